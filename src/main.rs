use args::{parse_args, Args};
use gwh::{
    actions::{process::ProcessSpawner, Executor, ExecutorConfig},
    cancel::Cancellation,
    config::{ConfigError, ServiceConfig},
    dispatch::Dispatcher,
    repository::set_network_timeouts,
    rules::source::FileRuleSource,
    server::{source::SourceFilter, ServerError, WebhookServer},
};
use log::{debug, warn, SetLoggerError};
use logger::init_logger;
use shutdown::ShutdownHandler;
use std::{env, process};
use thiserror::Error;

mod args;
mod logger;
mod shutdown;

#[derive(Debug, Error)]
pub enum MainError {
    #[error("Timezone offsets cannot be determined.")]
    FailedLoggerTimezones,
    #[error(transparent)]
    FailedLogger(#[from] SetLoggerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("Cannot set the git network timeouts: {0}")]
    NetworkTimeouts(#[from] git2::Error),
}

fn main_inner(args: Args) -> Result<(), MainError> {
    init_logger(&args)?;

    let config = match args.config_file() {
        Some(path) => {
            debug!("Loading config from {}.", path.to_string_lossy());
            ServiceConfig::load(&path)?
        }
        None => {
            warn!("There is no config file, every webhook will be ignored.");
            ServiceConfig::default()
        }
    };
    set_network_timeouts(config.fetch_timeout)?;
    let listen = args.listen.clone().unwrap_or_else(|| config.listen.clone());

    let executor = Executor::new(
        ExecutorConfig {
            base_env: env::vars().collect(),
            cache_dir: config.cache_dir.clone(),
            work_root: None,
            fetch_timeout: config.fetch_timeout,
        },
        Box::new(ProcessSpawner::new(Some(config.action_timeout))),
    );
    let dispatcher = Dispatcher::new(Box::new(FileRuleSource::new(config.handlers.clone())), executor);

    let sources = SourceFilter::from_config(&config.source)?;
    if !sources.is_enabled() {
        warn!("The source check is disabled, every caller can deliver webhooks.");
    }

    let cancellation = Cancellation::new();
    let server = WebhookServer::bind(&listen, dispatcher, sources, cancellation.clone())?;

    let unblocker = server.unblocker();
    ShutdownHandler::new(cancellation, move || unblocker.unblock()).listen();

    server.serve();

    Ok(())
}

fn main() {
    let args = parse_args();

    if args.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if let Err(err) = main_inner(args) {
        eprintln!("{err}");
        process::exit(1);
    }
}
