//! Check out the repository of the current event.
//!
//! Meant to be called from an action of a rule with `clone = false`, when the
//! action wants to decide itself whether and where to check out. The event and
//! the cache are picked up from the environment `gwh` sets for the action.

use duration_string::DurationString;
use gumdrop::Options;
use gwh::{
    cancel::Cancellation,
    event::{EventError, EventView},
    repository::{clone_direct, set_network_timeouts, RepositoryCache, RepositoryError},
};
use log::{debug, info, LevelFilter, SetLoggerError};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use std::{env, fs, path::PathBuf, process, time::Duration};
use thiserror::Error;

/// Check out the repository of a webhook event.
#[derive(Debug, Options)]
struct Args {
    /// The event file, defaults to GWH_EVENT_FILE or ./event.json.
    #[options(free)]
    event_file: Option<PathBuf>,

    /// The repository cache, defaults to GWH_CACHE_DIR. Without one the repository is cloned directly.
    #[options(meta = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Where to check out the repository.
    #[options(meta = "DIR", default = "repo")]
    output: PathBuf,

    /// Give up fetching after this long.
    ///
    /// Can be a number postfixed with s(econd), m(inutes), h(ours), d(ays)
    #[options(meta = "DURATION", default = "10m")]
    timeout: DurationString,

    /// Increase verbosity, can be set multiple times (-v debug, -vv tracing)
    #[options(count)]
    verbose: u8,

    /// Print this help.
    #[options()]
    help: bool,
}

#[derive(Debug, Error)]
enum CloneError {
    #[error("cannot read the event file {0}: {1}")]
    UnreadableEvent(String, std::io::Error),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    FailedLogger(#[from] SetLoggerError),
    #[error("cannot set the git network timeouts: {0}")]
    NetworkTimeouts(#[from] git2::Error),
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

impl Args {
    fn event_file(&self) -> PathBuf {
        self.event_file
            .clone()
            .or_else(|| env_path("GWH_EVENT_FILE"))
            .unwrap_or_else(|| PathBuf::from("event.json"))
    }

    fn cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir.clone().or_else(|| env_path("GWH_CACHE_DIR"))
    }
}

fn main_inner(args: Args) -> Result<(), CloneError> {
    TermLogger::init(
        match args.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        },
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;

    let event_file = args.event_file();
    debug!("Reading the event from {}.", event_file.to_string_lossy());
    let raw_body = fs::read(&event_file)
        .map_err(|err| CloneError::UnreadableEvent(event_file.to_string_lossy().to_string(), err))?;
    let event_type = env::var("GWH_EVENT_TYPE").unwrap_or_else(|_| "push".to_string());
    let target = EventView::parse(event_type, raw_body, None)?.repository_target()?;

    let timeout = Duration::from(args.timeout.clone());
    set_network_timeouts(timeout)?;
    let cancellation = Cancellation::new();
    let worktree = match args.cache_dir() {
        Some(cache_dir) => RepositoryCache::new(cache_dir, timeout).prepare_worktree(
            &target,
            &args.output,
            &cancellation,
        )?,
        None => clone_direct(&target, &args.output, timeout, &cancellation)?,
    };

    info!(
        "Checked out {} of {} in {}.",
        worktree.commit,
        target.full_name,
        worktree.path.to_string_lossy()
    );

    Ok(())
}

fn main() {
    let args = Args::parse_args_default_or_exit();

    if let Err(err) = main_inner(args) {
        eprintln!("{err}");
        process::exit(1);
    }
}
