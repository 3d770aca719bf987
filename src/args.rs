use gumdrop::Options;
use std::{env, path::PathBuf};

/// Receive GitHub webhooks and run commands on the pushed commits.
#[derive(Debug, Options)]
pub struct Args {
    /// The service config file, defaults to GWH_CONFIG_FILE.
    ///
    /// Without a config file there are no rules, so every webhook is ignored.
    #[options(meta = "FILE")]
    pub config: Option<PathBuf>,

    /// The address to listen on, overrides the config file (e.g. 0.0.0.0:8080).
    #[options(meta = "ADDRESS")]
    pub listen: Option<String>,

    /// Increase verbosity, can be set multiple times (-v debug, -vv tracing)
    #[options(count)]
    pub verbose: u8,

    /// Only print errors.
    #[options()]
    pub quiet: bool,

    /// Print the current version.
    #[options(short = "V")]
    pub version: bool,

    /// Print this help.
    #[options()]
    pub help: bool,
}

impl Args {
    /// The config file from the arguments or the environment.
    pub fn config_file(&self) -> Option<PathBuf> {
        self.config.clone().or_else(|| {
            env::var_os("GWH_CONFIG_FILE")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from)
        })
    }
}

pub fn parse_args() -> Args {
    Args::parse_args_default_or_exit()
}
