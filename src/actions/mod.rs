use crate::{
    cancel::Cancellation,
    config::default_cache_root,
    event::{EventError, EventView},
    repository::{RepositoryCache, RepositoryError, Worktree},
    rules::Rule,
};
use log::{debug, error, info, warn};
use mockall::automock;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

/// Splitting command lines into argument vectors.
pub mod command;
/// The environment passed to actions.
pub mod environment;
/// Running actions as child processes.
pub mod process;

use command::split_command;
use environment::build_environment;

/// The name of the file the raw event body is written to.
pub const EVENT_FILE_NAME: &str = "event.json";
/// The name of the checked out repository inside the working directory.
pub const REPOSITORY_DIR_NAME: &str = "repo";

/// A custom error describing the error cases of running an action.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The rule has no action to run.
    #[error("the rule has no action")]
    NoAction,
    /// The event lacks the fields needed to check out the repository.
    #[error("{0}")]
    MalformedEvent(#[from] EventError),
    /// The working tree cannot be prepared.
    #[error("cannot check out the repository: {0}")]
    Repository(#[from] RepositoryError),
    /// The action cannot be split into a program and arguments.
    #[error("invalid command {0:?}")]
    InvalidCommand(String),
    /// The temporary working directory or the event file cannot be created.
    #[error("cannot prepare the working directory: {0}")]
    WorkingDirectory(std::io::Error),
    /// The program cannot be started.
    #[error("cannot start {0}: {1}")]
    ProcessSpawnFailed(String, std::io::Error),
    /// The process ran longer than allowed and was stopped.
    #[error("the action timed out after {0:?}")]
    TimedOut(Duration),
    /// The process was stopped because the server is shutting down.
    #[error("the action was cancelled")]
    Cancelled,
    /// The temporary working directory cannot be removed.
    #[error("cannot remove {0}: {1}")]
    Cleanup(String, std::io::Error),
}

/// A fully resolved process to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionCommand {
    pub program: String,
    pub args: Vec<String>,
    pub directory: PathBuf,
    pub env: HashMap<String, String>,
}

/// How a finished process exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// The exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    /// Stdout and stderr of the process.
    pub output: String,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// How one command of a rule's action exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    pub command: String,
    pub exit: ExitReport,
}

/// The result of a rule's commands that all ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReport {
    /// One entry per command, in the configured order.
    pub commands: Vec<CommandReport>,
    pub worktree: Option<Worktree>,
}

impl ActionReport {
    pub fn success(&self) -> bool {
        self.commands.iter().all(|command| command.exit.success())
    }
}

/// Starts an action and waits for it.
#[automock]
pub trait Spawner: Send + Sync {
    /// Run the command to completion. A non-zero exit code is not an error.
    fn run(
        &self,
        command: &ActionCommand,
        cancellation: &Cancellation,
    ) -> Result<ExitReport, ActionError>;
}

/// Everything from the outside world the actions need.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// The environment every action starts from, usually the server's own.
    pub base_env: HashMap<String, String>,
    /// The configured cache root, exported as `GWH_CACHE_DIR`.
    pub cache_dir: Option<PathBuf>,
    /// Where temporary working directories are created, the system default if unset.
    pub work_root: Option<PathBuf>,
    pub fetch_timeout: Duration,
}

/// Runs the action of a matched rule in a fresh temporary directory.
pub struct Executor {
    config: ExecutorConfig,
    cache: RepositoryCache,
    spawner: Box<dyn Spawner>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, spawner: Box<dyn Spawner>) -> Self {
        let cache_root = config.cache_dir.clone().unwrap_or_else(default_cache_root);
        let cache = RepositoryCache::new(cache_root, config.fetch_timeout);

        Executor {
            config,
            cache,
            spawner,
        }
    }

    /// Run the commands of `rule` for `event`, one after the other.
    ///
    /// Every command runs in the same temporary directory and sees the same
    /// checkout. A command exiting with a non-zero code doesn't stop the next
    /// ones, a command that cannot be started does.
    ///
    /// The temporary directory is removed on every path out of this function,
    /// whether the commands ran, failed to start or the checkout failed.
    pub fn run(
        &self,
        rule: &Rule,
        event: &EventView,
        cancellation: &Cancellation,
    ) -> Result<ActionReport, ActionError> {
        if rule.actions.is_empty() {
            return Err(ActionError::NoAction);
        }
        let commands = rule
            .actions
            .iter()
            .map(|command_line| {
                split_command(command_line)
                    .map(|parsed| (command_line.as_str(), parsed))
                    .ok_or_else(|| ActionError::InvalidCommand(command_line.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("gwh-");
        let working_dir = match &self.config.work_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(ActionError::WorkingDirectory)?;
        let path = working_dir.path().to_path_buf();

        let result = self.run_in(&path, rule, &commands, event, cancellation);

        match working_dir.close() {
            Ok(()) => {
                debug!("Removed {}.", path.to_string_lossy());
                result
            }
            Err(err) => {
                error!("Failed removing {}: {err}.", path.to_string_lossy());
                result.and(Err(ActionError::Cleanup(
                    path.to_string_lossy().to_string(),
                    err,
                )))
            }
        }
    }

    fn run_in(
        &self,
        directory: &Path,
        rule: &Rule,
        commands: &[(&str, (String, Vec<String>))],
        event: &EventView,
        cancellation: &Cancellation,
    ) -> Result<ActionReport, ActionError> {
        let event_file = directory.join(EVENT_FILE_NAME);
        let env = build_environment(
            &self.config.base_env,
            event,
            &event_file,
            self.config.cache_dir.as_deref(),
        );

        let worktree = if rule.clone {
            let target = event.repository_target()?;
            let worktree = self.cache.prepare_worktree(
                &target,
                &directory.join(REPOSITORY_DIR_NAME),
                cancellation,
            )?;
            Some(worktree)
        } else {
            None
        };

        fs::write(&event_file, event.raw_body()).map_err(ActionError::WorkingDirectory)?;

        let mut reports = Vec::with_capacity(commands.len());
        for (command_line, (program, args)) in commands {
            if cancellation.is_cancelled() {
                return Err(ActionError::Cancelled);
            }

            let command = ActionCommand {
                program: program.clone(),
                args: args.clone(),
                directory: directory.to_path_buf(),
                env: env.clone(),
            };
            info!(
                "Running {command_line:?} in {}.",
                directory.to_string_lossy()
            );
            let exit = self.spawner.run(&command, cancellation)?;
            log_exit(command_line, &exit);

            reports.push(CommandReport {
                command: command_line.to_string(),
                exit,
            });
        }

        Ok(ActionReport {
            commands: reports,
            worktree,
        })
    }
}

fn log_exit(command_line: &str, exit: &ExitReport) {
    debug!("Action output:");
    exit.output.lines().for_each(|line| {
        debug!("{line}");
    });
    if exit.success() {
        info!("Action {command_line:?} finished.");
    } else {
        warn!(
            "Action {command_line:?} exited with {}.",
            exit.code
                .map(|code| format!("code {code}"))
                .unwrap_or_else(|| "a signal".to_string())
        );
    }
}
