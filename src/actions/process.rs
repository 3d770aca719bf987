use super::{ActionCommand, ActionError, ExitReport, Spawner};
use crate::cancel::{Cancellation, Deadline};
use duct::{cmd, Handle};
use log::{debug, warn};
use std::{
    path::Path,
    thread::sleep,
    time::Duration,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Runs actions as child processes, without a shell in between.
///
/// The process is stopped with SIGTERM when it runs past the timeout or the
/// server shuts down, and killed if it is still running after a grace period.
pub struct ProcessSpawner {
    timeout: Option<Duration>,
    grace_period: Duration,
}

impl ProcessSpawner {
    pub fn new(timeout: Option<Duration>) -> Self {
        ProcessSpawner {
            timeout,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    fn terminate(&self, handle: &Handle) {
        #[cfg(unix)]
        {
            use nix::{
                sys::signal::{kill, Signal},
                unistd::Pid,
            };
            for pid in handle.pids() {
                if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!("Failed sending SIGTERM to {pid}: {err}.");
                }
            }

            let grace = Deadline::after(self.grace_period);
            while !grace.is_expired() {
                if let Ok(Some(_)) = handle.try_wait() {
                    return;
                }
                sleep(POLL_INTERVAL);
            }
            warn!("Process did not stop in {:?}, killing it.", self.grace_period);
        }

        if let Err(err) = handle.kill() {
            warn!("Failed killing the process: {err}.");
        }
    }
}

/// Relative programs with a separator are looked up from the working directory
/// of the action, not the server.
fn resolve_program(program: &str, directory: &Path) -> String {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        directory.join(path).to_string_lossy().to_string()
    } else {
        program.to_string()
    }
}

impl Spawner for ProcessSpawner {
    fn run(
        &self,
        command: &ActionCommand,
        cancellation: &Cancellation,
    ) -> Result<ExitReport, ActionError> {
        let program = resolve_program(&command.program, &command.directory);
        let handle = cmd(&program, &command.args)
            .dir(&command.directory)
            .full_env(&command.env)
            .stderr_to_stdout()
            .stdout_capture()
            .unchecked()
            .start()
            .map_err(|err| ActionError::ProcessSpawnFailed(command.program.clone(), err))?;

        let deadline = self.timeout.map(Deadline::after).unwrap_or_else(Deadline::never);
        loop {
            match handle.try_wait() {
                Ok(Some(output)) => {
                    return Ok(ExitReport {
                        code: output.status.code(),
                        output: String::from_utf8_lossy(&output.stdout).to_string(),
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    return Err(ActionError::ProcessSpawnFailed(command.program.clone(), err));
                }
            }

            if cancellation.is_cancelled() {
                debug!("Stopping {} because of shutdown.", command.program);
                self.terminate(&handle);
                return Err(ActionError::Cancelled);
            }
            if deadline.is_expired() {
                debug!("Stopping {} because it timed out.", command.program);
                self.terminate(&handle);
                return Err(ActionError::TimedOut(deadline.timeout().unwrap_or_default()));
            }

            sleep(POLL_INTERVAL);
        }
    }
}
