use std::process::ExitStatus;

use parking_lot::Mutex;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ProcessError;

/// A spawned child process with a `wait` / `close` lifecycle.
///
/// `wait` and `close` take `&self`, so one task can block in `wait` while
/// another decides to stop the process. A process stopped through `close`
/// counts as a clean exit: `wait` returns `Ok(())` no matter which signal
/// ended it.
#[derive(Debug)]
pub struct SupervisedChild {
    program: String,
    child: Mutex<Option<Child>>,
    closed: CancellationToken,
}

impl SupervisedChild {
    /// Spawn `cmd` and take ownership of the child.
    pub fn spawn(cmd: &mut Command) -> Result<Self, ProcessError> {
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();
        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

        debug!(program = %program, pid = ?child.id(), "Spawned child process");

        Ok(Self {
            program,
            child: Mutex::new(Some(child)),
            closed: CancellationToken::new(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// OS process id, while the child is not being waited on and has not been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.lock().as_ref().and_then(Child::id)
    }

    pub fn take_stdin(&self) -> Option<ChildStdin> {
        self.child.lock().as_mut().and_then(|child| child.stdin.take())
    }

    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.child.lock().as_mut().and_then(|child| child.stdout.take())
    }

    pub fn take_stderr(&self) -> Option<ChildStderr> {
        self.child.lock().as_mut().and_then(|child| child.stderr.take())
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Block until the child exits.
    ///
    /// Only one caller may wait; a second concurrent or later call gets
    /// [`ProcessError::AlreadyWaited`].
    pub async fn wait(&self) -> Result<(), ProcessError> {
        let taken = self.child.lock().take();
        let Some(mut child) = taken else {
            return Err(ProcessError::AlreadyWaited {
                program: self.program.clone(),
            });
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                if let Err(e) = child.start_kill() {
                    debug!(program = %self.program, error = %e, "Child already gone when closing");
                }
                match child.wait().await {
                    Ok(status) => {
                        debug!(program = %self.program, %status, "Closed child process exited");
                        Ok(())
                    }
                    Err(source) => Err(ProcessError::Wait {
                        program: self.program.clone(),
                        source,
                    }),
                }
            }
            status = child.wait() => {
                let status = status.map_err(|source| ProcessError::Wait {
                    program: self.program.clone(),
                    source,
                })?;
                self.check_status(status)
            }
        }
    }

    /// Forcibly terminate the child.
    ///
    /// Idempotent; safe before, during and after [`wait`](Self::wait).
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        // Nobody is waiting yet: kill directly, the eventual waiter only reaps.
        if let Some(child) = self.child.lock().as_mut()
            && let Err(e) = child.start_kill()
        {
            debug!(program = %self.program, error = %e, "Failed to kill child process");
        }
    }

    fn check_status(&self, status: ExitStatus) -> Result<(), ProcessError> {
        if status.success() || self.closed.is_cancelled() {
            debug!(program = %self.program, %status, "Child process exited");
            Ok(())
        } else {
            Err(ProcessError::Exited {
                program: self.program.clone(),
                status,
            })
        }
    }
}
