//! Child process helpers shared across the workspace.
//!
//! - [`tokio_command`] builds a command that never outlives its handle.
//! - [`probe`] runs a short-lived command (`--version`, `--list-cameras`) and
//!   captures its output.
//! - [`SupervisedChild`] owns a long-running producer and gives it a
//!   `wait` / `close` lifecycle that can be driven from different tasks.

use std::ffi::OsStr;

mod error;
mod output;
mod probe;
mod supervised;

pub use error::ProcessError;
pub use output::spawn_line_logger;
pub use probe::{ProbeOutput, probe};
pub use supervised::SupervisedChild;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` for a pipeline producer.
///
/// The child is killed when its handle is dropped, so a task that gets aborted
/// never leaves an orphaned process behind.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// Render a command line for logging, quoting arguments that contain spaces.
pub fn command_line<I, S>(program: &str, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = program.to_string();
    for arg in args {
        let arg = arg.as_ref();
        line.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            line.push('"');
            line.push_str(&arg.replace('"', "\\\""));
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }
    line
}
