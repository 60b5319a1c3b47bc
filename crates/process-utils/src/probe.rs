use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};

use crate::{ProcessError, tokio_command};

/// Captured result of a short-lived command.
#[derive(Debug, Clone)]
pub struct ProbeOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProbeOutput {
    /// First non-empty line of stdout, falling back to stderr.
    pub fn first_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .chain(self.stderr.lines())
            .map(str::trim)
            .find(|line| !line.is_empty())
    }

    /// Whether either output stream contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }
}

/// Run `program` with `args` to completion and capture both output streams.
///
/// A non-zero exit is not an error here; callers decide what the output means.
pub async fn probe<I, S>(program: &str, args: I) -> Result<ProbeOutput, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = tokio_command(program)
        .args(args)
        .env("LC_ALL", "C")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

    Ok(ProbeOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_captures_output() {
        let output = probe("sh", ["-c", "echo 'tool 1.2.3'; echo warn >&2; exit 3"])
            .await
            .unwrap();

        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.first_line(), Some("tool 1.2.3"));
        assert!(output.contains("warn"));
    }

    #[tokio::test]
    async fn test_probe_missing_binary_is_unavailable() {
        let err = probe("/nonexistent/raspi-live-probe", ["--version"])
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(err.program(), "/nonexistent/raspi-live-probe");
    }
}
