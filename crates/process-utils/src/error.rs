use std::process::ExitStatus;

use thiserror::Error;

/// Errors raised while starting or supervising a child process.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Exited { program: String, status: ExitStatus },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} is already being waited on")]
    AlreadyWaited { program: String },
}

impl ProcessError {
    /// Name of the program the error refers to.
    pub fn program(&self) -> &str {
        match self {
            Self::Spawn { program, .. }
            | Self::Exited { program, .. }
            | Self::Wait { program, .. }
            | Self::AlreadyWaited { program } => program,
        }
    }

    /// Whether the program could not be launched because it is missing or
    /// not executable.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Spawn { source, .. }
                if matches!(
                    source.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                )
        )
    }
}
