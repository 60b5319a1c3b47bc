//! Application-wide error types.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use process_utils::ProcessError;
use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The served / segment directory does not exist. Kept distinct from other
    /// I/O failures so the operator gets a specific diagnostic.
    #[error("Directory does not exist: {}", .0.display())]
    InvalidDirectory(PathBuf),

    #[error("Directory is not writable: {}: {source}", path.display())]
    DirectoryNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Camera unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Muxer unavailable: {0}")]
    MuxerUnavailable(String),

    #[error("{0} has already been started")]
    AlreadyStarted(&'static str),

    #[error("{0} has not been started")]
    NotStarted(&'static str),

    #[error("Capture stream has already been taken")]
    StreamTaken,

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),

    #[error("{task} task failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("IO error {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether this is the "directory does not exist" condition.
    pub fn is_invalid_directory(&self) -> bool {
        matches!(self, Self::InvalidDirectory(_))
    }

    /// Operator-facing summary of what went wrong.
    pub fn diagnostic(&self) -> &'static str {
        match self {
            Self::InvalidDirectory(_) => "Directory does not exist",
            Self::Configuration(_) => "Invalid configuration",
            Self::DeviceUnavailable(_) | Self::StreamTaken => {
                "Encountered an error streaming video from the Raspberry Pi Camera Module"
            }
            Self::MuxerUnavailable(_) | Self::DirectoryNotWritable { .. } => {
                "Encountered an error muxing video"
            }
            Self::Bind { .. } | Self::Tls(_) | Self::Serve(_) => "Encountered an error serving video",
            _ => "Encountered an error running the video pipeline",
        }
    }
}
