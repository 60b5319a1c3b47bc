//! Lifecycle contracts the orchestrator depends on.
//!
//! The concrete implementations wrap external processes and an HTTP server;
//! tests substitute in-process doubles.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::Result;

/// Readable byte stream connecting the capture stage to the muxer.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Pipeline stage identifiers, used for logging and outcome reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    /// Camera capture producer.
    Capture,
    /// Segmenting muxer.
    Muxer,
    /// Static file server.
    Server,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Muxer => "muxer",
            Self::Server => "server",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A producer of raw video bytes.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Hand out the output stream. Available exactly once, before or after `start`.
    fn take_stream(&self) -> Result<ByteStream>;

    /// Start producing.
    async fn start(&self) -> Result<()>;

    /// Block until the producer exits. A producer stopped through `close`
    /// exits cleanly.
    async fn wait(&self) -> Result<()>;

    /// Forcibly stop producing and release the stream so readers see EOF.
    ///
    /// Idempotent; safe at any point of the lifecycle.
    fn close(&self);
}

/// A consumer of raw video bytes that writes a manifest and media segments.
#[async_trait]
pub trait SegmentMuxer: Send + Sync {
    /// Start consuming `input`. Returns once the muxer has launched.
    async fn mux(&self, input: ByteStream) -> Result<()>;

    /// Block until muxing finishes (end of input) or fails.
    async fn wait(&self) -> Result<()>;

    /// Forcibly stop muxing. Idempotent.
    fn close(&self);
}

/// A server publishing the segment directory.
#[async_trait]
pub trait FileServer: Send + Sync {
    /// Serve until shut down or failed.
    async fn listen_and_serve(&self) -> Result<()>;

    /// Stop accepting connections and give in-flight requests up to `deadline`
    /// before closing them. Safe to call before serving starts and repeatedly.
    async fn shutdown(&self, deadline: Duration);
}
