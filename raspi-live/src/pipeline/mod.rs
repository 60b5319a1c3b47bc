//! Capture → mux → serve pipeline.

mod orchestrator;
pub(crate) mod pump;
mod traits;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::capture::{CaptureProcess, StreamConfig};
use crate::muxer::{MuxConfig, MuxProcess};
use crate::server::{ServerConfig, StaticServer};

pub use orchestrator::{DEFAULT_PROCESS_DEADLINE, Orchestrator, ShutdownConfig, Termination};
pub use traits::{ByteStream, CaptureSource, Component, FileServer, SegmentMuxer};

/// Build the camera, `ffmpeg` and HTTP stages and run them until `stop` is
/// cancelled or one of them finishes.
pub async fn run(
    stream: StreamConfig,
    mux: MuxConfig,
    server: ServerConfig,
    shutdown: ShutdownConfig,
    stop: CancellationToken,
) -> Result<Termination> {
    let server = StaticServer::new(server)?;
    let muxer = MuxProcess::new(mux).await?;
    let capture = CaptureProcess::new(stream).await?;

    Orchestrator::new(Arc::new(capture), Arc::new(muxer), Arc::new(server), stop)
        .with_shutdown_config(shutdown)
        .run()
        .await
}
