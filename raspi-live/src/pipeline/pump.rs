//! Byte pumps between pipeline stages.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::debug;

pub(crate) type PumpHandle = JoinHandle<io::Result<u64>>;

/// Copy `reader` into `writer` until EOF, then shut the writer down so the
/// downstream side observes end-of-stream.
pub(crate) fn spawn_pump<R, W>(label: &'static str, mut reader: R, mut writer: W) -> PumpHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let copied = tokio::io::copy(&mut reader, &mut writer).await;
        if let Err(e) = writer.shutdown().await {
            debug!(pump = label, error = %e, "Failed to close pump output");
        }
        copied
    })
}

/// Give a pump `grace` to flush after its producer exited, then abort it.
pub(crate) async fn finish_pump(label: &'static str, mut pump: PumpHandle, grace: Duration) {
    let joined = match tokio::time::timeout(grace, &mut pump).await {
        Ok(joined) => joined,
        Err(_) => {
            pump.abort();
            debug!(pump = label, "Pump aborted after producer exit");
            return;
        }
    };

    match joined {
        Ok(Ok(bytes)) => debug!(pump = label, bytes, "Pump finished"),
        // The consumer usually went away first; the stage's own exit status
        // carries the real error.
        Ok(Err(e)) => debug!(pump = label, error = %e, "Pump stopped"),
        Err(e) if e.is_cancelled() => debug!(pump = label, "Pump cancelled"),
        Err(e) => debug!(pump = label, error = %e, "Pump task failed"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn test_pump_propagates_eof() {
        let (mut upstream_tx, upstream_rx) = tokio::io::duplex(64);
        let (downstream_tx, mut downstream_rx) = tokio::io::duplex(64);

        let pump = spawn_pump("test", upstream_rx, downstream_tx);
        upstream_tx.write_all(b"h264").await.unwrap();
        drop(upstream_tx);

        let mut received = Vec::new();
        downstream_rx.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"h264");
        assert_eq!(pump.await.unwrap().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_finish_pump_aborts_stuck_pump() {
        let (_upstream_tx, upstream_rx) = tokio::io::duplex(64);
        let (downstream_tx, mut downstream_rx) = tokio::io::duplex(64);

        let pump = spawn_pump("stuck", upstream_rx, downstream_tx);
        finish_pump("stuck", pump, Duration::from_millis(20)).await;

        // Aborting the pump drops its writer.
        let mut received = Vec::new();
        downstream_rx.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }
}
