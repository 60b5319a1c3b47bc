//! Translation of process signals into pipeline cancellation.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancel `stop` on SIGINT or SIGTERM (Ctrl+C elsewhere).
///
/// The listener keeps running after the first signal so repeated signals are
/// reported instead of falling through to the default handler.
pub fn spawn_signal_listener(stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let (mut sigint, mut sigterm) =
                match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                    (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(error = %e, "Failed to install signal handlers");
                        return;
                    }
                };

            loop {
                let name = tokio::select! {
                    received = sigint.recv() => received.map(|_| "SIGINT"),
                    received = sigterm.recv() => received.map(|_| "SIGTERM"),
                };
                let Some(name) = name else { break };
                on_signal(&stop, name);
            }
        }

        #[cfg(not(unix))]
        {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for Ctrl+C");
                    break;
                }
                on_signal(&stop, "Ctrl+C");
            }
        }
    })
}

/// Record a received signal. Returns `true` if it triggered the stop.
fn on_signal(stop: &CancellationToken, name: &str) -> bool {
    if stop.is_cancelled() {
        warn!(signal = name, "Shutdown already in progress, ignoring signal");
        return false;
    }
    info!(signal = name, "Received signal, shutting down");
    stop.cancel();
    true
}
