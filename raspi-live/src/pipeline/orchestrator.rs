//! Pipeline supervision.
//!
//! The orchestrator runs the server, muxer and capture stages in one
//! [`TaskGroup`]. The first stage to finish, or a stop request, ends the whole
//! pipeline: the capture stream is closed, the server drains within its
//! deadline and the producers get their own deadline before they are forced
//! down. Nothing is restarted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use pipeline_common::{CancellationToken, Drained, FirstExit, TaskError, TaskExit, TaskGroup};
use tracing::{debug, info, warn};

use super::traits::{CaptureSource, Component, FileServer, SegmentMuxer};
use crate::server::DEFAULT_SHUTDOWN_DEADLINE;
use crate::{Error, Result};

/// Default time the capture and mux processes get to exit during shutdown.
pub const DEFAULT_PROCESS_DEADLINE: Duration = Duration::from_secs(10);

/// Time force-closed stages get to unwind before their tasks are aborted.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Shutdown deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownConfig {
    /// Time in-flight HTTP requests get to complete.
    pub server_deadline: Duration,
    /// Time the capture and mux processes get to exit on their own.
    pub process_deadline: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            server_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            process_deadline: DEFAULT_PROCESS_DEADLINE,
        }
    }
}

/// Why the pipeline stopped, when it stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The stop token was cancelled.
    StopRequested,
    /// A stage finished cleanly before anything else happened.
    ComponentExited(Component),
}

/// First terminal event of a run.
enum Trigger {
    Stop,
    Exit(TaskExit<Component, Error>),
    Setup(Error),
}

type Tasks = TaskGroup<Component, Error>;

/// Starts, links and tears down the pipeline stages.
pub struct Orchestrator {
    capture: Arc<dyn CaptureSource>,
    muxer: Arc<dyn SegmentMuxer>,
    server: Arc<dyn FileServer>,
    stop: CancellationToken,
    shutdown_config: ShutdownConfig,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        capture: Arc<dyn CaptureSource>,
        muxer: Arc<dyn SegmentMuxer>,
        server: Arc<dyn FileServer>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            capture,
            muxer,
            server,
            stop,
            shutdown_config: ShutdownConfig::default(),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn with_shutdown_config(mut self, config: ShutdownConfig) -> Self {
        self.shutdown_config = config;
        self
    }

    /// Token that stops the pipeline when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Run the pipeline until the first stage finishes or a stop is requested.
    ///
    /// Returns the first error observed. Errors raised while shutting down are
    /// logged only.
    pub async fn run(&self) -> Result<Termination> {
        let mut tasks = Tasks::new();

        let server = self.server.clone();
        tasks.spawn(Component::Server, async move {
            server.listen_and_serve().await
        });

        // Let the server bind before the producers are started.
        tokio::task::yield_now().await;

        let trigger = if let Some(exit) = tasks.try_next_exit() {
            Trigger::Exit(exit)
        } else if self.stop.is_cancelled() {
            Trigger::Stop
        } else {
            match self.start_producers(&mut tasks).await {
                Ok(()) => match tasks.first_exit(&self.stop).await {
                    FirstExit::Task(exit) => Trigger::Exit(exit),
                    FirstExit::Cancelled => Trigger::Stop,
                },
                Err(e) => Trigger::Setup(e),
            }
        };

        let outcome = match trigger {
            Trigger::Stop => {
                info!("Stop requested");
                Ok(Termination::StopRequested)
            }
            Trigger::Exit(TaskExit {
                key,
                result: Ok(()),
            }) => {
                info!(component = %key, "Component finished");
                Ok(Termination::ComponentExited(key))
            }
            Trigger::Exit(TaskExit {
                key,
                result: Err(e),
            }) => {
                let err = task_error(key, e);
                debug!(component = %key, error = %err, "Component failed");
                Err(err)
            }
            Trigger::Setup(e) => {
                debug!(error = %e, "Pipeline setup failed");
                Err(e)
            }
        };

        self.shutdown().await;
        self.drain(&mut tasks).await;

        info!("Pipeline stopped");
        outcome
    }

    /// Begin the shutdown sequence: close the capture stream and drain the
    /// server within its deadline.
    ///
    /// Only the first call does anything; it returns `true`. Later calls log
    /// and return `false`.
    pub async fn shutdown(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return false;
        }

        info!("Shutting down pipeline");
        self.stop.cancel();
        self.capture.close();
        self.server
            .shutdown(self.shutdown_config.server_deadline)
            .await;
        true
    }

    async fn start_producers(&self, tasks: &mut Tasks) -> Result<()> {
        let stream = self.capture.take_stream()?;
        self.muxer.mux(stream).await?;

        let muxer = self.muxer.clone();
        tasks.spawn(Component::Muxer, async move { muxer.wait().await });

        self.capture.start().await?;

        let capture = self.capture.clone();
        tasks.spawn(Component::Capture, async move { capture.wait().await });

        info!("Pipeline started");
        Ok(())
    }

    async fn drain(&self, tasks: &mut Tasks) {
        let Drained { exits, pending } = tasks.drain(self.shutdown_config.process_deadline).await;
        exits.into_iter().for_each(log_late_exit);
        if pending.is_empty() {
            return;
        }

        warn!(?pending, "Forcing remaining components to stop");
        self.muxer.close();
        self.capture.close();

        let forced = tasks.drain(FORCE_CLOSE_GRACE).await;
        let timed_out = forced.timed_out();
        forced.exits.into_iter().for_each(log_late_exit);
        if timed_out {
            tasks.shutdown().await.into_iter().for_each(log_late_exit);
        }
    }
}

fn task_error(component: Component, error: TaskError<Error>) -> Error {
    match error {
        TaskError::Failed(e) => e,
        other => Error::TaskFailed {
            task: component.to_string(),
            message: other.to_string(),
        },
    }
}

fn log_late_exit(exit: TaskExit<Component, Error>) {
    match exit.result {
        Ok(()) => debug!(component = %exit.key, "Component stopped"),
        Err(TaskError::Aborted) => warn!(component = %exit.key, "Component aborted"),
        Err(e) => warn!(component = %exit.key, error = %e, "Component failed during shutdown"),
    }
}
