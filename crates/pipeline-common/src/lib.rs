//! # Pipeline Common
//!
//! Shared building blocks for supervising the stages of a streaming pipeline.
//!
//! ## Features
//!
//! - [`TaskGroup`]: run N stages as tokio tasks, wait for the first one to
//!   finish (or for a cancellation token), then drain the rest within a deadline
//! - [`TaskError`] / [`TaskExit`]: uniform completion reporting, including
//!   panicked and aborted stages
//!
//! ## License
//!
//! MIT License
//!

mod task_group;

pub use task_group::{Drained, FirstExit, TaskError, TaskExit, TaskGroup};

/// Re-export so callers share the same token type.
pub use tokio_util::sync::CancellationToken;
