//! Live MPEG-DASH streaming from a Raspberry Pi camera module.
//!
//! `libcamera-vid` captures H.264, `ffmpeg` segments it into a DASH manifest
//! and media segments, and a static HTTP(S) server publishes the segment
//! directory. [`pipeline::Orchestrator`] runs the three stages as one unit.

pub mod capture;
pub mod cli;
pub mod error;
pub mod logging;
pub mod muxer;
pub mod panic_hook;
pub mod pipeline;
pub mod server;
pub mod signal;

pub use error::{Error, Result};
