//! Command line interface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::capture::{DEFAULT_CAPTURE_BINARY, StreamConfig};
use crate::logging::LoggingOptions;
use crate::muxer::{DEFAULT_FFMPEG_BINARY, MuxConfig};
use crate::server::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "raspi-live")]
#[command(about = "Live video streaming from a Raspberry Pi camera module")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub video: VideoArgs,

    /// Log debug output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Also write daily rolling log files to this directory
    #[arg(long, global = true, env = "RASPI_LIVE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Camera options shared by every output format.
#[derive(Args, Debug, Clone)]
pub struct VideoArgs {
    /// Video width in pixels
    #[arg(long, global = true, default_value_t = 1920, env = "RASPI_LIVE_WIDTH")]
    pub width: u32,

    /// Video height in pixels
    #[arg(long, global = true, default_value_t = 1080, env = "RASPI_LIVE_HEIGHT")]
    pub height: u32,

    /// Frames per second
    #[arg(long, global = true, default_value_t = 30, env = "RASPI_LIVE_FPS")]
    pub fps: u32,

    /// Flip the image horizontally
    #[arg(long, global = true, env = "RASPI_LIVE_HORIZONTAL_FLIP")]
    pub horizontal_flip: bool,

    /// Flip the image vertically
    #[arg(long, global = true, env = "RASPI_LIVE_VERTICAL_FLIP")]
    pub vertical_flip: bool,

    /// Camera capture binary
    #[arg(
        long,
        global = true,
        default_value = DEFAULT_CAPTURE_BINARY,
        env = "RASPI_LIVE_CAMERA_BINARY"
    )]
    pub camera_binary: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream MPEG-DASH over HTTP(S)
    Dash(DashArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DashArgs {
    /// Port to serve on (0 picks a free port)
    #[arg(short, long, default_value_t = 0, env = "RASPI_LIVE_PORT")]
    pub port: u16,

    /// Directory for the manifest and segments
    #[arg(short, long, env = "RASPI_LIVE_DIRECTORY")]
    pub directory: PathBuf,

    /// TLS certificate (PEM)
    #[arg(long, env = "RASPI_LIVE_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "RASPI_LIVE_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Segment duration in seconds
    #[arg(long, default_value_t = 2, env = "RASPI_LIVE_SEGMENT_TIME")]
    pub segment_time: u32,

    /// Segments listed in the manifest
    #[arg(long, default_value_t = 10, env = "RASPI_LIVE_PLAYLIST_SIZE")]
    pub playlist_size: usize,

    /// Segments kept on disk after leaving the manifest
    #[arg(long, default_value_t = 1, env = "RASPI_LIVE_STORAGE_SIZE")]
    pub storage_size: usize,

    /// Value of the Access-Control-Allow-Origin header
    #[arg(long, env = "RASPI_LIVE_CORS")]
    pub cors: Option<String>,

    /// Muxer binary
    #[arg(long, default_value = DEFAULT_FFMPEG_BINARY, env = "RASPI_LIVE_FFMPEG_BINARY")]
    pub ffmpeg_binary: String,
}

/// Configuration for the `dash` command.
#[derive(Debug, Clone)]
pub struct DashConfigs {
    pub stream: StreamConfig,
    pub mux: MuxConfig,
    pub server: ServerConfig,
}

impl Cli {
    pub fn logging_options(&self) -> LoggingOptions {
        LoggingOptions {
            verbose: self.verbose,
            quiet: self.quiet,
            log_dir: self.log_dir.clone(),
        }
    }
}

impl VideoArgs {
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig::new(self.width, self.height, self.fps)
            .with_flip(self.horizontal_flip, self.vertical_flip)
            .with_binary(self.camera_binary.clone())
    }
}

impl DashArgs {
    /// Split the arguments into per-component configuration.
    pub fn into_configs(self, video: &VideoArgs) -> DashConfigs {
        let mux = MuxConfig::new(&self.directory)
            .with_segment_time(self.segment_time)
            .with_retention(self.playlist_size, self.storage_size)
            .with_fps(video.fps)
            .with_binary(self.ffmpeg_binary);

        let mut server = ServerConfig::new(self.port, self.directory);
        server.tls_cert = non_empty_path(self.tls_cert);
        server.tls_key = non_empty_path(self.tls_key);
        server.cors = self.cors.filter(|cors| !cors.is_empty());

        DashConfigs {
            stream: video.stream_config(),
            mux,
            server,
        }
    }
}

// Empty environment values mean "unset".
fn non_empty_path(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
}
