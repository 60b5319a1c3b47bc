//! Camera capture through `libcamera-vid`.

use std::fmt;
use std::process::Stdio;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use process_utils::{SupervisedChild, command_line, probe, spawn_line_logger, tokio_command};
use tokio::io::DuplexStream;
use tracing::{debug, info};

use crate::pipeline::pump::{PumpHandle, finish_pump, spawn_pump};
use crate::pipeline::{ByteStream, CaptureSource};
use crate::{Error, Result};

/// Default capture binary.
pub const DEFAULT_CAPTURE_BINARY: &str = "libcamera-vid";

/// In-memory buffer between the capture process and the stream reader.
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Time the stdout pump gets to flush after the capture process exits.
const PUMP_GRACE: Duration = Duration::from_secs(1);

/// Video capture settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    /// Frames per second.
    pub fps: u32,
    pub horizontal_flip: bool,
    pub vertical_flip: bool,
    /// Capture binary.
    pub binary_path: String,
    /// Arguments placed before the generated ones.
    pub extra_args: Vec<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            horizontal_flip: false,
            vertical_flip: false,
            binary_path: DEFAULT_CAPTURE_BINARY.to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl StreamConfig {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            ..Self::default()
        }
    }

    pub fn with_flip(mut self, horizontal: bool, vertical: bool) -> Self {
        self.horizontal_flip = horizontal;
        self.vertical_flip = vertical;
        self
    }

    pub fn with_binary(mut self, binary_path: impl Into<String>) -> Self {
        self.binary_path = binary_path.into();
        self
    }

    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::config(format!(
                "Invalid resolution {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(Error::config("Frame rate must be greater than zero"));
        }
        Ok(())
    }

    /// Arguments for an endless H.264 capture written to stdout.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = self.extra_args.clone();

        args.extend(
            [
                "--nopreview",
                "--inline",
                "-t",
                "0",
                "--codec",
                "h264",
            ]
            .map(String::from),
        );
        args.extend([
            "--width".to_string(),
            self.width.to_string(),
            "--height".to_string(),
            self.height.to_string(),
            "--framerate".to_string(),
            self.fps.to_string(),
        ]);

        if self.horizontal_flip {
            args.push("--hflip".to_string());
        }
        if self.vertical_flip {
            args.push("--vflip".to_string());
        }

        args.extend(["-o".to_string(), "-".to_string()]);
        args
    }
}

/// Handle to the camera capture process.
pub struct CaptureProcess {
    config: StreamConfig,
    camera: Option<String>,
    reader: Mutex<Option<DuplexStream>>,
    writer: Mutex<Option<DuplexStream>>,
    child: OnceLock<SupervisedChild>,
    pump: Mutex<Option<PumpHandle>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl CaptureProcess {
    /// Validate `config` and make sure a camera is available.
    pub async fn new(config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let camera = Self::detect_camera(&config).await?;
        info!(camera = camera.as_deref().unwrap_or("unknown"), "Camera detected");

        let (writer, reader) = tokio::io::duplex(STREAM_BUFFER_SIZE);

        Ok(Self {
            config,
            camera,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            child: OnceLock::new(),
            pump: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Description of the first detected camera.
    pub fn camera(&self) -> Option<&str> {
        self.camera.as_deref()
    }

    /// List cameras through the capture binary.
    async fn detect_camera(config: &StreamConfig) -> Result<Option<String>> {
        let mut args = config.extra_args.clone();
        args.push("--list-cameras".to_string());

        let output = probe(&config.binary_path, &args)
            .await
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        if output.contains("No cameras available") {
            return Err(Error::DeviceUnavailable("no cameras available".to_string()));
        }
        if !output.status.success() {
            let reason = output.first_line().unwrap_or("camera probe failed");
            return Err(Error::DeviceUnavailable(format!(
                "{} ({})",
                reason, output.status
            )));
        }

        // Camera lines look like "0 : imx219 [3280x2464] (/base/soc/i2c0mux/...)".
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with(|c: char| c.is_ascii_digit()))
            .map(str::to_string))
    }
}

impl fmt::Display for CaptureProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&command_line(
            &self.config.binary_path,
            self.config.build_args(),
        ))
    }
}

#[async_trait]
impl CaptureSource for CaptureProcess {
    fn take_stream(&self) -> Result<ByteStream> {
        let reader = self.reader.lock().take().ok_or(Error::StreamTaken)?;
        Ok(Box::new(reader))
    }

    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted("capture"));
        }
        if self.closed.load(Ordering::SeqCst) {
            debug!("Capture closed before it was started");
            return Ok(());
        }

        let writer = self.writer.lock().take();
        let Some(writer) = writer else {
            return Err(Error::NotStarted("capture"));
        };

        let mut cmd = tokio_command(&self.config.binary_path);
        cmd.args(self.config.build_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = SupervisedChild::spawn(&mut cmd)?;

        if let Some(stderr) = child.take_stderr() {
            spawn_line_logger(child.program(), stderr);
        }
        let stdout = child
            .take_stdout()
            .ok_or_else(|| Error::Io(std::io::Error::other("capture stdout unavailable")))?;
        *self.pump.lock() = Some(spawn_pump("capture", stdout, writer));

        let pid = child.id();
        let _ = self.child.set(child);

        // close() may have run while spawning.
        if self.closed.load(Ordering::SeqCst)
            && let Some(child) = self.child.get()
        {
            child.close();
        }

        info!(cmd = %self, ?pid, "Started capture");
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let Some(child) = self.child.get() else {
            return if self.closed.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::NotStarted("capture"))
            };
        };

        let result = child.wait().await;

        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            finish_pump("capture", pump, PUMP_GRACE).await;
        }

        result?;
        info!("Capture finished");
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing capture");

        // Release the stream so readers observe EOF even if capture never started.
        drop(self.writer.lock().take());

        if let Some(child) = self.child.get() {
            child.close();
        }
        if let Some(pump) = self.pump.lock().as_ref() {
            pump.abort();
        }
    }
}
