//! MPEG-DASH segmenting through `ffmpeg`.

pub mod retention;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use process_utils::{SupervisedChild, command_line, probe, spawn_line_logger, tokio_command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::pump::{PumpHandle, finish_pump, spawn_pump};
use crate::pipeline::{ByteStream, SegmentMuxer};
use crate::{Error, Result};

pub use retention::{
    RetentionPolicy, RetentionSweeper, Segment, SegmentWindow, SweepReport, remove_stale_segments,
};

/// Default muxer binary.
pub const DEFAULT_FFMPEG_BINARY: &str = "ffmpeg";

/// Manifest file name inside the segment directory.
pub const MANIFEST_NAME: &str = "manifest.mpd";

/// Time the stdin pump gets to finish after ffmpeg exits.
const PUMP_GRACE: Duration = Duration::from_secs(1);

/// Muxer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Output directory for the manifest and segments.
    pub directory: PathBuf,
    /// Target segment duration in seconds.
    pub segment_time: u32,
    /// Segments referenced by the manifest.
    pub playlist_size: usize,
    /// Segments kept on disk after leaving the manifest.
    pub storage_size: usize,
    /// Input frame rate.
    pub fps: u32,
    pub binary_path: String,
    /// Arguments placed before the generated ones.
    pub extra_args: Vec<String>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            segment_time: 2,
            playlist_size: 10,
            storage_size: 1,
            fps: 30,
            binary_path: DEFAULT_FFMPEG_BINARY.to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl MuxConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn with_segment_time(mut self, seconds: u32) -> Self {
        self.segment_time = seconds;
        self
    }

    pub fn with_retention(mut self, playlist_size: usize, storage_size: usize) -> Self {
        self.playlist_size = playlist_size;
        self.storage_size = storage_size;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
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
        if self.segment_time == 0 {
            return Err(Error::config("Segment time must be greater than zero"));
        }
        if self.playlist_size == 0 {
            return Err(Error::config("Playlist size must be greater than zero"));
        }
        if self.fps == 0 {
            return Err(Error::config("Frame rate must be greater than zero"));
        }
        Ok(())
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(self.playlist_size, self.storage_size)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.directory.join(MANIFEST_NAME)
    }

    /// Sweep interval of the retention sweeper.
    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.segment_time))
    }

    /// Arguments reading raw H.264 from stdin and writing DASH output.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = self.extra_args.clone();

        args.extend(["-y", "-hide_banner", "-loglevel", "warning"].map(String::from));

        // Input: raw H.264 elementary stream on stdin.
        args.extend([
            "-f".to_string(),
            "h264".to_string(),
            "-framerate".to_string(),
            self.fps.to_string(),
            "-i".to_string(),
            "pipe:0".to_string(),
        ]);

        // Output: stream copy into DASH.
        args.extend([
            "-c:v".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "dash".to_string(),
            "-seg_duration".to_string(),
            self.segment_time.to_string(),
            "-window_size".to_string(),
            self.playlist_size.to_string(),
            "-extra_window_size".to_string(),
            self.storage_size.to_string(),
            "-remove_at_exit".to_string(),
            "1".to_string(),
        ]);

        args.push(self.manifest_path().to_string_lossy().into_owned());
        args
    }
}

/// Make sure `directory` exists and accepts new files.
pub async fn check_directory(directory: &Path) -> Result<()> {
    let is_dir = tokio::fs::metadata(directory)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Err(Error::InvalidDirectory(directory.to_path_buf()));
    }

    let dir = directory.to_path_buf();
    let probe = tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(".raspi-live-")
            .tempfile_in(&dir)
            .map(drop)
    })
    .await
    .map_err(|e| Error::TaskFailed {
        task: "directory probe".to_string(),
        message: e.to_string(),
    })?;

    probe.map_err(|source| Error::DirectoryNotWritable {
        path: directory.to_path_buf(),
        source,
    })
}

/// Handle to the `ffmpeg` DASH muxer.
pub struct MuxProcess {
    config: MuxConfig,
    version: Option<String>,
    child: OnceLock<SupervisedChild>,
    pump: Mutex<Option<PumpHandle>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    sweeper_stop: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
}

impl MuxProcess {
    /// Validate `config` and make sure the muxer binary runs.
    pub async fn new(config: MuxConfig) -> Result<Self> {
        config.validate()?;
        let version = Self::detect_version(&config).await?;
        info!(
            version = version.as_deref().unwrap_or("unknown"),
            "Detected muxer"
        );

        Ok(Self {
            config,
            version,
            child: OnceLock::new(),
            pump: Mutex::new(None),
            sweeper: Mutex::new(None),
            sweeper_stop: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Version line reported by the muxer binary.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    async fn detect_version(config: &MuxConfig) -> Result<Option<String>> {
        let mut args = config.extra_args.clone();
        args.push("-version".to_string());

        let output = probe(&config.binary_path, &args)
            .await
            .map_err(|e| Error::MuxerUnavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(Error::MuxerUnavailable(format!(
                "{} -version exited with {}",
                config.binary_path, output.status
            )));
        }

        Ok(output.first_line().map(str::to_string))
    }

    async fn stop_sweeper(&self) {
        self.sweeper_stop.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper
            && let Err(e) = sweeper.await
            && !e.is_cancelled()
        {
            warn!(error = %e, "Retention sweeper task failed");
        }
    }
}

impl fmt::Display for MuxProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&command_line(
            &self.config.binary_path,
            self.config.build_args(),
        ))
    }
}

#[async_trait]
impl SegmentMuxer for MuxProcess {
    async fn mux(&self, input: ByteStream) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted("muxer"));
        }
        if self.closed.load(Ordering::SeqCst) {
            debug!("Muxer closed before it was started");
            return Ok(());
        }

        check_directory(&self.config.directory).await?;
        remove_stale_segments(&self.config.directory).await?;

        let mut cmd = tokio_command(&self.config.binary_path);
        cmd.args(self.config.build_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let child = SupervisedChild::spawn(&mut cmd)?;

        if let Some(stderr) = child.take_stderr() {
            spawn_line_logger(child.program(), stderr);
        }
        let stdin = child
            .take_stdin()
            .ok_or_else(|| Error::Io(std::io::Error::other("muxer stdin unavailable")))?;
        *self.pump.lock() = Some(spawn_pump("muxer", input, stdin));

        let sweeper = RetentionSweeper::new(&self.config.directory, self.config.retention_policy());
        *self.sweeper.lock() = Some(tokio::spawn(
            sweeper.run(self.config.sweep_period(), self.sweeper_stop.clone()),
        ));

        let pid = child.id();
        let _ = self.child.set(child);

        if self.closed.load(Ordering::SeqCst)
            && let Some(child) = self.child.get()
        {
            child.close();
        }

        info!(cmd = %self, ?pid, "Started muxer");
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let Some(child) = self.child.get() else {
            return if self.closed.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::NotStarted("muxer"))
            };
        };

        let result = child.wait().await;

        self.stop_sweeper().await;
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            finish_pump("muxer", pump, PUMP_GRACE).await;
        }

        result?;
        info!(manifest = %self.config.manifest_path().display(), "Muxer finished");
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing muxer");

        if let Some(child) = self.child.get() {
            child.close();
        }
        self.sweeper_stop.cancel();
        if let Some(pump) = self.pump.lock().as_ref() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MuxConfig::default();
        assert_eq!(config.segment_time, 2);
        assert_eq!(config.playlist_size, 10);
        assert_eq!(config.storage_size, 1);
        assert_eq!(config.retention_policy().max_on_disk(), 11);
        assert_eq!(config.sweep_period(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(MuxConfig::new(".").with_segment_time(0).validate().is_err());
        assert!(MuxConfig::new(".").with_retention(0, 1).validate().is_err());
        assert!(MuxConfig::new(".").with_retention(1, 0).validate().is_ok());
        assert!(MuxConfig::new(".").with_fps(0).validate().is_err());
    }

    #[test]
    fn test_build_args() {
        let args = MuxConfig::new("/srv/stream")
            .with_segment_time(4)
            .with_retention(5, 2)
            .with_fps(25)
            .build_args();

        assert_eq!(
            args,
            vec![
                "-y",
                "-hide_banner",
                "-loglevel",
                "warning",
                "-f",
                "h264",
                "-framerate",
                "25",
                "-i",
                "pipe:0",
                "-c:v",
                "copy",
                "-f",
                "dash",
                "-seg_duration",
                "4",
                "-window_size",
                "5",
                "-extra_window_size",
                "2",
                "-remove_at_exit",
                "1",
                "/srv/stream/manifest.mpd",
            ]
        );
    }

    #[test]
    fn test_extra_args_come_first() {
        let args = MuxConfig::new("out")
            .with_extra_args(["-nostdin"])
            .build_args();
        assert_eq!(args[0], "-nostdin");
        assert_eq!(args.last().map(String::as_str), Some("out/manifest.mpd"));
    }

    #[tokio::test]
    async fn test_check_directory() {
        let dir = tempfile::tempdir().unwrap();
        check_directory(dir.path()).await.unwrap();
        // The write probe cleans up after itself.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let missing = dir.path().join("missing");
        let err = check_directory(&missing).await.unwrap_err();
        assert!(err.is_invalid_directory());
    }

    #[tokio::test]
    async fn test_check_directory_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("manifest.mpd");
        std::fs::write(&file, "").unwrap();

        assert!(check_directory(&file).await.unwrap_err().is_invalid_directory());
    }

    #[tokio::test]
    async fn test_missing_binary_is_muxer_unavailable() {
        let config = MuxConfig::default().with_binary("/nonexistent/ffmpeg");
        assert!(matches!(
            MuxProcess::new(config).await,
            Err(Error::MuxerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_close_before_mux() {
        let dir = tempfile::tempdir().unwrap();
        let config = MuxConfig::new(dir.path())
            .with_binary("sh")
            .with_extra_args(["-c", "exit 0"]);
        let muxer = MuxProcess::new(config).await.unwrap();

        muxer.close();
        muxer.close();
        assert!(muxer.wait().await.is_ok());
    }
}
