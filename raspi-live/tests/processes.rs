//! Capture and mux process lifecycles against `sh` stand-ins.
#![cfg(unix)]

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use process_utils::ProcessError;
use raspi_live::capture::{CaptureProcess, StreamConfig};
use raspi_live::muxer::{MuxConfig, MuxProcess};
use raspi_live::pipeline::{
    self, CaptureSource, Component, SegmentMuxer, ShutdownConfig, Termination,
};
use raspi_live::server::ServerConfig;
use raspi_live::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// `sh -c <script>` stand-in for `libcamera-vid`. The first generated
/// argument lands in `$0`.
fn fake_camera(script: &str) -> StreamConfig {
    let script = format!(
        "[ \"$0\" = --list-cameras ] && {{ echo '0 : imx219 [3280x2464] (/base/i2c@80000/imx219@10)'; exit 0; }}\n{script}"
    );
    StreamConfig::new(640, 480, 30)
        .with_binary("sh")
        .with_extra_args(["-c".to_string(), script])
}

/// `sh -c <script>` stand-in for `ffmpeg`. `$out` is the manifest path.
fn fake_ffmpeg(directory: &Path, script: &str) -> MuxConfig {
    let script = format!(
        "[ \"$0\" = -version ] && {{ echo 'ffmpeg version 6.1'; exit 0; }}\nfor out; do :; done\n{script}"
    );
    MuxConfig::new(directory)
        .with_binary("sh")
        .with_extra_args(["-c".to_string(), script])
}

async fn read_all(mut stream: impl AsyncReadExt + Unpin) -> Vec<u8> {
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("stream should reach EOF")
        .unwrap();
    buf
}

#[tokio::test]
async fn test_capture_streams_stdout_and_reports_exit_status() {
    let capture = CaptureProcess::new(fake_camera("printf 'h264-bytes'; exit 3"))
        .await
        .unwrap();
    assert_eq!(
        capture.camera(),
        Some("0 : imx219 [3280x2464] (/base/i2c@80000/imx219@10)")
    );

    let stream = capture.take_stream().unwrap();
    assert!(matches!(capture.take_stream(), Err(Error::StreamTaken)));

    capture.start().await.unwrap();
    assert_eq!(read_all(stream).await, b"h264-bytes");

    match capture.wait().await {
        Err(Error::Process(ProcessError::Exited { status, .. })) => {
            assert_eq!(status.code(), Some(3));
        }
        other => panic!("expected exit error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_no_cameras_available() {
    let config = StreamConfig::default()
        .with_binary("sh")
        .with_extra_args(["-c", "echo 'No cameras available!'"]);

    assert!(matches!(
        CaptureProcess::new(config).await,
        Err(Error::DeviceUnavailable(_))
    ));
}

#[tokio::test]
async fn test_capture_close_during_wait_is_clean() {
    let capture = Arc::new(
        CaptureProcess::new(fake_camera("exec sleep 30"))
            .await
            .unwrap(),
    );
    let stream = capture.take_stream().unwrap();
    capture.start().await.unwrap();

    let waiter = {
        let capture = capture.clone();
        tokio::spawn(async move { capture.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    capture.close();
    capture.close();

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("wait should return after close")
        .unwrap();
    assert!(result.is_ok());
    assert!(read_all(stream).await.is_empty());
}

#[tokio::test]
async fn test_capture_close_before_start() {
    let capture = CaptureProcess::new(fake_camera("exec sleep 30"))
        .await
        .unwrap();
    let stream = capture.take_stream().unwrap();

    capture.close();
    capture.start().await.unwrap();
    capture.wait().await.unwrap();
    assert!(read_all(stream).await.is_empty());
}

#[tokio::test]
async fn test_muxer_consumes_input_until_eof() {
    let dir = tempfile::tempdir().unwrap();
    let muxer = MuxProcess::new(fake_ffmpeg(dir.path(), "cat > \"$out\""))
        .await
        .unwrap();
    assert_eq!(muxer.version(), Some("ffmpeg version 6.1"));

    let (mut writer, reader) = tokio::io::duplex(64);
    muxer.mux(Box::new(reader)).await.unwrap();
    assert!(matches!(
        muxer.mux(Box::new(tokio::io::empty())).await,
        Err(Error::AlreadyStarted(_))
    ));

    writer.write_all(b"frame-1 frame-2").await.unwrap();
    drop(writer);

    tokio::time::timeout(Duration::from_secs(5), muxer.wait())
        .await
        .expect("muxer should exit at end of input")
        .unwrap();

    let written = std::fs::read(dir.path().join("manifest.mpd")).unwrap();
    assert_eq!(written, b"frame-1 frame-2");
}

#[tokio::test]
async fn test_muxer_clears_segments_from_previous_run() {
    let dir = tempfile::tempdir().unwrap();
    for seq in 1..=20 {
        std::fs::write(dir.path().join(format!("chunk-stream0-{:05}.m4s", seq)), b"old").unwrap();
    }
    std::fs::write(dir.path().join("init-stream0.m4s"), b"init").unwrap();

    let muxer = MuxProcess::new(fake_ffmpeg(dir.path(), "cat > \"$out\""))
        .await
        .unwrap();
    muxer.mux(Box::new(tokio::io::empty())).await.unwrap();
    muxer.wait().await.unwrap();

    let leftovers = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("chunk-stream"))
        .count();
    assert_eq!(leftovers, 0);
    assert!(dir.path().join("init-stream0.m4s").exists());
}

#[tokio::test]
async fn test_muxer_failure_surfaces() {
    let dir = tempfile::tempdir().unwrap();
    let muxer = MuxProcess::new(fake_ffmpeg(dir.path(), "cat > /dev/null; exit 1"))
        .await
        .unwrap();

    muxer.mux(Box::new(tokio::io::empty())).await.unwrap();
    assert!(matches!(
        muxer.wait().await,
        Err(Error::Process(ProcessError::Exited { .. }))
    ));
}

#[tokio::test]
async fn test_muxer_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");
    let muxer = MuxProcess::new(fake_ffmpeg(&missing, "cat > \"$out\""))
        .await
        .unwrap();

    let err = muxer.mux(Box::new(tokio::io::empty())).await.unwrap_err();
    assert!(err.is_invalid_directory());
}

#[tokio::test]
async fn test_muxer_close_during_wait() {
    let dir = tempfile::tempdir().unwrap();
    let muxer = Arc::new(
        MuxProcess::new(fake_ffmpeg(dir.path(), "exec sleep 30"))
            .await
            .unwrap(),
    );
    let (_writer, reader) = tokio::io::duplex(64);
    muxer.mux(Box::new(reader)).await.unwrap();

    let waiter = {
        let muxer = muxer.clone();
        tokio::spawn(async move { muxer.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    muxer.close();

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("wait should return after close")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_pipeline_runs_until_capture_ends() {
    let dir = tempfile::tempdir().unwrap();
    let stream = fake_camera("printf 'camera-output'");
    let mux = fake_ffmpeg(dir.path(), "cat > \"$out\"");
    let server = ServerConfig::new(0, dir.path()).with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST));

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        pipeline::run(
            stream,
            mux,
            server,
            ShutdownConfig::default(),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("pipeline should stop once capture ends")
    .unwrap();

    assert!(matches!(
        outcome,
        Termination::ComponentExited(Component::Capture | Component::Muxer)
    ));
    let written = std::fs::read(dir.path().join("manifest.mpd")).unwrap();
    assert_eq!(written, b"camera-output");
}

#[tokio::test]
async fn test_pipeline_reports_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");

    let result = pipeline::run(
        fake_camera("exec sleep 30"),
        fake_ffmpeg(&missing, "cat > \"$out\""),
        ServerConfig::new(0, &missing).with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ShutdownConfig::default(),
        CancellationToken::new(),
    )
    .await;

    match result {
        Err(e) => {
            assert!(e.is_invalid_directory());
            assert_eq!(e.diagnostic(), "Directory does not exist");
        }
        Ok(outcome) => panic!("expected missing directory error, got {:?}", outcome),
    }
}
