//! Segment retention.
//!
//! Retention works in two stages. The manifest references at most
//! `playlist_size` of the newest segments. Segments that fall out of the
//! manifest stay on disk until more than `storage_size` of them have piled up,
//! so a client still downloading a just-evicted segment is not cut off. The
//! oldest unreferenced segments are deleted first.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Prefix of media segment file names written by the muxer.
const SEGMENT_PREFIX: &str = "chunk-stream";

/// A media segment file, named `chunk-stream<stream>-<sequence>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Representation (stream) index.
    pub stream: u32,
    /// Sequence number within the representation.
    pub sequence: u64,
    pub path: PathBuf,
}

impl Segment {
    /// Parse a segment from its path. Returns `None` for the manifest,
    /// initialization segments and temporary files.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let (stem, _ext) = name.rsplit_once('.')?;
        let rest = stem.strip_prefix(SEGMENT_PREFIX)?;
        let (stream, sequence) = rest.split_once('-')?;

        Some(Self {
            stream: stream.parse().ok()?,
            sequence: sequence.parse().ok()?,
            path: path.to_path_buf(),
        })
    }
}

/// The two retention counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Segments kept live in the manifest.
    pub playlist_size: usize,
    /// Segments kept on disk after leaving the manifest.
    pub storage_size: usize,
}

impl RetentionPolicy {
    pub fn new(playlist_size: usize, storage_size: usize) -> Self {
        Self {
            playlist_size,
            storage_size,
        }
    }

    /// Upper bound on segment files kept on disk per stream.
    pub fn max_on_disk(&self) -> usize {
        self.playlist_size + self.storage_size
    }
}

/// Sliding window over one stream's segments.
#[derive(Debug, Clone)]
pub struct SegmentWindow {
    policy: RetentionPolicy,
    referenced: VecDeque<Segment>,
    unreferenced: VecDeque<Segment>,
}

impl SegmentWindow {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            referenced: VecDeque::with_capacity(policy.playlist_size + 1),
            unreferenced: VecDeque::with_capacity(policy.storage_size + 1),
        }
    }

    /// Record a newly produced segment. Returns the segments that must now be
    /// deleted, oldest first.
    pub fn push(&mut self, segment: Segment) -> Vec<Segment> {
        self.referenced.push_back(segment);

        while self.referenced.len() > self.policy.playlist_size {
            if let Some(evicted) = self.referenced.pop_front() {
                self.unreferenced.push_back(evicted);
            }
        }

        let excess = self
            .unreferenced
            .len()
            .saturating_sub(self.policy.storage_size);
        self.unreferenced.drain(..excess).collect()
    }

    /// Segments the manifest currently lists, oldest first.
    pub fn referenced(&self) -> impl Iterator<Item = &Segment> {
        self.referenced.iter()
    }

    /// Segments kept on disk after leaving the manifest, oldest first.
    pub fn unreferenced(&self) -> impl Iterator<Item = &Segment> {
        self.unreferenced.iter()
    }

    /// Number of segments retained on disk.
    pub fn len(&self) -> usize {
        self.referenced.len() + self.unreferenced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of one sweep.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    /// Segments seen for the first time.
    pub discovered: usize,
    /// Files deleted.
    pub removed: Vec<PathBuf>,
}

/// Delete media segments left in `directory` by an earlier run.
///
/// A restarted muxer numbers its segments from 1 again, so leftovers with
/// higher sequence numbers would otherwise never be evicted.
pub async fn remove_stale_segments(directory: &Path) -> Result<Vec<PathBuf>> {
    let op = "removing stale segments";
    let mut entries = tokio::fs::read_dir(directory)
        .await
        .map_err(|e| Error::io_path(op, directory, e))?;

    let mut removed = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io_path(op, directory, e))?
    {
        let path = entry.path();
        if Segment::from_path(&path).is_none() {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed.push(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io_path(op, &path, e)),
        }
    }

    if !removed.is_empty() {
        info!(count = removed.len(), directory = %directory.display(), "Removed stale segments");
    }
    Ok(removed)
}

/// Enforces [`RetentionPolicy`] on a segment directory.
///
/// Each sweep lists the directory, feeds segments not seen before into the
/// per-stream [`SegmentWindow`] in sequence order and deletes what the window
/// evicts.
#[derive(Debug)]
pub struct RetentionSweeper {
    directory: PathBuf,
    policy: RetentionPolicy,
    windows: BTreeMap<u32, SegmentWindow>,
    last_seen: BTreeMap<u32, u64>,
}

impl RetentionSweeper {
    pub fn new(directory: impl Into<PathBuf>, policy: RetentionPolicy) -> Self {
        Self {
            directory: directory.into(),
            policy,
            windows: BTreeMap::new(),
            last_seen: BTreeMap::new(),
        }
    }

    /// Segment window of `stream`, if any segment of it was seen.
    pub fn window(&self, stream: u32) -> Option<&SegmentWindow> {
        self.windows.get(&stream)
    }

    pub async fn sweep(&mut self) -> Result<SweepReport> {
        let mut fresh = self.scan().await?;
        fresh.sort_by_key(|s| (s.stream, s.sequence));

        let mut report = SweepReport {
            discovered: fresh.len(),
            ..SweepReport::default()
        };

        let policy = self.policy;
        for segment in fresh {
            self.last_seen.insert(segment.stream, segment.sequence);
            let evicted = self
                .windows
                .entry(segment.stream)
                .or_insert_with(|| SegmentWindow::new(policy))
                .push(segment);

            for old in evicted {
                match tokio::fs::remove_file(&old.path).await {
                    Ok(()) => {
                        debug!(path = %old.path.display(), "Removed expired segment");
                        report.removed.push(old.path);
                    }
                    // The muxer may have removed it already.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %old.path.display(), error = %e, "Failed to remove expired segment");
                    }
                }
            }
        }

        Ok(report)
    }

    /// Sweep every `period` until `stop` is cancelled.
    pub async fn run(mut self, period: Duration, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!("Retention sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) if !report.removed.is_empty() => {
                            debug!(removed = report.removed.len(), "Swept expired segments");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Segment sweep failed"),
                    }
                }
            }
        }

        let retained: usize = self.windows.values().map(SegmentWindow::len).sum();
        info!(retained, "Retention sweeper stopped");
    }

    async fn scan(&self) -> Result<Vec<Segment>> {
        let op = "scanning segment directory";
        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .map_err(|e| Error::io_path(op, &self.directory, e))?;

        let mut fresh = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io_path(op, &self.directory, e))?
        {
            let Some(segment) = Segment::from_path(&entry.path()) else {
                continue;
            };
            let is_new = self
                .last_seen
                .get(&segment.stream)
                .is_none_or(|last| segment.sequence > *last);
            if is_new {
                fresh.push(segment);
            }
        }
        Ok(fresh)
    }
}
