//! Frame persistence.
//!
//! Captured frames are handed to a bounded queue drained by a tokio task, so
//! PNG encoding and disk I/O never run on the surveillance thread. Only the
//! most recent frames are kept on disk.

use callwatch_hw::Frame;
use chrono::Utc;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

const FRAME_PREFIX: &str = "frame_";
const FRAME_SUFFIX: &str = ".png";

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("encode: {0}")]
    Encode(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Somewhere captured frames go after capture. Must not block for long.
pub trait FrameSink: Send {
    fn submit(&self, frame: Frame);
}

/// Directory of persisted frames with a retention bound.
pub struct FrameStore {
    dir: PathBuf,
    keep: usize,
}

impl FrameStore {
    pub fn new(dir: PathBuf, keep: usize) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, keep: keep.max(1) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `frame` as PNG, then prune older frames.
    ///
    /// The image is encoded into a hidden `.part` file and renamed into place,
    /// so a half-written frame is never listed or pruned as a complete one.
    pub fn write(&self, frame: &Frame) -> Result<PathBuf, PersistError> {
        let name = frame_file_name(frame);
        let part = self.dir.join(format!(".{name}.part"));
        let dest = self.dir.join(&name);

        if let Err(e) = frame.pixels.save_with_format(&part, ImageFormat::Png) {
            let _ = std::fs::remove_file(&part);
            return Err(e.into());
        }
        std::fs::rename(&part, &dest)?;

        let removed = self.prune()?;
        tracing::debug!(path = %dest.display(), removed, "frame persisted");
        Ok(dest)
    }

    /// Delete all but the `keep` most recently written frames.
    pub fn prune(&self) -> std::io::Result<usize> {
        let mut frames = self.completed_frames()?;
        if frames.len() <= self.keep {
            return Ok(0);
        }

        // Newest first; the name breaks ties within one mtime tick.
        frames.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

        let mut removed = 0;
        for (path, _) in frames.drain(self.keep..) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot prune frame"),
            }
        }
        Ok(removed)
    }

    /// Completed frame files with their modification time.
    pub fn completed_frames(&self) -> std::io::Result<Vec<(PathBuf, SystemTime)>> {
        let mut frames = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !(name.starts_with(FRAME_PREFIX) && name.ends_with(FRAME_SUFFIX)) {
                continue;
            }
            let meta = entry.metadata()?;
            if meta.is_file() {
                frames.push((entry.path(), meta.modified()?));
            }
        }
        Ok(frames)
    }
}

/// `frame_<YYYYmmdd_HHMMSS_micros>_<seq>.png`, stamped in UTC so names keep
/// increasing across DST changes.
pub fn frame_file_name(frame: &Frame) -> String {
    format!(
        "{FRAME_PREFIX}{}_{}{FRAME_SUFFIX}",
        frame.captured_at.with_timezone(&Utc).format("%Y%m%d_%H%M%S_%6f"),
        frame.sequence
    )
}

/// Sending half of the persistence queue, used from the surveillance thread.
pub struct PersistQueue {
    tx: mpsc::Sender<Frame>,
    runtime: Handle,
    send_timeout: Duration,
}

impl PersistQueue {
    /// Start the persistence worker on `runtime`.
    ///
    /// The worker exits once every `PersistQueue` is dropped and the queued
    /// frames are written; await the returned handle to drain on shutdown.
    pub fn start(store: FrameStore, capacity: usize, send_timeout: Duration, runtime: &Handle) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = runtime.spawn(run_worker(Arc::new(store), rx));
        (Self::with_sender(tx, runtime.clone(), send_timeout), worker)
    }

    fn with_sender(tx: mpsc::Sender<Frame>, runtime: Handle, send_timeout: Duration) -> Self {
        Self {
            tx,
            runtime,
            send_timeout,
        }
    }
}

impl FrameSink for PersistQueue {
    /// Queue a frame, waiting at most the send timeout for room.
    ///
    /// Must be called from outside the runtime (the surveillance thread).
    fn submit(&self, frame: Frame) {
        let sequence = frame.sequence;
        let frame = match self.tx.try_send(frame) {
            Ok(()) => return,
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(sequence, "persistence queue closed; frame dropped");
                return;
            }
            Err(TrySendError::Full(frame)) => frame,
        };

        let sent = self
            .runtime
            .block_on(tokio::time::timeout(self.send_timeout, self.tx.send(frame)));
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::warn!(sequence, "persistence queue closed; frame dropped"),
            Err(_) => tracing::warn!(
                sequence,
                timeout_ms = self.send_timeout.as_millis() as u64,
                "persistence queue full; frame dropped"
            ),
        }
    }
}

async fn run_worker(store: Arc<FrameStore>, mut rx: mpsc::Receiver<Frame>) {
    tracing::debug!(dir = %store.dir().display(), "persistence worker started");
    while let Some(frame) = rx.recv().await {
        let sequence = frame.sequence;
        let store = Arc::clone(&store);
        match tokio::task::spawn_blocking(move || store.write(&frame)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(stage = "persist", sequence, error = %e, "cannot write frame"),
            Err(e) => tracing::warn!(stage = "persist", sequence, error = %e, "frame writer panicked"),
        }
    }
    tracing::debug!("persistence queue drained");
}
