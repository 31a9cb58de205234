//! The surveillance loop.
//!
//! Runs on a dedicated OS thread: every tick it locates the call window,
//! raises and captures it, hands the frame to persistence, then detects,
//! embeds and matches every face against the registry cache.

use crate::persist::FrameSink;
use crate::sink::{MatchEvent, MatchSink};
use callwatch_core::{EmbeddingCache, FaceDetector, FaceEmbedder, MatchEngine};
use callwatch_hw::Desktop;
use serde::Serialize;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Detector and embedder in one shareable handle.
pub trait Inference: FaceDetector + FaceEmbedder + Send + Sync {}

impl<T: FaceDetector + FaceEmbedder + Send + Sync + ?Sized> Inference for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    /// No call window on the last tick.
    Searching,
    /// The call window is being captured.
    Active,
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    NotFound,
    CaptureFailed,
    Scanned { faces: usize, matches: usize },
}

/// Snapshot published after every tick.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub state: LoopState,
    pub tick: u64,
    pub consecutive_failures: u32,
    pub frames_captured: u64,
    pub matches_total: u64,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            state: LoopState::Searching,
            tick: 0,
            consecutive_failures: 0,
            frames_captured: 0,
            matches_total: 0,
        }
    }
}

pub struct LoopSettings {
    pub title_keyword: String,
    pub embedder_variant: String,
    pub failure_ceiling: u32,
    pub interval: Duration,
}

pub struct SurveillanceLoop {
    desktop: Box<dyn Desktop>,
    models: Arc<dyn Inference>,
    cache: Arc<EmbeddingCache>,
    matcher: MatchEngine,
    frames: Box<dyn FrameSink>,
    sinks: Vec<Box<dyn MatchSink>>,
    settings: LoopSettings,
    status_tx: watch::Sender<LoopStatus>,
    status: LoopStatus,
}

impl SurveillanceLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        desktop: Box<dyn Desktop>,
        models: Arc<dyn Inference>,
        cache: Arc<EmbeddingCache>,
        matcher: MatchEngine,
        frames: Box<dyn FrameSink>,
        sinks: Vec<Box<dyn MatchSink>>,
        settings: LoopSettings,
        status_tx: watch::Sender<LoopStatus>,
    ) -> Self {
        Self {
            desktop,
            models,
            cache,
            matcher,
            frames,
            sinks,
            settings,
            status_tx,
            status: LoopStatus::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.status.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.status.consecutive_failures
    }

    /// Tick until `stop` fires or its sender is dropped.
    ///
    /// The stop signal is observed during the inter-tick sleep, so shutdown
    /// waits for at most one tick in progress.
    pub fn run(mut self, stop: Receiver<()>) {
        tracing::info!(
            keyword = %self.settings.title_keyword,
            variant = %self.settings.embedder_variant,
            interval_ms = self.settings.interval.as_millis() as u64,
            cache_entries = self.cache.len(),
            "surveillance loop started"
        );

        loop {
            self.tick();
            match stop.recv_timeout(self.settings.interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        tracing::info!(ticks = self.status.tick, "surveillance loop stopped");
    }

    /// One pass of locate → focus → capture → persist → detect → embed → match.
    pub fn tick(&mut self) -> TickOutcome {
        self.status.tick += 1;
        let outcome = self.run_tick(self.status.tick);
        self.status_tx.send_replace(self.status.clone());
        outcome
    }

    fn run_tick(&mut self, tick: u64) -> TickOutcome {
        let Some(target) = self.desktop.locate(&self.settings.title_keyword) else {
            self.window_missing(tick);
            return TickOutcome::NotFound;
        };

        self.status.consecutive_failures = 0;
        if self.status.state == LoopState::Searching {
            tracing::info!(tick, handle = %target.handle, rect = %target.rect, "call window found");
            self.status.state = LoopState::Active;
        }

        if let Err(e) = self.desktop.focus(&target.handle) {
            tracing::debug!(tick, stage = "focus", error = %e, "cannot raise call window");
        }

        let frame = match self.desktop.capture(&target.rect) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(tick, stage = "capture", error = %e, "capture failed");
                return TickOutcome::CaptureFailed;
            }
        };
        self.status.frames_captured += 1;
        self.frames.submit(frame.clone());

        let faces = self.models.detect(&frame.pixels);
        tracing::debug!(tick, frame = frame.sequence, faces = faces.len(), "frame scanned");

        let mut matches = 0;
        for (face_index, face) in faces.iter().enumerate() {
            let embedding = match self.models.embed(face, &self.settings.embedder_variant) {
                Ok(embedding) => embedding,
                Err(e) if e.is_model_unusable() => {
                    tracing::warn!(tick, stage = "embed", face = face_index, error = %e, "embedding unavailable; skipping tick");
                    break;
                }
                Err(e) => {
                    tracing::warn!(tick, stage = "embed", face = face_index, error = %e, "cannot embed face");
                    continue;
                }
            };

            let result = match self.matcher.find_match(&embedding, &self.cache, face_index) {
                Ok(Some(result)) => result,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(tick, stage = "match", error = %e, "cannot compare against cache");
                    break;
                }
            };

            matches += 1;
            let event = MatchEvent {
                id: uuid::Uuid::new_v4(),
                tick,
                display_name: callwatch_core::registry::display_name(&result.identifier),
                identifier: result.identifier,
                similarity: result.similarity,
                face_index,
                frame_sequence: frame.sequence,
                detected_at: chrono::Local::now(),
            };
            for sink in &self.sinks {
                sink.emit(&event);
            }
        }

        self.status.matches_total += matches as u64;
        TickOutcome::Scanned {
            faces: faces.len(),
            matches,
        }
    }

    fn window_missing(&mut self, tick: u64) {
        if self.status.state == LoopState::Active {
            tracing::info!(tick, "call window lost");
            self.status.state = LoopState::Searching;
        }

        self.status.consecutive_failures += 1;
        let failures = self.status.consecutive_failures;
        if failures == 1 {
            tracing::info!(tick, keyword = %self.settings.title_keyword, "call window not found");
        }
        if failures >= self.settings.failure_ceiling {
            tracing::warn!(tick, failures, keyword = %self.settings.title_keyword, "call window still not found");
            self.status.consecutive_failures = 0;
        }
    }
}
