//! Match event delivery.

use crate::dbus_interface::WatcherService;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;
use zbus::object_server::SignalEmitter;

/// A registered person seen in the call window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEvent {
    pub id: Uuid,
    pub tick: u64,
    pub identifier: String,
    pub display_name: String,
    pub similarity: f32,
    pub face_index: usize,
    pub frame_sequence: u64,
    pub detected_at: DateTime<Local>,
}

/// Downstream consumer of match events. Called on the loop thread.
pub trait MatchSink: Send {
    fn emit(&self, event: &MatchEvent);
}

pub struct TracingSink;

impl MatchSink for TracingSink {
    fn emit(&self, event: &MatchEvent) {
        tracing::warn!(
            tick = event.tick,
            identifier = %event.identifier,
            name = %event.display_name,
            similarity = format!("{:.1}", event.similarity),
            face = event.face_index,
            frame = event.frame_sequence,
            "registered person detected"
        );
    }
}

/// Appends one JSON object per line.
pub struct JsonLinesSink {
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl MatchSink for JsonLinesSink {
    fn emit(&self, event: &MatchEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "cannot serialize match event");
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
            tracing::warn!(error = %e, "cannot append match event");
        }
    }
}

/// Last few events, newest last, for the `RecentMatches` D-Bus method.
#[derive(Clone)]
pub struct RecentMatches {
    inner: Arc<Mutex<VecDeque<MatchEvent>>>,
    capacity: usize,
}

impl RecentMatches {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn snapshot(&self) -> Vec<MatchEvent> {
        let events = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        events.iter().cloned().collect()
    }
}

impl MatchSink for RecentMatches {
    fn emit(&self, event: &MatchEvent) {
        let mut events = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

/// Broadcasts `MatchFound` on the session bus.
pub struct DbusSink {
    connection: zbus::Connection,
    runtime: tokio::runtime::Handle,
}

impl DbusSink {
    pub fn new(connection: zbus::Connection, runtime: tokio::runtime::Handle) -> Self {
        Self { connection, runtime }
    }
}

impl MatchSink for DbusSink {
    fn emit(&self, event: &MatchEvent) {
        let connection = self.connection.clone();
        let identifier = event.identifier.clone();
        let similarity = f64::from(event.similarity);
        let face_index = u32::try_from(event.face_index).unwrap_or(u32::MAX);

        self.runtime.spawn(async move {
            let sent = match SignalEmitter::new(&connection, crate::dbus_interface::OBJECT_PATH) {
                Ok(emitter) => WatcherService::match_found(&emitter, &identifier, similarity, face_index).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                tracing::warn!(error = %e, "cannot emit MatchFound signal");
            }
        });
    }
}
