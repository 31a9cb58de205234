use crate::engine::LoopStatus;
use crate::sink::RecentMatches;
use callwatch_core::ModelRegistry;
use std::sync::Arc;
use tokio::sync::watch;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.callwatch.Watcher1";
pub const OBJECT_PATH: &str = "/org/callwatch/Watcher1";

/// Static facts about the running daemon, reported by `Status()`.
#[derive(Debug, Clone)]
pub struct DaemonInfo {
    pub backend: &'static str,
    pub title_keyword: String,
    pub embedder_variant: String,
    pub threshold_percent: f32,
    pub cache_entries: usize,
}

/// D-Bus interface for the callwatch daemon.
///
/// Bus name: org.callwatch.Watcher1 (session bus)
/// Object path: /org/callwatch/Watcher1
pub struct WatcherService {
    info: DaemonInfo,
    status: watch::Receiver<LoopStatus>,
    recent: RecentMatches,
    models: Arc<ModelRegistry>,
}

impl WatcherService {
    pub fn new(
        info: DaemonInfo,
        status: watch::Receiver<LoopStatus>,
        recent: RecentMatches,
        models: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            info,
            status,
            recent,
            models,
        }
    }

    fn status_json(&self) -> serde_json::Value {
        let status = self.status.borrow().clone();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "backend": self.info.backend,
            "title_keyword": self.info.title_keyword,
            "embedder_variant": self.info.embedder_variant,
            "threshold_percent": self.info.threshold_percent,
            "cache_entries": self.info.cache_entries,
            "detector_loaded": self.models.detector_ready(),
            "embedders_loaded": self.models.loaded_variants(),
            "loop": status,
        })
    }
}

#[interface(name = "org.callwatch.Watcher1")]
impl WatcherService {
    /// Return daemon and loop status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json().to_string())
    }

    /// Return the most recent match events as a JSON array, oldest first.
    async fn recent_matches(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.recent.snapshot()).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Emitted for every face that matches a registry entry.
    #[zbus(signal)]
    pub async fn match_found(
        emitter: &SignalEmitter<'_>,
        identifier: &str,
        similarity: f64,
        face_index: u32,
    ) -> zbus::Result<()>;
}

/// Claim the bus name on the session bus and serve the interface.
pub async fn serve(service: WatcherService) -> zbus::Result<zbus::Connection> {
    let connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;
    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use callwatch_core::models::ModelSources;

    #[test]
    fn test_status_json_reports_loop_state() {
        let (tx, rx) = watch::channel(LoopStatus::default());
        let models = Arc::new(ModelRegistry::new(ModelSources {
            model_dir: std::env::temp_dir().join("callwatch-test-no-models"),
            detector_url: None,
            embedder_base_url: None,
        }));
        let service = WatcherService::new(
            DaemonInfo {
                backend: "hyprland",
                title_keyword: "Messenger call".into(),
                embedder_variant: "edgeface_xxs".into(),
                threshold_percent: 75.0,
                cache_entries: 2,
            },
            rx,
            RecentMatches::new(4),
            models,
        );

        let mut next = LoopStatus::default();
        next.tick = 12;
        next.consecutive_failures = 3;
        tx.send_replace(next);

        let json = service.status_json();
        assert_eq!(json["loop"]["tick"], 12);
        assert_eq!(json["loop"]["state"], "searching");
        assert_eq!(json["cache_entries"], 2);
        assert_eq!(json["detector_loaded"], false);
    }
}
