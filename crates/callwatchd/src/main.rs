use anyhow::{Context, Result};
use callwatch_core::{Config, EmbeddingCache, MatchEngine, ModelRegistry};
use callwatch_hw::{open_desktop, Desktop};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod dbus_interface;
mod engine;
mod persist;
mod sink;

use dbus_interface::{DaemonInfo, WatcherService};
use engine::{LoopSettings, LoopStatus, SurveillanceLoop};
use persist::{FrameStore, PersistQueue};
use sink::{DbusSink, JsonLinesSink, MatchSink, RecentMatches, TracingSink};

const RECENT_MATCHES: usize = 50;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "callwatchd starting");

    let config = Config::load().context("invalid configuration")?;
    let runtime = tokio::runtime::Handle::current();

    let models = Arc::new(ModelRegistry::new(config.model_sources()));
    let cache = Arc::new(EmbeddingCache::load_or_empty(&config.cache_path, &config.embedder_variant));
    let matcher = MatchEngine::new(config.threshold_percent, config.match_policy)?;
    let desktop = open_desktop(config.backend, config.command_timeout());
    let backend = desktop.name();

    let store = FrameStore::new(config.frames_dir.clone(), config.frames_retained)
        .with_context(|| format!("cannot create frames directory {}", config.frames_dir.display()))?;
    let (frames, persist_worker) = PersistQueue::start(
        store,
        config.persist_queue_capacity,
        config.persist_send_timeout(),
        &runtime,
    );

    let recent = RecentMatches::new(RECENT_MATCHES);
    let mut sinks: Vec<Box<dyn MatchSink>> = vec![Box::new(TracingSink), Box::new(recent.clone())];
    if let Some(path) = &config.events_path {
        let sink = JsonLinesSink::open(path).with_context(|| format!("cannot open events file {}", path.display()))?;
        sinks.push(Box::new(sink));
    }

    let (status_tx, status_rx) = watch::channel(LoopStatus::default());

    // Held for the life of the process; dropping it releases the bus name.
    let _connection = if config.dbus_enabled {
        let service = WatcherService::new(
            DaemonInfo {
                backend,
                title_keyword: config.title_keyword.clone(),
                embedder_variant: config.embedder_variant.clone(),
                threshold_percent: config.threshold_percent,
                cache_entries: cache.len(),
            },
            status_rx,
            recent,
            Arc::clone(&models),
        );
        match dbus_interface::serve(service).await {
            Ok(connection) => {
                sinks.push(Box::new(DbusSink::new(connection.clone(), runtime.clone())));
                Some(connection)
            }
            Err(e) => {
                tracing::warn!(error = %e, "D-Bus unavailable; continuing without status interface");
                None
            }
        }
    } else {
        None
    };

    let surveillance = SurveillanceLoop::new(
        desktop,
        models,
        cache,
        matcher,
        Box::new(frames),
        sinks,
        LoopSettings {
            title_keyword: config.title_keyword.clone(),
            embedder_variant: config.embedder_variant.clone(),
            failure_ceiling: config.failure_ceiling,
            interval: config.interval(),
        },
        status_tx,
    );

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    let loop_thread = std::thread::Builder::new()
        .name("callwatch-loop".into())
        .spawn(move || surveillance.run(stop_rx))
        .context("failed to spawn surveillance thread")?;

    tracing::info!("callwatchd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("callwatchd shutting down");

    let _ = stop_tx.send(());
    let joined = tokio::task::spawn_blocking(move || loop_thread.join()).await?;
    if joined.is_err() {
        tracing::error!("surveillance thread panicked");
    }

    // The loop owned the only queue sender; the worker finishes what is queued.
    persist_worker.await?;
    tracing::info!("frame persistence drained");

    Ok(())
}
