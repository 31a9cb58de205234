use anyhow::{bail, Context, Result};
use callwatch_core::registry::display_name;
use callwatch_core::{
    build_cache, Config, EmbeddingCache, FaceDetector, FaceEmbedder, MissingFacePolicy, ModelRegistry, Registry,
};
use callwatch_hw::{open_desktop, Desktop, WindowLocator};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "callwatch", about = "callwatch registry and diagnostics CLI")]
struct Cli {
    /// Embedder variant (overrides configuration)
    #[arg(long, global = true)]
    variant: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the embedding cache from the registry photos
    Precompute {
        /// Registry directory (defaults to configuration)
        #[arg(long)]
        registry: Option<PathBuf>,
        /// Output cache file (defaults to configuration)
        #[arg(long)]
        out: Option<PathBuf>,
        /// What to do with photos that have no detectable face
        #[arg(long, value_enum)]
        missing_face: Option<MissingFace>,
    },
    /// Show the contents of the embedding cache
    Cache {
        /// Cache file (defaults to configuration)
        path: Option<PathBuf>,
    },
    /// Compare the first face of two photos
    Compare { a: PathBuf, b: PathBuf },
    /// Detect faces in a photo
    Detect {
        image: PathBuf,
        /// Directory to save face crops into
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List visible windows and mark the call window
    Windows {
        /// Title keyword (defaults to configuration)
        #[arg(long)]
        keyword: Option<String>,
    },
    /// Show daemon status
    Status,
    /// Show recent matches reported by the daemon
    Recent,
}

#[derive(Clone, Copy, ValueEnum)]
enum MissingFace {
    Skip,
    Warn,
    Fail,
}

impl From<MissingFace> for MissingFacePolicy {
    fn from(value: MissingFace) -> Self {
        match value {
            MissingFace::Skip => MissingFacePolicy::Skip,
            MissingFace::Warn => MissingFacePolicy::Warn,
            MissingFace::Fail => MissingFacePolicy::Fail,
        }
    }
}

// `#[zbus::proxy]` generates `WatcherProxy` (async) and `WatcherProxyBlocking`.
#[zbus::proxy(
    interface = "org.callwatch.Watcher1",
    default_service = "org.callwatch.Watcher1",
    default_path = "/org/callwatch/Watcher1"
)]
trait Watcher {
    async fn status(&self) -> zbus::Result<String>;
    async fn recent_matches(&self) -> zbus::Result<String>;
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load().context("invalid configuration")?;
    if let Some(variant) = cli.variant {
        tracing::debug!(configured = %config.embedder_variant, %variant, "embedder variant overridden");
        config.embedder_variant = variant;
        config.validate()?;
    }

    match cli.command {
        Commands::Precompute {
            registry,
            out,
            missing_face,
        } => precompute(&config, registry, out, missing_face.map(Into::into)),
        Commands::Cache { path } => show_cache(&path.unwrap_or_else(|| config.cache_path.clone())),
        Commands::Compare { a, b } => compare(&config, &a, &b),
        Commands::Detect { image, out } => detect(&config, &image, out.as_deref()),
        Commands::Windows { keyword } => windows(&config, keyword.as_deref().unwrap_or(&config.title_keyword)),
        Commands::Status => {
            let proxy_status = daemon()?.status()?;
            print_json(&proxy_status);
            Ok(())
        }
        Commands::Recent => {
            let recent = daemon()?.recent_matches()?;
            print_json(&recent);
            Ok(())
        }
    }
}

fn precompute(
    config: &Config,
    registry_dir: Option<PathBuf>,
    out: Option<PathBuf>,
    missing_face: Option<MissingFacePolicy>,
) -> Result<()> {
    let registry_dir = registry_dir.unwrap_or_else(|| config.registry_dir.clone());
    let out = out.unwrap_or_else(|| config.cache_path.clone());
    let policy = missing_face.unwrap_or(config.missing_face_policy);

    let registry = Registry::scan(&registry_dir)?;
    if registry.entries().is_empty() {
        bail!("no registry photos in {}", registry_dir.display());
    }

    let models = ModelRegistry::new(config.model_sources());
    let (cache, report) = build_cache(registry.entries(), &models, &config.embedder_variant, policy)?;
    cache.save(&out).with_context(|| format!("cannot write {}", out.display()))?;

    println!(
        "Embedded {} of {} registry photos with {} -> {}",
        report.embedded,
        registry.entries().len(),
        config.embedder_variant,
        out.display()
    );
    if !report.no_face.is_empty() {
        println!("No face found ({}):", report.no_face.len());
        for id in &report.no_face {
            println!("  {}", display_name(id));
        }
    }
    if !report.failed.is_empty() {
        println!("Failed ({}):", report.failed.len());
        for (id, reason) in &report.failed {
            println!("  {}: {reason}", display_name(id));
        }
    }
    Ok(())
}

fn show_cache(path: &Path) -> Result<()> {
    let cache = EmbeddingCache::load(path).with_context(|| format!("cannot read {}", path.display()))?;
    println!("{}", path.display());
    println!("  variant:   {}", cache.variant());
    println!("  dimension: {}", cache.dim().map_or("-".to_string(), |d| d.to_string()));
    println!("  entries:   {}", cache.len());
    for entry in cache.entries() {
        println!("    {:<32} {}", entry.identifier, display_name(&entry.identifier));
    }
    Ok(())
}

fn compare(config: &Config, a: &Path, b: &Path) -> Result<()> {
    let models = ModelRegistry::new(config.model_sources());
    let ea = embed_first_face(&models, a, &config.embedder_variant)?;
    let eb = embed_first_face(&models, b, &config.embedder_variant)?;

    let similarity = ea.similarity_percent(&eb);
    let verdict = if similarity >= config.threshold_percent {
        "MATCH"
    } else {
        "no match"
    };
    println!(
        "{similarity:.1}% ({verdict} at threshold {:.1}, {})",
        config.threshold_percent, config.embedder_variant
    );
    Ok(())
}

fn embed_first_face(models: &ModelRegistry, path: &Path, variant: &str) -> Result<callwatch_core::Embedding> {
    let faces = models.detect_path(path);
    let Some(face) = faces.first() else {
        bail!("no face found in {}", path.display());
    };
    Ok(models.embed(face, variant)?)
}

fn detect(config: &Config, image: &Path, out: Option<&Path>) -> Result<()> {
    let models = ModelRegistry::new(config.model_sources());
    let faces = models.detect_path(image);
    println!("{}: {} face(s)", image.display(), faces.len());

    let stem = image.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    if let Some(dir) = out {
        std::fs::create_dir_all(dir)?;
    }
    for (i, face) in faces.iter().enumerate() {
        let r = face.rect;
        println!(
            "  [{i}] {}x{} at ({}, {}) confidence {:.3}",
            r.width, r.height, r.x, r.y, face.confidence
        );
        if let Some(dir) = out {
            let path = dir.join(format!("{stem}_face_{i}.png"));
            face.image
                .save(&path)
                .with_context(|| format!("cannot save {}", path.display()))?;
            tracing::debug!(path = %path.display(), face = i, "saved face crop");
        }
    }
    Ok(())
}

fn windows(config: &Config, keyword: &str) -> Result<()> {
    let desktop = open_desktop(config.backend, config.command_timeout());
    let windows = desktop.list_windows()?;
    let target = callwatch_hw::window::select_target(&windows, keyword);

    for w in &windows {
        let marker = match &target {
            Some(t) if t.handle == w.handle => "*",
            _ => " ",
        };
        let rect = w.rect.map_or("(zero size)".to_string(), |r| r.to_string());
        println!("{marker} {:<24} {:<22} {}", w.handle.to_string().replace('\t', ":"), rect, w.title);
    }
    if target.is_none() {
        println!("no window title contains {keyword:?} ({} backend)", desktop.name());
    }
    Ok(())
}

fn daemon() -> Result<WatcherProxyBlocking<'static>> {
    tracing::debug!("connecting to callwatchd on the session bus");
    let conn = zbus::blocking::connection::Builder::session()?
        .method_timeout(Duration::from_secs(3))
        .build()
        .context("cannot connect to the session bus")?;
    WatcherProxyBlocking::new(&conn).context("callwatchd is not running")
}

fn print_json(raw: &str) {
    println!("{}", pretty_json(raw));
}

/// Pretty-print a daemon reply, passing anything that is not JSON through.
fn pretty_json(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw).and_then(|v| serde_json::to_string_pretty(&v)) {
        Ok(pretty) => pretty,
        Err(e) => {
            tracing::warn!(error = %e, "daemon reply is not JSON; printing it raw");
            raw.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_precompute_flags() {
        let cli = Cli::parse_from(["callwatch", "precompute", "--missing-face", "fail", "--out", "/tmp/c.bin"]);
        match cli.command {
            Commands::Precompute { missing_face, out, .. } => {
                assert!(matches!(missing_face, Some(MissingFace::Fail)));
                assert_eq!(out, Some(PathBuf::from("/tmp/c.bin")));
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_global_variant_flag() {
        let cli = Cli::parse_from(["callwatch", "compare", "a.jpg", "b.jpg", "--variant", "edgeface_xxs"]);
        assert_eq!(cli.variant.as_deref(), Some("edgeface_xxs"));
    }

    #[test]
    fn test_pretty_json_passes_through_non_json() {
        assert_eq!(pretty_json(r#"{"tick":3}"#), "{\n  \"tick\": 3\n}");
        assert_eq!(pretty_json("daemon said no"), "daemon said no");
    }

    #[test]
    fn test_missing_face_maps_to_policy() {
        assert_eq!(MissingFacePolicy::from(MissingFace::Skip), MissingFacePolicy::Skip);
        assert_eq!(MissingFacePolicy::from(MissingFace::Fail), MissingFacePolicy::Fail);
    }
}
