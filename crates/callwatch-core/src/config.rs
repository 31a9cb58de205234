//! Configuration shared by the daemon and the CLI.
//!
//! Layered as built-in defaults, then an optional TOML file, then
//! `CALLWATCH_*` environment variables.

use crate::cache::MissingFacePolicy;
use crate::embedder::variant_spec;
use crate::matcher::MatchPolicy;
use crate::models::{ModelSources, DEFAULT_DETECTOR_URL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "CALLWATCH_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    BadEnv { key: String, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// Which desktop integration captures the call window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Probe the running session.
    #[default]
    Auto,
    Hyprland,
    #[serde(rename = "macos")]
    MacOs,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "hyprland" => Ok(Self::Hyprland),
            "macos" => Ok(Self::MacOs),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Case-insensitive substring of the call window title.
    pub title_keyword: String,
    /// Seconds to sleep after every tick.
    pub interval_seconds: f64,
    /// Similarity percentage a face must reach to count as a match.
    pub threshold_percent: f32,
    pub embedder_variant: String,
    pub match_policy: MatchPolicy,
    pub backend: BackendKind,
    pub model_dir: PathBuf,
    /// Base URL for embedder weights; `<base>/<variant>.onnx` is fetched.
    pub model_base_url: Option<String>,
    pub detector_model_url: Option<String>,
    pub registry_dir: PathBuf,
    pub cache_path: PathBuf,
    pub frames_dir: PathBuf,
    /// Persisted frames kept on disk.
    pub frames_retained: usize,
    /// Consecutive "window not found" ticks before a reminder is logged.
    pub failure_ceiling: u32,
    /// Upper bound on every external command (hyprctl, grim, screencapture).
    pub command_timeout_secs: f64,
    pub persist_queue_capacity: usize,
    pub persist_send_timeout_ms: u64,
    pub missing_face_policy: MissingFacePolicy,
    /// Append match events as JSON lines to this file.
    pub events_path: Option<PathBuf>,
    pub dbus_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data = data_dir();
        Self {
            title_keyword: "Messenger call".to_string(),
            interval_seconds: 1.0,
            threshold_percent: 75.0,
            embedder_variant: "edgeface_s_gamma_05".to_string(),
            match_policy: MatchPolicy::default(),
            backend: BackendKind::default(),
            model_dir: data.join("models"),
            model_base_url: None,
            detector_model_url: Some(DEFAULT_DETECTOR_URL.to_string()),
            registry_dir: data.join("registry"),
            cache_path: data.join("models").join("embeddings.bin"),
            frames_dir: data.join("frames"),
            frames_retained: 5,
            failure_ceiling: 10,
            command_timeout_secs: 5.0,
            persist_queue_capacity: 4,
            persist_send_timeout_ms: 250,
            missing_face_policy: MissingFacePolicy::default(),
            events_path: None,
            dbus_enabled: true,
        }
    }
}

impl Config {
    /// Load from the config file (if any) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var_os("CALLWATCH_CONFIG").map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(|| data_dir().join("config.toml"));

        let mut config = if explicit.is_some() || path.is_file() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;

        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Parse a TOML file; absent keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Override fields from `CALLWATCH_<FIELD>` variables found by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |field: &str| {
            let key = format!("{ENV_PREFIX}{}", field.to_ascii_uppercase());
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, v)) = get("title_keyword") {
            self.title_keyword = v;
        }
        env_parse(get("interval_seconds"), &mut self.interval_seconds)?;
        env_parse(get("threshold_percent"), &mut self.threshold_percent)?;
        if let Some((_, v)) = get("embedder_variant") {
            self.embedder_variant = v;
        }
        if let Some((key, v)) = get("match_policy") {
            self.match_policy = match v.as_str() {
                "first_above_threshold" => MatchPolicy::FirstAboveThreshold,
                "best_match" => MatchPolicy::BestMatch,
                _ => return Err(ConfigError::BadEnv { key, value: v }),
            };
        }
        if let Some((key, v)) = get("backend") {
            self.backend = v.parse().map_err(|_| ConfigError::BadEnv { key, value: v })?;
        }
        if let Some((_, v)) = get("model_dir") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some((_, v)) = get("model_base_url") {
            self.model_base_url = non_empty(v);
        }
        if let Some((_, v)) = get("detector_model_url") {
            self.detector_model_url = non_empty(v);
        }
        if let Some((_, v)) = get("registry_dir") {
            self.registry_dir = PathBuf::from(v);
        }
        if let Some((_, v)) = get("cache_path") {
            self.cache_path = PathBuf::from(v);
        }
        if let Some((_, v)) = get("frames_dir") {
            self.frames_dir = PathBuf::from(v);
        }
        env_parse(get("frames_retained"), &mut self.frames_retained)?;
        env_parse(get("failure_ceiling"), &mut self.failure_ceiling)?;
        env_parse(get("command_timeout_secs"), &mut self.command_timeout_secs)?;
        env_parse(get("persist_queue_capacity"), &mut self.persist_queue_capacity)?;
        env_parse(get("persist_send_timeout_ms"), &mut self.persist_send_timeout_ms)?;
        if let Some((key, v)) = get("missing_face_policy") {
            self.missing_face_policy = match v.as_str() {
                "skip" => MissingFacePolicy::Skip,
                "warn" => MissingFacePolicy::Warn,
                "fail" => MissingFacePolicy::Fail,
                _ => return Err(ConfigError::BadEnv { key, value: v }),
            };
        }
        if let Some((_, v)) = get("events_path") {
            self.events_path = non_empty(v).map(PathBuf::from);
        }
        if let Some((_, v)) = get("dbus_enabled") {
            self.dbus_enabled = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.title_keyword.trim().is_empty() {
            return invalid("title_keyword must not be empty".into());
        }
        seconds("interval_seconds", self.interval_seconds)?;
        if !(0.0..=100.0).contains(&self.threshold_percent) {
            return invalid(format!("threshold_percent must be within [0, 100], got {}", self.threshold_percent));
        }
        if let Err(e) = variant_spec(&self.embedder_variant) {
            return invalid(e.to_string());
        }
        if self.frames_retained == 0 {
            return invalid("frames_retained must be at least 1".into());
        }
        if self.failure_ceiling == 0 {
            return invalid("failure_ceiling must be at least 1".into());
        }
        if self.persist_queue_capacity == 0 {
            return invalid("persist_queue_capacity must be at least 1".into());
        }
        seconds("command_timeout_secs", self.command_timeout_secs)?;
        Ok(())
    }

    /// Poll interval. Values that fail validation saturate instead of panicking.
    pub fn interval(&self) -> Duration {
        seconds("interval_seconds", self.interval_seconds).unwrap_or(Duration::MAX)
    }

    pub fn command_timeout(&self) -> Duration {
        seconds("command_timeout_secs", self.command_timeout_secs).unwrap_or(Duration::MAX)
    }

    pub fn persist_send_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_send_timeout_ms)
    }

    pub fn model_sources(&self) -> ModelSources {
        ModelSources {
            model_dir: self.model_dir.clone(),
            detector_url: self.detector_model_url.clone(),
            embedder_base_url: self.model_base_url.clone(),
        }
    }
}

/// A strictly positive number of seconds that fits in a [`Duration`].
fn seconds(key: &str, value: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(value) {
        Ok(d) if !d.is_zero() => Ok(d),
        _ => Err(ConfigError::Invalid(format!(
            "{key} must be a positive number of seconds, got {value}"
        ))),
    }
}

/// `$XDG_DATA_HOME/callwatch`, falling back to `~/.local/share/callwatch`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("callwatch")
}

fn env_parse<T: std::str::FromStr>(found: Option<(String, String)>, slot: &mut T) -> Result<(), ConfigError> {
    if let Some((key, value)) = found {
        *slot = value.trim().parse().map_err(|_| ConfigError::BadEnv { key, value })?;
    }
    Ok(())
}

fn non_empty(v: String) -> Option<String> {
    (!v.trim().is_empty()).then_some(v)
}
