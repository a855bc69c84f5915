use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::reporter::ReporterSettings;
use crate::worker::WorkerSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One camera or video URI, with the label used in logs and thread names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub label: String,
    pub uri: String,
}

/// Daemon configuration.
///
/// Loaded from `PRESENCE_*` environment variables or a TOML file; every
/// field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub streams: Vec<StreamConfig>,
    /// SQLite database holding the `identities` table.
    pub db_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Euclidean distance below which a face is recognized. The default
    /// suits the bundled ArcFace encoder (unit-length descriptors).
    pub match_threshold: f32,
    /// Minimum seconds between two events for the same identity.
    pub cooldown_secs: u64,
    pub report_url: String,
    pub http_timeout_secs: u64,
    /// Total delivery attempts per event.
    pub http_retries: u32,
    pub http_retry_delay_ms: u64,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
    /// Consecutive failed reads tolerated before reconnecting. 0 reconnects on the first failure.
    pub read_failure_tolerance: u32,
    pub read_retry_delay_ms: u64,
    /// Downscale factor applied before detection.
    pub detection_scale: f32,
    /// Scale of the operator overlay relative to the source frame.
    pub display_scale: f32,
    pub supervisor_poll_secs: u64,
    pub sound_recognized: PathBuf,
    pub sound_unknown: PathBuf,
    /// Command used to play feedback sounds, e.g. `paplay` or `aplay`.
    pub sound_player: String,
    pub voice_enabled: bool,
    pub voice_command: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            db_path: default_data_dir().join("presence.db"),
            model_dir: presence_core::default_model_dir(),
            match_threshold: presence_core::ARCFACE_THRESHOLD,
            cooldown_secs: 8,
            report_url: "http://localhost:5000/api/pointage".to_string(),
            http_timeout_secs: 3,
            http_retries: 2,
            http_retry_delay_ms: 1000,
            backoff_initial_secs: 5,
            backoff_max_secs: 60,
            read_failure_tolerance: 10,
            read_retry_delay_ms: 1000,
            detection_scale: 0.25,
            display_scale: 0.6,
            supervisor_poll_secs: 10,
            sound_recognized: PathBuf::from("./sound_ok.wav"),
            sound_unknown: PathBuf::from("./sound_error.wav"),
            sound_player: "paplay".to_string(),
            voice_enabled: false,
            voice_command: "espeak".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            streams: get("PRESENCE_STREAMS")
                .map(|v| parse_streams(&v))
                .unwrap_or(defaults.streams),
            db_path: get("PRESENCE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            model_dir: get("PRESENCE_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            match_threshold: parsed(&get, "PRESENCE_MATCH_THRESHOLD", defaults.match_threshold),
            cooldown_secs: parsed(&get, "PRESENCE_COOLDOWN_SECS", defaults.cooldown_secs),
            report_url: get("PRESENCE_REPORT_URL").unwrap_or(defaults.report_url),
            http_timeout_secs: parsed(
                &get,
                "PRESENCE_HTTP_TIMEOUT_SECS",
                defaults.http_timeout_secs,
            ),
            http_retries: parsed(&get, "PRESENCE_HTTP_RETRIES", defaults.http_retries),
            http_retry_delay_ms: parsed(
                &get,
                "PRESENCE_HTTP_RETRY_DELAY_MS",
                defaults.http_retry_delay_ms,
            ),
            backoff_initial_secs: parsed(
                &get,
                "PRESENCE_BACKOFF_INITIAL_SECS",
                defaults.backoff_initial_secs,
            ),
            backoff_max_secs: parsed(&get, "PRESENCE_BACKOFF_MAX_SECS", defaults.backoff_max_secs),
            read_failure_tolerance: parsed(
                &get,
                "PRESENCE_READ_FAILURE_TOLERANCE",
                defaults.read_failure_tolerance,
            ),
            read_retry_delay_ms: parsed(
                &get,
                "PRESENCE_READ_RETRY_DELAY_MS",
                defaults.read_retry_delay_ms,
            ),
            detection_scale: parsed(&get, "PRESENCE_DETECTION_SCALE", defaults.detection_scale),
            display_scale: parsed(&get, "PRESENCE_DISPLAY_SCALE", defaults.display_scale),
            supervisor_poll_secs: parsed(
                &get,
                "PRESENCE_SUPERVISOR_POLL_SECS",
                defaults.supervisor_poll_secs,
            ),
            sound_recognized: get("PRESENCE_SOUND_RECOGNIZED")
                .map(PathBuf::from)
                .unwrap_or(defaults.sound_recognized),
            sound_unknown: get("PRESENCE_SOUND_UNKNOWN")
                .map(PathBuf::from)
                .unwrap_or(defaults.sound_unknown),
            sound_player: get("PRESENCE_SOUND_PLAYER").unwrap_or(defaults.sound_player),
            voice_enabled: get("PRESENCE_VOICE_ENABLED")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(defaults.voice_enabled),
            voice_command: get("PRESENCE_VOICE_COMMAND").unwrap_or(defaults.voice_command),
        }
    }

    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File configuration when a path is given, environment otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::from_env()),
        }
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streams.is_empty() {
            return Err(ConfigError::Invalid("no streams configured".into()));
        }
        let mut labels = HashSet::new();
        for stream in &self.streams {
            if stream.uri.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stream {:?} has an empty uri",
                    stream.label
                )));
            }
            if !labels.insert(stream.label.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate stream label {:?}",
                    stream.label
                )));
            }
        }
        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be positive, got {}",
                self.match_threshold
            )));
        }
        for (name, scale) in [
            ("detection_scale", self.detection_scale),
            ("display_scale", self.display_scale),
        ] {
            if !(scale > 0.0 && scale <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be in (0, 1], got {scale}"
                )));
            }
        }
        if self.cooldown_secs == 0 {
            return Err(ConfigError::Invalid("cooldown_secs must be at least 1".into()));
        }
        if self.http_retries == 0 {
            return Err(ConfigError::Invalid("http_retries must be at least 1".into()));
        }
        if self.backoff_initial_secs == 0 || self.backoff_max_secs < self.backoff_initial_secs {
            return Err(ConfigError::Invalid(format!(
                "backoff must satisfy 0 < initial ({}) <= max ({})",
                self.backoff_initial_secs, self.backoff_max_secs
            )));
        }
        if self.supervisor_poll_secs == 0 {
            return Err(ConfigError::Invalid("supervisor_poll_secs must be at least 1".into()));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn supervisor_poll(&self) -> Duration {
        Duration::from_secs(self.supervisor_poll_secs)
    }

    pub fn reporter_settings(&self) -> ReporterSettings {
        ReporterSettings {
            url: self.report_url.clone(),
            attempts: self.http_retries,
            retry_delay: Duration::from_millis(self.http_retry_delay_ms),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            backoff_initial: Duration::from_secs(self.backoff_initial_secs),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
            read_failure_tolerance: self.read_failure_tolerance,
            read_retry_delay: Duration::from_millis(self.read_retry_delay_ms),
            detection_scale: self.detection_scale,
            display_scale: self.display_scale,
        }
    }
}

/// Parse `label=uri;label=uri`. Entries without a label become `camera-N`.
pub fn parse_streams(entries: &str) -> Vec<StreamConfig> {
    entries.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(index, entry)| match split_label(entry) {
            Some((label, uri)) => StreamConfig {
                label: label.to_string(),
                uri: uri.to_string(),
            },
            None => StreamConfig {
                label: format!("camera-{}", index + 1),
                uri: entry.to_string(),
            },
        })
        .collect()
}

/// `label=uri`, where the label cannot contain `/` or `:` so query strings in bare URIs survive.
fn split_label(entry: &str) -> Option<(&str, &str)> {
    let (label, uri) = entry.split_once('=')?;
    let label = label.trim();
    let valid = !label.is_empty() && !label.contains(['/', ':', '?']);
    valid.then(|| (label, uri.trim()))
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

/// Typed value of `key`, or `default` when unset or malformed.
fn parsed<T: std::str::FromStr>(
    get: impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    let Some(raw) = get(key) else {
        return default;
    };
    match parse_value(key, &raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "malformed setting, using default");
            default
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| {
        ConfigError::Invalid(format!("{key}={raw:?} is not a valid {}", type_name::<T>()))
    })
}

fn type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
