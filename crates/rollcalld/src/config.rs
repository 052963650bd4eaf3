use crate::sink::SinkKind;
use rollcall_core::{ConfirmPolicy, MatchRule, VerifyPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for `read_timeout_secs`; one hour.
const MAX_READ_TIMEOUT_SECS: u64 = 3600;
/// Upper bound for `retry_delay_ms`; one minute.
const MAX_RETRY_DELAY_MS: u64 = 60_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration: optional TOML file named by `ROLLCALL_CONFIG`,
/// overridden by `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Reference encodings artifact (JSON).
    pub encodings_path: PathBuf,
    /// Detector frame feed: `-` for stdin, otherwise a file or FIFO path.
    pub frame_source: String,
    /// Character device of the RFID reader bridge.
    pub reader_device: String,
    pub reader_baud: u32,
    /// `euclidean` or `cosine`.
    pub match_metric: String,
    /// Euclidean tolerance or cosine threshold, depending on the metric.
    pub match_threshold: f32,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Per-attempt read timeout; 0 waits until a tag is presented.
    pub read_timeout_secs: u64,
    pub confirm_policy: ConfirmPolicy,
    pub sink: SinkKind,
    /// Attendance file; defaults to `attendance.csv` or `attendance.db` in
    /// the data directory.
    pub attendance_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            encodings_path: data_dir().join("encodings.json"),
            frame_source: "-".to_string(),
            reader_device: "/dev/ttyACM0".to_string(),
            reader_baud: 9600,
            match_metric: "euclidean".to_string(),
            match_threshold: rollcall_core::resolver::DEFAULT_TOLERANCE,
            max_attempts: 3,
            retry_delay_ms: 2000,
            read_timeout_secs: 10,
            confirm_policy: ConfirmPolicy::default(),
            sink: SinkKind::Csv,
            attendance_path: None,
        }
    }
}

impl Config {
    /// Load the config file (if any), apply environment overrides, validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `ROLLCALL_*` overrides from `lookup`. Unparseable values are
    /// logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_ENCODINGS_PATH") {
            self.encodings_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_FRAME_SOURCE") {
            self.frame_source = v;
        }
        if let Some(v) = lookup("ROLLCALL_READER_DEVICE") {
            self.reader_device = v;
        }
        if let Some(v) = lookup("ROLLCALL_MATCH_METRIC") {
            self.match_metric = v;
        }
        if let Some(v) = lookup("ROLLCALL_ATTENDANCE_PATH") {
            self.attendance_path = Some(PathBuf::from(v));
        }
        override_parsed(&lookup, "ROLLCALL_READER_BAUD", &mut self.reader_baud);
        override_parsed(&lookup, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&lookup, "ROLLCALL_MAX_ATTEMPTS", &mut self.max_attempts);
        override_parsed(&lookup, "ROLLCALL_RETRY_DELAY_MS", &mut self.retry_delay_ms);
        override_parsed(&lookup, "ROLLCALL_READ_TIMEOUT_SECS", &mut self.read_timeout_secs);
        override_parsed(&lookup, "ROLLCALL_CONFIRM_POLICY", &mut self.confirm_policy);
        override_parsed(&lookup, "ROLLCALL_SINK", &mut self.sink);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a non-negative number, got {}",
                self.match_threshold
            )));
        }
        if self.read_timeout_secs > MAX_READ_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "read_timeout_secs must be at most {MAX_READ_TIMEOUT_SECS}, got {}",
                self.read_timeout_secs
            )));
        }
        if self.retry_delay_ms > MAX_RETRY_DELAY_MS {
            return Err(ConfigError::Invalid(format!(
                "retry_delay_ms must be at most {MAX_RETRY_DELAY_MS}, got {}",
                self.retry_delay_ms
            )));
        }
        if self.frame_source.trim().is_empty() {
            return Err(ConfigError::Invalid("frame_source must not be empty".into()));
        }
        self.match_rule()?;
        Ok(())
    }

    pub fn match_rule(&self) -> Result<MatchRule, ConfigError> {
        MatchRule::from_metric(&self.match_metric, self.match_threshold).map_err(ConfigError::Invalid)
    }

    pub fn verify_policy(&self) -> VerifyPolicy {
        VerifyPolicy {
            max_attempts: self.max_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            read_timeout: (self.read_timeout_secs > 0)
                .then(|| Duration::from_secs(self.read_timeout_secs)),
        }
    }

    pub fn attendance_path(&self) -> PathBuf {
        self.attendance_path
            .clone()
            .unwrap_or_else(|| data_dir().join(self.sink.default_file_name()))
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}
