//! Configuration model for `shelf` plus `tracing` initialisation.
//!
//! The on-disk format is TOML:
//!
//! ```toml
//! [cache]
//! dir = "/var/cache/shelf"
//! key_prefix = "site_"
//! protected_patterns = ["site_menu*"]
//! default_lifetime_secs = 600
//! codec = "json"
//!
//! [cache.lock]
//! timeout_ms = 250
//! require_lock = true
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! Unknown keys are rejected so typos surface at load time.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use std::time::Duration;

use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::prelude::*;

/// Environment variable overriding `cache.dir`.
pub const CACHE_DIR_ENV: &str = "SHELF_CACHE_DIR";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShelfConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Storage directory. Falls back to `$HOME/.shelf/cache` when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Prepended to every prefixed key to form the entry's file name.
    #[serde(default)]
    pub key_prefix: String,

    /// Create the storage directory (and parents) when it does not exist.
    #[serde(default = "default_true")]
    pub auto_create_dir: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Keep the cache active even when `enabled = false`.
    #[serde(default)]
    pub force: bool,

    /// Glob patterns over entry file names that `clear` skips by default.
    #[serde(default)]
    pub protected_patterns: Vec<String>,

    /// Lifetime used when a caller does not pass one explicitly.
    #[serde(default = "CacheConfig::default_lifetime_secs")]
    pub default_lifetime_secs: u64,

    #[serde(default)]
    pub codec: CodecKind,

    #[serde(default)]
    pub lock: LockConfig,
}

fn default_true() -> bool {
    true
}

impl CacheConfig {
    fn default_lifetime_secs() -> u64 {
        3_600
    }

    pub fn default_lifetime(&self) -> Duration {
        Duration::from_secs(self.default_lifetime_secs)
    }

    /// The configured storage directory, or the per-user default.
    pub fn storage_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => default_cache_root(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            key_prefix: String::new(),
            auto_create_dir: true,
            enabled: true,
            force: false,
            protected_patterns: Vec::new(),
            default_lifetime_secs: Self::default_lifetime_secs(),
            codec: CodecKind::default(),
            lock: LockConfig::default(),
        }
    }
}

/// Serialization format for typed values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Bincode,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// How long a read or write waits for the entry lock.
    #[serde(default = "LockConfig::default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "LockConfig::default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// When set, an operation that cannot get its lock in time degrades to a
    /// miss (reads) or a failed write instead of proceeding unlocked.
    #[serde(default)]
    pub require_lock: bool,
}

impl LockConfig {
    fn default_timeout_ms() -> u64 {
        1_000
    }

    fn default_retry_interval_ms() -> u64 {
        5
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            retry_interval_ms: Self::default_retry_interval_ms(),
            require_lock: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A bare level (`info`, `debug`, ...) for shelf's own targets, or a full
    /// `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    #[serde(default = "default_true")]
    pub stderr: bool,

    /// Append logs to the given file path. If the file cannot be opened, file
    /// logging is disabled while stderr stays active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Directive applied to every target outside `shelf.*`.
const FOREIGN_TARGET_DIRECTIVE: &str = "warn";

impl LoggingConfig {
    fn default_level() -> String {
        "warn".to_owned()
    }

    /// Maps `level` to `EnvFilter` directives.
    ///
    /// A bare level only raises or lowers shelf's own targets (`shelf.cache`,
    /// `shelf.cli`, ...); dependencies stay at `warn`. Anything else is taken
    /// as a complete directive string.
    fn directives(&self) -> String {
        let level = self.level.trim();
        let bare = match level.to_ascii_lowercase().as_str() {
            "" => return FOREIGN_TARGET_DIRECTIVE.to_owned(),
            "warning" => "warn",
            "none" => "off",
            other => match other.parse::<tracing_subscriber::filter::LevelFilter>() {
                Ok(_) => return format!("{FOREIGN_TARGET_DIRECTIVE},shelf={other}"),
                Err(_) => return level.to_owned(),
            },
        };
        format!("{FOREIGN_TARGET_DIRECTIVE},shelf={bare}")
    }

    /// The effective `EnvFilter`. `RUST_LOG` is appended after the configured
    /// directives so it wins per target; an unparsable combination falls back
    /// to the configured directives alone, then to `warn`.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        use tracing_subscriber::EnvFilter;

        let configured = self.directives();
        let combined = match std::env::var("RUST_LOG") {
            Ok(env) if !env.trim().is_empty() => format!("{configured},{}", env.trim()),
            _ => configured.clone(),
        };

        EnvFilter::try_new(&combined)
            .or_else(|_| EnvFilter::try_new(&configured))
            .unwrap_or_else(|_| EnvFilter::new(FOREIGN_TARGET_DIRECTIVE))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: true,
            file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("no cache directory configured and neither HOME nor USERPROFILE is set")]
    MissingHomeDir,
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // `Display` includes a source snippet; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl ShelfConfig {
    /// Load a config file from TOML, then apply environment overrides.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::load_from_str(&text)?.with_env_overrides())
    }

    /// Parse TOML without consulting the environment.
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `SHELF_CACHE_DIR` on top of the file-provided values.
    pub fn with_env_overrides(self) -> Self {
        let dir = std::env::var_os(CACHE_DIR_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        self.with_cache_dir_override(dir)
    }

    pub fn with_cache_dir_override(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(dir) = dir {
            self.cache.dir = Some(dir);
        }
        self
    }
}

fn default_cache_root() -> Result<PathBuf, ConfigError> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .ok_or(ConfigError::MissingHomeDir)?;

    Ok(home.join(".shelf").join("cache"))
}

static TRACING_INIT: Once = Once::new();

/// Initializes structured `tracing` logging.
///
/// Safe to call multiple times; only the first call installs a global
/// subscriber, and a subscriber installed by someone else is left alone.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();

        let file = config.file.as_ref().and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
        let file_open_failed = config.file.is_some() && file.is_none();

        let make_writer = match (file, config.stderr) {
            (Some(file), true) => BoxMakeWriter::new(Mutex::new(file).and(std::io::stderr)),
            (Some(file), false) => BoxMakeWriter::new(Mutex::new(file)),
            (None, true) => BoxMakeWriter::new(std::io::stderr),
            (None, false) => BoxMakeWriter::new(std::io::sink),
        };

        let installed = if config.json {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(make_writer)
                        .with_ansi(false),
                )
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(make_writer)
                        .with_ansi(false),
                )
                .try_init()
        };

        if installed.is_ok() && file_open_failed {
            if let Some(path) = config.file.as_ref() {
                tracing::warn!(
                    target: "shelf.config",
                    path = %path.display(),
                    "failed to open log file; file logging disabled"
                );
            }
        }
    });
}
