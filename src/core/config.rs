//! Configuration loaded from the platform config directory, with every
//! field optional in the file and overridable from the command line. The
//! engine only ever reads the resulting struct.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::core::cache::CachePolicy;
use crate::core::rate_limit::BackoffPolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Errors that can occur when loading configuration from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub model: String,
    pub base_url: String,
    pub streaming: bool,
    /// Bound on request cycles within one user turn.
    pub max_iterations: u32,
    /// Ceiling on consecutive 429/5xx responses per request.
    pub rate_limit_attempts: u32,
    /// Ceiling on network-level failures per request.
    pub transport_attempts: u32,
    pub request_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub min_request_spacing_ms: u64,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        let cache = CachePolicy::default();
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            streaming: true,
            max_iterations: 10,
            rate_limit_attempts: 8,
            transport_attempts: 3,
            request_timeout_secs: 120,
            backoff_base_ms: backoff.base_delay.as_millis() as u64,
            backoff_max_ms: backoff.max_delay.as_millis() as u64,
            min_request_spacing_ms: backoff.min_spacing.as_millis() as u64,
            cache_ttl_secs: cache.ttl.as_secs(),
            cache_max_entries: cache.max_entries,
        }
    }
}

impl Config {
    /// Loads from the platform config directory. A missing file is not an
    /// error; defaults apply.
    pub fn load() -> Result<Config, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Config::default()),
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn default_path() -> Option<PathBuf> {
        let dirs = ProjectDirs::from("org", "permacommons", "parley")?;
        Some(dirs.config_dir().join("config.toml"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            min_spacing: Duration::from_millis(self.min_request_spacing_ms),
        }
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            ttl: Duration::from_secs(self.cache_ttl_secs),
            max_entries: self.cache_max_entries,
        }
    }
}
