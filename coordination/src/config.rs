//! Round orchestration configuration
//!
//! Values come from `Default`, optionally overridden by a TOML document and
//! then by `ROUNDTABLE_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

/// Tunables for the round orchestration core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Snapshots older than this are discarded and the round restarts
    pub stale_snapshot_after_secs: u64,

    /// Pre-search stuck in STREAMING this long is treated as failed
    pub pre_search_timeout_secs: u64,

    /// Analysis stuck in PENDING/STREAMING this long is treated as failed
    pub analysis_timeout_secs: u64,

    /// Capacity of the store change broadcast channel
    pub event_channel_capacity: usize,

    /// Snapshot fetch attempts before the engine gives up
    pub resumption_attempts: u32,

    /// Delay between snapshot fetch attempts
    pub resumption_backoff_ms: u64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            stale_snapshot_after_secs: 5 * 60,
            pre_search_timeout_secs: 10,
            analysis_timeout_secs: 60,
            event_channel_capacity: 256,
            resumption_attempts: 3,
            resumption_backoff_ms: 200,
        }
    }
}

impl RoundConfig {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `ROUNDTABLE_*` environment overrides on top of `self`
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_u64("ROUNDTABLE_STALE_SNAPSHOT_SECS") {
            self.stale_snapshot_after_secs = n;
        }
        if let Some(n) = env_u64("ROUNDTABLE_PRE_SEARCH_TIMEOUT_SECS") {
            self.pre_search_timeout_secs = n;
        }
        if let Some(n) = env_u64("ROUNDTABLE_ANALYSIS_TIMEOUT_SECS") {
            self.analysis_timeout_secs = n;
        }
        if let Some(n) = env_u64("ROUNDTABLE_EVENT_CAPACITY") {
            self.event_channel_capacity = n as usize;
        }
        if let Some(n) = env_u64("ROUNDTABLE_RESUMPTION_ATTEMPTS") {
            self.resumption_attempts = n as u32;
        }
        if let Some(n) = env_u64("ROUNDTABLE_RESUMPTION_BACKOFF_MS") {
            self.resumption_backoff_ms = n;
        }
        self
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "event_channel_capacity",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.resumption_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "resumption_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn stale_snapshot_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_snapshot_after_secs as i64)
    }

    pub fn pre_search_timeout(&self) -> Duration {
        Duration::from_secs(self.pre_search_timeout_secs)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    pub fn resumption_backoff(&self) -> Duration {
        Duration::from_millis(self.resumption_backoff_ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}
