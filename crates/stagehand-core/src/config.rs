//! Engine configuration (TOML).
//!
//! ```toml
//! workers = 8
//! requeue_delay_ms = 50
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 200
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scheduler pool size.
    pub workers: usize,
    pub retry: RetryPolicy,
    /// Delay before a task whose target is locked is offered again.
    pub requeue_delay_ms: u64,
    /// Soft per-stage deadline; overruns are audited, never killed.
    pub stage_soft_deadline_ms: u64,
    /// Reload-and-retry bound for optimistic-concurrency conflicts.
    pub conflict_retries: u32,
    /// Idle worker pop timeout.
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            requeue_delay_ms: 50,
            stage_soft_deadline_ms: 30_000,
            conflict_retries: 5,
            poll_interval_ms: 200,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0".into()));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1.0".into()));
        }
        if self.conflict_retries == 0 {
            return Err(ConfigError::Invalid("conflict_retries must be > 0".into()));
        }
        Ok(())
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    pub fn stage_soft_deadline(&self) -> Duration {
        Duration::from_millis(self.stage_soft_deadline_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
