//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding the pool size.
pub const WORKERS_ENV: &str = "AFFINITY_WORKERS";

/// Environment variable overriding the idle timeout, in milliseconds.
pub const IDLE_TIMEOUT_ENV: &str = "AFFINITY_IDLE_TIMEOUT_MS";

/// Configuration error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Pool size and dequeue timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of workers started per run.
    pub workers: usize,
    /// How long a worker waits on an empty queue before retiring.
    #[serde(rename = "idle_timeout_ms", with = "millis")]
    pub idle_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            idle_timeout: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Defaults overridden by `AFFINITY_WORKERS` and
    /// `AFFINITY_IDLE_TIMEOUT_MS`.
    ///
    /// # Errors
    /// Returns error if a variable is set but not a non-negative integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    ///
    /// # Errors
    /// Returns error if a value is present but not a non-negative integer.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(workers) = parse(&lookup, WORKERS_ENV)? {
            config.workers = usize::try_from(workers).map_err(|_| ConfigError::Invalid {
                key: WORKERS_ENV,
                value: workers.to_string(),
            })?;
        }
        if let Some(ms) = parse(&lookup, IDLE_TIMEOUT_ENV)? {
            config.idle_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

fn parse(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::Invalid { key, value })
        })
        .transpose()
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
