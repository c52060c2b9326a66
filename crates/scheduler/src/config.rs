//! Scheduler configuration.
//!
//! The worker pool size and idle timeout can be set programmatically or read
//! from environment variables.

use std::time::Duration;

/// Environment variable holding the worker pool size.
pub const WORKERS_ENV: &str = "TILEFETCH_WORKERS";

/// Environment variable holding the idle timeout in milliseconds (`0` keeps
/// workers alive forever).
pub const IDLE_TIMEOUT_ENV: &str = "TILEFETCH_IDLE_TIMEOUT_MS";

/// Configuration for the fetch worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of worker threads kept alive while there is work.
    /// Default: 5.
    pub worker_count: usize,

    /// How long an idle pool waits for new work before its workers exit.
    /// `None` keeps workers alive until shutdown. Default: 30 seconds.
    pub idle_timeout: Option<Duration>,

    /// Prefix for worker thread names; workers are named `{prefix}-{n}`.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            idle_timeout: Some(Duration::from_secs(30)),
            thread_name: "tilefetch-io".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Create a configuration with `worker_count` workers (at least one).
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
            ..Self::default()
        }
    }

    /// Sets how long idle workers linger before exiting.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Keeps workers alive until the scheduler shuts down.
    pub fn without_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    /// Sets the worker thread name prefix.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TILEFETCH_WORKERS`: worker pool size (default: 5, must be positive)
    /// - `TILEFETCH_IDLE_TIMEOUT_MS`: idle timeout in milliseconds
    ///   (default: 30000, `0` disables idle retirement)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var(WORKERS_ENV) {
            config.worker_count = match val.trim().parse::<usize>() {
                Ok(count) if count > 0 => count,
                _ => return Err(ConfigError::invalid(WORKERS_ENV, &val)),
            };
        }

        if let Ok(val) = std::env::var(IDLE_TIMEOUT_ENV) {
            let millis = val
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::invalid(IDLE_TIMEOUT_ENV, &val))?;
            config.idle_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }

        Ok(config)
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

impl ConfigError {
    fn invalid(key: &str, value: &str) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}
