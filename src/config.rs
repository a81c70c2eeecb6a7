//! Configuration types for marketfeed

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for a fetch run
///
/// Every field has a sensible default; a `Config::default()` works out of
/// the box against a local cache directory. [`Config::validate`] is called
/// by the orchestrator on construction and rejects inconsistent settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Number of parallel workers pulling from the shared queue (default: 3)
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Pacing delay each worker observes after its own last completed task
    /// (default: 500ms)
    ///
    /// The aggregate soft throughput is `worker_count / per_worker_delay`.
    #[serde(default = "default_per_worker_delay", with = "duration_millis")]
    pub per_worker_delay: Duration,

    /// Maximum number of points retained in a continuous record
    /// (default: 250 trading days)
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Points fetched for an incremental continuous refresh (default: 30)
    #[serde(default = "default_short_window_size")]
    pub short_window_size: usize,

    /// Staleness threshold in days for periodic records inside an active
    /// calendar window (default: 7)
    #[serde(default = "default_short_threshold_days")]
    pub short_threshold_days: i64,

    /// Staleness threshold in days for periodic records outside active
    /// calendar windows (default: 90)
    #[serde(default = "default_long_threshold_days")]
    pub long_threshold_days: i64,

    /// Number of recent outcomes each worker keeps in its rolling error
    /// window (default: 20)
    #[serde(default = "default_error_window_size")]
    pub error_window_size: usize,

    /// Error percentage over the rolling window above which a worker backs
    /// off before accepting its next item (default: 25.0)
    #[serde(default = "default_error_threshold_pct")]
    pub error_threshold_pct: f64,

    /// How long a worker sleeps when its rolling error rate breaches the
    /// threshold (default: 30s)
    #[serde(default = "default_backoff_duration", with = "duration_millis")]
    pub backoff_duration: Duration,

    /// Retry policy for transient fetch failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Resume from the latest open checkpoint run instead of starting fresh
    /// (default: false)
    #[serde(default)]
    pub resume: bool,

    /// On resume, re-enqueue subjects that were marked FAILED in the
    /// interrupted run (default: true)
    #[serde(default = "default_true")]
    pub retry_failed_on_resume: bool,

    /// Refresh continuous series with a short recent-window fetch merged
    /// against the cache, instead of a full refetch (default: false)
    #[serde(default)]
    pub incremental_continuous: bool,

    /// Root directory of the cache store (default: "./data/cache")
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Path of the checkpoint SQLite database (default: "./data/checkpoint.db")
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,

    /// Grace period granted to in-flight tasks after cancellation before
    /// they are abandoned (default: 30s)
    #[serde(default = "default_cancel_grace", with = "duration_millis")]
    pub cancel_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            per_worker_delay: default_per_worker_delay(),
            window_size: default_window_size(),
            short_window_size: default_short_window_size(),
            short_threshold_days: default_short_threshold_days(),
            long_threshold_days: default_long_threshold_days(),
            error_window_size: default_error_window_size(),
            error_threshold_pct: default_error_threshold_pct(),
            backoff_duration: default_backoff_duration(),
            retry: RetryConfig::default(),
            resume: false,
            retry_failed_on_resume: true,
            incremental_continuous: false,
            cache_dir: default_cache_dir(),
            checkpoint_path: default_checkpoint_path(),
            cancel_grace: default_cancel_grace(),
        }
    }
}

impl Config {
    /// Validate the configuration, returning the first inconsistency found
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(config_error("worker_count must be at least 1", "worker_count"));
        }
        if self.window_size == 0 {
            return Err(config_error("window_size must be at least 1", "window_size"));
        }
        if self.short_window_size == 0 || self.short_window_size > self.window_size {
            return Err(config_error(
                "short_window_size must be between 1 and window_size",
                "short_window_size",
            ));
        }
        if self.short_threshold_days <= 0 || self.long_threshold_days <= 0 {
            return Err(config_error(
                "staleness thresholds must be positive",
                "short_threshold_days",
            ));
        }
        if self.short_threshold_days >= self.long_threshold_days {
            return Err(config_error(
                "short_threshold_days must be below long_threshold_days",
                "short_threshold_days",
            ));
        }
        if self.error_window_size == 0 {
            return Err(config_error(
                "error_window_size must be at least 1",
                "error_window_size",
            ));
        }
        if !(0.0..=100.0).contains(&self.error_threshold_pct) {
            return Err(config_error(
                "error_threshold_pct must be between 0 and 100",
                "error_threshold_pct",
            ));
        }
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

/// Retry configuration for transient fetch failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_millis")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_millis")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Serialize [`Duration`] fields as integer milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

fn default_worker_count() -> usize {
    3
}

fn default_per_worker_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_window_size() -> usize {
    250
}

fn default_short_window_size() -> usize {
    30
}

fn default_short_threshold_days() -> i64 {
    7
}

fn default_long_threshold_days() -> i64 {
    90
}

fn default_error_window_size() -> usize {
    20
}

fn default_error_threshold_pct() -> f64 {
    25.0
}

fn default_backoff_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/cache")
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("./data/checkpoint.db")
}

fn default_cancel_grace() -> Duration {
    Duration::from_secs(30)
}
