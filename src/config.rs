//! Configuration for the sync scheduler
//!
//! All values are fixed when the scheduler is spawned; there is no runtime
//! reconfiguration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delay after the last enqueue before a flush is attempted
    pub quiet_period: Duration,

    /// Admission credits available in a full bucket
    pub bucket_capacity: u32,

    /// Time needed to earn one admission credit back
    pub refill_period: Duration,

    /// Retry configuration
    pub retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(1500),
            bucket_capacity: 30,
            refill_period: Duration::from_secs(2),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Exponential base; the n-th retry waits `base^n * unit`
    pub backoff_base: u32,

    /// Unit multiplied by the exponential factor
    pub backoff_unit: Duration,

    /// Upper bound on a single backoff delay
    pub max_backoff: Duration,

    /// Add up to 30% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2,
            backoff_unit: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl SchedulerConfig {
    /// Reject configurations the flush cycle cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "bucket_capacity must be at least 1".into(),
            ));
        }
        if self.refill_period.is_zero() {
            return Err(SyncError::InvalidConfig(
                "refill_period must be non-zero".into(),
            ));
        }
        if self.retry.backoff_base == 0 {
            return Err(SyncError::InvalidConfig(
                "backoff_base must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: SchedulerConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
        }
    }

    pub fn quiet_period(mut self, period: Duration) -> Self {
        self.config.quiet_period = period;
        self
    }

    pub fn bucket_capacity(mut self, capacity: u32) -> Self {
        self.config.bucket_capacity = capacity;
        self
    }

    pub fn refill_period(mut self, period: Duration) -> Self {
        self.config.refill_period = period;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.retry.max_retries = retries;
        self
    }

    pub fn backoff(mut self, base: u32, unit: Duration) -> Self {
        self.config.retry.backoff_base = base;
        self.config.retry.backoff_unit = unit;
        self
    }

    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.config.retry.max_backoff = max;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.config.retry.jitter = enabled;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<SchedulerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse::<u32>().ok())
}

/// Load configuration from `SYNC_BATCH_*` environment variables.
///
/// Unset or unparsable variables keep their defaults; the result is validated.
pub fn from_env() -> Result<SchedulerConfig> {
    let mut config = SchedulerConfig::default();

    if let Some(d) = env_millis("SYNC_BATCH_QUIET_MS") {
        config.quiet_period = d;
    }
    if let Some(n) = env_u32("SYNC_BATCH_CAPACITY") {
        config.bucket_capacity = n;
    }
    if let Some(d) = env_millis("SYNC_BATCH_REFILL_MS") {
        config.refill_period = d;
    }
    if let Some(n) = env_u32("SYNC_BATCH_MAX_RETRIES") {
        config.retry.max_retries = n;
    }
    if let Some(n) = env_u32("SYNC_BATCH_BACKOFF_BASE") {
        config.retry.backoff_base = n;
    }
    if let Some(d) = env_millis("SYNC_BATCH_BACKOFF_UNIT_MS") {
        config.retry.backoff_unit = d;
    }
    if let Some(d) = env_millis("SYNC_BATCH_MAX_BACKOFF_MS") {
        config.retry.max_backoff = d;
    }
    if let Ok(jitter) = std::env::var("SYNC_BATCH_JITTER") {
        config.retry.jitter = jitter.to_lowercase() == "true" || jitter == "1";
    }

    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<SchedulerConfig> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| SyncError::ConfigFile(e.to_string()))?;
    let config: SchedulerConfig =
        toml::from_str(&contents).map_err(|e| SyncError::ConfigFile(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
