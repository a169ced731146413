//! Retry decisions with exponential backoff
//!
//! A failed transport call either goes back to the queue after
//! `base^retry_count * unit` or, once the budget is spent, becomes terminal.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;

/// What to do with a mutation whose transport call just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue with `retry_count` bumped to `retry`, not before `delay` has passed
    Retry { retry: u32, delay: Duration },
    /// Budget exhausted; reject every waiter
    GiveUp { attempts: u32 },
}

/// Retry policy for queued mutations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Backoff before the `retry`-th retry (1-indexed), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.config.backoff_base.checked_pow(retry).unwrap_or(u32::MAX);
        self.config
            .backoff_unit
            .checked_mul(factor)
            .unwrap_or(self.config.max_backoff)
            .min(self.config.max_backoff)
    }

    /// Decide the fate of a mutation that has already been retried
    /// `retry_count` times and just failed again.
    pub fn on_failure(&self, key: &str, retry_count: u32, reason: &str) -> RetryDecision {
        if retry_count >= self.config.max_retries {
            warn!(
                key,
                max_retries = self.config.max_retries,
                reason,
                "max retries reached, giving up"
            );
            return RetryDecision::GiveUp {
                attempts: retry_count + 1,
            };
        }

        let retry = retry_count + 1;
        let mut delay = self.backoff(retry);

        if self.config.jitter {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(0.0..0.3);
            delay += delay.mul_f64(jitter);
        }

        debug!(
            key,
            retry,
            delay_ms = delay.as_millis() as u64,
            reason,
            "transport failed, scheduling retry"
        );
        RetryDecision::Retry { retry, delay }
    }
}
