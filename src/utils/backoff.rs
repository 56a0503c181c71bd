//! Exponential backoff calculation
//!
//! Shared by the work queue's per-item rate limiter. The delay for attempt N
//! is `base * multiplier^(N-1)`, capped at `max_delay_ms`; attempt 0 is
//! immediate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for exponential backoff behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,

    /// Attempts after which an item is dropped instead of requeued
    pub max_retries: u32,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 10,
            max_delay_ms: 30_000,
            max_retries: 15,
            backoff_multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Create a backoff configuration with custom delays
    pub fn with_delays(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_retries,
            backoff_multiplier: 2.0,
        }
    }

    /// Calculate delay for a given attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay_ms = if attempt == 0 {
            0
        } else {
            let exponential =
                self.base_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
            (exponential as u64).min(self.max_delay_ms)
        };

        Duration::from_millis(delay_ms)
    }

    /// Whether another retry is allowed after `attempt` failures
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
