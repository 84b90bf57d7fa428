//! Retry policy and backoff math
//!
//! Exponential backoff with a hard cap and uniform jitter:
//! `delay(k) = min(base * multiplier^(k-1), max) + U[0, jitter)`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy attached to a subscriber or used as the service default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Backoff multiplier applied per attempt
    pub multiplier: f64,
    /// Hard cap on the computed delay, in milliseconds
    pub max_delay_ms: u64,
    /// Upper bound (exclusive) of the uniform jitter, in milliseconds
    pub jitter_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
            jitter_max_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff before retry number `attempt`, jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_max_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..self.jitter_max_ms);
        base + Duration::from_millis(jitter)
    }

    /// True while `attempt` leaves budget for another try.
    pub fn has_budget(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
