//! Retry schedule for remote calls.
//!
//! Every remote interaction uses the same typed schedule: a bounded number
//! of attempts with exponential backoff and uniform jitter. The policy only
//! computes delays; classification of which errors are retryable lives with
//! the HTTP client, and sleeping lives with the caller.

use std::time::Duration;

use crate::time::JitterSource;

/// Retry schedule: up to [`max_attempts`](Self::max_attempts) attempts, with
/// the delay before attempt `n` (1-indexed, `n >= 2`) being
/// `min(base_delay_ms * 2^(n-2), max_delay_ms) + uniform(0, jitter_ms)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,

    /// Base delay applied before the second attempt.
    pub base_delay_ms: u64,

    /// Cap on the exponential component of the delay.
    pub max_delay_ms: u64,

    /// Upper bound (exclusive) of the uniform jitter added to every delay.
    pub jitter_ms: u64,
}

const fn default_max_attempts() -> u32 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
            jitter_ms: 300,
        }
    }
}

impl RetryPolicy {
    /// Returns true if another attempt is allowed after `attempt` attempts
    /// have already been made.
    #[must_use]
    pub const fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Computes the delay to sleep before attempt `attempt` (1-indexed).
    ///
    /// Attempt 1 has no delay. The exponential component saturates at
    /// [`max_delay_ms`](Self::max_delay_ms).
    #[must_use]
    pub fn delay_before_attempt(&self, attempt: u32, jitter: &dyn JitterSource) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = attempt - 2;
        let base = self
            .base_delay_ms
            .checked_shl(exponent)
            .unwrap_or(self.max_delay_ms)
            .min(self.max_delay_ms);
        Duration::from_millis(base + jitter.jitter_ms(self.jitter_ms))
    }
}
