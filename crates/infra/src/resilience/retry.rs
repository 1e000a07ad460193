//! Retry policy: capped exponential backoff with additive jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt).
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each subsequent one.
    pub base_delay: Duration,
    /// Cap on the exponential part of the delay.
    pub max_delay: Duration,
    /// Upper bound (exclusive) of the uniform jitter added to every delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_jitter: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff and no jitter.
    pub fn exponential(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_jitter: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Total attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Deterministic part of the delay after the attempt at `attempt_index`
    /// (0-indexed): `min(base_delay * 2^attempt_index, max_delay)`.
    pub fn backoff_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt_index).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff plus uniform jitter in `[0, max_jitter)`.
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let backoff = self.backoff_for_attempt(attempt_index);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
    }

    /// Check if another attempt follows the one at `attempt_index`.
    pub fn should_retry(&self, attempt_index: u32) -> bool {
        attempt_index < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(500),
            ..RetryPolicy::exponential(10, Duration::from_millis(100))
        };
        assert_eq!(policy.backoff_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..4 {
            let backoff = policy.backoff_for_attempt(attempt);
            for _ in 0..50 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(delay >= backoff);
                assert!(delay < backoff + policy.max_jitter);
            }
        }
    }

    #[test]
    fn retry_budget_counts_attempts_after_the_first() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1));
        assert_eq!(policy.max_attempts(), 4);
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }
}
