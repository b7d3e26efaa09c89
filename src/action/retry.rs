//! Step retry policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for step callbacks.
///
/// Delays are deterministic (no jitter): persisted backoff feeds lease
/// extensions, and those must match what the sleep actually does.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries; total attempts = `limit + 1`.
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Backoff multiplier.
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Initial delay in milliseconds.
    #[serde(default = "default_min_timeout_ms")]
    pub min_timeout_ms: u64,
    /// Delay ceiling in milliseconds.
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
}

fn default_limit() -> u32 {
    4
}

fn default_factor() -> f64 {
    2.0
}

fn default_min_timeout_ms() -> u64 {
    1000
}

fn default_max_timeout_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            factor: default_factor(),
            min_timeout_ms: default_min_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            limit: 0,
            ..Default::default()
        }
    }

    /// Delay before the retry following the given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.min_timeout_ms as f64 * self.factor.powi(attempt as i32);
        let delay_ms = base.min(self.max_timeout_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }

    /// Check if another attempt is allowed after the given attempt.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.limit, 4);
        assert_eq!(policy.min_timeout_ms, 1000);
        assert_eq!(policy.max_timeout_ms, 30_000);
    }

    #[test]
    fn test_delay_progression() {
        let policy = RetryPolicy {
            limit: 5,
            factor: 2.0,
            min_timeout_ms: 1000,
            max_timeout_ms: 30_000,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy {
            limit: 10,
            factor: 2.0,
            min_timeout_ms: 1000,
            max_timeout_ms: 5000,
        };
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(5000));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::with_limit(2);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));

        assert!(!RetryPolicy::no_retry().should_retry(0));
    }
}
