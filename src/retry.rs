use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with full jitter for contended acquires and transient
/// store failures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 10,
            max_backoff_ms: 500,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the backoff before the `attempt`-th retry (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(attempt);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Jittered delay in `[ceiling/2, ceiling]`; half the window stays
    /// deterministic so contending callers still back off.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if ceiling.is_zero() {
            return ceiling;
        }
        let half = ceiling / 2;
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=half);
        half + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            multiplier: 2,
        };
        assert_eq!(policy.ceiling(0), Duration::from_millis(10));
        assert_eq!(policy.ceiling(1), Duration::from_millis(20));
        assert_eq!(policy.ceiling(3), Duration::from_millis(80));
        assert_eq!(policy.ceiling(4), Duration::from_millis(100));
        assert_eq!(policy.ceiling(60), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_within_window() {
        let policy = RetryPolicy::default();
        for attempt in 0..8 {
            let ceiling = policy.ceiling(attempt);
            let delay = policy.delay(attempt);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
    }
}
