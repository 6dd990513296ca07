//! Retry policies for transient failures.
//!
//! Both the downloader and the decoder adapter retry with bounded
//! exponential backoff plus jitter, so parallel workers hitting the same
//! hiccup do not retry in lockstep.

use rand::Rng;
use std::time::Duration;

/// Defines a bounded exponential-backoff retry policy.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt afterwards.
    pub base_delay: Duration,
    /// Cap applied after exponentiation.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Backoff before retrying after the given 1-based failed attempt.
    /// Includes up to 25% random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let jitter = raw.mul_f64(rand::thread_rng().gen_range(0.0..0.25));
        raw + jitter
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_saturate() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(400));
        let d1 = policy.delay_for(1);
        let d3 = policy.delay_for(3);
        assert!(d1 >= Duration::from_millis(100));
        assert!(d1 < Duration::from_millis(130));
        // capped at max_delay plus jitter
        assert!(d3 >= Duration::from_millis(400));
        assert!(d3 < Duration::from_millis(500));
        assert!(policy.delay_for(30) < Duration::from_millis(500));
    }

    #[test]
    fn attempt_budget() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(10));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
