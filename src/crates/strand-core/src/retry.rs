//! Retry policies for task functions
//!
//! A [`RetryPolicy`] attached to a [`Task`](crate::Task) makes the executor re-run a failing
//! task function with exponential backoff. Only the final failure surfaces to the awaiting
//! workflow body; intermediate failures are logged and never recorded.
//!
//! ```text
//! delay = initial_interval × backoff_factor ^ attempt
//! delay = min(delay, max_interval)
//! if jitter: delay *= random(0.5..=1.5)
//! ```
//!
//! ```rust
//! use strand_core::RetryPolicy;
//!
//! let policy = RetryPolicy::new(5)
//!     .with_initial_interval(0.25)
//!     .with_backoff_factor(4.0)
//!     .with_max_interval(10.0)
//!     .with_jitter(false);
//!
//! assert_eq!(policy.calculate_delay(1).as_secs_f64(), 1.0);
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retrying failed task executions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: usize,

    /// Initial interval between retries in seconds
    pub initial_interval: f64,

    /// Multiplier for the interval after each retry
    pub backoff_factor: f64,

    /// Maximum interval between retries in seconds
    pub max_interval: f64,

    /// Whether to add random jitter to intervals
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create a new retry policy with the given max attempts
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 128.0,
            jitter: true,
        }
    }

    /// Single attempt, no retries
    pub fn never() -> Self {
        Self::new(1)
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after the given failed attempt (0-indexed)
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::ZERO;
        }

        let base_delay = self.initial_interval * self.backoff_factor.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_interval).max(0.0);

        let final_delay = if self.jitter {
            let mut rng = rand::thread_rng();
            capped_delay * rng.gen_range(0.5..=1.5)
        } else {
            capped_delay
        };

        Duration::try_from_secs_f64(final_delay).unwrap_or(Duration::MAX)
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, 0.5);
        assert_eq!(policy.backoff_factor, 2.0);
        assert!(policy.jitter);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
        assert!(!RetryPolicy::never().should_retry(1));
    }

    #[test]
    fn test_exponential_backoff_with_cap() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(1.0)
            .with_backoff_factor(2.0)
            .with_max_interval(5.0)
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(0).as_secs_f64(), 1.0);
        assert_eq!(policy.calculate_delay(2).as_secs_f64(), 4.0);
        assert_eq!(policy.calculate_delay(3).as_secs_f64(), 5.0);
        assert_eq!(policy.calculate_delay(10), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(5).with_initial_interval(1.0);
        for _ in 0..20 {
            let delay = policy.calculate_delay(2).as_secs_f64();
            assert!((2.0..=6.0).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_unbounded_delay_saturates() {
        let policy: RetryPolicy =
            toml::from_str("max_attempts = 2000\ninitial_interval = 1.0\nmax_interval = inf").unwrap();
        assert_eq!(policy.calculate_delay(1500), Duration::MAX);
        assert_eq!(policy.clone().with_jitter(false).calculate_delay(1500), Duration::MAX);
        assert_eq!(policy.with_jitter(false).calculate_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_policy_from_toml_uses_defaults() {
        let policy: RetryPolicy = toml::from_str("max_attempts = 4\njitter = false").unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.initial_interval, 0.5);
        assert!(!policy.jitter);
    }
}
