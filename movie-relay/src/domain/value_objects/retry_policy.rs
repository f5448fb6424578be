//! Retry policy value object.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for recoverable stage errors.
///
/// One policy applies to every stage; `max_retries` is the stage-local budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts per stage.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff multiplier for exponential backoff.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    #[serde(default = "default_true")]
    pub use_jitter: bool,
}

fn default_max_retries() -> u32 {
    1
}

fn default_initial_delay_ms() -> u64 {
    10_000
}

fn default_max_delay_ms() -> u64 {
    120_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl RetryPolicy {
    /// Attempts a stage may make: the first try plus `max_retries`.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether a stage that has already failed `attempts_made` times may run again.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.total_attempts()
    }

    /// Backoff before the next attempt, after `attempts_made` failures (1-based).
    pub fn backoff_after(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(32) as i32;
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let delay_ms = base.min(self.max_delay_ms as f64) as u64;

        if self.use_jitter {
            // Up to 25% on top.
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            Duration::from_millis(delay_ms + jitter)
        } else {
            Duration::from_millis(delay_ms)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            use_jitter: default_true(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without_jitter(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            use_jitter: false,
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.total_attempts(), 2);
        assert_eq!(policy.initial_delay_ms, 10_000);
        assert!(policy.use_jitter);
    }

    #[test]
    fn test_attempt_budget() {
        let policy = without_jitter(2);
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));

        let once = without_jitter(0);
        assert!(!once.allows_another(1));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = without_jitter(5);
        assert_eq!(policy.backoff_after(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(4000));
        assert_eq!(policy.backoff_after(7), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let policy = RetryPolicy {
            use_jitter: true,
            ..without_jitter(1)
        };
        for _ in 0..50 {
            let delay = policy.backoff_after(1);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_serialization_fills_defaults() {
        let parsed: RetryPolicy = serde_json::from_str(r#"{"max_retries":4}"#).unwrap();
        assert_eq!(parsed.max_retries, 4);
        assert_eq!(parsed.backoff_multiplier, 2.0);
    }
}
