//! Retry policy for failed refreshes.
//!
//! Implements bounded exponential backoff.

use crate::config::RefreshSettings;
use chrono::{DateTime, Duration, Utc};

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failures after which a key is left for an operator.
    pub max_attempts: u32,
    /// Delay after the first failure, in seconds.
    pub initial_backoff_secs: u64,
    /// Maximum backoff duration in seconds (cap for exponential growth).
    pub max_backoff_secs: u64,
    /// Multiplier applied to backoff after each failure.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(settings: &RefreshSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_backoff_secs: settings.initial_backoff_secs,
            max_backoff_secs: settings.max_backoff_secs,
            backoff_multiplier: settings.backoff_multiplier,
        }
    }

    /// Backoff after the `attempts`-th consecutive failure:
    /// `initial_backoff * multiplier^(attempts - 1)`, capped at `max_backoff_secs`.
    pub fn backoff_secs(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        backoff.min(self.max_backoff_secs as f64) as u64
    }

    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.backoff_secs(attempts) as i64)
    }

    /// Whether a key that has failed `attempts` times is retried automatically.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RefreshSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 8);
        assert_eq!(policy.initial_backoff_secs, 10);
        assert_eq!(policy.max_backoff_secs, 1800);
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_secs: 60,
            max_backoff_secs: 3600,
            backoff_multiplier: 2.0,
        };

        assert_eq!(policy.backoff_secs(1), 60);
        assert_eq!(policy.backoff_secs(2), 120);
        assert_eq!(policy.backoff_secs(3), 240);
        assert_eq!(policy.backoff_secs(4), 480);
    }

    #[test]
    fn test_backoff_capping() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_secs: 60,
            max_backoff_secs: 300,
            backoff_multiplier: 2.0,
        };

        assert_eq!(policy.backoff_secs(3), 240);
        assert_eq!(policy.backoff_secs(4), 300);
        assert_eq!(policy.backoff_secs(50), 300);
    }

    #[test]
    fn test_next_retry_at() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(policy.next_retry_at(1, now), now + Duration::seconds(10));
        assert_eq!(policy.next_retry_at(3, now), now + Duration::seconds(40));
    }

    #[test]
    fn test_should_retry_until_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }
}
