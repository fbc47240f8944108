//! Exponential backoff policy for provider calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Retry schedule applied by a resilient client. Immutable once the client is built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Upper bound for any single delay.
    pub max_interval: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Multiplicative factor applied per retry.
    pub multiplier: f64,
    /// Whether to apply random jitter (+/- 50%) to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            max_attempts: 3,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Policy with a fixed delay between attempts.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_interval: delay,
            max_interval: delay,
            max_attempts,
            multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                "must be at least 1",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "retry.multiplier",
                format!("must be a finite number >= 1.0, got {}", self.multiplier),
            ));
        }
        if self.max_interval < self.initial_interval {
            return Err(ConfigError::invalid(
                "retry.max_interval",
                "must not be shorter than retry.initial_interval",
            ));
        }
        Ok(())
    }

    /// Delay to wait before retry number `retry` (0-based).
    ///
    /// The delay is `initial_interval * multiplier ^ retry`, capped at `max_interval`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let seconds = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = seconds.min(self.max_interval.as_secs_f64());
        let delay = Duration::from_secs_f64(capped.max(0.0));

        if !self.jitter {
            return delay;
        }

        let millis = delay.as_millis().min(u128::from(u64::MAX)) as u64;
        let spread = millis / 2;
        let offset = fastrand::u64(0..=spread * 2);
        Duration::from_millis((millis - spread).saturating_add(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delays_are_capped() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            max_attempts: 6,
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn jittered_delays_stay_within_half_of_base() {
        let policy = RetryPolicy {
            jitter: true,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            ..RetryPolicy::default()
        };

        for _ in 0..10 {
            for retry in 0..5 {
                let expected = (100.0 * 2_f64.powi(retry as i32)).min(1000.0);
                let delay_ms = policy.delay(retry).as_millis() as f64;
                assert!(delay_ms >= expected * 0.49, "retry={retry}, delay_ms={delay_ms}");
                assert!(delay_ms <= expected * 1.51, "retry={retry}, delay_ms={delay_ms}");
            }
        }
    }

    #[test]
    fn fixed_policy_repeats_same_delay() {
        let policy = RetryPolicy::fixed(Duration::from_millis(250), 4);

        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(3), Duration::from_millis(250));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };

        assert!(matches!(
            policy.validate(),
            Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                ..
            })
        ));
    }

    #[test]
    fn shrinking_multiplier_is_rejected() {
        let policy = RetryPolicy {
            multiplier: 0.5,
            ..RetryPolicy::default()
        };

        assert!(policy.validate().is_err());
    }
}
