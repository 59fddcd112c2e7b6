use std::time::Duration;

use crate::config::BackendConfig;
use crate::error::ConfigError;

/// Retry and dead-letter behaviour for messages whose handler failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RedeliveryPolicy {
    /// Deliveries before a message is dead-lettered.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_backoff_ms: 300_000, // 5 minutes
        }
    }
}

/// What to do with a message after a failed delivery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Redelivery {
    Retry { delay: Duration },
    DeadLetter,
}

impl RedeliveryPolicy {
    /// Read `maxAttempts`, `baseDelayMs` and `maxBackoffMs` options, falling
    /// back to the defaults.
    pub fn from_backend_config(config: &BackendConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_attempts: config
                .parse_option("maxAttempts")?
                .unwrap_or(defaults.max_attempts),
            base_delay_ms: config
                .parse_option("baseDelayMs")?
                .unwrap_or(defaults.base_delay_ms),
            max_backoff_ms: config
                .parse_option("maxBackoffMs")?
                .unwrap_or(defaults.max_backoff_ms),
        })
    }

    /// Backoff before the next delivery after `attempts` failed ones.
    ///
    /// Formula: delay = min(base_delay * 2^(attempts-1), max_backoff)
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let exp = attempts.saturating_sub(1).min(62) as i32;
        let scaled = (self.base_delay_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.max_backoff_ms as f64).max(0.0);

        Duration::from_millis(capped as u64)
    }

    pub fn should_dead_letter(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Decide the fate of a message that has failed `attempts` times.
    pub fn decide(&self, attempts: u32) -> Redelivery {
        if self.should_dead_letter(attempts) {
            Redelivery::DeadLetter
        } else {
            Redelivery::Retry {
                delay: self.delay_for(attempts),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_is_exponential() {
        let policy = RedeliveryPolicy::default();

        assert_eq!(policy.delay_for(1), Duration::from_millis(policy.base_delay_ms));
        assert_eq!(policy.delay_for(2), Duration::from_millis(policy.base_delay_ms * 2));
        assert_eq!(policy.delay_for(3), Duration::from_millis(policy.base_delay_ms * 4));
    }

    #[test]
    fn test_delay_capped() {
        let policy = RedeliveryPolicy {
            base_delay_ms: 1000,
            max_backoff_ms: 5000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for(10), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn test_decide_dead_letters_at_max_attempts() {
        let policy = RedeliveryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_backoff_ms: 100,
        };

        assert!(matches!(policy.decide(1), Redelivery::Retry { .. }));
        assert!(matches!(policy.decide(2), Redelivery::Retry { .. }));
        assert_eq!(policy.decide(3), Redelivery::DeadLetter);
    }
}
