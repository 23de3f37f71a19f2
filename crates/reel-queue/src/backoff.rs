//! Retry backoff policy.

use std::time::Duration;

/// Exponential backoff bounded by a maximum attempt count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Deliveries allowed before the job fails terminally
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Create policy from environment variables.
    pub fn from_env() -> Self {
        Self {
            base_delay: Duration::from_millis(
                std::env::var("QUEUE_BACKOFF_BASE_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5_000),
            ),
            max_delay: Duration::from_millis(
                std::env::var("QUEUE_BACKOFF_MAX_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300_000),
            ),
            max_attempts: std::env::var("QUEUE_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &u32| *n > 0)
                .unwrap_or(3),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(2u32.pow(exponent));
        delay.min(self.max_delay)
    }

    /// Whether a job that has failed `attempts` times gets another delivery.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        };
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_attempt_ceiling() {
        let policy = BackoffPolicy::default();
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }
}
