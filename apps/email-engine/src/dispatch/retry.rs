use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::DispatchConfig;

/// Capped exponential backoff: `min(base * 2^retry_count, max)`, for at most
/// `max_attempts` retries after the first failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }

    pub fn delay(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// When the row should be retried, or `None` once the budget is spent.
    /// `retry_count` is the number of retries already performed.
    pub fn next_retry_at(&self, retry_count: i32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let performed = u32::try_from(retry_count).unwrap_or(0);
        if performed >= self.max_attempts {
            return None;
        }
        let delay = chrono::Duration::from_std(self.delay(performed)).ok()?;
        Some(now + delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(60));
        assert_eq!(policy.delay(1), Duration::from_secs(120));
        assert_eq!(policy.delay(5), Duration::from_secs(1920));
        assert_eq!(policy.delay(6), Duration::from_secs(3600));
        assert_eq!(policy.delay(40), Duration::from_secs(3600));
    }

    #[test]
    fn test_budget_is_bounded() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(
            policy.next_retry_at(0, now),
            Some(now + chrono::Duration::seconds(60))
        );
        assert!(policy.next_retry_at(2, now).is_some());
        assert!(policy.next_retry_at(3, now).is_none());
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(policy.next_retry_at(0, Utc::now()).is_none());
    }
}
