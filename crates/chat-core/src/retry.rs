use std::time::Duration;

use crate::{error::ChatError, types::RuntimeConfig};

const MAX_DOUBLINGS: u32 = 16;

/// Backoff between live feed reattach attempts.
///
/// Doubles from `base` per failed attempt, never exceeds `max`, and waits at
/// least as long as a server retry hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        let base = Duration::from_millis(base_delay_ms);
        Self {
            base,
            max: Duration::from_millis(max_delay_ms).max(base),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.reattach_base_delay_ms, config.reattach_max_delay_ms)
    }

    pub fn delay_for_attempt(&self, attempt: u32, retry_after_ms: Option<u64>) -> Duration {
        let backoff = self
            .base
            .checked_mul(1 << attempt.min(MAX_DOUBLINGS))
            .unwrap_or(self.max);
        let hint = retry_after_ms.map(Duration::from_millis).unwrap_or_default();
        backoff.max(hint).min(self.max)
    }

    /// Delay before reattaching after `fault`.
    pub fn delay_after(&self, attempt: u32, fault: &ChatError) -> Duration {
        self.delay_for_attempt(attempt, fault.retry_after_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatErrorCategory;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn doubles_per_attempt_until_capped() {
        let policy = RetryPolicy::new(200, 1_000);
        let delays: Vec<_> = (0..5).map(|n| policy.delay_for_attempt(n, None)).collect();
        assert_eq!(delays, [ms(200), ms(400), ms(800), ms(1_000), ms(1_000)]);
    }

    #[test]
    fn huge_attempt_counts_stay_at_the_cap() {
        let policy = RetryPolicy::new(500, 30_000);
        assert_eq!(policy.delay_for_attempt(u32::MAX, None), ms(30_000));
    }

    #[test]
    fn rate_limit_hint_extends_the_wait() {
        let policy = RetryPolicy::new(100, 20_000);
        let fault = ChatError::new(ChatErrorCategory::RateLimited, "rate_limited", "slow down")
            .with_retry_after(5_000);
        assert_eq!(policy.delay_after(0, &fault), ms(5_000));
    }

    #[test]
    fn hint_never_exceeds_the_cap() {
        let policy = RetryPolicy::new(100, 2_000);
        assert_eq!(policy.delay_for_attempt(0, Some(60_000)), ms(2_000));
    }

    #[test]
    fn max_is_raised_to_base_when_misconfigured() {
        let policy = RetryPolicy::new(1_000, 10);
        assert_eq!(policy.delay_for_attempt(0, None), ms(1_000));
        assert_eq!(policy.delay_for_attempt(3, None), ms(1_000));
    }

    #[test]
    fn defaults_follow_runtime_config() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0, None), ms(500));
        assert_eq!(policy.delay_for_attempt(u32::MAX, None), ms(30_000));
    }
}
