//! Retry backoff policy.
//!
//! One policy object owned by the orchestrator so every fault category
//! shares identical backoff math: the base delay doubles per attempt and
//! is capped at a configured ceiling.

use std::time::Duration;

use remedy_common::config::HealingConfig;

/// Exponential backoff, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base: Duration,
    ceiling: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self { base, ceiling }
    }

    pub fn from_config(cfg: &HealingConfig) -> Self {
        Self::new(
            Duration::from_secs(cfg.backoff_base_secs),
            Duration::from_secs(cfg.backoff_ceiling_secs),
        )
    }

    /// Delay before the retry that follows attempt `attempt` (1-based).
    /// Attempt 1 waits the base delay, attempt N waits base * 2^(N-1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let secs = self
            .base
            .as_secs()
            .checked_shl(shift)
            .unwrap_or(self.ceiling.as_secs());
        Duration::from_secs(secs).min(self.ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_per_attempt() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(300));
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for(4), Duration::from_secs(40));
    }

    #[test]
    fn test_ceiling_caps_delay() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
        // Shift overflow territory still lands on the ceiling
        assert_eq!(policy.delay_for(200), Duration::from_secs(60));
    }

    #[test]
    fn test_monotonic_non_decreasing() {
        let policy = BackoffPolicy::new(Duration::from_secs(3), Duration::from_secs(120));
        let mut prev = Duration::ZERO;
        for attempt in 1..=20 {
            let d = policy.delay_for(attempt);
            assert!(d >= prev, "delay shrank at attempt {}", attempt);
            prev = d;
        }
    }

    #[test]
    fn test_zero_base_stays_zero() {
        // Used by tests and aggressive configs: retry immediately
        let policy = BackoffPolicy::new(Duration::ZERO, Duration::from_secs(60));
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(5), Duration::ZERO);
    }
}
