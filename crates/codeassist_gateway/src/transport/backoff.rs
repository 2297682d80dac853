use std::time::Duration;

/// Retry schedule for 403 responses caused by permission propagation lag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max_delay: Duration::from_millis(2000),
            max_retries: 10,
        }
    }
}

impl BackoffPolicy {
    pub fn normalized(self) -> Self {
        let base = if self.base.is_zero() {
            Duration::from_millis(1)
        } else {
            self.base
        };
        let max_delay = self.max_delay.max(base);
        Self {
            base,
            max_delay,
            max_retries: self.max_retries,
        }
    }

    /// Delay before retry number `retry` (zero based): `base * 2^retry`,
    /// capped at `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 1_u128 << retry.min(31);
        let delay_ms = self
            .base
            .as_millis()
            .saturating_mul(factor)
            .min(self.max_delay.as_millis());
        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_doubles_then_caps() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..policy.max_retries)
            .map(|retry| policy.delay_for_retry(retry).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![200, 400, 800, 1600, 2000, 2000, 2000, 2000, 2000, 2000]
        );
    }

    #[test]
    fn delays_are_non_decreasing_and_bounded() {
        let policy = BackoffPolicy::default();
        let mut previous = Duration::ZERO;
        for retry in 0..64 {
            let delay = policy.delay_for_retry(retry);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(2000));
            previous = delay;
        }
    }

    #[test]
    fn normalization_keeps_cap_above_base() {
        let policy = BackoffPolicy {
            base: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_retries: 3,
        }
        .normalized();
        assert_eq!(policy.base, Duration::from_millis(1));
        assert_eq!(policy.max_delay, Duration::from_millis(1));
    }
}
