use log::{info, warn};

use crate::config::defaults;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::UPDATE_RETRY_ATTEMPTS,
            initial_backoff_ms: defaults::UPDATE_RETRY_BACKOFF_MS,
            max_backoff_ms: defaults::UPDATE_RETRY_BACKOFF_CAP_MS,
        }
    }
}

impl RetryPolicy {
    pub fn backoff_ms(&self, failures: u32) -> Option<u64> {
        if failures == 0 || failures > self.max_attempts {
            return None;
        }
        let factor = 1_u64.checked_shl(failures - 1).unwrap_or(u64::MAX);
        Some(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone)]
pub struct UpdateSchedule {
    interval_ms: u64,
    policy: RetryPolicy,
    next_due_ms: u64,
    failures: u32,
}

impl UpdateSchedule {
    pub fn new(interval_ms: u64, policy: RetryPolicy) -> Self {
        Self {
            interval_ms,
            policy,
            next_due_ms: 0,
            failures: 0,
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.next_due_ms
    }

    pub fn next_due_ms(&self) -> u64 {
        self.next_due_ms
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_success(&mut self, now_ms: u64) {
        self.failures = 0;
        self.next_due_ms = now_ms.saturating_add(self.interval_ms);
    }

    pub fn record_failure(&mut self, now_ms: u64) {
        self.failures = self.failures.saturating_add(1);
        match self.policy.backoff_ms(self.failures) {
            Some(backoff) => {
                info!(
                    "update run failed ({} so far); retrying in {}s",
                    self.failures,
                    backoff / 1000
                );
                self.next_due_ms = now_ms.saturating_add(backoff);
            }
            None => {
                warn!(
                    "update run failed {} times; waiting for the regular interval",
                    self.failures
                );
                self.failures = 0;
                self.next_due_ms = now_ms.saturating_add(self.interval_ms);
            }
        }
    }
}

impl Default for UpdateSchedule {
    fn default() -> Self {
        Self::new(defaults::UPDATE_INTERVAL_MS, RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 5_000,
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = policy();
        let delays: Vec<_> = (0..=5).map(|n| policy.backoff_ms(n)).collect();
        assert_eq!(
            delays,
            vec![None, Some(1_000), Some(2_000), Some(4_000), Some(5_000), None]
        );
    }

    #[test]
    fn huge_failure_counts_do_not_overflow() {
        let policy = RetryPolicy {
            max_attempts: u32::MAX,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        };
        assert_eq!(policy.backoff_ms(200), Some(60_000));
    }

    #[test]
    fn first_check_is_due_immediately() {
        let schedule = UpdateSchedule::new(100_000, policy());
        assert!(schedule.is_due(0));
    }

    #[test]
    fn failures_back_off_then_fall_back_to_interval() {
        let mut schedule = UpdateSchedule::new(100_000, policy());

        schedule.record_failure(10);
        assert_eq!(schedule.next_due_ms(), 1_010);
        assert!(!schedule.is_due(1_009));
        assert!(schedule.is_due(1_010));

        for _ in 0..3 {
            schedule.record_failure(2_000);
        }
        assert_eq!(schedule.failures(), 4);
        assert_eq!(schedule.next_due_ms(), 7_000);

        schedule.record_failure(7_000);
        assert_eq!(schedule.failures(), 0);
        assert_eq!(schedule.next_due_ms(), 107_000);
    }

    #[test]
    fn success_resets_failures() {
        let mut schedule = UpdateSchedule::new(100_000, policy());
        schedule.record_failure(0);
        schedule.record_success(500);
        assert_eq!(schedule.failures(), 0);
        assert_eq!(schedule.next_due_ms(), 100_500);
    }
}
