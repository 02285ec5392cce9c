//! Decision model: what to do with a task that failed or was abandoned.
//!
//! `RetryPolicy` computes the backoff window, `Decider` turns the task's retry
//! budget into a `Decision`. Both are pure; applying the decision (writing the
//! record back) is the caller's job.

use std::time::Duration;

use super::task::TaskRecord;

/// Exponential backoff, capped.
///
/// delay = min(base_delay * multiplier^(retry - 1), max_delay)
///
/// Example with base_delay=30s, multiplier=2.0, max_delay=10m:
/// - retry 1: 30s
/// - retry 2: 60s
/// - retry 3: 120s
/// - retry 6 and later: 600s
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Growth factor per retry. Values below 1.0 are treated as 1.0.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-indexed; 0 behaves like 1).
    pub fn next_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Give the task another run after `delay`.
    Retry { delay: Duration, reason: String },

    /// Out of retries: the failure is final.
    MarkDead { reason: String },
}

/// Decides the next action for a failed or abandoned task.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord) -> Decision;
}

/// Retry while `retry_count < max_retries`, using `RetryPolicy` for the delay.
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord) -> Decision {
        if !task.has_retries_left() {
            Decision::MarkDead {
                reason: format!(
                    "retries exhausted: {}/{}",
                    task.retry_count, task.max_retries
                ),
            }
        } else {
            let next = task.retry_count + 1;
            let delay = self.retry_policy.next_delay(next);
            Decision::Retry {
                delay,
                reason: format!("retry {}/{} after {:?}", next, task.max_retries, delay),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::TaskId;
    use crate::domain::task::tests::sample_input;
    use chrono::Utc;
    use ulid::Ulid;

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.next_delay(1), Duration::from_secs(30));
        assert_eq!(policy.next_delay(2), Duration::from_secs(60));
        assert_eq!(policy.next_delay(3), Duration::from_secs(120));
        assert_eq!(policy.next_delay(6), Duration::from_secs(600));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn backoff_is_monotonic() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            multiplier: 0.5,
            max_delay: Duration::from_secs(8),
        };
        let delays: Vec<_> = (1..10).map(|n| policy.next_delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn decider_respects_retry_budget() {
        let decider = DefaultDecider::default();
        let mut task = TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            sample_input(),
            5,
            2,
            Utc::now(),
        );

        assert!(matches!(
            decider.decide(&task),
            Decision::Retry { delay, .. } if delay == Duration::from_secs(30)
        ));

        task.retry_count = 1;
        assert!(matches!(
            decider.decide(&task),
            Decision::Retry { delay, .. } if delay == Duration::from_secs(60)
        ));

        task.retry_count = 2;
        assert!(matches!(decider.decide(&task), Decision::MarkDead { .. }));
    }
}
