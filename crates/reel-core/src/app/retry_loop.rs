//! RetryLoop - 失敗タスクの再投入
//!
//! 1 tick で 2 段階を順に処理する:
//! 1. failed かつリトライ残りあり → retrying（retry_count += 1、
//!    retry_after = 失敗時刻 + backoff）
//! 2. retrying かつ retry_after を過ぎた → pending（AssignmentEngine が拾う）
//!
//! リトライ残りのない failed は終端なので触らない。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::app::guard::store_call;
use crate::domain::{Decider, Decision, ErrorKind, SchedulerError, TaskRecord, TaskStatus};
use crate::ports::{Clock, TaskOrder, TaskRepository};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// failed -> retrying
    pub scheduled: usize,
    /// retrying -> pending
    pub requeued: usize,
    pub conflicts: usize,
    pub errors: usize,
}

pub struct RetryLoop {
    tasks: Arc<dyn TaskRepository>,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl RetryLoop {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        decider: Arc<dyn Decider>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            tasks,
            decider,
            clock,
            store_timeout,
        }
    }

    pub async fn tick(&self) -> Result<RetryReport, SchedulerError> {
        let mut report = RetryReport::default();

        for task in self.list(TaskStatus::Failed).await? {
            let Decision::Retry { delay, reason } = self.decider.decide(&task) else {
                continue;
            };
            let retry_after = backoff_deadline(task.updated_at, delay);
            let mut next = task.clone();
            let result = match next.schedule_retry(retry_after, self.clock.now()) {
                Ok(()) => self.write(next).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(stored) => {
                    tracing::info!(
                        task_id = %stored.id,
                        retry_count = stored.retry_count,
                        retry_after = %retry_after,
                        reason = %reason,
                        "retry scheduled"
                    );
                    report.scheduled += 1;
                }
                Err(e) => tally(&mut report, &task, e),
            }
        }

        for task in self.list(TaskStatus::Retrying).await? {
            let now = self.clock.now();
            if task.retry_after.is_some_and(|after| after > now) {
                continue;
            }
            let mut next = task.clone();
            let result = match next.requeue(now) {
                Ok(()) => self.write(next).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(stored) => {
                    tracing::info!(task_id = %stored.id, retry_count = stored.retry_count, "task requeued");
                    report.requeued += 1;
                }
                Err(e) => tally(&mut report, &task, e),
            }
        }

        if report.scheduled + report.requeued > 0 {
            tracing::info!(?report, "retry tick");
        } else {
            tracing::debug!(?report, "retry tick");
        }
        Ok(report)
    }

    async fn list(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, SchedulerError> {
        store_call(
            self.store_timeout,
            "list_by_status",
            self.tasks
                .list_by_status(status, TaskOrder::LeastRecentlyUpdated, usize::MAX),
        )
        .await
    }

    async fn write(&self, task: TaskRecord) -> Result<TaskRecord, SchedulerError> {
        store_call(
            self.store_timeout,
            "update_task_conditional",
            self.tasks.update_task_conditional(task),
        )
        .await
    }
}

fn backoff_deadline(failed_at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| failed_at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn tally(report: &mut RetryReport, task: &TaskRecord, err: SchedulerError) {
    if err.kind() == ErrorKind::Conflict {
        tracing::debug!(task_id = %task.id, "task moved on during retry tick");
        report.conflicts += 1;
    } else {
        tracing::warn!(task_id = %task.id, error = %err, "retry step failed");
        report.errors += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::tests::sample_input;
    use crate::domain::{DefaultDecider, RetryPolicy, TaskId, WorkerId};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use ulid::Ulid;

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        clock: Arc<FixedClock>,
        retry: RetryLoop,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryTaskStore::new());
        let retry = RetryLoop::new(
            store.clone(),
            Arc::new(DefaultDecider::new(RetryPolicy::default())),
            clock.clone(),
            Duration::from_secs(5),
        );
        Fixture {
            store,
            clock,
            retry,
        }
    }

    async fn failed_task(f: &Fixture, retry_count: u32, max_retries: u32) -> TaskRecord {
        let mut input = sample_input();
        input.max_retries = Some(max_retries);
        let mut task = TaskRecord::new(TaskId::from_ulid(Ulid::new()), input, 5, 3, f.clock.now());
        task.retry_count = retry_count;
        let mut task = f.store.create_task(task).await.unwrap();

        let worker = WorkerId::new("enc-1");
        task.assign(worker.clone(), f.clock.now()).unwrap();
        task.start(&worker, f.clock.now()).unwrap();
        task.fail("encoder crashed".into(), f.clock.now()).unwrap();
        f.store.update_task_conditional(task).await.unwrap()
    }

    #[tokio::test]
    async fn failed_task_waits_out_backoff_before_requeue() {
        let f = fixture();
        let task = failed_task(&f, 0, 3).await;

        let report = f.retry.tick().await.unwrap();
        assert_eq!(report.scheduled, 1);
        assert_eq!(report.requeued, 0);

        let stored = f.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Retrying);
        assert_eq!(stored.retry_count, 1);

        f.clock.advance(Duration::from_secs(29));
        assert_eq!(f.retry.tick().await.unwrap().requeued, 0);

        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.retry.tick().await.unwrap().requeued, 1);
        assert_eq!(f.store.get_task(task.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn second_failure_backs_off_longer() {
        let f = fixture();
        let task = failed_task(&f, 1, 3).await;

        f.retry.tick().await.unwrap();
        let stored = f.store.get_task(task.id).await.unwrap();
        assert_eq!(
            stored.retry_after,
            Some(task.updated_at + chrono::Duration::seconds(60))
        );
    }

    #[tokio::test]
    async fn exhausted_failure_is_left_alone() {
        let f = fixture();
        let task = failed_task(&f, 3, 3).await;

        let report = f.retry.tick().await.unwrap();
        assert_eq!(report, RetryReport::default());

        let stored = f.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.version, task.version);
    }

    #[tokio::test]
    async fn repeated_ticks_are_idempotent() {
        let f = fixture();
        let task = failed_task(&f, 0, 3).await;

        f.retry.tick().await.unwrap();
        let once = f.store.get_task(task.id).await.unwrap();
        let report = f.retry.tick().await.unwrap();
        let twice = f.store.get_task(task.id).await.unwrap();

        assert_eq!(report, RetryReport::default());
        assert_eq!(once.version, twice.version);
        assert_eq!(twice.retry_count, 1);
    }
}
