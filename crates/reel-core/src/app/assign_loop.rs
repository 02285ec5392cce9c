//! AssignmentEngine - pending タスクをワーカーに割り当てる
//!
//! # フロー（1 tick）
//! 1. registry から割り当て可能なワーカーを取得（stale なワーカーはここで offline になる）
//! 2. pending タスクを (priority DESC, created_at ASC) で batch_limit 件取得
//! 3. タスクごとに load factor 最小（同率なら last_heartbeat が最も古い）ワーカーを選ぶ
//! 4. 条件付き書き込みで assigned にする。競合したら捨てて次の tick に任せる
//! 5. tick 内の予測負荷を +1 し、ワーカーに通知（fire-and-forget）

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::app::guard::{notify_call, store_call};
use crate::app::registry::WorkerRegistry;
use crate::domain::{ErrorKind, SchedulerError, TaskStatus, WorkerId, WorkerRecord};
use crate::ports::{Assignment, Clock, TaskOrder, TaskRepository, WorkerNotifier};

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignReport {
    pub considered: usize,
    pub assigned: usize,
    pub conflicts: usize,
    /// Left pending because every worker was full.
    pub no_capacity: usize,
    pub errors: usize,
}

/// Local, per-tick view of a worker's load.
#[derive(Debug, Clone)]
struct Slot {
    id: WorkerId,
    current: u32,
    max: u32,
    last_heartbeat: DateTime<Utc>,
}

impl Slot {
    fn from_worker(worker: &WorkerRecord) -> Self {
        Self {
            id: worker.id.clone(),
            current: worker.current_tasks,
            max: worker.max_tasks,
            last_heartbeat: worker.last_heartbeat,
        }
    }

    fn load_factor(&self) -> f64 {
        if self.max == 0 {
            return 1.0;
        }
        f64::from(self.current) / f64::from(self.max)
    }

    fn has_capacity(&self) -> bool {
        self.current < self.max
    }
}

/// Lowest load factor first; ties go to the worker idle the longest.
fn pick(slots: &mut [Slot]) -> Option<&mut Slot> {
    slots
        .iter_mut()
        .filter(|s| s.has_capacity())
        .min_by(|a, b| {
            a.load_factor()
                .total_cmp(&b.load_factor())
                .then(a.last_heartbeat.cmp(&b.last_heartbeat))
        })
}

pub struct AssignmentEngine {
    tasks: Arc<dyn TaskRepository>,
    registry: Arc<WorkerRegistry>,
    notifier: Arc<dyn WorkerNotifier>,
    clock: Arc<dyn Clock>,
    batch_limit: usize,
    store_timeout: Duration,
    notify_timeout: Duration,
}

impl AssignmentEngine {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        registry: Arc<WorkerRegistry>,
        notifier: Arc<dyn WorkerNotifier>,
        clock: Arc<dyn Clock>,
        batch_limit: usize,
        store_timeout: Duration,
        notify_timeout: Duration,
    ) -> Self {
        Self {
            tasks,
            registry,
            notifier,
            clock,
            batch_limit,
            store_timeout,
            notify_timeout,
        }
    }

    /// Runs one assignment pass.
    ///
    /// Only failures to read the worker list or the pending list abort the
    /// tick; per-task failures are counted and skipped.
    pub async fn tick(&self) -> Result<AssignReport, SchedulerError> {
        let mut report = AssignReport::default();

        let mut slots: Vec<Slot> = self
            .registry
            .list_available()
            .await?
            .iter()
            .map(Slot::from_worker)
            .collect();
        if slots.is_empty() {
            tracing::debug!("no worker with spare capacity");
            return Ok(report);
        }

        let pending = store_call(
            self.store_timeout,
            "list_by_status",
            self.tasks
                .list_by_status(TaskStatus::Pending, TaskOrder::Scheduling, self.batch_limit),
        )
        .await?;

        for (i, task) in pending.iter().enumerate() {
            report.considered += 1;

            let Some(slot) = pick(&mut slots) else {
                report.no_capacity = pending.len() - i;
                report.considered = pending.len();
                break;
            };

            let mut bound = task.clone();
            if let Err(e) = bound.assign(slot.id.clone(), self.clock.now()) {
                tracing::warn!(task_id = %task.id, error = %e, "pending task refused assignment");
                report.errors += 1;
                continue;
            }

            let stored = match store_call(
                self.store_timeout,
                "update_task_conditional",
                self.tasks.update_task_conditional(bound),
            )
            .await
            {
                Ok(stored) => stored,
                Err(e) if e.kind() == ErrorKind::Conflict => {
                    tracing::debug!(task_id = %task.id, "lost assignment race, leaving for next tick");
                    report.conflicts += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "assignment write failed");
                    report.errors += 1;
                    continue;
                }
            };

            slot.current += 1;
            let worker_id = slot.id.clone();
            report.assigned += 1;
            tracing::info!(
                task_id = %stored.id,
                worker_id = %worker_id,
                priority = stored.priority,
                "task assigned"
            );

            if let Err(e) = self.registry.record_assignment(&worker_id).await {
                tracing::warn!(worker_id = %worker_id, error = %e, "could not record worker load");
            }

            let assignment = Assignment::for_task(&stored, worker_id.clone());
            if let Err(e) = notify_call(
                self.notify_timeout,
                self.notifier.notify_assigned(&assignment),
            )
            .await
            {
                tracing::warn!(
                    task_id = %stored.id,
                    worker_id = %worker_id,
                    error = %e,
                    "assignment notification failed, worker will reconcile"
                );
            }
        }

        if report.assigned > 0 || report.no_capacity > 0 {
            tracing::info!(?report, "assignment tick");
        } else {
            tracing::debug!(?report, "assignment tick");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::tests::sample_input;
    use crate::domain::{LoadSnapshot, TaskId, TaskRecord};
    use crate::impls::{ChannelNotifier, InMemoryTaskStore, InMemoryWorkerStore};
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use ulid::Ulid;

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        registry: Arc<WorkerRegistry>,
        notifier: Arc<ChannelNotifier>,
        clock: Arc<FixedClock>,
        engine: AssignmentEngine,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryTaskStore::new());
        let registry = Arc::new(WorkerRegistry::new(
            Arc::new(InMemoryWorkerStore::new()),
            clock.clone(),
            Duration::from_secs(90),
            Duration::from_secs(5),
        ));
        let notifier = Arc::new(ChannelNotifier::new());
        let engine = AssignmentEngine::new(
            store.clone(),
            registry.clone(),
            notifier.clone(),
            clock.clone(),
            32,
            Duration::from_secs(5),
            Duration::from_secs(2),
        );
        Fixture {
            store,
            registry,
            notifier,
            clock,
            engine,
        }
    }

    async fn submit(f: &Fixture, priority: u8) -> TaskRecord {
        let mut input = sample_input();
        input.priority = priority;
        let task = TaskRecord::new(TaskId::from_ulid(Ulid::new()), input, 5, 3, f.clock.now());
        f.clock.advance(Duration::from_secs(1));
        f.store.create_task(task).await.unwrap()
    }

    #[tokio::test]
    async fn highest_priority_goes_first_when_capacity_is_short() {
        let f = fixture();
        f.registry.register("enc-1".into(), "encoder", 1).await.unwrap();
        let low = submit(&f, 2).await;
        let high = submit(&f, 9).await;

        let report = f.engine.tick().await.unwrap();
        assert_eq!(report.assigned, 1);
        assert_eq!(report.no_capacity, 1);

        assert_eq!(f.store.get_task(high.id).await.unwrap().status, TaskStatus::Assigned);
        assert_eq!(f.store.get_task(low.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn one_tick_spreads_load_across_workers() {
        let f = fixture();
        f.registry.register("a".into(), "a", 2).await.unwrap();
        f.registry.register("b".into(), "b", 2).await.unwrap();
        for _ in 0..4 {
            submit(&f, 5).await;
        }

        let report = f.engine.tick().await.unwrap();
        assert_eq!(report.assigned, 4);

        for id in ["a", "b"] {
            let worker = f.registry.get(&id.into()).await.unwrap();
            assert_eq!(worker.current_tasks, 2, "worker {id}");
        }
    }

    #[tokio::test]
    async fn ties_prefer_the_longest_idle_worker() {
        let f = fixture();
        f.registry.register("early".into(), "early", 2).await.unwrap();
        f.clock.advance(Duration::from_secs(10));
        f.registry.register("late".into(), "late", 2).await.unwrap();
        f.registry
            .heartbeat(&"late".into(), LoadSnapshot { current_tasks: 0 })
            .await
            .unwrap();

        let task = submit(&f, 5).await;
        f.engine.tick().await.unwrap();

        let stored = f.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.assigned_worker, Some(WorkerId::new("early")));
    }

    #[tokio::test]
    async fn assigned_worker_is_notified() {
        let f = fixture();
        f.registry.register("enc-1".into(), "encoder", 1).await.unwrap();
        let mut rx = f.notifier.subscribe("enc-1".into());
        let task = submit(&f, 5).await;

        f.engine.tick().await.unwrap();

        let assignment = rx.recv().await.unwrap();
        assert_eq!(assignment.task_id, task.id);
        assert_eq!(assignment.worker_id, WorkerId::new("enc-1"));
    }

    #[tokio::test]
    async fn notification_failure_does_not_undo_assignment() {
        let f = fixture();
        f.registry.register("enc-1".into(), "encoder", 1).await.unwrap();
        // nobody subscribed for enc-1
        let task = submit(&f, 5).await;

        let report = f.engine.tick().await.unwrap();
        assert_eq!(report.assigned, 1);
        assert_eq!(f.store.get_task(task.id).await.unwrap().status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn no_workers_means_no_mutation() {
        let f = fixture();
        let task = submit(&f, 5).await;

        let report = f.engine.tick().await.unwrap();
        assert_eq!(report, AssignReport::default());
        assert_eq!(f.store.get_task(task.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn store_outage_aborts_the_tick() {
        let f = fixture();
        f.registry.register("enc-1".into(), "encoder", 1).await.unwrap();
        submit(&f, 5).await;

        f.store.set_unavailable(true);
        let err = f.engine.tick().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn pick_skips_full_slots() {
        let now = Utc::now();
        let mut slots = vec![
            Slot {
                id: "full".into(),
                current: 1,
                max: 1,
                last_heartbeat: now,
            },
            Slot {
                id: "busy".into(),
                current: 3,
                max: 4,
                last_heartbeat: now,
            },
        ];
        assert_eq!(pick(&mut slots).map(|s| s.id.clone()), Some("busy".into()));

        slots[1].current = 4;
        assert!(pick(&mut slots).is_none());
    }
}
