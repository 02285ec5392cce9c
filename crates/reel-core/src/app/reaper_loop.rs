//! ReaperLoop - 放置されたタスクの回収（expiry loop）
//!
//! # フロー（1 tick）
//! 0. processing の HLS 親タスクを `HlsCoordinator::settle` で再集約する
//!    （報告直後の集約が落ちていても、ここで completed / failed に収束する。
//!    サブタスクが無い親はここで展開し直す）
//! 1. assigned / processing のタスクを updated_at の古い順に取得
//! 2. 次のどちらかなら「ワーカーが応答しない」とみなす
//!    - updated_at が assignment timeout より古い
//!    - 担当ワーカーが生存していない（未登録・offline・liveness window 外）
//! 3. Decider に従い、リトライ残りがあれば pending へ戻す（retry_count += 1）、
//!    なければ failed（終端）にする。どちらもワーカーの紐付けを外す
//! 4. 条件付き書き込み。競合したら何もしない（別の経路が先に動かした）

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::app::config::SchedulerConfig;
use crate::app::guard::store_call;
use crate::app::hls::{HlsCoordinator, SettleCause};
use crate::app::registry::WorkerRegistry;
use crate::domain::{
    Decider, Decision, ErrorKind, SchedulerError, TaskRecord, TaskStatus, WorkerId,
};
use crate::ports::{Clock, TaskOrder, TaskRepository};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// HLS parents moved to a terminal state by reconciliation.
    pub settled: usize,
    /// HLS parents whose missing sub-tasks were created.
    pub expanded: usize,
    pub scanned: usize,
    /// Back to pending.
    pub reclaimed: usize,
    /// Retries exhausted, now failed.
    pub failed: usize,
    pub conflicts: usize,
    pub errors: usize,
}

pub struct ReaperLoop {
    tasks: Arc<dyn TaskRepository>,
    registry: Arc<WorkerRegistry>,
    hls: Arc<HlsCoordinator>,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
    config: Arc<SchedulerConfig>,
}

impl ReaperLoop {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        registry: Arc<WorkerRegistry>,
        hls: Arc<HlsCoordinator>,
        decider: Arc<dyn Decider>,
        clock: Arc<dyn Clock>,
        config: Arc<SchedulerConfig>,
    ) -> Self {
        Self {
            tasks,
            registry,
            hls,
            decider,
            clock,
            config,
        }
    }

    pub async fn tick(&self) -> Result<ReapReport, SchedulerError> {
        let mut report = ReapReport::default();
        let mut liveness: HashMap<WorkerId, bool> = HashMap::new();

        self.reconcile_hls(&mut report).await?;

        for status in [TaskStatus::Assigned, TaskStatus::Processing] {
            let in_flight = store_call(
                self.config.store_timeout(),
                "list_by_status",
                self.tasks
                    .list_by_status(status, TaskOrder::LeastRecentlyUpdated, usize::MAX),
            )
            .await?;

            for task in in_flight {
                report.scanned += 1;
                match self.reap_one(task, &mut liveness).await {
                    Ok(Some(Reaped::Reclaimed)) => report.reclaimed += 1,
                    Ok(Some(Reaped::Failed)) => report.failed += 1,
                    Ok(None) => {}
                    Err(e) if e.kind() == ErrorKind::Conflict => report.conflicts += 1,
                    Err(e) => {
                        tracing::warn!(error = %e, "expiry check failed, retrying next tick");
                        report.errors += 1;
                    }
                }
            }
        }

        if report.reclaimed + report.failed + report.settled + report.expanded > 0 {
            tracing::info!(?report, "expiry tick");
        } else {
            tracing::debug!(?report, "expiry tick");
        }
        Ok(report)
    }

    async fn reconcile_hls(&self, report: &mut ReapReport) -> Result<(), SchedulerError> {
        let processing = store_call(
            self.config.store_timeout(),
            "list_by_status",
            self.tasks.list_by_status(
                TaskStatus::Processing,
                TaskOrder::LeastRecentlyUpdated,
                usize::MAX,
            ),
        )
        .await?;

        for task in processing.into_iter().filter(TaskRecord::is_hls) {
            match self.hls.settle(task.id, SettleCause::Sweep).await {
                Ok(settlement) => {
                    if settlement.expanded {
                        report.expanded += 1;
                    }
                    if let Some(worker) = settlement.release {
                        report.settled += 1;
                        if let Err(e) = self.registry.release(&worker).await {
                            tracing::warn!(worker_id = %worker, error = %e, "could not release worker load");
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::Conflict => report.conflicts += 1,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "hls reconciliation failed, retrying next tick");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    async fn reap_one(
        &self,
        task: TaskRecord,
        liveness: &mut HashMap<WorkerId, bool>,
    ) -> Result<Option<Reaped>, SchedulerError> {
        let now = self.clock.now();
        let timeout = self.config.timeout_for(task.estimated_duration());
        let idle = (now - task.updated_at).to_std().unwrap_or(Duration::ZERO);

        let reason = match &task.assigned_worker {
            _ if idle > timeout => format!("no progress for {}s", idle.as_secs()),
            Some(worker) => {
                let live = match liveness.get(worker) {
                    Some(live) => *live,
                    None => {
                        let live = self.registry.is_live(worker).await?;
                        liveness.insert(worker.clone(), live);
                        live
                    }
                };
                if live {
                    return Ok(None);
                }
                SchedulerError::WorkerUnresponsive(worker.clone()).to_string()
            }
            None => "in flight without a worker".to_string(),
        };

        let worker = task.assigned_worker.clone();
        let mut next = task.clone();
        let outcome = match self.decider.decide(&task) {
            Decision::Retry { .. } => {
                next.reclaim(now)?;
                Reaped::Reclaimed
            }
            Decision::MarkDead { reason: dead } => {
                next.fail(format!("{reason}; {dead}"), now)?;
                Reaped::Failed
            }
        };

        let stored = store_call(
            self.config.store_timeout(),
            "update_task_conditional",
            self.tasks.update_task_conditional(next),
        )
        .await?;

        tracing::info!(
            task_id = %stored.id,
            worker_id = ?worker.as_ref().map(WorkerId::as_str),
            status = %stored.status,
            retry_count = stored.retry_count,
            reason = %reason,
            "reclaimed abandoned task"
        );

        if let Some(worker) = worker
            && let Err(e) = self.registry.release(&worker).await
        {
            tracing::warn!(worker_id = %worker, error = %e, "could not release worker load");
        }
        Ok(Some(outcome))
    }
}

enum Reaped {
    Reclaimed,
    Failed,
}
