//! Scheduler - 管理 API とワーカー報告の窓口
//!
//! 外部の HTTP 層から関数として呼ばれる表面。バックグラウンドループ
//! （AssignmentEngine / ReaperLoop / RetryLoop）とは store だけを共有する。
//!
//! # 設計原則
//! - すべての変更は「読む → ドメインで遷移 → 条件付き書き込み」
//! - 競合したら読み直して最大 `MAX_WRITE_ATTEMPTS` 回まで再適用する。
//!   再適用で遷移が不正になったら（別経路が先に終端にした等）そのまま
//!   `InvalidTransition` を返す。遅れてきた報告が終端タスクを戻すことはない
//! - 終端の報告（completed / failed / cancel）はワーカーの負荷を 1 つ返す
//!
//! # HLS のフロー
//! 1. `report_started` で親が processing になった直後にサブタスクを展開
//! 2. サブタスクの報告ごとに親を集約（進捗の反映、全完了なら playlist を書いて completed、
//!    1 つでも failed なら親も failed）
//! 3. 途中でストア障害に当たったら、ワーカーは同じ報告を再送してよい。
//!    `report_started` と終端のサブタスク報告は再送されると展開・集約だけをやり直す。
//!    再送が無くても expiry loop が同じ集約を毎 tick やり直す

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::app::config::SchedulerConfig;
use crate::app::guard::store_call;
use crate::app::hls::{HlsCoordinator, SettleCause, average_progress};
use crate::app::registry::WorkerRegistry;
use crate::app::status::{
    BatchOp, BatchResult, TaskStatistics, TaskView, WorkerOp, WorkerStatistics,
};
use crate::domain::{
    ErrorKind, HlsPlaylist, HlsSegment, LoadSnapshot, NewTask, SchedulerError, SubTaskId,
    SubTaskRecord, SubTaskStatus, TaskId, TaskRecord, TaskStatus, WorkerId, WorkerRecord,
};
use crate::ports::{Clock, IdGenerator, TaskQuery, TaskRepository};

const MAX_WRITE_ATTEMPTS: usize = 3;

pub struct Scheduler {
    tasks: Arc<dyn TaskRepository>,
    registry: Arc<WorkerRegistry>,
    hls: Arc<HlsCoordinator>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    config: Arc<SchedulerConfig>,
}

impl Scheduler {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        registry: Arc<WorkerRegistry>,
        hls: Arc<HlsCoordinator>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        config: Arc<SchedulerConfig>,
    ) -> Self {
        Self {
            tasks,
            registry,
            hls,
            ids,
            clock,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    // ---- tasks ----

    /// Validates and stores a new `pending` task.
    pub async fn create_task(&self, input: NewTask) -> Result<TaskRecord, SchedulerError> {
        input.validate()?;
        let task = TaskRecord::new(
            self.ids.generate_task_id(),
            input,
            self.config.tasks.default_priority,
            self.config.tasks.default_max_retries,
            self.clock.now(),
        );
        let stored = store_call(
            self.config.store_timeout(),
            "create_task",
            self.tasks.create_task(task),
        )
        .await?;
        tracing::info!(
            task_id = %stored.id,
            user_id = %stored.user_id,
            priority = stored.priority,
            hls = stored.is_hls(),
            "task created"
        );
        Ok(stored)
    }

    /// The task with its sub-tasks and master playlist. HLS progress is
    /// recomputed from the sub-tasks here.
    pub async fn get_task(&self, id: TaskId) -> Result<TaskView, SchedulerError> {
        let mut task = self.load(id).await?;
        if !task.is_hls() {
            return Ok(TaskView {
                task,
                sub_tasks: Vec::new(),
                master_playlist: None,
            });
        }

        let sub_tasks = self.hls.sub_tasks(&task).await?;
        if !sub_tasks.is_empty() {
            task.progress = average_progress(&sub_tasks);
        }
        let master_playlist = self.hls.master_playlist(&task).await?;
        Ok(TaskView {
            task,
            sub_tasks,
            master_playlist,
        })
    }

    pub async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, SchedulerError> {
        store_call(
            self.config.store_timeout(),
            "list_tasks",
            self.tasks.list_tasks(query),
        )
        .await
    }

    pub async fn list_sub_tasks(&self, id: TaskId) -> Result<Vec<SubTaskRecord>, SchedulerError> {
        let task = self.load(id).await?;
        self.hls.sub_tasks(&task).await
    }

    pub async fn get_master_playlist(&self, id: TaskId) -> Result<HlsPlaylist, SchedulerError> {
        let task = self.load(id).await?;
        self.hls
            .master_playlist(&task)
            .await?
            .ok_or_else(|| SchedulerError::NotFound {
                kind: "playlist",
                id: format!("{id}/master"),
            })
    }

    /// Only tasks nobody is working on (pending or terminal) can be deleted.
    pub async fn delete_task(&self, id: TaskId) -> Result<(), SchedulerError> {
        let task = self.load(id).await?;
        if !(task.status == TaskStatus::Pending || task.is_terminal()) {
            return Err(SchedulerError::Validation(format!(
                "{id} is {} and cannot be deleted",
                task.status
            )));
        }
        store_call(
            self.config.store_timeout(),
            "delete_task",
            self.tasks.delete_task(id),
        )
        .await?;
        tracing::info!(task_id = %id, "task deleted");
        Ok(())
    }

    // ---- workers ----

    pub async fn register_worker(
        &self,
        id: WorkerId,
        name: impl Into<String>,
        max_tasks: u32,
    ) -> Result<WorkerRecord, SchedulerError> {
        self.registry.register(id, name, max_tasks).await
    }

    pub async fn heartbeat(
        &self,
        id: &WorkerId,
        load: LoadSnapshot,
    ) -> Result<WorkerRecord, SchedulerError> {
        self.registry.heartbeat(id, load).await
    }

    pub async fn deregister_worker(&self, id: &WorkerId) -> Result<WorkerRecord, SchedulerError> {
        self.registry.deregister(id).await
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerRecord>, SchedulerError> {
        self.registry.list().await
    }

    /// Tasks currently bound to the worker (assigned or processing). A
    /// deregistered worker keeps its tasks listed until the expiry loop
    /// reclaims them.
    pub async fn list_worker_tasks(&self, id: &WorkerId) -> Result<Vec<TaskRecord>, SchedulerError> {
        let query = TaskQuery {
            worker_id: Some(id.clone()),
            ..TaskQuery::default()
        };
        let mut tasks = store_call(
            self.config.store_timeout(),
            "list_tasks",
            self.tasks.list_tasks(&query),
        )
        .await?;
        tasks.retain(|t| t.status.is_in_flight());
        Ok(tasks)
    }

    /// Operator override. `Offline` takes the worker out of assignment at
    /// once; the expiry loop then reclaims whatever it holds. `Online` counts
    /// as a fresh heartbeat.
    pub async fn set_worker_status(
        &self,
        id: &WorkerId,
        op: WorkerOp,
    ) -> Result<WorkerRecord, SchedulerError> {
        match op {
            WorkerOp::Online => self.registry.set_online(id).await,
            WorkerOp::Offline => self.registry.set_offline(id).await,
        }
    }

    pub async fn batch_workers(&self, op: WorkerOp, ids: &[WorkerId]) -> BatchResult<WorkerId> {
        let mut result = BatchResult::default();
        for id in ids {
            let outcome = self.set_worker_status(id, op).await;
            result.record(id.clone(), outcome.map(|_| ()));
        }
        tracing::info!(
            ?op,
            requested = result.requested,
            succeeded = result.succeeded,
            "batch worker operation"
        );
        result
    }

    // ---- task reports ----

    /// assigned -> processing. HLS tasks are expanded into fresh sub-tasks.
    ///
    /// Resending it for a task the same worker already started only repeats
    /// the expansion.
    pub async fn report_started(
        &self,
        id: TaskId,
        worker: &WorkerId,
    ) -> Result<TaskRecord, SchedulerError> {
        let task = match self.mutate_task(id, |t, now| t.start(worker, now)).await {
            Ok((_, task)) => {
                tracing::info!(task_id = %id, worker_id = %worker, "task started");
                task
            }
            Err(e @ SchedulerError::InvalidTransition { .. }) => {
                let task = self.load(id).await?;
                if task.status != TaskStatus::Processing {
                    return Err(e);
                }
                task.ensure_owned_by(worker)?;
                tracing::debug!(task_id = %id, worker_id = %worker, "start reported again");
                task
            }
            Err(e) => return Err(e),
        };

        if task.is_hls() {
            self.hls.expand(&task).await?;
        }
        Ok(task)
    }

    pub async fn report_progress(
        &self,
        id: TaskId,
        worker: &WorkerId,
        progress: u8,
    ) -> Result<TaskRecord, SchedulerError> {
        let (_, task) = self
            .mutate_task(id, |t, now| t.set_progress(worker, progress, now))
            .await?;
        tracing::debug!(task_id = %id, progress = task.progress, "task progress");
        Ok(task)
    }

    /// processing -> completed. HLS tasks complete through their sub-tasks.
    pub async fn report_completed(
        &self,
        id: TaskId,
        worker: &WorkerId,
    ) -> Result<TaskRecord, SchedulerError> {
        let (_, task) = self
            .mutate_task(id, |t, now| {
                if t.is_hls() {
                    return Err(SchedulerError::Validation(format!(
                        "{id} is an hls task; it completes when its renditions do"
                    )));
                }
                t.ensure_owned_by(worker)?;
                t.complete(now)
            })
            .await?;
        tracing::info!(task_id = %id, worker_id = %worker, "task completed");
        self.release(worker).await;
        Ok(task)
    }

    /// processing -> failed. Terminal at once when no retries are left.
    pub async fn report_failed(
        &self,
        id: TaskId,
        worker: &WorkerId,
        error: impl Into<String>,
    ) -> Result<TaskRecord, SchedulerError> {
        let error = error.into();
        let (_, task) = self
            .mutate_task(id, |t, now| {
                t.ensure_owned_by(worker)?;
                t.fail(error.clone(), now)
            })
            .await?;
        tracing::warn!(
            task_id = %id,
            worker_id = %worker,
            error = %error,
            retry_count = task.retry_count,
            terminal = task.is_terminal(),
            "task failed"
        );
        self.release(worker).await;
        Ok(task)
    }

    // ---- sub-task reports ----

    pub async fn report_subtask_started(
        &self,
        id: SubTaskId,
        worker: &WorkerId,
    ) -> Result<SubTaskRecord, SchedulerError> {
        let sub = self
            .mutate_sub_task(id, |s, now| s.start(worker.clone(), now))
            .await?;
        tracing::info!(sub_task_id = %id, task_id = %sub.task_id, worker_id = %worker, "rendition started");
        self.settle_parent(sub.task_id).await?;
        Ok(sub)
    }

    pub async fn report_subtask_progress(
        &self,
        id: SubTaskId,
        progress: u8,
    ) -> Result<SubTaskRecord, SchedulerError> {
        let sub = self
            .mutate_sub_task(id, |s, now| s.set_progress(progress, now))
            .await?;
        self.settle_parent(sub.task_id).await?;
        Ok(sub)
    }

    pub async fn report_subtask_completed(
        &self,
        id: SubTaskId,
        media_playlist: impl Into<String>,
    ) -> Result<SubTaskRecord, SchedulerError> {
        let media_playlist = media_playlist.into();
        let sub = match self
            .mutate_sub_task(id, |s, now| s.complete(media_playlist.clone(), now))
            .await
        {
            Ok(sub) => sub,
            Err(e) => return self.settle_repeated(id, SubTaskStatus::Completed, e).await,
        };
        tracing::info!(sub_task_id = %id, task_id = %sub.task_id, rendition = %sub.rendition.label, "rendition completed");
        self.settle_parent(sub.task_id).await?;
        Ok(sub)
    }

    pub async fn report_subtask_failed(
        &self,
        id: SubTaskId,
        error: impl Into<String>,
    ) -> Result<SubTaskRecord, SchedulerError> {
        let error = error.into();
        let sub = match self
            .mutate_sub_task(id, |s, now| s.fail(error.clone(), now))
            .await
        {
            Ok(sub) => sub,
            Err(e) => return self.settle_repeated(id, SubTaskStatus::Failed, e).await,
        };
        tracing::warn!(sub_task_id = %id, task_id = %sub.task_id, rendition = %sub.rendition.label, error = %error, "rendition failed");
        self.settle_parent(sub.task_id).await?;
        Ok(sub)
    }

    /// Appends a written segment to a processing sub-task. Indexes are
    /// write-once.
    pub async fn record_segment(&self, segment: HlsSegment) -> Result<(), SchedulerError> {
        let sub = self.load_sub_task(segment.sub_task_id).await?;
        self.ensure_parent_processing(sub.task_id).await?;
        if sub.status != SubTaskStatus::Processing {
            return Err(SchedulerError::InvalidTransition {
                from: sub.status.as_str(),
                to: SubTaskStatus::Processing.as_str(),
            });
        }
        let index = segment.index;
        store_call(
            self.config.store_timeout(),
            "append_segment",
            self.tasks.append_segment(segment),
        )
        .await?;
        tracing::debug!(sub_task_id = %sub.id, index, "segment recorded");
        Ok(())
    }

    // ---- manual operations ----

    pub async fn cancel_task(&self, id: TaskId) -> Result<TaskRecord, SchedulerError> {
        let (before, task) = self.mutate_task(id, |t, now| t.cancel(now)).await?;
        tracing::info!(task_id = %id, previous = %before.status, "task cancelled");
        if before.status.is_in_flight()
            && let Some(worker) = &before.assigned_worker
        {
            self.release(worker).await;
        }
        Ok(task)
    }

    /// Puts a failed task that still has retries left straight back to
    /// `pending`, skipping the backoff window.
    pub async fn retry_task(&self, id: TaskId) -> Result<TaskRecord, SchedulerError> {
        let (_, task) = self
            .mutate_task(id, |t, now| {
                t.schedule_retry(now, now)?;
                t.requeue(now)
            })
            .await?;
        tracing::info!(task_id = %id, retry_count = task.retry_count, "manual retry");
        Ok(task)
    }

    pub async fn batch(&self, op: BatchOp, ids: &[TaskId]) -> BatchResult {
        let mut result = BatchResult::default();
        for &id in ids {
            let outcome = match op {
                BatchOp::Cancel => self.cancel_task(id).await,
                BatchOp::Retry => self.retry_task(id).await,
            };
            result.record(id, outcome.map(|_| ()));
        }
        tracing::info!(
            ?op,
            requested = result.requested,
            succeeded = result.succeeded,
            "batch operation"
        );
        result
    }

    // ---- statistics ----

    pub async fn task_statistics(&self) -> Result<TaskStatistics, SchedulerError> {
        let counts = store_call(
            self.config.store_timeout(),
            "count_by_status",
            self.tasks.count_by_status(),
        )
        .await?;
        Ok(TaskStatistics::from_counts(&counts))
    }

    pub async fn worker_statistics(&self) -> Result<WorkerStatistics, SchedulerError> {
        self.registry.sweep().await?;
        Ok(WorkerStatistics::from_workers(&self.registry.list().await?))
    }

    // ---- internals ----

    /// Brings an HLS parent in line with its sub-tasks and gives back the
    /// worker's load once the parent is done.
    async fn settle_parent(&self, id: TaskId) -> Result<TaskRecord, SchedulerError> {
        let settlement = self.hls.settle(id, SettleCause::Report).await?;
        if let Some(worker) = &settlement.release {
            self.release(worker).await;
        }
        Ok(settlement.task)
    }

    /// A terminal sub-task report that was already applied: the sub-task
    /// stays as it is and only the parent is settled again.
    async fn settle_repeated(
        &self,
        id: SubTaskId,
        reported: SubTaskStatus,
        err: SchedulerError,
    ) -> Result<SubTaskRecord, SchedulerError> {
        if !matches!(err, SchedulerError::InvalidTransition { .. }) {
            return Err(err);
        }
        let sub = self.load_sub_task(id).await?;
        if sub.status != reported {
            return Err(err);
        }
        tracing::debug!(sub_task_id = %id, task_id = %sub.task_id, status = %reported, "rendition reported again, settling parent");
        self.settle_parent(sub.task_id).await?;
        Ok(sub)
    }

    /// Read, apply, conditional write; re-applies on a lost race. Returns
    /// the record as read and as stored.
    async fn mutate_task<F>(
        &self,
        id: TaskId,
        mut apply: F,
    ) -> Result<(TaskRecord, TaskRecord), SchedulerError>
    where
        F: FnMut(&mut TaskRecord, DateTime<Utc>) -> Result<(), SchedulerError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let before = self.load(id).await?;
            let mut next = before.clone();
            apply(&mut next, self.clock.now())?;
            match self.write(next).await {
                Ok(stored) => return Ok((before, stored)),
                Err(e) if e.kind() == ErrorKind::Conflict && attempt < MAX_WRITE_ATTEMPTS => {
                    tracing::debug!(task_id = %id, attempt, "conflicting write, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Same as `mutate_task`, for sub-tasks of a processing parent.
    async fn mutate_sub_task<F>(
        &self,
        id: SubTaskId,
        mut apply: F,
    ) -> Result<SubTaskRecord, SchedulerError>
    where
        F: FnMut(&mut SubTaskRecord, DateTime<Utc>) -> Result<(), SchedulerError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let sub = self.load_sub_task(id).await?;
            self.ensure_parent_processing(sub.task_id).await?;
            let mut next = sub.clone();
            apply(&mut next, self.clock.now())?;
            match store_call(
                self.config.store_timeout(),
                "update_sub_task_conditional",
                self.tasks.update_sub_task_conditional(next),
            )
            .await
            {
                Ok(stored) => return Ok(stored),
                Err(e) if e.kind() == ErrorKind::Conflict && attempt < MAX_WRITE_ATTEMPTS => {
                    tracing::debug!(sub_task_id = %id, attempt, "conflicting write, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn ensure_parent_processing(&self, id: TaskId) -> Result<(), SchedulerError> {
        let parent = self.load(id).await?;
        if parent.status != TaskStatus::Processing {
            return Err(SchedulerError::InvalidTransition {
                from: parent.status.as_str(),
                to: TaskStatus::Processing.as_str(),
            });
        }
        Ok(())
    }

    async fn load(&self, id: TaskId) -> Result<TaskRecord, SchedulerError> {
        store_call(self.config.store_timeout(), "get_task", self.tasks.get_task(id)).await
    }

    async fn load_sub_task(&self, id: SubTaskId) -> Result<SubTaskRecord, SchedulerError> {
        store_call(
            self.config.store_timeout(),
            "get_sub_task",
            self.tasks.get_sub_task(id),
        )
        .await
    }

    async fn write(&self, task: TaskRecord) -> Result<TaskRecord, SchedulerError> {
        store_call(
            self.config.store_timeout(),
            "update_task_conditional",
            self.tasks.update_task_conditional(task),
        )
        .await
    }

    async fn release(&self, worker: &WorkerId) {
        if let Err(e) = self.registry.release(worker).await {
            tracing::warn!(worker_id = %worker, error = %e, "could not release worker load");
        }
    }
}
