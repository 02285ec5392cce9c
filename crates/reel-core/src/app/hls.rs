//! HlsCoordinator - HLS タスクの分解と集約
//!
//! - 分解: 親タスクが processing になった時点で、解像度ごとのサブタスクを作る
//!   （世代 = 親の retry_count。同じ世代の展開は冪等、前の世代は破棄して作り直す）
//! - 集約: サブタスクが 1 つでも failed なら親は failed（all-or-nothing）、
//!   全部 completed なら media / master playlist を書いてから親を completed にする
//! - 進捗: サブタスク進捗の単純平均（上限 100）
//!
//! # 再集約
//! 報告の直後の集約がストア障害で落ちても、`settle` は何度呼んでも同じ結果に
//! 収束する。expiry loop が processing の親に対して毎 tick 呼び直す。
//! サブタスクが 1 つも無い親（展開が書けなかった）はここで展開し直す。

use std::sync::Arc;
use std::time::Duration;

use crate::app::guard::store_call;
use crate::domain::hls::{render_master_playlist, render_media_playlist};
use crate::domain::{
    ErrorKind, HlsPlaylist, PlaylistKind, SchedulerError, SubTaskRecord, SubTaskStatus, TaskId,
    TaskRecord, TaskStatus, WorkerId,
};
use crate::ports::{Clock, IdGenerator, TaskRepository};

pub const MASTER_PLAYLIST_NAME: &str = "master.m3u8";

const SETTLE_ATTEMPTS: usize = 3;

/// Why a parent is being settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleCause {
    /// A sub-task report just landed. Progress is written even when
    /// unchanged, so the parent's `updated_at` follows its renditions.
    Report,
    /// Periodic reconciliation. Writes only when the outcome changed.
    Sweep,
}

/// Result of `HlsCoordinator::settle`.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub task: TaskRecord,
    /// The parent's worker, when this call moved the parent to a terminal
    /// state. Releasing its load unit is up to the caller.
    pub release: Option<WorkerId>,
    /// A missing sub-task set was created.
    pub expanded: bool,
}

impl Settlement {
    fn unchanged(task: TaskRecord) -> Self {
        Self {
            task,
            release: None,
            expanded: false,
        }
    }
}

/// Where a set of sibling sub-tasks stands.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate {
    /// Some sub-tasks are still pending or processing.
    InProgress { progress: u8 },
    /// Every sub-task completed.
    Completed,
    /// At least one sub-task failed; siblings no longer matter.
    Failed { sub_task: SubTaskRecord },
}

/// Unweighted mean of sub-task progress, capped at 100. Empty -> 0.
pub fn average_progress(sub_tasks: &[SubTaskRecord]) -> u8 {
    if sub_tasks.is_empty() {
        return 0;
    }
    let sum: u64 = sub_tasks.iter().map(|s| u64::from(s.progress.min(100))).sum();
    (sum / sub_tasks.len() as u64).min(100) as u8
}

pub fn aggregate(sub_tasks: &[SubTaskRecord]) -> Aggregate {
    if let Some(failed) = sub_tasks.iter().find(|s| s.status == SubTaskStatus::Failed) {
        return Aggregate::Failed {
            sub_task: failed.clone(),
        };
    }
    if !sub_tasks.is_empty() && sub_tasks.iter().all(|s| s.status == SubTaskStatus::Completed) {
        return Aggregate::Completed;
    }
    Aggregate::InProgress {
        progress: average_progress(sub_tasks),
    }
}

pub struct HlsCoordinator {
    tasks: Arc<dyn TaskRepository>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl HlsCoordinator {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            tasks,
            ids,
            clock,
            store_timeout,
        }
    }

    /// Creates one pending sub-task per rendition for the task's current
    /// processing round. Repeating it within the same round returns the set
    /// already stored; a new round replaces the earlier set. Non-HLS tasks
    /// get none.
    pub async fn expand(&self, task: &TaskRecord) -> Result<Vec<SubTaskRecord>, SchedulerError> {
        let Some(hls) = &task.hls else {
            return Ok(Vec::new());
        };
        let now = self.clock.now();
        let sub_tasks = hls
            .resolve()?
            .into_iter()
            .map(|rendition| {
                SubTaskRecord::new(
                    self.ids.generate_sub_task_id(),
                    task.id,
                    task.retry_count,
                    rendition,
                    task.assigned_worker.clone(),
                    now,
                )
            })
            .collect();

        let stored = store_call(
            self.store_timeout,
            "expand_sub_tasks",
            self.tasks
                .expand_sub_tasks(task.id, task.retry_count, sub_tasks),
        )
        .await?;
        tracing::info!(
            task_id = %task.id,
            attempt = task.retry_count,
            sub_tasks = stored.len(),
            "hls task expanded"
        );
        Ok(stored)
    }

    /// Every stored sub-task of the task, whatever round it belongs to.
    pub async fn sub_tasks(&self, task: &TaskRecord) -> Result<Vec<SubTaskRecord>, SchedulerError> {
        store_call(
            self.store_timeout,
            "list_sub_tasks",
            self.tasks.list_sub_tasks(task.id),
        )
        .await
    }

    /// Sub-tasks of the task's current processing round.
    pub async fn current_sub_tasks(
        &self,
        task: &TaskRecord,
    ) -> Result<Vec<SubTaskRecord>, SchedulerError> {
        let mut sub_tasks = self.sub_tasks(task).await?;
        sub_tasks.retain(|s| s.attempt == task.retry_count);
        Ok(sub_tasks)
    }

    /// Brings a processing HLS parent in line with its sub-tasks: mirrors
    /// progress, fails it on the first failed rendition, or publishes the
    /// playlists and completes it. Anything else is returned untouched.
    pub async fn settle(
        &self,
        id: TaskId,
        cause: SettleCause,
    ) -> Result<Settlement, SchedulerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let parent = store_call(self.store_timeout, "get_task", self.tasks.get_task(id)).await?;
            if parent.status != TaskStatus::Processing || !parent.is_hls() {
                return Ok(Settlement::unchanged(parent));
            }

            let sub_tasks = self.current_sub_tasks(&parent).await?;
            if sub_tasks.is_empty() {
                tracing::warn!(task_id = %id, "processing hls task has no sub-tasks, expanding");
                self.expand(&parent).await?;
                return Ok(Settlement {
                    task: parent,
                    release: None,
                    expanded: true,
                });
            }

            let now = self.clock.now();
            let mut next = parent.clone();
            let finished = match aggregate(&sub_tasks) {
                Aggregate::InProgress { progress } => {
                    if cause == SettleCause::Sweep && progress == parent.progress {
                        return Ok(Settlement::unchanged(parent));
                    }
                    next.sync_progress(progress, now)?;
                    false
                }
                Aggregate::Failed { sub_task } => {
                    let reason = format!(
                        "rendition {} failed: {}",
                        sub_task.rendition.label,
                        sub_task.error.as_deref().unwrap_or("unknown error")
                    );
                    next.fail(reason, now)?;
                    true
                }
                Aggregate::Completed => {
                    // master goes in before the parent flips to completed
                    self.publish_playlists(&parent, &sub_tasks).await?;
                    next.complete(now)?;
                    true
                }
            };

            match store_call(
                self.store_timeout,
                "update_task_conditional",
                self.tasks.update_task_conditional(next),
            )
            .await
            {
                Ok(stored) => {
                    if finished {
                        tracing::info!(task_id = %id, status = %stored.status, ?cause, "hls task settled");
                    }
                    return Ok(Settlement {
                        task: stored,
                        release: finished.then(|| parent.assigned_worker.clone()).flatten(),
                        expanded: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::Conflict && attempt < SETTLE_ATTEMPTS => {
                    tracing::debug!(task_id = %id, attempt, "parent moved while settling, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes the media playlists of every sub-task and then the master
    /// playlist. Returns the master.
    ///
    /// A sub-task whose segments were recorded gets a rendered media
    /// playlist; otherwise the worker-reported playlist path is referenced.
    pub async fn publish_playlists(
        &self,
        task: &TaskRecord,
        sub_tasks: &[SubTaskRecord],
    ) -> Result<HlsPlaylist, SchedulerError> {
        let Some(hls) = &task.hls else {
            return Err(SchedulerError::Validation(format!(
                "{} is not an hls task",
                task.id
            )));
        };
        let now = self.clock.now();

        let mut variants = Vec::with_capacity(sub_tasks.len());
        for sub in sub_tasks {
            let segments = store_call(
                self.store_timeout,
                "list_segments",
                self.tasks.list_segments(sub.id),
            )
            .await?;

            let name = sub.rendition.media_playlist_name();
            if !segments.is_empty() {
                let media = HlsPlaylist {
                    task_id: task.id,
                    kind: PlaylistKind::Media,
                    sub_task_id: Some(sub.id),
                    name: name.clone(),
                    content: render_media_playlist(hls, &segments),
                    created_at: now,
                };
                store_call(self.store_timeout, "put_playlist", self.tasks.put_playlist(media))
                    .await?;
            }
            let uri = sub.media_playlist.clone().unwrap_or(name);
            variants.push((&sub.rendition, uri));
        }

        let master = HlsPlaylist {
            task_id: task.id,
            kind: PlaylistKind::Master,
            sub_task_id: None,
            name: MASTER_PLAYLIST_NAME.to_string(),
            content: render_master_playlist(variants.iter().map(|(r, uri)| (*r, uri.as_str()))),
            created_at: now,
        };
        store_call(
            self.store_timeout,
            "put_playlist",
            self.tasks.put_playlist(master.clone()),
        )
        .await?;
        tracing::info!(task_id = %task.id, variants = sub_tasks.len(), "master playlist written");
        Ok(master)
    }

    pub async fn master_playlist(
        &self,
        task: &TaskRecord,
    ) -> Result<Option<HlsPlaylist>, SchedulerError> {
        let playlists = store_call(
            self.store_timeout,
            "list_playlists",
            self.tasks.list_playlists(task.id),
        )
        .await?;
        Ok(playlists.into_iter().find(|p| p.kind == PlaylistKind::Master))
    }
}
