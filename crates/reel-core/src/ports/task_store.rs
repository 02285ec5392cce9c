//! TaskRepository port - タスク状態の正本（source of truth）
//!
//! TaskRepository は以下を管理します：
//! - タスク（status, priority, retry, HLS 設定）
//! - HLS サブタスク（解像度ごと）
//! - HLS セグメント（追記のみ）
//! - HLS プレイリスト（master / media）
//!
//! # 設計原則
//! - すべての更新は行バージョンによる条件付き書き込み（楽観ロック）
//! - スケジューラ側のメモリ上の構造はキャッシュに過ぎない
//! - タスク削除時はサブタスク・セグメント・プレイリストもカスケード削除

use async_trait::async_trait;
use std::collections::HashMap;

use crate::domain::{
    HlsPlaylist, HlsSegment, SchedulerError, SubTaskId, SubTaskRecord, TaskId, TaskRecord,
    TaskStatus, WorkerId,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("{kind} {id} already exists")]
    Duplicate { kind: &'static str, id: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn task_not_found(id: TaskId) -> Self {
        StoreError::NotFound {
            kind: "task",
            id: id.to_string(),
        }
    }

    pub fn sub_task_not_found(id: SubTaskId) -> Self {
        StoreError::NotFound {
            kind: "sub-task",
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => SchedulerError::NotFound { kind, id },
            StoreError::VersionConflict { id, .. } => SchedulerError::Conflict { id },
            StoreError::Duplicate { kind, id } => {
                SchedulerError::Validation(format!("{kind} {id} already exists"))
            }
            StoreError::Unavailable(msg) => SchedulerError::TransientStore(msg),
        }
    }
}

/// Ordering for `list_by_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOrder {
    /// priority DESC, created_at ASC (assignment order)
    Scheduling,
    /// updated_at ASC (oldest untouched first)
    LeastRecentlyUpdated,
}

/// Filter for the management listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskQuery {
    pub user_id: Option<String>,
    pub status: Option<TaskStatus>,
    /// Tasks currently bound to this worker.
    pub worker_id: Option<WorkerId>,
    /// None = no limit
    pub limit: Option<usize>,
    pub offset: usize,
}

/// TaskRepository はタスクと HLS 付随データの正本
///
/// `*_conditional` の更新は、渡したレコードの `version` が保存済みの値と一致する
/// ときだけ書き込み、バージョンを 1 進めたレコードを返す。一致しなければ
/// `StoreError::VersionConflict`。
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Inserts a new task. The stored version starts at 1.
    async fn create_task(&self, task: TaskRecord) -> Result<TaskRecord, StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<TaskRecord, StoreError>;

    async fn update_task_conditional(&self, task: TaskRecord) -> Result<TaskRecord, StoreError>;

    async fn list_by_status(
        &self,
        status: TaskStatus,
        order: TaskOrder,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Newest first.
    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, StoreError>;

    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>, StoreError>;

    /// Removes the task and everything hanging off it.
    async fn delete_task(&self, id: TaskId) -> Result<(), StoreError>;

    /// Installs the sub-task set of `attempt`, atomically.
    ///
    /// - the task already holds a non-empty set for `attempt`: that set is
    ///   returned and `sub_tasks` is discarded
    /// - otherwise the existing sub-tasks, segments and playlists are dropped
    ///   and `sub_tasks` are inserted (each at version 1)
    async fn expand_sub_tasks(
        &self,
        task_id: TaskId,
        attempt: u32,
        sub_tasks: Vec<SubTaskRecord>,
    ) -> Result<Vec<SubTaskRecord>, StoreError>;

    async fn get_sub_task(&self, id: SubTaskId) -> Result<SubTaskRecord, StoreError>;

    async fn list_sub_tasks(&self, task_id: TaskId) -> Result<Vec<SubTaskRecord>, StoreError>;

    async fn update_sub_task_conditional(
        &self,
        sub_task: SubTaskRecord,
    ) -> Result<SubTaskRecord, StoreError>;

    /// Append-only; a second segment with the same index is `Duplicate`.
    async fn append_segment(&self, segment: HlsSegment) -> Result<(), StoreError>;

    async fn list_segments(&self, sub_task_id: SubTaskId) -> Result<Vec<HlsSegment>, StoreError>;

    /// Upsert keyed by (task, kind, sub-task).
    async fn put_playlist(&self, playlist: HlsPlaylist) -> Result<(), StoreError>;

    async fn list_playlists(&self, task_id: TaskId) -> Result<Vec<HlsPlaylist>, StoreError>;
}
