//! InMemoryTaskStore - 開発用・テスト用の正本
//!
//! # 実装詳細
//! - 1 つの `tokio::sync::Mutex` で全テーブルを守る（条件付き書き込みはロック内で判定）
//! - 行ごとに `version` を持ち、書き込みのたびに +1
//! - タスク削除時はサブタスク・セグメント・プレイリストをカスケード削除
//! - テスト用に「ストア停止」と「応答遅延」を注入できる

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::domain::{
    HlsPlaylist, HlsSegment, SubTaskId, SubTaskRecord, TaskId, TaskRecord, TaskStatus,
};
use crate::ports::{StoreError, TaskOrder, TaskQuery, TaskRepository};

#[derive(Default)]
struct Tables {
    tasks: HashMap<TaskId, TaskRecord>,
    sub_tasks: HashMap<SubTaskId, SubTaskRecord>,
    sub_tasks_by_task: HashMap<TaskId, Vec<SubTaskId>>,
    segments: HashMap<SubTaskId, BTreeMap<u32, HlsSegment>>,
    playlists: HashMap<TaskId, Vec<HlsPlaylist>>,
}

impl Tables {
    fn drop_hls_rows(&mut self, task_id: TaskId) {
        if let Some(ids) = self.sub_tasks_by_task.remove(&task_id) {
            for id in ids {
                self.sub_tasks.remove(&id);
                self.segments.remove(&id);
            }
        }
        self.playlists.remove(&task_id);
    }
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    tables: Arc<Mutex<Tables>>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay injected before every call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn gate(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskStore {
    async fn create_task(&self, mut task: TaskRecord) -> Result<TaskRecord, StoreError> {
        self.gate().await?;
        let mut tables = self.tables.lock().await;
        if tables.tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate {
                kind: "task",
                id: task.id.to_string(),
            });
        }
        task.version = 1;
        tables.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().await;
        tables.tasks.get(&id).cloned().ok_or_else(|| StoreError::task_not_found(id))
    }

    async fn update_task_conditional(
        &self,
        mut task: TaskRecord,
    ) -> Result<TaskRecord, StoreError> {
        self.gate().await?;
        let mut tables = self.tables.lock().await;
        let stored = tables
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::task_not_found(task.id))?;
        if stored.version != task.version {
            return Err(StoreError::VersionConflict {
                id: task.id.to_string(),
                expected: task.version,
                actual: stored.version,
            });
        }
        task.version += 1;
        *stored = task.clone();
        Ok(task)
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        order: TaskOrder,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().await;
        let mut matching: Vec<TaskRecord> = tables
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        match order {
            TaskOrder::Scheduling => matching.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            }),
            TaskOrder::LeastRecentlyUpdated => {
                matching.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)))
            }
        }
        matching.truncate(limit);
        Ok(matching)
    }

    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().await;
        let mut matching: Vec<TaskRecord> = tables
            .tasks
            .values()
            .filter(|t| query.user_id.as_deref().is_none_or(|u| t.user_id == u))
            .filter(|t| query.status.is_none_or(|s| t.status == s))
            .filter(|t| {
                query
                    .worker_id
                    .as_ref()
                    .is_none_or(|w| t.assigned_worker.as_ref() == Some(w))
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().await;
        let mut counts = HashMap::new();
        for task in tables.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn delete_task(&self, id: TaskId) -> Result<(), StoreError> {
        self.gate().await?;
        let mut tables = self.tables.lock().await;
        tables.tasks.remove(&id).ok_or_else(|| StoreError::task_not_found(id))?;
        tables.drop_hls_rows(id);
        Ok(())
    }

    async fn expand_sub_tasks(
        &self,
        task_id: TaskId,
        attempt: u32,
        sub_tasks: Vec<SubTaskRecord>,
    ) -> Result<Vec<SubTaskRecord>, StoreError> {
        self.gate().await?;
        let mut tables = self.tables.lock().await;
        if !tables.tasks.contains_key(&task_id) {
            return Err(StoreError::task_not_found(task_id));
        }

        let current: Vec<SubTaskRecord> = tables
            .sub_tasks_by_task
            .get(&task_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.sub_tasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        if !current.is_empty() && current.iter().all(|s| s.attempt == attempt) {
            return Ok(current);
        }
        tables.drop_hls_rows(task_id);

        let mut stored = Vec::with_capacity(sub_tasks.len());
        let mut ids = Vec::with_capacity(sub_tasks.len());
        for mut sub in sub_tasks {
            sub.task_id = task_id;
            sub.attempt = attempt;
            sub.version = 1;
            ids.push(sub.id);
            tables.sub_tasks.insert(sub.id, sub.clone());
            stored.push(sub);
        }
        tables.sub_tasks_by_task.insert(task_id, ids);
        Ok(stored)
    }

    async fn get_sub_task(&self, id: SubTaskId) -> Result<SubTaskRecord, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().await;
        tables
            .sub_tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::sub_task_not_found(id))
    }

    async fn list_sub_tasks(&self, task_id: TaskId) -> Result<Vec<SubTaskRecord>, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().await;
        Ok(tables
            .sub_tasks_by_task
            .get(&task_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.sub_tasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_sub_task_conditional(
        &self,
        mut sub_task: SubTaskRecord,
    ) -> Result<SubTaskRecord, StoreError> {
        self.gate().await?;
        let mut tables = self.tables.lock().await;
        let stored = tables
            .sub_tasks
            .get_mut(&sub_task.id)
            .ok_or_else(|| StoreError::sub_task_not_found(sub_task.id))?;
        if stored.version != sub_task.version {
            return Err(StoreError::VersionConflict {
                id: sub_task.id.to_string(),
                expected: sub_task.version,
                actual: stored.version,
            });
        }
        sub_task.version += 1;
        *stored = sub_task.clone();
        Ok(sub_task)
    }

    async fn append_segment(&self, segment: HlsSegment) -> Result<(), StoreError> {
        self.gate().await?;
        let mut tables = self.tables.lock().await;
        if !tables.sub_tasks.contains_key(&segment.sub_task_id) {
            return Err(StoreError::sub_task_not_found(segment.sub_task_id));
        }
        let segments = tables.segments.entry(segment.sub_task_id).or_default();
        if segments.contains_key(&segment.index) {
            return Err(StoreError::Duplicate {
                kind: "segment",
                id: format!("{}#{}", segment.sub_task_id, segment.index),
            });
        }
        segments.insert(segment.index, segment);
        Ok(())
    }

    async fn list_segments(&self, sub_task_id: SubTaskId) -> Result<Vec<HlsSegment>, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().await;
        Ok(tables
            .segments
            .get(&sub_task_id)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_playlist(&self, playlist: HlsPlaylist) -> Result<(), StoreError> {
        self.gate().await?;
        let mut tables = self.tables.lock().await;
        if !tables.tasks.contains_key(&playlist.task_id) {
            return Err(StoreError::task_not_found(playlist.task_id));
        }
        let playlists = tables.playlists.entry(playlist.task_id).or_default();
        match playlists
            .iter_mut()
            .find(|p| p.kind == playlist.kind && p.sub_task_id == playlist.sub_task_id)
        {
            Some(existing) => *existing = playlist,
            None => playlists.push(playlist),
        }
        Ok(())
    }

    async fn list_playlists(&self, task_id: TaskId) -> Result<Vec<HlsPlaylist>, StoreError> {
        self.gate().await?;
        let tables = self.tables.lock().await;
        Ok(tables.playlists.get(&task_id).cloned().unwrap_or_default())
    }
}
