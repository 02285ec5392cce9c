//! InMemoryWorkerStore - 開発用のワーカー保存先

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::{WorkerId, WorkerRecord};
use crate::ports::{StoreError, WorkerMutation, WorkerPredicate, WorkerRepository};

#[derive(Default)]
pub struct InMemoryWorkerStore {
    workers: Arc<Mutex<HashMap<WorkerId, WorkerRecord>>>,
}

impl InMemoryWorkerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRepository for InMemoryWorkerStore {
    async fn get_worker(&self, id: &WorkerId) -> Result<Option<WorkerRecord>, StoreError> {
        Ok(self.workers.lock().await.get(id).cloned())
    }

    async fn insert_worker_unless(
        &self,
        worker: WorkerRecord,
        keep: WorkerPredicate<'_>,
    ) -> Result<Option<WorkerRecord>, StoreError> {
        let mut workers = self.workers.lock().await;
        if let Some(existing) = workers.get(&worker.id)
            && keep(existing)
        {
            return Ok(Some(existing.clone()));
        }
        workers.insert(worker.id.clone(), worker);
        Ok(None)
    }

    async fn update_worker(
        &self,
        id: &WorkerId,
        mutation: WorkerMutation<'_>,
    ) -> Result<WorkerRecord, StoreError> {
        let mut workers = self.workers.lock().await;
        let worker = workers.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "worker",
            id: id.to_string(),
        })?;
        mutation(worker);
        Ok(worker.clone())
    }

    async fn remove_worker(&self, id: &WorkerId) -> Result<Option<WorkerRecord>, StoreError> {
        Ok(self.workers.lock().await.remove(id))
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let mut workers: Vec<_> = self.workers.lock().await.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }
}
