//! WorkerRepository port - ワーカー情報の保存先
//!
//! 生存判定や busy/idle の導出は WorkerRegistry が行う。ここは保存だけ。

use async_trait::async_trait;

use super::task_store::StoreError;
use crate::domain::{WorkerId, WorkerRecord};

/// Mutation applied atomically by `update_worker`.
pub type WorkerMutation<'a> = &'a (dyn Fn(&mut WorkerRecord) + Send + Sync);

/// Test on an existing record, evaluated under the store's serialization.
pub type WorkerPredicate<'a> = &'a (dyn Fn(&WorkerRecord) -> bool + Send + Sync);

#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn get_worker(&self, id: &WorkerId) -> Result<Option<WorkerRecord>, StoreError>;

    /// Inserts `worker` unless a record under the same id satisfies `keep`,
    /// as one atomic step. Returns the kept record when the insert was refused.
    async fn insert_worker_unless(
        &self,
        worker: WorkerRecord,
        keep: WorkerPredicate<'_>,
    ) -> Result<Option<WorkerRecord>, StoreError>;

    /// Applies `mutation` under the store's own serialization and returns the
    /// new record. `NotFound` if absent.
    async fn update_worker(
        &self,
        id: &WorkerId,
        mutation: WorkerMutation<'_>,
    ) -> Result<WorkerRecord, StoreError>;

    async fn remove_worker(&self, id: &WorkerId) -> Result<Option<WorkerRecord>, StoreError>;

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError>;
}
