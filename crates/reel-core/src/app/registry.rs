//! WorkerRegistry - ワーカーの登録・生存監視・負荷管理
//!
//! # 設計原則
//! - 生存判定（liveness window）はここだけが行う
//! - heartbeat が途絶えたワーカーは registry 自身が offline にする
//!   （`sweep`、`list_available` の冒頭で毎回実行）
//! - 負荷カウントは割り当て時に +1、終了報告で -1、heartbeat で実測値に上書き

use std::sync::Arc;
use std::time::Duration;

use crate::app::guard::store_call;
use crate::domain::{LoadSnapshot, SchedulerError, WorkerId, WorkerRecord, WorkerStatus};
use crate::ports::{Clock, WorkerRepository};

pub struct WorkerRegistry {
    repo: Arc<dyn WorkerRepository>,
    clock: Arc<dyn Clock>,
    liveness_window: Duration,
    store_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(
        repo: Arc<dyn WorkerRepository>,
        clock: Arc<dyn Clock>,
        liveness_window: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            clock,
            liveness_window,
            store_timeout,
        }
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    /// Registers a worker, or replaces a stale registration under the same id.
    ///
    /// Fails with `DuplicateWorker` while the existing registration is live.
    pub async fn register(
        &self,
        id: WorkerId,
        name: impl Into<String>,
        max_tasks: u32,
    ) -> Result<WorkerRecord, SchedulerError> {
        if id.as_str().trim().is_empty() {
            return Err(SchedulerError::Validation("worker id must not be empty".into()));
        }
        if max_tasks == 0 {
            return Err(SchedulerError::Validation(format!(
                "worker {id} must accept at least one task"
            )));
        }

        let now = self.clock.now();
        let window = self.liveness_window;
        let worker = WorkerRecord::new(id, name, max_tasks, now);
        // liveness is judged inside the store so two registrations cannot both win
        let keep_live = move |w: &WorkerRecord| w.is_live(now, window);
        let kept = store_call(
            self.store_timeout,
            "insert_worker_unless",
            self.repo.insert_worker_unless(worker.clone(), &keep_live),
        )
        .await?;
        if kept.is_some() {
            return Err(SchedulerError::DuplicateWorker(worker.id));
        }
        tracing::info!(worker_id = %worker.id, max_tasks, "worker registered");
        Ok(worker)
    }

    pub async fn heartbeat(
        &self,
        id: &WorkerId,
        load: LoadSnapshot,
    ) -> Result<WorkerRecord, SchedulerError> {
        let now = self.clock.now();
        let mutation = move |w: &mut WorkerRecord| w.apply_heartbeat(load, now);
        let updated = store_call(
            self.store_timeout,
            "update_worker",
            self.repo.update_worker(id, &mutation),
        )
        .await
        .map_err(|e| unknown_worker(e, id))?;
        tracing::trace!(worker_id = %id, current_tasks = updated.current_tasks, "heartbeat");
        Ok(updated)
    }

    /// Takes the worker out of assignment until its next heartbeat.
    pub async fn set_offline(&self, id: &WorkerId) -> Result<WorkerRecord, SchedulerError> {
        let mutation = |w: &mut WorkerRecord| w.mark_offline();
        let updated = store_call(
            self.store_timeout,
            "update_worker",
            self.repo.update_worker(id, &mutation),
        )
        .await
        .map_err(|e| unknown_worker(e, id))?;
        tracing::info!(worker_id = %id, "worker set offline by operator");
        Ok(updated)
    }

    pub async fn set_online(&self, id: &WorkerId) -> Result<WorkerRecord, SchedulerError> {
        let now = self.clock.now();
        let mutation = move |w: &mut WorkerRecord| w.mark_online(now);
        let updated = store_call(
            self.store_timeout,
            "update_worker",
            self.repo.update_worker(id, &mutation),
        )
        .await
        .map_err(|e| unknown_worker(e, id))?;
        tracing::info!(worker_id = %id, status = %updated.status, "worker set online by operator");
        Ok(updated)
    }

    pub async fn deregister(&self, id: &WorkerId) -> Result<WorkerRecord, SchedulerError> {
        let removed = store_call(self.store_timeout, "remove_worker", self.repo.remove_worker(id))
            .await?
            .ok_or_else(|| SchedulerError::UnknownWorker(id.clone()))?;
        tracing::info!(worker_id = %id, "worker deregistered");
        Ok(removed)
    }

    pub async fn get(&self, id: &WorkerId) -> Result<WorkerRecord, SchedulerError> {
        store_call(self.store_timeout, "get_worker", self.repo.get_worker(id))
            .await?
            .ok_or_else(|| SchedulerError::UnknownWorker(id.clone()))
    }

    pub async fn list(&self) -> Result<Vec<WorkerRecord>, SchedulerError> {
        store_call(self.store_timeout, "list_workers", self.repo.list_workers()).await
    }

    /// Marks workers that missed the liveness window as offline. Returns their ids.
    pub async fn sweep(&self) -> Result<Vec<WorkerId>, SchedulerError> {
        let now = self.clock.now();
        let window = self.liveness_window;
        let mut marked = Vec::new();

        for worker in self.list().await? {
            if worker.status == WorkerStatus::Offline || worker.is_live(now, window) {
                continue;
            }
            // re-checked under the store's lock so a racing heartbeat wins
            let mutation = move |w: &mut WorkerRecord| {
                if !w.is_live(now, window) {
                    w.mark_offline();
                }
            };
            match store_call(
                self.store_timeout,
                "update_worker",
                self.repo.update_worker(&worker.id, &mutation),
            )
            .await
            {
                Ok(updated) if updated.status == WorkerStatus::Offline => {
                    tracing::info!(
                        worker_id = %worker.id,
                        last_heartbeat = %worker.last_heartbeat,
                        "worker missed its heartbeats, marked offline"
                    );
                    marked.push(worker.id);
                }
                Ok(_) => {}
                // deregistered in the meantime
                Err(SchedulerError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(marked)
    }

    /// Workers that can take a task now: not offline, inside the liveness
    /// window, below capacity.
    pub async fn list_available(&self) -> Result<Vec<WorkerRecord>, SchedulerError> {
        self.sweep().await?;
        let now = self.clock.now();
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|w| w.is_live(now, self.liveness_window) && w.has_capacity())
            .collect())
    }

    /// Unknown workers count as not live.
    pub async fn is_live(&self, id: &WorkerId) -> Result<bool, SchedulerError> {
        let now = self.clock.now();
        let worker = store_call(self.store_timeout, "get_worker", self.repo.get_worker(id)).await?;
        Ok(worker.is_some_and(|w| w.is_live(now, self.liveness_window)))
    }

    pub async fn record_assignment(&self, id: &WorkerId) -> Result<(), SchedulerError> {
        let mutation = |w: &mut WorkerRecord| w.add_load();
        store_call(
            self.store_timeout,
            "update_worker",
            self.repo.update_worker(id, &mutation),
        )
        .await
        .map_err(|e| unknown_worker(e, id))?;
        Ok(())
    }

    /// Gives back one unit of load. A worker that has gone away is ignored.
    pub async fn release(&self, id: &WorkerId) -> Result<(), SchedulerError> {
        let mutation = |w: &mut WorkerRecord| w.release_load();
        match store_call(
            self.store_timeout,
            "update_worker",
            self.repo.update_worker(id, &mutation),
        )
        .await
        {
            Ok(_) | Err(SchedulerError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn unknown_worker(err: SchedulerError, id: &WorkerId) -> SchedulerError {
    match err {
        SchedulerError::NotFound { .. } => SchedulerError::UnknownWorker(id.clone()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryWorkerStore;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    fn registry() -> (WorkerRegistry, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let registry = WorkerRegistry::new(
            Arc::new(InMemoryWorkerStore::new()),
            clock.clone(),
            Duration::from_secs(90),
            Duration::from_secs(5),
        );
        (registry, clock)
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected_while_online() {
        let (registry, clock) = registry();
        registry.register("enc-1".into(), "encoder", 2).await.unwrap();

        let err = registry.register("enc-1".into(), "encoder", 2).await.unwrap_err();
        assert_eq!(err, SchedulerError::DuplicateWorker("enc-1".into()));

        // once the old registration went stale, the id can be reused
        clock.advance(Duration::from_secs(91));
        registry.register("enc-1".into(), "encoder v2", 4).await.unwrap();
        assert_eq!(registry.get(&"enc-1".into()).await.unwrap().max_tasks, 4);
    }

    #[tokio::test]
    async fn racing_registrations_admit_one() {
        let (registry, _) = registry();
        let (a, b) = tokio::join!(
            registry.register("enc-1".into(), "first", 1),
            registry.register("enc-1".into(), "second", 1),
        );
        let admitted = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 1);
        assert!(
            [a, b]
                .into_iter()
                .any(|r| r == Err(SchedulerError::DuplicateWorker("enc-1".into())))
        );
    }

    #[tokio::test]
    async fn operator_toggle_overrides_liveness() {
        let (registry, clock) = registry();
        registry.register("enc-1".into(), "encoder", 2).await.unwrap();
        registry.record_assignment(&"enc-1".into()).await.unwrap();

        let offline = registry.set_offline(&"enc-1".into()).await.unwrap();
        assert_eq!(offline.status, WorkerStatus::Offline);
        assert!(!registry.is_live(&"enc-1".into()).await.unwrap());
        assert!(registry.list_available().await.unwrap().is_empty());

        clock.advance(Duration::from_secs(300));
        let online = registry.set_online(&"enc-1".into()).await.unwrap();
        assert_eq!(online.status, WorkerStatus::Idle);
        assert_eq!(online.current_tasks, 1);
        assert!(registry.is_live(&"enc-1".into()).await.unwrap());

        assert_eq!(
            registry.set_offline(&"ghost".into()).await.unwrap_err(),
            SchedulerError::UnknownWorker("ghost".into())
        );
    }

    #[tokio::test]
    async fn registration_validates_input() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.register("enc-1".into(), "encoder", 0).await,
            Err(SchedulerError::Validation(_))
        ));
        assert!(matches!(
            registry.register("".into(), "encoder", 1).await,
            Err(SchedulerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_worker_fails() {
        let (registry, _) = registry();
        let err = registry
            .heartbeat(&"ghost".into(), LoadSnapshot { current_tasks: 0 })
            .await
            .unwrap_err();
        assert_eq!(err, SchedulerError::UnknownWorker("ghost".into()));
    }

    #[tokio::test]
    async fn available_excludes_full_and_silent_workers() {
        let (registry, clock) = registry();
        registry.register("full".into(), "full", 1).await.unwrap();
        registry.register("free".into(), "free", 2).await.unwrap();
        registry.register("silent".into(), "silent", 2).await.unwrap();

        registry
            .heartbeat(&"full".into(), LoadSnapshot { current_tasks: 1 })
            .await
            .unwrap();

        clock.advance(Duration::from_secs(60));
        registry
            .heartbeat(&"free".into(), LoadSnapshot { current_tasks: 0 })
            .await
            .unwrap();
        registry
            .heartbeat(&"full".into(), LoadSnapshot { current_tasks: 1 })
            .await
            .unwrap();
        clock.advance(Duration::from_secs(40));

        let available: Vec<_> = registry
            .list_available()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(available, vec![WorkerId::new("free")]);

        let silent = registry.get(&"silent".into()).await.unwrap();
        assert_eq!(silent.status, WorkerStatus::Offline);
    }

    #[tokio::test]
    async fn sweep_marks_each_stale_worker_once() {
        let (registry, clock) = registry();
        registry.register("enc-1".into(), "encoder", 2).await.unwrap();

        clock.advance(Duration::from_secs(120));
        assert_eq!(registry.sweep().await.unwrap(), vec![WorkerId::new("enc-1")]);
        assert!(registry.sweep().await.unwrap().is_empty());
        assert!(!registry.is_live(&"enc-1".into()).await.unwrap());

        registry
            .heartbeat(&"enc-1".into(), LoadSnapshot { current_tasks: 0 })
            .await
            .unwrap();
        assert!(registry.is_live(&"enc-1".into()).await.unwrap());
    }

    #[tokio::test]
    async fn load_accounting_round_trips() {
        let (registry, _) = registry();
        registry.register("enc-1".into(), "encoder", 1).await.unwrap();

        registry.record_assignment(&"enc-1".into()).await.unwrap();
        let worker = registry.get(&"enc-1".into()).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Busy);
        assert!(registry.list_available().await.unwrap().is_empty());

        registry.release(&"enc-1".into()).await.unwrap();
        registry.release(&"gone".into()).await.unwrap();
        assert_eq!(registry.list_available().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deregister_removes_worker() {
        let (registry, _) = registry();
        registry.register("enc-1".into(), "encoder", 1).await.unwrap();
        registry.deregister(&"enc-1".into()).await.unwrap();

        assert!(matches!(
            registry.deregister(&"enc-1".into()).await,
            Err(SchedulerError::UnknownWorker(_))
        ));
        assert!(!registry.is_live(&"enc-1".into()).await.unwrap());
    }
}
