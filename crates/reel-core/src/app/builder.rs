//! SchedulerBuilder - スケジューラの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - 必須の port（TaskRepository / WorkerRepository）が無ければ `build()` が失敗する
//! - 設定値は `build()` 時に検証する（0 秒の interval などは起動させない）
//! - 任意の port（notifier / clock / id generator）は既定の実装で埋める
//!
//! # 起動と停止
//! - `App::spawn()` で 3 つのループ（assign / expiry / retry）を別タスクとして起動
//! - 各ループは `MissedTickBehavior::Delay` の interval で回るので、
//!   tick が長引いても自分自身とは重ならない
//! - `SchedulerHandle::request_shutdown()` で watch channel を倒すと、
//!   各ループは実行中の tick を終えてから抜ける

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::app::assign_loop::AssignmentEngine;
use crate::app::config::{ConfigError, SchedulerConfig};
use crate::app::hls::HlsCoordinator;
use crate::app::reaper_loop::ReaperLoop;
use crate::app::registry::WorkerRegistry;
use crate::app::retry_loop::RetryLoop;
use crate::app::scheduler::Scheduler;
use crate::domain::{DefaultDecider, SchedulerError};
use crate::impls::NoopNotifier;
use crate::ports::{
    Clock, IdGenerator, SystemClock, TaskRepository, UlidGenerator, WorkerNotifier,
    WorkerRepository,
};

/// BuildError はスケジューラ構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing component: {0}. Provide it on the builder before build().")]
    MissingComponent(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl From<BuildError> for SchedulerError {
    fn from(err: BuildError) -> Self {
        SchedulerError::Config(err.to_string())
    }
}

/// # 使用例
/// ```ignore
/// let app = SchedulerBuilder::new()
///     .config(SchedulerConfig::load("reel.toml")?)
///     .task_store(Arc::new(InMemoryTaskStore::new()))
///     .worker_store(Arc::new(InMemoryWorkerStore::new()))
///     .build()?;
/// let handle = app.spawn();
/// ```
#[derive(Default)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    task_store: Option<Arc<dyn TaskRepository>>,
    worker_store: Option<Arc<dyn WorkerRepository>>,
    notifier: Option<Arc<dyn WorkerNotifier>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn task_store(mut self, store: Arc<dyn TaskRepository>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn worker_store(mut self, store: Arc<dyn WorkerRepository>) -> Self {
        self.worker_store = Some(store);
        self
    }

    /// Defaults to `NoopNotifier`; workers then learn about assignments by polling.
    pub fn notifier(mut self, notifier: Arc<dyn WorkerNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;
        let tasks = self
            .task_store
            .ok_or(BuildError::MissingComponent("task store"))?;
        let workers = self
            .worker_store
            .ok_or(BuildError::MissingComponent("worker store"))?;
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(NoopNotifier));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let config = Arc::new(self.config);

        let registry = Arc::new(WorkerRegistry::new(
            workers,
            clock.clone(),
            config.liveness_window(),
            config.store_timeout(),
        ));
        let decider = Arc::new(DefaultDecider::new(config.retry_policy()));
        let hls = Arc::new(HlsCoordinator::new(
            tasks.clone(),
            ids.clone(),
            clock.clone(),
            config.store_timeout(),
        ));

        let assigner = Arc::new(AssignmentEngine::new(
            tasks.clone(),
            registry.clone(),
            notifier,
            clock.clone(),
            config.loops.assign_batch_limit,
            config.store_timeout(),
            config.notify_timeout(),
        ));
        let reaper = Arc::new(ReaperLoop::new(
            tasks.clone(),
            registry.clone(),
            hls.clone(),
            decider.clone(),
            clock.clone(),
            config.clone(),
        ));
        let retrier = Arc::new(RetryLoop::new(
            tasks.clone(),
            decider,
            clock.clone(),
            config.store_timeout(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            tasks,
            registry,
            hls,
            ids,
            clock,
            config.clone(),
        ));

        tracing::debug!(?config, "scheduler built");
        Ok(App {
            scheduler,
            assigner,
            reaper,
            retrier,
            config,
        })
    }
}

/// Everything wired together. Ticks can be driven by hand (tests) or by
/// `spawn()`.
pub struct App {
    pub scheduler: Arc<Scheduler>,
    pub assigner: Arc<AssignmentEngine>,
    pub reaper: Arc<ReaperLoop>,
    pub retrier: Arc<RetryLoop>,
    pub config: Arc<SchedulerConfig>,
}

impl App {
    /// Starts the assign, expiry and retry loops.
    pub fn spawn(&self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loops: [(Arc<dyn Periodic>, Duration); 3] = [
            (self.assigner.clone(), self.config.assign_interval()),
            (self.reaper.clone(), self.config.expiry_interval()),
            (self.retrier.clone(), self.config.retry_interval()),
        ];

        let joins = loops
            .into_iter()
            .map(|(activity, period)| {
                let rx = shutdown_rx.clone();
                tokio::spawn(drive(activity, period, rx))
            })
            .collect();

        tracing::info!(
            assign_every = ?self.config.assign_interval(),
            expiry_every = ?self.config.expiry_interval(),
            retry_every = ?self.config.retry_interval(),
            "scheduler loops started"
        );
        SchedulerHandle { shutdown_tx, joins }
    }
}

/// Handle on the running loops.
/// - `request_shutdown()` で全ループに停止を伝える
/// - `shutdown_and_join()` で全ループの終了を待てる
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stops the loops after their current tick. In-flight store calls finish.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "scheduler loop panicked");
            }
        }
    }
}

/// One periodic activity.
#[async_trait]
trait Periodic: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_once(&self) -> Result<(), SchedulerError>;
}

#[async_trait]
impl Periodic for AssignmentEngine {
    fn name(&self) -> &'static str {
        "assign"
    }

    async fn run_once(&self) -> Result<(), SchedulerError> {
        self.tick().await.map(|_| ())
    }
}

#[async_trait]
impl Periodic for ReaperLoop {
    fn name(&self) -> &'static str {
        "expiry"
    }

    async fn run_once(&self) -> Result<(), SchedulerError> {
        self.tick().await.map(|_| ())
    }
}

#[async_trait]
impl Periodic for RetryLoop {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn run_once(&self) -> Result<(), SchedulerError> {
        self.tick().await.map(|_| ())
    }
}

async fn drive(
    activity: Arc<dyn Periodic>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        if let Err(e) = activity.run_once().await {
            tracing::warn!(
                loop_name = activity.name(),
                error = %e,
                "tick failed, retrying next interval"
            );
        }
    }
    tracing::info!(loop_name = activity.name(), "loop stopped");
}
