//! reel-core
//!
//! Scheduling core for a distributed video-transcoding fleet: assigns transcode
//! tasks to workers, tracks task and worker lifecycle, retries failed work and
//! splits HLS tasks into per-resolution sub-tasks that converge into a master
//! playlist.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, task, hls, worker, decision, errors）
//! - **ports**: 抽象化レイヤー（TaskRepository, WorkerRepository, WorkerNotifier, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryTaskStore など開発・テスト用）
//! - **app**: アプリケーションロジック（builder, scheduler, registry, assign / expiry / retry loops, hls）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{App, Scheduler, SchedulerBuilder, SchedulerConfig, SchedulerHandle};
pub use domain::{ErrorKind, SchedulerError};
