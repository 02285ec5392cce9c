//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（永続ストア、ワーカーへの通知経路、時計）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - ストアが source of truth（正本）
//! - スケジューラは trait 越しにのみ依存し、実装は起動時に注入する

pub mod clock;
pub mod id_generator;
pub mod notifier;
pub mod task_store;
pub mod worker_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::notifier::{Assignment, NotifyError, WorkerNotifier};
pub use self::task_store::{StoreError, TaskOrder, TaskQuery, TaskRepository};
pub use self::worker_store::{WorkerMutation, WorkerPredicate, WorkerRepository};
