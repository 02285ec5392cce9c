//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: 行バージョン付きの正本
//! - **InMemoryWorkerStore**: ワーカー保存先
//! - **NoopNotifier / ChannelNotifier**: 割り当て通知
//!
//! 本番用のストア実装（RDB など）は別クレートに置く想定。

pub mod inmem_task_store;
pub mod inmem_worker_store;
pub mod notifier;

pub use self::inmem_task_store::InMemoryTaskStore;
pub use self::inmem_worker_store::InMemoryWorkerStore;
pub use self::notifier::{ChannelNotifier, NoopNotifier};
