//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてスケジューラのロジックを実装します。
//!
//! # 主要コンポーネント
//! - **SchedulerBuilder**: 構築とワイヤリング、ループの起動（`SchedulerHandle`）
//! - **Scheduler**: 管理 API とワーカーからの報告
//! - **WorkerRegistry**: ワーカーの登録・生存監視・負荷管理
//! - **AssignmentEngine**: pending タスクの割り当て
//! - **ReaperLoop**: 放置されたタスクの回収（expiry loop）
//! - **RetryLoop**: 失敗タスクの backoff 後の再投入
//! - **HlsCoordinator**: HLS タスクの分解と集約

pub mod assign_loop;
pub mod builder;
pub mod config;
pub mod guard;
pub mod hls;
pub mod reaper_loop;
pub mod registry;
pub mod retry_loop;
pub mod scheduler;
pub mod status;

// 主要な型を再エクスポート
pub use self::assign_loop::{AssignReport, AssignmentEngine};
pub use self::builder::{App, BuildError, SchedulerBuilder, SchedulerHandle};
pub use self::config::{ConfigError, SchedulerConfig};
pub use self::hls::{HlsCoordinator, SettleCause, Settlement};
pub use self::reaper_loop::{ReapReport, ReaperLoop};
pub use self::registry::WorkerRegistry;
pub use self::retry_loop::{RetryLoop, RetryReport};
pub use self::scheduler::Scheduler;
pub use self::status::{
    BatchFailure, BatchOp, BatchResult, TaskStatistics, TaskView, WorkerOp, WorkerStatistics,
};
