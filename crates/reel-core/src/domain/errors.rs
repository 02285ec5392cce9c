//! Errors - エラー型と分類
//!
//! `SchedulerError` は core 全体で共有するエラー型。
//! バックグラウンドループは `kind()` を見て「黙って次の tick へ」「warn して継続」
//! 「呼び出し元へ返す」を決める。

use super::ids::WorkerId;

/// ErrorKind は運用上の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 入力不正。スケジューラには入らない。
    Validation,
    /// 参照先が存在しない。リトライしない。
    NotFound,
    /// 楽観ロックで競合に負けた。次の tick で再評価する。
    Conflict,
    /// ストア不達・タイムアウト。今回の tick ではスキップする。
    Transient,
    /// それ以外（状態遷移違反、設定不正など）
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("conflicting update on {id}")]
    Conflict { id: String },

    #[error("store unavailable: {0}")]
    TransientStore(String),

    #[error("worker {0} is unresponsive")]
    WorkerUnresponsive(WorkerId),

    #[error("worker {0} is already registered and online")]
    DuplicateWorker(WorkerId),

    #[error("worker {0} is not registered")]
    UnknownWorker(WorkerId),

    #[error("illegal transition {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Validation(_) => ErrorKind::Validation,
            SchedulerError::NotFound { .. } | SchedulerError::UnknownWorker(_) => {
                ErrorKind::NotFound
            }
            SchedulerError::Conflict { .. } => ErrorKind::Conflict,
            SchedulerError::TransientStore(_) => ErrorKind::Transient,
            SchedulerError::WorkerUnresponsive(_)
            | SchedulerError::DuplicateWorker(_)
            | SchedulerError::InvalidTransition { .. }
            | SchedulerError::Config(_) => ErrorKind::Permanent,
        }
    }

    /// Lost races and late reports: the caller should drop the item quietly.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            SchedulerError::Conflict { .. } | SchedulerError::InvalidTransition { .. }
        )
    }
}
