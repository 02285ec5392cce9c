//! WorkerNotifier port - 割り当て通知
//!
//! fire-and-forget。通知に失敗しても割り当ては取り消さない
//! （ワーカーは heartbeat / ポーリングで追いつく前提）。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{EncodeConfig, HlsConfig, TaskId, TaskRecord, WorkerId};

/// What a worker receives when a task is bound to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub source: String,
    pub output: String,
    pub encode: EncodeConfig,
    pub hls: Option<HlsConfig>,
    pub retry_count: u32,
}

impl Assignment {
    pub fn for_task(task: &TaskRecord, worker_id: WorkerId) -> Self {
        Self {
            task_id: task.id,
            worker_id,
            source: task.source.clone(),
            output: task.output.clone(),
            encode: task.encode.clone(),
            hls: task.hls.clone(),
            retry_count: task.retry_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("no channel for worker {0}")]
    NoChannel(WorkerId),

    #[error("notification failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait WorkerNotifier: Send + Sync {
    async fn notify_assigned(&self, assignment: &Assignment) -> Result<(), NotifyError>;
}
