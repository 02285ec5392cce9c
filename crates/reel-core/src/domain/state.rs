//! Status enums and their transition tables.
//!
//! Task:
//! - Pending -> Assigned -> Processing -> Completed
//! - Processing -> Failed -> Retrying -> Pending (or Assigned)
//! - Assigned | Processing -> Pending (reclaimed by the reaper)
//! - Assigned | Processing -> Failed (reclaimed, retries exhausted)
//! - any non-final -> Cancelled
//!
//! Sub-task: Pending -> Processing -> Completed | Failed. Retries happen on
//! the parent, never on a single rendition.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for the assignment engine.
    Pending,

    /// Bound to a worker, not started yet.
    Assigned,

    /// The worker reported that transcoding started.
    Processing,

    Completed,

    /// Failed. Terminal only once retries are exhausted (see `TaskRecord::is_terminal`).
    Failed,

    /// Waiting out the backoff window before going back to `Pending`.
    Retrying,

    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Retrying,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that can never be left. `Failed` is excluded because it may
    /// still move to `Retrying`.
    pub fn is_final(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Statuses in which a worker holds the task.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Processing)
    }

    pub fn can_transition_to(self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        if target == Cancelled {
            return !self.is_final();
        }
        match self {
            Pending => target == Assigned,
            Assigned => matches!(target, Processing | Pending | Failed),
            Processing => matches!(target, Completed | Failed | Pending),
            Failed => target == Retrying,
            Retrying => matches!(target, Pending | Assigned),
            Completed | Cancelled => false,
        }
    }

    /// Like `can_transition_to`, but as a `Result` for `?` chains.
    pub fn check_transition(self, target: TaskStatus) -> Result<(), SchedulerError> {
        if self.can_transition_to(target) {
            Ok(())
        } else {
            Err(SchedulerError::InvalidTransition {
                from: self.as_str(),
                to: target.as_str(),
            })
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| SchedulerError::Validation(format!("invalid task status: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SubTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubTaskStatus::Pending => "pending",
            SubTaskStatus::Processing => "processing",
            SubTaskStatus::Completed => "completed",
            SubTaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SubTaskStatus::Completed | SubTaskStatus::Failed)
    }

    pub fn can_transition_to(self, target: SubTaskStatus) -> bool {
        use SubTaskStatus::*;
        matches!(
            (self, target),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed)
        )
    }

    pub fn check_transition(self, target: SubTaskStatus) -> Result<(), SchedulerError> {
        if self.can_transition_to(target) {
            Ok(())
        } else {
            Err(SchedulerError::InvalidTransition {
                from: self.as_str(),
                to: target.as_str(),
            })
        }
    }
}

impl fmt::Display for SubTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Offline,
    /// At capacity (derived from the last load snapshot).
    Busy,
    /// Below capacity (derived from the last load snapshot).
    Idle,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Online => "online",
            WorkerStatus::Offline => "offline",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Idle => "idle",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
