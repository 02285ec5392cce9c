//! Status - 統計とクエリ結果の view
//!
//! 管理 API（外部の HTTP 層）がそのまま serialize できる形にする。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::{
    HlsPlaylist, SchedulerError, SubTaskRecord, TaskId, TaskRecord, TaskStatus, WorkerRecord,
    WorkerStatus,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total: u64,
    pub pending: u64,
    pub assigned: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub retrying: u64,
    pub cancelled: u64,
}

impl TaskStatistics {
    pub fn from_counts(counts: &HashMap<TaskStatus, u64>) -> Self {
        let get = |s: TaskStatus| counts.get(&s).copied().unwrap_or(0);
        Self {
            total: counts.values().sum(),
            pending: get(TaskStatus::Pending),
            assigned: get(TaskStatus::Assigned),
            processing: get(TaskStatus::Processing),
            completed: get(TaskStatus::Completed),
            failed: get(TaskStatus::Failed),
            retrying: get(TaskStatus::Retrying),
            cancelled: get(TaskStatus::Cancelled),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatistics {
    pub total: u64,
    pub online: u64,
    pub offline: u64,
    pub busy: u64,
    pub idle: u64,
    /// Sum of `max_tasks` over workers that are not offline.
    pub total_capacity: u64,
    pub total_load: u64,
    /// `total_load / total_capacity`, 0.0 with no capacity.
    pub average_load: f64,
}

impl WorkerStatistics {
    pub fn from_workers(workers: &[WorkerRecord]) -> Self {
        let mut stats = Self::default();
        for worker in workers {
            stats.total += 1;
            match worker.status {
                WorkerStatus::Online => stats.online += 1,
                WorkerStatus::Offline => stats.offline += 1,
                WorkerStatus::Busy => stats.busy += 1,
                WorkerStatus::Idle => stats.idle += 1,
            }
            if worker.status != WorkerStatus::Offline {
                stats.total_capacity += u64::from(worker.max_tasks);
                stats.total_load += u64::from(worker.current_tasks);
            }
        }
        if stats.total_capacity > 0 {
            stats.average_load = stats.total_load as f64 / stats.total_capacity as f64;
        }
        stats
    }
}

/// A task as the management surface shows it. For HLS tasks `progress`
/// is the average over the current sub-tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: TaskRecord,
    pub sub_tasks: Vec<SubTaskRecord>,
    pub master_playlist: Option<HlsPlaylist>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOp {
    Cancel,
    Retry,
}

/// Operator override of a worker's availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerOp {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure<I = TaskId> {
    pub id: I,
    pub error: String,
}

/// Per-id outcome of a batch over tasks (default) or workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult<I = TaskId> {
    pub requested: usize,
    pub succeeded: usize,
    pub failures: Vec<BatchFailure<I>>,
}

impl<I> Default for BatchResult<I> {
    fn default() -> Self {
        Self {
            requested: 0,
            succeeded: 0,
            failures: Vec::new(),
        }
    }
}

impl<I> BatchResult<I> {
    pub fn record(&mut self, id: I, result: Result<(), SchedulerError>) {
        self.requested += 1;
        match result {
            Ok(()) => self.succeeded += 1,
            Err(e) => self.failures.push(BatchFailure {
                id,
                error: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LoadSnapshot, WorkerId};
    use chrono::Utc;
    use ulid::Ulid;

    #[test]
    fn task_statistics_fill_missing_statuses_with_zero() {
        let counts = HashMap::from([(TaskStatus::Pending, 3), (TaskStatus::Completed, 2)]);
        let stats = TaskStatistics::from_counts(&counts);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn worker_statistics_skip_offline_capacity() {
        let now = Utc::now();
        let mut busy = WorkerRecord::new(WorkerId::new("a"), "a", 2, now);
        busy.apply_heartbeat(LoadSnapshot { current_tasks: 2 }, now);
        let mut idle = WorkerRecord::new(WorkerId::new("b"), "b", 2, now);
        idle.apply_heartbeat(LoadSnapshot { current_tasks: 0 }, now);
        let mut gone = WorkerRecord::new(WorkerId::new("c"), "c", 4, now);
        gone.mark_offline();

        let stats = WorkerStatistics::from_workers(&[busy, idle, gone]);
        assert_eq!(stats.total, 3);
        assert_eq!((stats.busy, stats.idle, stats.offline), (1, 1, 1));
        assert_eq!(stats.total_capacity, 4);
        assert_eq!(stats.total_load, 2);
        assert!((stats.average_load - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn batch_result_collects_failures() {
        let ok = TaskId::from_ulid(Ulid::new());
        let bad = TaskId::from_ulid(Ulid::new());
        let mut result: BatchResult = BatchResult::default();
        result.record(ok, Ok(()));
        result.record(
            bad,
            Err(SchedulerError::InvalidTransition {
                from: "completed",
                to: "cancelled",
            }),
        );
        assert_eq!(result.requested, 2);
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failures[0].id, bad);
    }
}
