//! Transcode task record and its creation input.
//!
//! Every status change goes through a method on `TaskRecord`, which checks the
//! transition table first and keeps the derived fields (worker binding,
//! timestamps) consistent with the new status:
//! - `assigned_worker` is set iff the status is `assigned` or `processing`
//! - `completed_at` is set iff the task is terminal
//! - `retry_count <= max_retries`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::errors::SchedulerError;
use super::hls::{HlsConfig, Rendition};
use super::ids::{TaskId, WorkerId};
use super::state::TaskStatus;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

/// Encoder settings handed to the worker untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeConfig {
    pub resolution: String,
    pub bitrate: String,
    pub codec: String,
    #[serde(default)]
    pub preset: Option<String>,
    pub container: String,
}

impl EncodeConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let required = [
            ("resolution", &self.resolution),
            ("bitrate", &self.bitrate),
            ("codec", &self.codec),
            ("container", &self.container),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(SchedulerError::Validation(format!(
                    "encode.{field} must not be empty"
                )));
            }
        }
        Ok(())
    }
}

/// Client input for creating a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub user_id: String,
    pub source: String,
    pub output: String,
    pub encode: EncodeConfig,

    /// 1..=10, higher runs first. 0 means "use the configured default".
    #[serde(default)]
    pub priority: u8,

    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub max_retries: Option<u32>,

    #[serde(default)]
    pub hls: Option<HlsConfig>,

    /// Expected run time; stretches the assignment timeout for long jobs.
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
}

impl NewTask {
    /// Validates the input. Returns the resolved renditions for HLS tasks.
    pub fn validate(&self) -> Result<Option<Vec<Rendition>>, SchedulerError> {
        if self.user_id.trim().is_empty() {
            return Err(SchedulerError::Validation("user_id must not be empty".into()));
        }
        if self.source.trim().is_empty() {
            return Err(SchedulerError::Validation("source must not be empty".into()));
        }
        if self.output.trim().is_empty() {
            return Err(SchedulerError::Validation("output must not be empty".into()));
        }
        self.encode.validate()?;

        if self.priority != 0 && !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(SchedulerError::Validation(format!(
                "priority must be within {MIN_PRIORITY}..={MAX_PRIORITY}, got {}",
                self.priority
            )));
        }

        self.hls.as_ref().map(HlsConfig::resolve).transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub user_id: String,
    pub source: String,
    pub output: String,
    pub encode: EncodeConfig,
    pub priority: u8,
    pub status: TaskStatus,
    pub assigned_worker: Option<WorkerId>,

    pub retry_count: u32,
    pub max_retries: u32,

    /// Earliest time the retry loop may requeue a `retrying` task.
    pub retry_after: Option<DateTime<Utc>>,

    pub error: Option<String>,

    /// 0..=100. For HLS tasks this is recomputed from sub-tasks at read time.
    pub progress: u8,

    pub hls: Option<HlsConfig>,
    pub estimated_duration_secs: Option<u64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Row version for conditional writes. Owned by the store.
    pub version: u64,
}

impl TaskRecord {
    /// Builds a pending record from validated input.
    pub fn new(
        id: TaskId,
        input: NewTask,
        default_priority: u8,
        default_max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let priority = match input.priority {
            0 => default_priority,
            p => p,
        };
        Self {
            id,
            user_id: input.user_id,
            source: input.source,
            output: input.output,
            encode: input.encode,
            priority,
            status: TaskStatus::Pending,
            assigned_worker: None,
            retry_count: 0,
            max_retries: input.max_retries.unwrap_or(default_max_retries),
            retry_after: None,
            error: None,
            progress: 0,
            hls: input.hls,
            estimated_duration_secs: input.estimated_duration_secs,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
        }
    }

    pub fn is_hls(&self) -> bool {
        self.hls.is_some()
    }

    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Terminal: completed, cancelled, or failed with no retries left.
    pub fn is_terminal(&self) -> bool {
        self.status.is_final() || (self.status == TaskStatus::Failed && !self.has_retries_left())
    }

    pub fn estimated_duration(&self) -> Option<Duration> {
        self.estimated_duration_secs.map(Duration::from_secs)
    }

    /// Binds the task to a worker (pending/retrying -> assigned).
    pub fn assign(&mut self, worker: WorkerId, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.status.check_transition(TaskStatus::Assigned)?;
        self.status = TaskStatus::Assigned;
        self.assigned_worker = Some(worker);
        self.retry_after = None;
        self.updated_at = now;
        Ok(())
    }

    /// The bound worker started transcoding (assigned -> processing).
    pub fn start(&mut self, worker: &WorkerId, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.ensure_owned_by(worker)?;
        self.status.check_transition(TaskStatus::Processing)?;
        self.status = TaskStatus::Processing;
        self.progress = 0;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn set_progress(
        &mut self,
        worker: &WorkerId,
        progress: u8,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.ensure_owned_by(worker)?;
        if self.status != TaskStatus::Processing {
            return Err(SchedulerError::InvalidTransition {
                from: self.status.as_str(),
                to: TaskStatus::Processing.as_str(),
            });
        }
        self.progress = progress.min(100);
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.status.check_transition(TaskStatus::Completed)?;
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.assigned_worker = None;
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Records a failure. Terminal at once when no retries are left.
    pub fn fail(&mut self, error: String, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.status.check_transition(TaskStatus::Failed)?;
        self.status = TaskStatus::Failed;
        self.assigned_worker = None;
        self.error = Some(error);
        if !self.has_retries_left() {
            self.completed_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// failed -> retrying. Consumes one retry.
    pub fn schedule_retry(
        &mut self,
        retry_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.status.check_transition(TaskStatus::Retrying)?;
        if !self.has_retries_left() {
            return Err(SchedulerError::Validation(format!(
                "{} has no retries left ({}/{})",
                self.id, self.retry_count, self.max_retries
            )));
        }
        self.status = TaskStatus::Retrying;
        self.retry_count += 1;
        self.retry_after = Some(retry_after);
        self.progress = 0;
        self.started_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// retrying -> pending once the backoff window has passed.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.status.check_transition(TaskStatus::Pending)?;
        if self.status != TaskStatus::Retrying {
            return Err(SchedulerError::InvalidTransition {
                from: self.status.as_str(),
                to: TaskStatus::Pending.as_str(),
            });
        }
        self.status = TaskStatus::Pending;
        self.retry_after = None;
        self.updated_at = now;
        Ok(())
    }

    /// assigned|processing -> pending after the worker went silent. Consumes one retry.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if !self.status.is_in_flight() {
            return Err(SchedulerError::InvalidTransition {
                from: self.status.as_str(),
                to: TaskStatus::Pending.as_str(),
            });
        }
        if !self.has_retries_left() {
            return Err(SchedulerError::Validation(format!(
                "{} has no retries left ({}/{})",
                self.id, self.retry_count, self.max_retries
            )));
        }
        self.status = TaskStatus::Pending;
        self.retry_count += 1;
        self.assigned_worker = None;
        self.progress = 0;
        self.started_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.status.check_transition(TaskStatus::Cancelled)?;
        if self.is_terminal() {
            return Err(SchedulerError::InvalidTransition {
                from: self.status.as_str(),
                to: TaskStatus::Cancelled.as_str(),
            });
        }
        self.status = TaskStatus::Cancelled;
        self.assigned_worker = None;
        self.retry_after = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Mirrors the aggregated sub-task progress onto a processing HLS parent.
    pub fn sync_progress(&mut self, progress: u8, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if self.status != TaskStatus::Processing {
            return Err(SchedulerError::InvalidTransition {
                from: self.status.as_str(),
                to: TaskStatus::Processing.as_str(),
            });
        }
        self.progress = progress.min(100);
        self.updated_at = now;
        Ok(())
    }

    /// Reports from anyone but the bound worker are stale.
    pub fn ensure_owned_by(&self, worker: &WorkerId) -> Result<(), SchedulerError> {
        match &self.assigned_worker {
            Some(bound) if bound == worker => Ok(()),
            _ => Err(SchedulerError::Conflict {
                id: self.id.to_string(),
            }),
        }
    }
}
