//! Worker record and load snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ids::WorkerId;
use super::state::WorkerStatus;

/// Load reported by a worker on each heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub current_tasks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub name: String,
    pub status: WorkerStatus,
    pub max_tasks: u32,
    pub current_tasks: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(
        id: WorkerId,
        name: impl Into<String>,
        max_tasks: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            status: WorkerStatus::Online,
            max_tasks,
            current_tasks: 0,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    /// `current / max`; a worker without capacity counts as full.
    pub fn load_factor(&self) -> f64 {
        if self.max_tasks == 0 {
            return 1.0;
        }
        f64::from(self.current_tasks) / f64::from(self.max_tasks)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_tasks < self.max_tasks
    }

    /// Heartbeat seen within the liveness window.
    pub fn is_live(&self, now: DateTime<Utc>, window: Duration) -> bool {
        if self.status == WorkerStatus::Offline {
            return false;
        }
        match (now - self.last_heartbeat).to_std() {
            Ok(elapsed) => elapsed <= window,
            // heartbeat in the future (clock skew): treat as fresh
            Err(_) => true,
        }
    }

    /// Applies a heartbeat: load is clamped to capacity and busy/idle is
    /// re-derived. A heartbeat brings an offline worker back.
    pub fn apply_heartbeat(&mut self, load: LoadSnapshot, now: DateTime<Utc>) {
        self.current_tasks = load.current_tasks.min(self.max_tasks);
        self.last_heartbeat = now;
        self.status = WorkerStatus::Online;
        self.refresh_status();
    }

    pub fn add_load(&mut self) {
        self.current_tasks = (self.current_tasks + 1).min(self.max_tasks);
        self.refresh_status();
    }

    pub fn release_load(&mut self) {
        self.current_tasks = self.current_tasks.saturating_sub(1);
        self.refresh_status();
    }

    pub fn mark_offline(&mut self) {
        self.status = WorkerStatus::Offline;
    }

    /// Operator override; counts as a heartbeat that keeps the current load.
    pub fn mark_online(&mut self, now: DateTime<Utc>) {
        self.apply_heartbeat(
            LoadSnapshot {
                current_tasks: self.current_tasks,
            },
            now,
        );
    }

    fn refresh_status(&mut self) {
        if self.status == WorkerStatus::Offline {
            return;
        }
        self.status = if self.has_capacity() {
            WorkerStatus::Idle
        } else {
            WorkerStatus::Busy
        };
    }
}
