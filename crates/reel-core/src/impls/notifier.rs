//! WorkerNotifier implementations.
//!
//! - `NoopNotifier`: drops every notification (workers poll instead)
//! - `ChannelNotifier`: one mpsc channel per subscribed worker; used by the
//!   demo and the scenario tests to play the worker side

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

use crate::domain::WorkerId;
use crate::ports::{Assignment, NotifyError, WorkerNotifier};

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl WorkerNotifier for NoopNotifier {
    async fn notify_assigned(&self, _assignment: &Assignment) -> Result<(), NotifyError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ChannelNotifier {
    senders: Mutex<HashMap<WorkerId, mpsc::UnboundedSender<Assignment>>>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the receiving end for `worker`. Subscribing again replaces the
    /// previous channel.
    pub fn subscribe(&self, worker: WorkerId) -> mpsc::UnboundedReceiver<Assignment> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(worker, tx);
        rx
    }

    pub fn unsubscribe(&self, worker: &WorkerId) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(worker);
    }
}

#[async_trait]
impl WorkerNotifier for ChannelNotifier {
    async fn notify_assigned(&self, assignment: &Assignment) -> Result<(), NotifyError> {
        let sender = self
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&assignment.worker_id)
            .cloned()
            .ok_or_else(|| NotifyError::NoChannel(assignment.worker_id.clone()))?;

        sender
            .send(assignment.clone())
            .map_err(|_| NotifyError::Failed(format!("{} hung up", assignment.worker_id)))
    }
}
