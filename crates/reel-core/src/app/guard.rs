//! Time limits on collaborator calls.
//!
//! Store calls and worker notifications never block a loop indefinitely: each
//! one is wrapped in `tokio::time::timeout`, and running out of time becomes
//! `SchedulerError::TransientStore` so the caller skips the item for this tick.

use std::future::Future;
use std::time::Duration;

use crate::domain::SchedulerError;
use crate::ports::NotifyError;

/// Runs a store call with a deadline.
pub async fn store_call<T, E, F>(
    limit: Duration,
    op: &'static str,
    call: F,
) -> Result<T, SchedulerError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<SchedulerError>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(SchedulerError::TransientStore(format!(
            "{op} timed out after {limit:?}"
        ))),
    }
}

/// Runs a notification with a deadline. Errors come back as text; the
/// caller only logs them.
pub async fn notify_call<F>(limit: Duration, call: F) -> Result<(), String>
where
    F: Future<Output = Result<(), NotifyError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err(format!("notification timed out after {limit:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::StoreError;

    #[tokio::test(start_paused = true)]
    async fn slow_store_call_becomes_transient() {
        let result: Result<(), SchedulerError> =
            store_call(Duration::from_secs(5), "get_task", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), StoreError>(())
            })
            .await;

        assert!(matches!(result, Err(SchedulerError::TransientStore(msg)) if msg.contains("get_task")));
    }

    #[tokio::test]
    async fn store_errors_are_converted() {
        let result: Result<(), SchedulerError> =
            store_call(Duration::from_secs(5), "get_task", async {
                Err(StoreError::VersionConflict {
                    id: "task-1".into(),
                    expected: 1,
                    actual: 2,
                })
            })
            .await;

        assert_eq!(
            result,
            Err(SchedulerError::Conflict {
                id: "task-1".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_notification_times_out() {
        let result = notify_call(Duration::from_secs(2), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(result.is_err());
    }
}
