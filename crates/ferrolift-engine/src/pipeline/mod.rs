//! Parent and Child pipelines
//!
//! A pipeline runs one assigned task to a terminal status (or to a hand-off point, for a
//! Parent that has published its children). Every store write carries the worker's id, so a
//! pipeline whose task was reclaimed fails its next write with [`Error::NotOwner`] and stops.
//!
//! Task-level failures are written to the store and the pipeline returns `Ok`. An `Err`
//! means the pipeline could not record an outcome at all.

pub mod child;
pub mod parent;

use crate::executor::WorkerConfig;
use crate::monitor::StatisticsCollector;
use crate::queue::WorkQueues;
use ferrolift_io::StorageRegistry;
use ferrolift_store::TaskStore;
use ferrolift_types::{Error, ErrorKind, Result, TaskId, WorkerId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use child::run_child;
pub use parent::run_parent;

/// Error text recorded for tasks stopped by a cancel request
pub const CANCELLED_BY_REQUEST: &str = "cancelled by request";

/// Everything a pipeline needs from its worker
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Worker running the pipeline
    pub worker_id: WorkerId,
    /// Task store
    pub store: Arc<dyn TaskStore>,
    /// Storage adapters
    pub registry: StorageRegistry,
    /// Ready-work queues
    pub queues: WorkQueues,
    /// Engine counters
    pub statistics: StatisticsCollector,
    /// Worker settings
    pub config: WorkerConfig,
}

impl PipelineContext {
    /// Cancellation checkpoint: the in-process token or the persisted request flag
    pub async fn cancel_requested(
        &self,
        task_id: TaskId,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if cancel.is_cancelled() {
            return Ok(true);
        }
        self.store.is_cancel_requested(task_id).await
    }
}

/// Sleep for `delay`, returning [`Error::Cancelled`] if the token fires first
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Errors about the task record itself rather than the data being moved
pub(crate) fn is_bookkeeping_error(error: &Error) -> bool {
    matches!(error.kind(), ErrorKind::State | ErrorKind::Store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_or_cancel() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(1), &token).await.is_ok());

        token.cancel();
        let error = sleep_or_cancel(Duration::from_secs(60), &token)
            .await
            .unwrap_err();
        assert_eq!(error, Error::Cancelled);
    }

    #[test]
    fn test_bookkeeping_errors() {
        assert!(is_bookkeeping_error(&Error::NotOwner { task: TaskId::new() }));
        assert!(is_bookkeeping_error(&Error::store("down")));
        assert!(!is_bookkeeping_error(&Error::io("reset")));
        assert!(!is_bookkeeping_error(&Error::Cancelled));
    }
}
