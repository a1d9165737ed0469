//! Control channel
//!
//! Cancel actions are broadcast to every worker. A worker keeps a [`CancelRegistry`] of its
//! running pipelines; an action cancels every pipeline whose Top, Parent or own task id it
//! names, provided the tenant matches. Duplicate actions are harmless.

use ferrolift_types::{ControlAction, ControlKind, TaskId, TenantId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Broadcast fan-out of control actions
#[derive(Debug, Clone)]
pub struct ControlChannel {
    sender: broadcast::Sender<ControlAction>,
}

impl ControlChannel {
    /// Create a channel buffering up to `capacity` actions per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver an action to every subscriber, returning how many received it
    pub fn publish(&self, action: ControlAction) -> usize {
        let task_id = action.task_id;
        // Err only means nobody is subscribed
        let receivers = self.sender.send(action).unwrap_or(0);
        debug!("Control action for {} delivered to {} workers", task_id, receivers);
        receivers
    }

    /// New subscription
    pub fn subscribe(&self) -> broadcast::Receiver<ControlAction> {
        self.sender.subscribe()
    }
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Identity of a running pipeline, matched against control actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskScope {
    /// Task run by the pipeline
    pub task_id: TaskId,
    /// Owning parent, for child pipelines
    pub parent_id: Option<TaskId>,
    /// Owning Top task
    pub top_id: TaskId,
    /// Tenant of the task
    pub tenant: TenantId,
}

impl TaskScope {
    /// Whether the action targets this pipeline
    pub fn matches(&self, action: &ControlAction) -> bool {
        action.tenant == self.tenant
            && (action.task_id == self.task_id
                || action.task_id == self.top_id
                || Some(action.task_id) == self.parent_id)
    }
}

/// Cancellation tokens of the pipelines running on one worker
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    running: Arc<RwLock<HashMap<TaskId, (TaskScope, CancellationToken)>>>,
}

impl CancelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a pipeline and hand out its token
    pub async fn register(&self, scope: TaskScope) -> CancellationToken {
        let token = CancellationToken::new();
        self.running
            .write()
            .await
            .insert(scope.task_id, (scope, token.clone()));
        token
    }

    /// Stop tracking a finished pipeline
    pub async fn unregister(&self, task_id: TaskId) {
        self.running.write().await.remove(&task_id);
    }

    /// Whether a pipeline for `task_id` is running
    pub async fn is_running(&self, task_id: TaskId) -> bool {
        self.running.read().await.contains_key(&task_id)
    }

    /// Number of running pipelines
    pub async fn len(&self) -> usize {
        self.running.read().await.len()
    }

    /// Whether no pipeline is running
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Apply an action, returning how many pipelines it reached
    pub async fn apply(&self, action: &ControlAction) -> usize {
        match action.kind {
            ControlKind::Cancel => {
                let running = self.running.read().await;
                let mut reached = 0;
                for (scope, token) in running.values().filter(|(scope, _)| scope.matches(action)) {
                    if !token.is_cancelled() {
                        info!(
                            "Cancelling task {} on request for {}",
                            scope.task_id, action.task_id
                        );
                        token.cancel();
                    }
                    reached += 1;
                }
                reached
            }
        }
    }
}
