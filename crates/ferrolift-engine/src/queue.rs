//! Ready-work queues
//!
//! Two named queues carry task ids from submission and staging to the dispatcher:
//! "parent-ready" and "child-ready". Delivery is at-least-once: a consumed delivery stays
//! in flight until it is acknowledged, and a negative acknowledgment puts it back at the
//! front of the queue. Consumption is bounded by the prefetch limit.

use ferrolift_types::{TaskId, TaskKind};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

/// A consumed, not yet acknowledged message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Delivery tag used for ack/nack
    pub tag: u64,
    /// Task carried by the message
    pub task_id: TaskId,
    /// Whether the message was delivered before
    pub redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<(TaskId, bool)>,
    unacked: HashMap<u64, TaskId>,
    next_tag: u64,
}

/// At-least-once in-process work queue
#[derive(Debug, Clone)]
pub struct WorkQueue {
    name: &'static str,
    state: Arc<Mutex<QueueState>>,
    published: Arc<Notify>,
}

impl WorkQueue {
    /// Create an empty queue
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(QueueState::default())),
            published: Arc::new(Notify::new()),
        }
    }

    /// Queue name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append a task id and wake a waiting consumer
    pub async fn publish(&self, task_id: TaskId) {
        self.state.lock().await.ready.push_back((task_id, false));
        self.published.notify_one();
    }

    /// Append several task ids
    pub async fn publish_all<I: IntoIterator<Item = TaskId>>(&self, task_ids: I) {
        let mut state = self.state.lock().await;
        let before = state.ready.len();
        state.ready.extend(task_ids.into_iter().map(|id| (id, false)));
        let published = state.ready.len() - before;
        drop(state);

        if published > 0 {
            debug!("Published {} tasks to {}", published, self.name);
            self.published.notify_one();
        }
    }

    /// Take up to `prefetch` minus in-flight deliveries
    pub async fn consume(&self, prefetch: usize) -> Vec<Delivery> {
        let mut state = self.state.lock().await;
        let budget = prefetch.saturating_sub(state.unacked.len());
        let mut deliveries = Vec::with_capacity(budget.min(state.ready.len()));

        while deliveries.len() < budget {
            let Some((task_id, redelivered)) = state.ready.pop_front() else {
                break;
            };
            let tag = state.next_tag;
            state.next_tag += 1;
            state.unacked.insert(tag, task_id);
            deliveries.push(Delivery {
                tag,
                task_id,
                redelivered,
            });
        }
        deliveries
    }

    /// Acknowledge a delivery; returns `false` for an unknown tag
    pub async fn ack(&self, tag: u64) -> bool {
        self.state.lock().await.unacked.remove(&tag).is_some()
    }

    /// Reject a delivery, optionally putting it back at the front of the queue
    pub async fn nack(&self, tag: u64, requeue: bool) -> bool {
        let mut state = self.state.lock().await;
        let Some(task_id) = state.unacked.remove(&tag) else {
            warn!("Nack for unknown delivery {} on {}", tag, self.name);
            return false;
        };
        if requeue {
            state.ready.push_front((task_id, true));
            drop(state);
            self.published.notify_one();
        }
        true
    }

    /// Messages waiting for a consumer
    pub async fn len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Whether no message is waiting
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Deliveries consumed but not yet acknowledged
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Resolve at the next publish, or immediately if one happened since the last wait
    pub async fn published(&self) {
        self.published.notified().await;
    }
}

/// The parent-ready and child-ready queues
#[derive(Debug, Clone)]
pub struct WorkQueues {
    parent: WorkQueue,
    child: WorkQueue,
}

impl WorkQueues {
    /// Create both queues
    pub fn new() -> Self {
        Self {
            parent: WorkQueue::new(TaskKind::Parent.queue_name()),
            child: WorkQueue::new(TaskKind::Child.queue_name()),
        }
    }

    /// Queue feeding the given pool
    pub fn get(&self, kind: TaskKind) -> &WorkQueue {
        match kind {
            TaskKind::Parent => &self.parent,
            TaskKind::Child => &self.child,
        }
    }
}

impl Default for WorkQueues {
    fn default() -> Self {
        Self::new()
    }
}
