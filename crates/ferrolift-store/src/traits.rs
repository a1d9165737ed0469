//! The task store contract
//!
//! Every method is one atomic transaction. Worker-side mutations take the calling worker's
//! id and fail with [`Error::NotOwner`](ferrolift_types::Error::NotOwner) when the task is no
//! longer assigned to it, so a reclaimed task can never be written by its previous owner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferrolift_types::{
    ChildSpec, ChildTask, ParentTask, Result, TaskId, TaskKind, TaskStatus, TenantId, TopTask,
    WorkerId, WorkerRecord,
};
use std::collections::HashMap;

/// Result of a cancellation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Top task owning the cancelled task
    pub top_id: TaskId,
    /// Tenant of the cancelled task
    pub tenant: TenantId,
    /// `false` when the task was already terminal and nothing changed
    pub accepted: bool,
    /// Tasks cancelled directly because no worker held them
    pub cancelled: Vec<TaskId>,
    /// Tasks still held by a worker; they stop at their next checkpoint
    pub in_flight: Vec<TaskId>,
}

/// Durable record of tasks and worker heartbeats
#[async_trait]
pub trait TaskStore: Send + Sync + std::fmt::Debug {
    // Submission and queries

    /// Persist a Top task with its Parent tasks
    async fn create_transfer(&self, top: TopTask, parents: Vec<ParentTask>) -> Result<TopTask>;

    /// Fetch a Top task
    async fn get_top(&self, id: TaskId) -> Result<TopTask>;

    /// Most recent Top tasks of a tenant, newest first, optionally filtered by user
    async fn list_tops(
        &self,
        tenant: &str,
        user: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TopTask>>;

    /// Fetch a Parent task
    async fn get_parent(&self, id: TaskId) -> Result<ParentTask>;

    /// Fetch a Child task
    async fn get_child(&self, id: TaskId) -> Result<ChildTask>;

    /// Parent tasks of a Top task, in submission order
    async fn parents_of(&self, top_id: TaskId) -> Result<Vec<ParentTask>>;

    /// Child tasks of a Parent task, in staging order
    async fn children_of(&self, parent_id: TaskId) -> Result<Vec<ChildTask>>;

    /// Whether a task of the given kind is recorded
    async fn contains(&self, kind: TaskKind, id: TaskId) -> Result<bool>;

    /// Number of tasks of a kind per status
    async fn status_counts(&self, kind: TaskKind) -> Result<HashMap<TaskStatus, usize>>;

    /// Accept a cancellation for a Top, Parent or Child task.
    ///
    /// Marks the owning Top task, cancels every unassigned non-terminal descendant directly
    /// and reports the ones a worker still holds.
    async fn request_cancel(&self, id: TaskId) -> Result<CancelOutcome>;

    /// Whether a cancel was accepted for the task or one of its ancestors
    async fn is_cancel_requested(&self, id: TaskId) -> Result<bool>;

    // Workers

    /// Insert or refresh a worker record
    async fn register_worker(&self, worker: WorkerRecord) -> Result<()>;

    /// Refresh a worker heartbeat; an evicted worker is re-registered
    async fn heartbeat(&self, worker: WorkerId, at: DateTime<Utc>) -> Result<()>;

    /// Remove a worker and release its assignments
    async fn deregister_worker(&self, worker: WorkerId) -> Result<()>;

    /// Registered workers
    async fn workers(&self) -> Result<Vec<WorkerRecord>>;

    /// Drop workers whose last heartbeat is older than `cutoff`
    async fn evict_stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerId>>;

    // Scheduling

    /// Clear assignments that reference unregistered workers, returning how many were cleared
    async fn clear_orphaned_assignments(&self, kind: TaskKind) -> Result<usize>;

    /// Non-terminal assigned task count for every registered worker
    async fn backlogs(&self, kind: TaskKind) -> Result<HashMap<WorkerId, usize>>;

    /// Unassigned ready tasks ordered by creation, at most `limit` per tenant
    async fn ready_ids(&self, kind: TaskKind, limit: usize) -> Result<Vec<(TenantId, TaskId)>>;

    /// Atomically assign a ready, unassigned task to a registered worker.
    ///
    /// Returns `false` when the task is no longer assignable.
    async fn assign(&self, kind: TaskKind, id: TaskId, worker: WorkerId) -> Result<bool>;

    /// Non-terminal tasks currently assigned to `worker`
    async fn assigned_to(&self, kind: TaskKind, worker: WorkerId) -> Result<Vec<TaskId>>;

    // Parent pipeline

    /// Move an assigned parent into STAGING, restarting staging after a reclaim
    async fn begin_staging(&self, id: TaskId, worker: WorkerId) -> Result<ParentTask>;

    /// Count a retried listing attempt, returning the new retry count
    async fn record_parent_retry(&self, id: TaskId, worker: WorkerId) -> Result<u32>;

    /// Record the children and total size and move STAGING to STAGED
    async fn commit_staging(
        &self,
        id: TaskId,
        worker: WorkerId,
        children: Vec<ChildSpec>,
    ) -> Result<Vec<ChildTask>>;

    /// Move STAGED to IN_PROGRESS and release the assignment; rolls up immediately when
    /// every child is already terminal
    async fn start_parent(&self, id: TaskId, worker: WorkerId) -> Result<ParentTask>;

    /// Move an owned parent to FAILED or CANCELLED and release it
    async fn finish_parent(
        &self,
        id: TaskId,
        worker: WorkerId,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<ParentTask>;

    // Child pipeline

    /// Start a copy attempt: ACCEPTED to IN_PROGRESS, retry count incremented, bytes reset
    async fn begin_child_attempt(&self, id: TaskId, worker: WorkerId) -> Result<ChildTask>;

    /// Persist a progress sample
    async fn record_progress(&self, id: TaskId, worker: WorkerId, bytes: u64) -> Result<()>;

    /// Terminal write for a child; the parent and Top roll-up happen in the same transaction
    async fn finish_child(
        &self,
        id: TaskId,
        worker: WorkerId,
        status: TaskStatus,
        bytes_transferred: u64,
        error: Option<String>,
    ) -> Result<ChildTask>;
}
