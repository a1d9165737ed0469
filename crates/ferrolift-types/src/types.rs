//! Core data types for FerroLift
//!
//! This module provides the task records persisted by the task store, the worker record,
//! control actions and the file metadata returned by storage adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a Top, Parent or Child task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new task ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TaskId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Unique identifier for a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Uuid);

impl WorkerId {
    /// Create a new worker ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant identifier
pub type TenantId = String;

/// Lifecycle status shared by every task level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Persisted, waiting for a worker
    Accepted,
    /// Parent is listing its source
    Staging,
    /// Parent children are committed
    Staged,
    /// Work is running
    InProgress,
    /// Work is suspended
    Paused,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Finished because cancellation was requested
    Cancelled,
}

impl TaskStatus {
    /// Check if the status is terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the status is active (running or paused)
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Staging | Self::Staged | Self::InProgress | Self::Paused
        )
    }

    /// Stable upper-case name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "ACCEPTED",
            Self::Staging => "STAGING",
            Self::Staged => "STAGED",
            Self::InProgress => "IN_PROGRESS",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schedulable task level; each has its own worker pool and queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Parent task (one source/destination element)
    Parent,
    /// Child task (one file copy)
    Child,
}

impl TaskKind {
    /// Both schedulable kinds
    pub const ALL: [Self; 2] = [Self::Parent, Self::Child];

    /// Queue name used for this kind
    pub fn queue_name(self) -> &'static str {
        match self {
            Self::Parent => "parent-ready",
            Self::Child => "child-ready",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parent => f.write_str("parent"),
            Self::Child => f.write_str("child"),
        }
    }
}

/// One user-initiated transfer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopTask {
    /// Task ID
    pub id: TaskId,
    /// Owning tenant
    pub tenant: TenantId,
    /// Owning user
    pub user: String,
    /// Optional free-form tag
    pub tag: Option<String>,
    /// Aggregate status derived from the parents
    pub status: TaskStatus,
    /// Error message of the first required failure
    pub error: Option<String>,
    /// Whether a cancel was accepted for this transfer
    pub cancel_requested: bool,
    /// Parent tasks in submission order
    pub parent_ids: Vec<TaskId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time the first parent left ACCEPTED
    pub started_at: Option<DateTime<Utc>>,
    /// Time the status became terminal
    pub ended_at: Option<DateTime<Utc>>,
}

impl TopTask {
    /// Create a new accepted top task
    pub fn new(tenant: impl Into<TenantId>, user: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            tenant: tenant.into(),
            user: user.into(),
            tag: None,
            status: TaskStatus::Accepted,
            error: None,
            cancel_requested: false,
            parent_ids: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }
}

/// One source URI to destination URI element of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentTask {
    /// Task ID
    pub id: TaskId,
    /// Owning top task
    pub top_id: TaskId,
    /// Tenant of the owning top task
    pub tenant: TenantId,
    /// Source URI
    pub source: String,
    /// Destination URI
    pub destination: String,
    /// Current status
    pub status: TaskStatus,
    /// Optional elements never fail their transfer
    pub optional: bool,
    /// Sum of child sizes, known once STAGED
    pub total_bytes: Option<u64>,
    /// Aggregate bytes moved by the children
    pub bytes_transferred: u64,
    /// Number of children committed at STAGED
    pub child_count: usize,
    /// Worker currently holding the task
    pub assigned_worker: Option<WorkerId>,
    /// Number of staging attempts
    pub retry_count: u32,
    /// Last error
    pub error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time staging began
    pub started_at: Option<DateTime<Utc>>,
    /// Time the status became terminal
    pub ended_at: Option<DateTime<Utc>>,
}

impl ParentTask {
    /// Create a new accepted parent for `top`
    pub fn new(
        top: &TopTask,
        source: impl Into<String>,
        destination: impl Into<String>,
        optional: bool,
    ) -> Self {
        Self {
            id: TaskId::new(),
            top_id: top.id,
            tenant: top.tenant.clone(),
            source: source.into(),
            destination: destination.into(),
            status: TaskStatus::Accepted,
            optional,
            total_bytes: None,
            bytes_transferred: 0,
            child_count: 0,
            assigned_worker: None,
            retry_count: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }
}

/// Declared child produced by staging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSpec {
    /// Source URI of the file
    pub source: String,
    /// Destination URI of the file
    pub destination: String,
    /// Declared size in bytes
    pub size: u64,
}

/// One concrete file copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildTask {
    /// Task ID
    pub id: TaskId,
    /// Owning parent
    pub parent_id: TaskId,
    /// Owning top task
    pub top_id: TaskId,
    /// Tenant of the owning top task
    pub tenant: TenantId,
    /// Source URI
    pub source: String,
    /// Destination URI
    pub destination: String,
    /// Current status
    pub status: TaskStatus,
    /// Declared size in bytes
    pub size: u64,
    /// Bytes moved by the current attempt
    pub bytes_transferred: u64,
    /// Inherited from the parent
    pub optional: bool,
    /// Worker currently holding the task
    pub assigned_worker: Option<WorkerId>,
    /// Number of attempts started
    pub retry_count: u32,
    /// Last error
    pub error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the first attempt
    pub started_at: Option<DateTime<Utc>>,
    /// Time the status became terminal
    pub ended_at: Option<DateTime<Utc>>,
}

impl ChildTask {
    /// Create a new accepted child of `parent`
    pub fn new(parent: &ParentTask, spec: ChildSpec) -> Self {
        Self {
            id: TaskId::new(),
            parent_id: parent.id,
            top_id: parent.top_id,
            tenant: parent.tenant.clone(),
            source: spec.source,
            destination: spec.destination,
            status: TaskStatus::Accepted,
            size: spec.size,
            bytes_transferred: 0,
            optional: parent.optional,
            assigned_worker: None,
            retry_count: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }
}

/// Registered worker and its heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Worker ID
    pub id: WorkerId,
    /// Host label
    pub host: String,
    /// Registration time
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat time
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRecord {
    /// Record for a worker registering now
    pub fn new(id: WorkerId, host: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            host: host.into(),
            registered_at: now,
            last_heartbeat: now,
        }
    }

    /// Check whether the last heartbeat is newer than `cutoff`
    pub fn is_live(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_heartbeat >= cutoff
    }
}

/// Kind of out-of-band control action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlKind {
    /// Stop the task at its next checkpoint
    Cancel,
}

/// Ephemeral control message fanned out to every worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlAction {
    /// Top, Parent or Child task the action targets
    pub task_id: TaskId,
    /// Tenant of the targeted task
    pub tenant: TenantId,
    /// Action kind
    pub kind: ControlKind,
}

impl ControlAction {
    /// Create a cancel action
    pub fn cancel(task_id: TaskId, tenant: impl Into<TenantId>) -> Self {
        Self {
            task_id,
            tenant: tenant.into(),
            kind: ControlKind::Cancel,
        }
    }
}

/// Entry type reported by a storage adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Regular file or object
    File,
    /// Directory or prefix
    Directory,
}

/// File metadata reported by a storage adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Absolute path on the backend
    pub path: String,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Entry type
    pub entry_type: EntryType,
    /// Last modification time, if known
    pub modified: Option<DateTime<Utc>>,
}

impl FileInfo {
    /// Create file metadata
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            entry_type: EntryType::File,
            modified: None,
        }
    }

    /// Create directory metadata
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            entry_type: EntryType::Directory,
            modified: None,
        }
    }

    /// Set the modification time
    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Check if this entry is a directory
    pub fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Directory
    }
}
