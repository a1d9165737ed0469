//! Task store for FerroLift
//!
//! The task store is the single source of truth for task status and worker assignment:
//!
//! - **Transactions**: every operation is one atomic read-modify-write
//! - **Fencing**: worker-side writes are rejected unless the caller still owns the task
//! - **Roll-up**: child outcomes roll up to parents and transfers inside the same transaction
//! - **Reclamation**: stale workers are evicted and their assignments returned to the pool
//! - **Snapshots**: task records can be saved to and restored from JSON
//!
//! # Examples
//!
//! ```rust
//! use ferrolift_store::{InMemoryTaskStore, TaskStore};
//! use ferrolift_types::{ParentTask, TaskKind, TopTask};
//!
//! # async fn example() -> ferrolift_types::Result<()> {
//! let store = InMemoryTaskStore::new();
//! let top = TopTask::new("tenant-a", "alice");
//! let parent = ParentTask::new(&top, "file:///data/in", "file:///data/out", false);
//! store.create_transfer(top, vec![parent]).await?;
//!
//! let ready = store.ready_ids(TaskKind::Parent, 10).await?;
//! assert_eq!(ready.len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod memory;
pub mod snapshot;
pub mod traits;

pub use memory::InMemoryTaskStore;
pub use snapshot::StoreSnapshot;
pub use traits::{CancelOutcome, TaskStore};
