//! Core task model and error handling for FerroLift
//!
//! This crate provides the foundational types shared by every FerroLift component:
//!
//! - **Task model**: Top, Parent and Child task records, worker records and control actions
//! - **State machine**: the static transition tables and the status roll-up rules
//! - **Error handling**: a categorised error type that drives retry decisions
//! - **Traits**: the `StorageAdapter` capability surface consumed by the pipelines
//! - **Configuration values**: validated retry/backoff and buffer size types
//!
//! # Examples
//!
//! ```rust
//! use ferrolift_types::{state, TaskKind, TaskStatus};
//!
//! assert!(state::can_transition(TaskKind::Parent, TaskStatus::Accepted, TaskStatus::Staging));
//! let skipped = state::transition(TaskKind::Parent, TaskStatus::Accepted, TaskStatus::Completed);
//! assert!(skipped.is_err());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod result;
pub mod state;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::{BufferSize, RetryConfig};
pub use error::{Error, ErrorKind};
pub use result::Result;
pub use traits::{ByteReader, ByteWriter, StorageAdapter};
pub use types::*;
