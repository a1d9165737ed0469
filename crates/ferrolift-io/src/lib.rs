//! Storage adapters and streaming I/O for FerroLift
//!
//! This crate implements the storage side of a transfer:
//!
//! - **Addressing**: `scheme://system/path` transfer URIs
//! - **Registry**: system id to adapter lookup with per-system enable flags
//! - **Adapters**: local filesystem, in-memory object store, pull-only wrapper
//! - **Streaming**: a progress-observing reader and a cancellable chunked copy
//!
//! # Examples
//!
//! ```rust
//! use ferrolift_io::{MemoryAdapter, StorageRegistry, TransferUri};
//! use std::sync::Arc;
//!
//! # async fn example() -> ferrolift_types::Result<()> {
//! let registry = StorageRegistry::new();
//! registry.register("archive", Arc::new(MemoryAdapter::new())).await;
//!
//! let uri = TransferUri::parse("mem://archive/reports/q1.csv")?;
//! let adapter = registry.resolve(&uri).await?;
//! println!("{} served by {}", uri, adapter.backend());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod local;
pub mod memory;
pub mod readonly;
pub mod registry;
pub mod stream;
pub mod uri;

pub use local::LocalFsAdapter;
pub use memory::MemoryAdapter;
pub use readonly::ReadOnlyAdapter;
pub use registry::StorageRegistry;
pub use stream::{copy_stream, ProgressReader, ProgressSample};
pub use uri::TransferUri;
