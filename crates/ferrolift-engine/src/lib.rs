//! Transfer orchestration engine for FerroLift
//!
//! This crate turns transfer requests into a three-level task hierarchy and drives it to
//! completion with a pool of workers:
//!
//! # Features
//!
//! - **Decomposition**: one Top task per request, one Parent per element, one Child per file
//! - **Dispatching**: fair, backlog-aware assignment of ready tasks to live workers
//! - **Workers**: heartbeats, bounded concurrency and per-task pipelines
//! - **Retries**: transient failures retried with exponential backoff
//! - **Cancellation**: broadcast control actions plus a persisted cancel flag
//! - **Progress**: throttled byte counts persisted while a copy runs
//!
//! # Examples
//!
//! ```rust,no_run
//! use ferrolift_engine::{TransferEngine, TransferRequest};
//! use ferrolift_io::LocalFsAdapter;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = TransferEngine::builder().with_workers(2).build().await?;
//! engine.registry().register("local", Arc::new(LocalFsAdapter::new())).await;
//! engine.start().await?;
//!
//! let request = TransferRequest::new("tenant-a", "alice")
//!     .with_element("file://local/data/in", "file://local/data/out");
//! let top = engine.submit(request).await?;
//! let top = engine.wait_for_top(top.id, Duration::from_secs(60)).await?;
//! println!("Transfer finished as {}", top.status);
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod control;
pub mod engine;
pub mod executor;
pub mod monitor;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod task;

pub use control::{CancelRegistry, ControlChannel, TaskScope};
pub use engine::{EngineBuilder, TransferEngine};
pub use executor::{Worker, WorkerConfig, WorkerHandle};
pub use ferrolift_store::CancelOutcome;
pub use monitor::{ProgressThrottle, Statistics, StatisticsCollector};
pub use pipeline::PipelineContext;
pub use queue::{Delivery, WorkQueue, WorkQueues};
pub use scheduler::{CycleReport, Dispatcher, SchedulerConfig};
pub use task::{TransferElement, TransferRequest};
