//! Configuration management system for FerroLift
//!
//! This crate holds the single configuration value object injected into every engine
//! component, and the machinery that loads it from layered sources.
//!
//! # Features
//!
//! - **Multiple formats**: YAML, TOML and JSON configuration files
//! - **Validation**: rejects settings the dispatcher or pipelines cannot run with
//! - **Environment overrides**: `FERROLIFT__SECTION__KEY=value`
//! - **Defaults**: every option has a default, so a missing file is not an error
//!
//! # Examples
//!
//! ```rust
//! use ferrolift_config::{Config, ConfigBuilder};
//!
//! let config = ConfigBuilder::new()
//!     .add_defaults()
//!     .add_source_file("ferrolift.yaml")
//!     .add_env_prefix("FERROLIFT")
//!     .build()
//!     .expect("Failed to load configuration");
//!
//! println!("Liveness window: {:?}", config.dispatch.heartbeat_timeout());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use ferrolift_types::{BufferSize, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod builder;
pub mod error;
pub mod loader;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

/// Main configuration structure for FerroLift
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dispatcher configuration
    pub dispatch: DispatchConfig,
    /// Worker pool configuration
    pub worker: WorkerPoolConfig,
    /// Retry policy for transient failures
    pub retry: RetryPolicyConfig,
    /// Progress persistence configuration
    pub progress: ProgressConfig,
    /// Parent staging limits
    pub staging: StagingConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// A worker whose heartbeat is older than this is dead (milliseconds)
    pub heartbeat_timeout_ms: u64,
    /// Workers with fewer assigned tasks than this need work
    pub backlog_threshold: usize,
    /// Upper bound on ready rows read per tenant per cycle
    pub max_ready_rows: usize,
    /// Upper bound on tasks assigned per cycle
    pub max_batch_size: usize,
    /// First idle sleep (milliseconds)
    pub idle_backoff_base_ms: u64,
    /// Longest idle sleep (milliseconds)
    pub idle_backoff_max_ms: u64,
    /// Queue deliveries drained per cycle
    pub queue_prefetch: usize,
}

impl DispatchConfig {
    /// Liveness window
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// First idle sleep
    pub fn idle_backoff_base(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_base_ms)
    }

    /// Longest idle sleep
    pub fn idle_backoff_max(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_max_ms)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 600_000,
            backlog_threshold: 4,
            max_ready_rows: 1000,
            max_batch_size: 100,
            idle_backoff_base_ms: 100,
            idle_backoff_max_ms: 5000,
            queue_prefetch: 256,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Heartbeat interval (milliseconds)
    pub heartbeat_interval_ms: u64,
    /// Interval between assignment polls (milliseconds)
    pub poll_interval_ms: u64,
    /// Pipelines run concurrently by one worker
    pub max_concurrent_tasks: usize,
    /// Copy chunk size
    pub buffer_size: BufferSize,
}

impl WorkerPoolConfig {
    /// Heartbeat interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Interval between assignment polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            poll_interval_ms: 250,
            max_concurrent_tasks: num_cpus::get().max(2),
            buffer_size: BufferSize::default(),
        }
    }
}

/// Retry policy for transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Maximum attempts per task
    pub max_retries: u32,
    /// First backoff delay (milliseconds)
    pub initial_delay_ms: u64,
    /// Backoff cap (milliseconds)
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl RetryPolicyConfig {
    /// Convert to the validated retry policy
    pub fn to_retry_config(&self) -> ConfigResult<RetryConfig> {
        RetryConfig::new(
            self.max_retries,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_multiplier,
        )
        .map_err(ConfigError::validation)
    }
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: RetryConfig::MAX_RETRIES,
            initial_delay_ms: 10_000,
            max_delay_ms: 300_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Progress persistence configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// At most one progress sample is persisted per window (milliseconds)
    pub window_ms: u64,
}

impl ProgressConfig {
    /// Throttle window
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self { window_ms: 1000 }
    }
}

/// Parent staging limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// A listing producing more children than this fails the parent
    pub max_children_per_parent: usize,
    /// Maximum directory recursion depth
    pub max_listing_depth: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            max_children_per_parent: 100_000,
            max_listing_depth: 64,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_format: bool,
    /// Also write logs to this file
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            log_file: None,
        }
    }
}
