//! Test fixtures for end-to-end transfer scenarios

use ferrolift_config::Config;
use ferrolift_engine::{TransferEngine, TransferRequest};
use ferrolift_io::{LocalFsAdapter, MemoryAdapter};
use ferrolift_types::{ChildTask, Result, TaskId, TaskStatus, TopTask};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Storage system id of the in-memory adapter
pub const MEM_SYSTEM: &str = "mem";

/// Storage system id of the local filesystem adapter
pub const LOCAL_SYSTEM: &str = "local";

/// Default time allowed for a scenario to settle
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Test data generation patterns
#[derive(Debug, Clone, Copy)]
pub enum TestDataPattern {
    /// All zeros
    Zeros,
    /// Repeating byte ramp
    Sequential,
    /// Deterministic pseudo-random bytes
    Noise,
}

/// Generate test data with the given pattern
pub fn generate_test_data(size: usize, pattern: TestDataPattern) -> Vec<u8> {
    match pattern {
        TestDataPattern::Zeros => vec![0u8; size],
        TestDataPattern::Sequential => (0..size).map(|i| (i % 256) as u8).collect(),
        TestDataPattern::Noise => {
            let mut seed: u32 = 0x9E37_79B9;
            (0..size)
                .map(|_| {
                    seed ^= seed << 13;
                    seed ^= seed >> 17;
                    seed ^= seed << 5;
                    (seed & 0xFF) as u8
                })
                .collect()
        }
    }
}

/// Write a file of `size` bytes below `dir`, creating parent directories
pub fn create_test_file(dir: &Path, name: &str, size: usize) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent directory");
    }
    fs::write(&path, generate_test_data(size, TestDataPattern::Sequential))
        .expect("Failed to write test file");
    path
}

/// URI of a path on the in-memory system
pub fn mem_uri(path: &str) -> String {
    format!("{}://{}/{}", MEM_SYSTEM, MEM_SYSTEM, path.trim_start_matches('/'))
}

/// URI of a path below the root of the local system
pub fn local_uri(relative: &str) -> String {
    format!("file://{}/{}", LOCAL_SYSTEM, relative.trim_start_matches('/'))
}

/// Configuration with millisecond-scale timings
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.dispatch.idle_backoff_base_ms = 1;
    config.dispatch.idle_backoff_max_ms = 10;
    config.worker.poll_interval_ms = 5;
    config.worker.heartbeat_interval_ms = 50;
    config.progress.window_ms = 10;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 10;
    config
}

/// A started engine with an in-memory system registered as [`MEM_SYSTEM`]
pub struct EngineFixture {
    /// The running engine
    pub engine: TransferEngine,
    /// Objects served under [`MEM_SYSTEM`]
    pub memory: MemoryAdapter,
}

impl EngineFixture {
    /// Start an engine with [`fast_config`] and `workers` workers
    pub async fn new(workers: usize) -> Self {
        Self::with_config(fast_config(), workers, MemoryAdapter::new()).await
    }

    /// Start an engine with a custom configuration and adapter
    pub async fn with_config(config: Config, workers: usize, memory: MemoryAdapter) -> Self {
        let engine = TransferEngine::builder()
            .with_config(config)
            .with_workers(workers)
            .build()
            .await
            .expect("Failed to build engine");
        engine
            .registry()
            .register(MEM_SYSTEM, Arc::new(memory.clone()))
            .await;
        engine.start().await.expect("Failed to start engine");
        Self { engine, memory }
    }

    /// Also serve `root` as [`LOCAL_SYSTEM`]
    pub async fn with_local_root(self, root: &Path) -> Self {
        self.engine
            .registry()
            .register(LOCAL_SYSTEM, Arc::new(LocalFsAdapter::rooted(root)))
            .await;
        self
    }

    /// Store a patterned object of `size` bytes at `path`
    pub fn put(&self, path: &str, size: usize) {
        self.memory
            .insert(path, generate_test_data(size, TestDataPattern::Sequential))
            .expect("Failed to insert object");
    }

    /// Submit a request and wait for its Top task to finish
    pub async fn run(&self, request: TransferRequest) -> TopTask {
        let top = self.engine.submit(request).await.expect("Failed to submit");
        self.engine
            .wait_for_top(top.id, SETTLE_TIMEOUT)
            .await
            .expect("Transfer did not finish")
    }

    /// Every child of every parent of a transfer
    pub async fn children(&self, top_id: TaskId) -> Result<Vec<ChildTask>> {
        let mut children = Vec::new();
        for parent in self.engine.parents_of(top_id).await? {
            children.extend(self.engine.children_of(parent.id).await?);
        }
        Ok(children)
    }

    /// Wait until `count` children of a transfer have the given status
    pub async fn wait_for_children(&self, top_id: TaskId, status: TaskStatus, count: usize) {
        wait_until(SETTLE_TIMEOUT, move || async move {
            self.children(top_id)
                .await
                .map(|children| children.iter().filter(|c| c.status == status).count() >= count)
                .unwrap_or(false)
        })
        .await;
    }

    /// Stop the engine
    pub async fn shutdown(self) {
        self.engine.shutdown().await.expect("Failed to shut down");
    }
}

/// Poll `condition` every few milliseconds until it holds, panicking after `timeout`
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Condition not met within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
