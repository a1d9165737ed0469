//! Transfer engine: the in-process assembly of store, dispatcher and workers

use crate::{
    control::ControlChannel,
    executor::{Worker, WorkerConfig, WorkerHandle},
    monitor::{Statistics, StatisticsCollector},
    pipeline::PipelineContext,
    queue::WorkQueues,
    scheduler::{Dispatcher, SchedulerConfig},
    task::TransferRequest,
};
use ferrolift_config::{Config, ConfigLoader};
use ferrolift_io::StorageRegistry;
use ferrolift_store::{CancelOutcome, InMemoryTaskStore, TaskStore};
use ferrolift_types::{
    ChildTask, ControlAction, Error, ParentTask, Result, TaskId, TaskKind, TaskStatus, TopTask,
    WorkerId,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Main transfer engine
#[derive(Debug)]
pub struct TransferEngine {
    config: Arc<Config>,
    store: Arc<dyn TaskStore>,
    registry: StorageRegistry,
    queues: WorkQueues,
    control: ControlChannel,
    statistics: StatisticsCollector,
    dispatcher: Arc<Dispatcher>,
    worker_config: WorkerConfig,
    initial_workers: usize,
    shutdown: CancellationToken,
    dispatcher_loops: Mutex<Vec<JoinHandle<()>>>,
    workers: Mutex<HashMap<WorkerId, WorkerHandle>>,
}

impl TransferEngine {
    /// Create an engine from the default configuration sources
    pub async fn new() -> Result<Self> {
        let config = ConfigLoader::load_default()?;
        Self::with_config(config).await
    }

    /// Create an engine with custom configuration, an in-memory store and no adapters
    pub async fn with_config(config: Config) -> Result<Self> {
        EngineBuilder::new().with_config(config).build().await
    }

    /// Start building an engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Storage adapters; register systems before submitting transfers
    pub fn registry(&self) -> &StorageRegistry {
        &self.registry
    }

    /// Underlying task store
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Start the dispatcher loops and the configured number of workers
    pub async fn start(&self) -> Result<()> {
        let mut loops = self.dispatcher_loops.lock().await;
        if !loops.is_empty() {
            debug!("Transfer engine already started");
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            return Err(Error::other("transfer engine was shut down"));
        }
        loops.extend(Arc::clone(&self.dispatcher).spawn(&self.shutdown));
        drop(loops);

        for _ in 0..self.initial_workers {
            self.spawn_worker().await?;
        }
        info!("Transfer engine started with {} workers", self.initial_workers);
        Ok(())
    }

    /// Add a worker serving both pools
    pub async fn spawn_worker(&self) -> Result<WorkerId> {
        let ctx = PipelineContext {
            worker_id: WorkerId::new(),
            store: Arc::clone(&self.store),
            registry: self.registry.clone(),
            queues: self.queues.clone(),
            statistics: self.statistics.clone(),
            config: self.worker_config.clone(),
        };
        let worker = Worker::new(ctx, self.control.clone());
        let id = worker.id();
        let handle = worker.spawn(&self.shutdown);
        self.workers.lock().await.insert(id, handle);
        Ok(id)
    }

    /// Ids of the workers started by this engine
    pub async fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.workers.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Stop one worker gracefully
    pub async fn stop_worker(&self, id: WorkerId) -> Result<()> {
        let handle = self.take_worker(id).await?;
        handle.stop().await
    }

    /// Stop one worker without deregistering it, as if its process died
    pub async fn kill_worker(&self, id: WorkerId) -> Result<()> {
        self.take_worker(id).await?.kill();
        Ok(())
    }

    async fn take_worker(&self, id: WorkerId) -> Result<WorkerHandle> {
        self.workers
            .lock()
            .await
            .remove(&id)
            .ok_or_else(|| Error::other(format!("Unknown worker {}", id)))
    }

    /// Accept a transfer: record its tasks and queue its parents
    pub async fn submit(&self, request: TransferRequest) -> Result<TopTask> {
        let (top, parents) = request.into_tasks()?;
        let parent_ids: Vec<TaskId> = parents.iter().map(|parent| parent.id).collect();
        let top = self.store.create_transfer(top, parents).await?;

        self.queues
            .get(TaskKind::Parent)
            .publish_all(parent_ids)
            .await;
        self.statistics.record_transfer_submitted().await;
        info!(
            "Accepted transfer {} for {}/{} with {} elements",
            top.id,
            top.tenant,
            top.user,
            top.parent_ids.len()
        );
        Ok(top)
    }

    /// Fetch a Top task
    pub async fn get_top(&self, id: TaskId) -> Result<TopTask> {
        self.store.get_top(id).await
    }

    /// Most recent transfers of a tenant
    pub async fn list_tops(
        &self,
        tenant: &str,
        user: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TopTask>> {
        self.store.list_tops(tenant, user, limit).await
    }

    /// Fetch a Parent task
    pub async fn get_parent(&self, id: TaskId) -> Result<ParentTask> {
        self.store.get_parent(id).await
    }

    /// Fetch a Child task
    pub async fn get_child(&self, id: TaskId) -> Result<ChildTask> {
        self.store.get_child(id).await
    }

    /// Parents of a transfer
    pub async fn parents_of(&self, top_id: TaskId) -> Result<Vec<ParentTask>> {
        self.store.parents_of(top_id).await
    }

    /// Children of a parent
    pub async fn children_of(&self, parent_id: TaskId) -> Result<Vec<ChildTask>> {
        self.store.children_of(parent_id).await
    }

    /// Task counts per status for a pool
    pub async fn status_counts(&self, kind: TaskKind) -> Result<HashMap<TaskStatus, usize>> {
        self.store.status_counts(kind).await
    }

    /// Cancel a Top, Parent or Child task.
    ///
    /// Unassigned tasks are cancelled in the store right away; running pipelines are told
    /// over the control channel and stop at their next checkpoint. A terminal task is left
    /// alone and the outcome reports `accepted == false`.
    pub async fn cancel(&self, id: TaskId) -> Result<CancelOutcome> {
        let outcome = self.store.request_cancel(id).await?;
        if outcome.accepted {
            let reached = self
                .control
                .publish(ControlAction::cancel(id, outcome.tenant.clone()));
            self.statistics.record_cancel_accepted().await;
            info!(
                "Cancel of {} accepted: {} tasks cancelled, {} in flight, {} workers notified",
                id,
                outcome.cancelled.len(),
                outcome.in_flight.len(),
                reached
            );
        } else {
            debug!("Cancel of {} ignored, transfer already finished", id);
        }
        Ok(outcome)
    }

    /// Engine counters
    pub async fn statistics(&self) -> Statistics {
        self.statistics.snapshot().await
    }

    /// Wait until a transfer reaches a terminal status
    pub async fn wait_for_top(&self, id: TaskId, timeout: Duration) -> Result<TopTask> {
        let poll = async {
            loop {
                let top = self.store.get_top(id).await?;
                if top.status.is_terminal() {
                    return Ok(top);
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| Error::Timeout {
                seconds: timeout.as_secs(),
            })?
    }

    /// Stop every worker and the dispatcher
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();

        let workers: Vec<WorkerHandle> =
            self.workers.lock().await.drain().map(|(_, h)| h).collect();
        let stopped = join_all(workers.into_iter().map(WorkerHandle::stop)).await;

        let loops: Vec<JoinHandle<()>> = self.dispatcher_loops.lock().await.drain(..).collect();
        for joined in join_all(loops).await {
            if let Err(e) = joined {
                warn!("Dispatcher loop ended abnormally: {}", e);
            }
        }

        info!("Transfer engine stopped");
        stopped.into_iter().collect()
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        if !self.dispatcher_loops.get_mut().is_empty() && !self.shutdown.is_cancelled() {
            warn!("Transfer engine dropped without proper shutdown");
            self.shutdown.cancel();
        }
    }
}

/// Builder for creating a transfer engine with custom configuration
#[derive(Debug, Default)]
pub struct EngineBuilder {
    config: Option<Config>,
    store: Option<Arc<dyn TaskStore>>,
    registry: Option<StorageRegistry>,
    scheduler_config: Option<SchedulerConfig>,
    worker_config: Option<WorkerConfig>,
    workers: Option<usize>,
}

impl EngineBuilder {
    /// Create a new engine builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an existing task store
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use an existing adapter registry
    pub fn with_registry(mut self, registry: StorageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Override the dispatcher configuration
    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = Some(config);
        self
    }

    /// Override the worker configuration
    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = Some(config);
        self
    }

    /// Number of workers started by [`TransferEngine::start`]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Build the transfer engine
    pub async fn build(self) -> Result<TransferEngine> {
        let config = match self.config {
            Some(config) => config,
            None => ConfigLoader::load_default()?,
        };
        let scheduler_config = self
            .scheduler_config
            .unwrap_or_else(|| SchedulerConfig::from_config(&config));
        let worker_config = match self.worker_config {
            Some(worker_config) => worker_config,
            None => WorkerConfig::from_config(&config)?,
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));

        let queues = WorkQueues::new();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            queues.clone(),
            scheduler_config,
        ));

        info!("Transfer engine initialized");
        Ok(TransferEngine {
            config: Arc::new(config),
            store,
            registry: self.registry.unwrap_or_default(),
            queues,
            control: ControlChannel::default(),
            statistics: StatisticsCollector::new(),
            dispatcher,
            worker_config,
            initial_workers: self.workers.unwrap_or(1),
            shutdown: CancellationToken::new(),
            dispatcher_loops: Mutex::new(Vec::new()),
            workers: Mutex::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrolift_io::MemoryAdapter;
    use ferrolift_types::ErrorKind;

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.dispatch.idle_backoff_base_ms = 1;
        config.dispatch.idle_backoff_max_ms = 10;
        config.worker.poll_interval_ms = 5;
        config.worker.heartbeat_interval_ms = 50;
        config.progress.window_ms = 10;
        config
    }

    async fn engine_with_memory(workers: usize) -> (TransferEngine, MemoryAdapter) {
        let memory = MemoryAdapter::new();
        let engine = EngineBuilder::new()
            .with_config(fast_config())
            .with_workers(workers)
            .build()
            .await
            .unwrap();
        engine
            .registry()
            .register("mem", Arc::new(memory.clone()))
            .await;
        (engine, memory)
    }

    #[tokio::test]
    async fn test_engine_builder() {
        let engine = EngineBuilder::new()
            .with_config(Config::default())
            .with_workers(3)
            .build()
            .await
            .unwrap();

        assert_eq!(engine.config().retry.max_retries, 5);
        assert!(engine.worker_ids().await.is_empty());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let (engine, memory) = engine_with_memory(2).await;
        memory.insert("/src/file.bin", vec![9u8; 10_240]).unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.worker_ids().await.len(), 2);

        let request = TransferRequest::new("tenant-a", "alice")
            .with_element("mem://mem/src/file.bin", "mem://mem/dst/file.bin");
        let top = engine.submit(request).await.unwrap();
        assert_eq!(top.status, TaskStatus::Accepted);

        let top = engine.wait_for_top(top.id, Duration::from_secs(10)).await.unwrap();
        assert_eq!(top.status, TaskStatus::Completed);
        assert_eq!(memory.get("/dst/file.bin").unwrap().len(), 10_240);

        let parents = engine.parents_of(top.id).await.unwrap();
        assert_eq!(parents[0].bytes_transferred, 10_240);
        let stats = engine.statistics().await;
        assert_eq!(stats.transfers_submitted, 1);
        assert_eq!(stats.children_completed, 1);

        engine.shutdown().await.unwrap();
        assert!(engine.store().workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_without_side_effects() {
        let (engine, _memory) = engine_with_memory(1).await;
        let error = engine
            .submit(TransferRequest::new("tenant-a", "alice"))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::State);
        assert!(engine.list_tops("tenant-a", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_finished() {
        let (engine, memory) = engine_with_memory(1).await;
        assert!(matches!(
            engine.cancel(TaskId::new()).await,
            Err(Error::TaskNotFound { .. })
        ));

        memory.insert("/src/a", vec![1u8; 8]).unwrap();
        engine.start().await.unwrap();
        let top = engine
            .submit(
                TransferRequest::new("tenant-a", "alice")
                    .with_element("mem://mem/src/a", "mem://mem/dst/a"),
            )
            .await
            .unwrap();
        engine.wait_for_top(top.id, Duration::from_secs(10)).await.unwrap();

        let outcome = engine.cancel(top.id).await.unwrap();
        assert!(!outcome.accepted);
        assert_eq!(engine.get_top(top.id).await.unwrap().status, TaskStatus::Completed);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_top_times_out() {
        let (engine, memory) = engine_with_memory(1).await;
        memory.insert("/src/a", vec![1u8; 8]).unwrap();
        // Not started: nothing ever runs
        let top = engine
            .submit(
                TransferRequest::new("tenant-a", "alice")
                    .with_element("mem://mem/src/a", "mem://mem/dst/a"),
            )
            .await
            .unwrap();

        let error = engine
            .wait_for_top(top.id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Timeout { .. }));
    }
}
