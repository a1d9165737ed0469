//! Worker process: registration, heartbeats and bounded pipeline execution
//!
//! A worker polls the task store for tasks the dispatcher assigned to it and runs each in
//! its own pipeline, at most `max_concurrent_tasks` at a time. A background loop refreshes
//! its heartbeat; another applies broadcast control actions to the running pipelines.

use crate::control::{CancelRegistry, ControlChannel, TaskScope};
use crate::pipeline::{run_child, run_parent, PipelineContext};
use chrono::Utc;
use ferrolift_config::Config;
use ferrolift_store::TaskStore;
use ferrolift_types::{
    ControlAction, Error, Result, RetryConfig, TaskId, TaskKind, WorkerId, WorkerRecord,
};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for a worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Host label recorded at registration
    pub host: String,
    /// Heartbeat interval
    pub heartbeat_interval: Duration,
    /// Interval between assignment polls
    pub poll_interval: Duration,
    /// Maximum number of concurrent pipelines
    pub max_concurrent_tasks: usize,
    /// Copy chunk size
    pub buffer_size: usize,
    /// Retry policy for transient failures
    pub retry: RetryConfig,
    /// Progress persistence window
    pub progress_window: Duration,
    /// Children one parent may produce
    pub max_children_per_parent: usize,
    /// Directory recursion limit
    pub max_listing_depth: usize,
}

impl WorkerConfig {
    /// Create worker config from main config
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            host: default_host(),
            heartbeat_interval: config.worker.heartbeat_interval(),
            poll_interval: config.worker.poll_interval(),
            max_concurrent_tasks: config.worker.max_concurrent_tasks.max(1),
            buffer_size: config.worker.buffer_size.get(),
            retry: config.retry.to_retry_config()?,
            progress_window: config.progress.window(),
            max_children_per_parent: config.staging.max_children_per_parent,
            max_listing_depth: config.staging.max_listing_depth,
        })
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            max_concurrent_tasks: num_cpus::get().max(2),
            buffer_size: 64 * 1024,
            retry: RetryConfig::default(),
            progress_window: Duration::from_secs(1),
            max_children_per_parent: 100_000,
            max_listing_depth: 64,
        }
    }
}

fn default_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// A worker serving both pools
#[derive(Debug)]
pub struct Worker {
    ctx: PipelineContext,
    control: ControlChannel,
    cancels: CancelRegistry,
    semaphore: Arc<Semaphore>,
}

impl Worker {
    /// Create a worker; it registers itself when run
    pub fn new(ctx: PipelineContext, control: ControlChannel) -> Self {
        let semaphore = Arc::new(Semaphore::new(ctx.config.max_concurrent_tasks.max(1)));
        Self {
            ctx,
            control,
            cancels: CancelRegistry::new(),
            semaphore,
        }
    }

    /// Worker id
    pub fn id(&self) -> WorkerId {
        self.ctx.worker_id
    }

    /// Run on the current runtime until `shutdown` fires
    pub fn spawn(self, shutdown: &CancellationToken) -> WorkerHandle {
        let id = self.id();
        let shutdown = shutdown.child_token();
        let join = tokio::spawn(self.run(shutdown.clone()));
        WorkerHandle { id, shutdown, join }
    }

    /// Register, serve assignments until `shutdown`, then deregister.
    ///
    /// Pipelines still running at shutdown are aborted; deregistration hands their tasks
    /// back to the ready pool.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let worker_id = self.id();
        let control = self.control.subscribe();
        self.ctx
            .store
            .register_worker(WorkerRecord::new(worker_id, self.ctx.config.host.clone()))
            .await?;
        info!(
            "Worker {} registered on {} with {} slots",
            worker_id, self.ctx.config.host, self.ctx.config.max_concurrent_tasks
        );

        let mut services = JoinSet::new();
        services.spawn(heartbeat_loop(
            Arc::clone(&self.ctx.store),
            worker_id,
            self.ctx.config.heartbeat_interval,
            shutdown.clone(),
        ));
        services.spawn(control_loop(self.cancels.clone(), control, shutdown.clone()));

        let mut pipelines = JoinSet::new();
        let served = self.serve(&shutdown, &mut pipelines).await;

        let aborted = pipelines.len();
        pipelines.shutdown().await;
        services.shutdown().await;
        if aborted > 0 {
            warn!("Worker {} aborted {} running pipelines", worker_id, aborted);
        }
        self.ctx.store.deregister_worker(worker_id).await?;
        info!("Worker {} stopped", worker_id);
        served
    }

    async fn serve(&self, shutdown: &CancellationToken, pipelines: &mut JoinSet<()>) -> Result<()> {
        let mut poll = tokio::time::interval(self.ctx.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(()),
                _ = poll.tick() => {}
            }

            while let Some(Some(finished)) = pipelines.join_next().now_or_never() {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("Pipeline on worker {} panicked: {}", self.id(), e);
                    }
                }
            }

            for kind in TaskKind::ALL {
                let assigned = match self.ctx.store.assigned_to(kind, self.id()).await {
                    Ok(assigned) => assigned,
                    Err(e) => {
                        warn!("Worker {} could not read {} assignments: {}", self.id(), kind, e);
                        continue;
                    }
                };
                for task_id in assigned {
                    if self.cancels.is_running(task_id).await {
                        continue;
                    }
                    let permit = tokio::select! {
                        biased;
                        () = shutdown.cancelled() => return Ok(()),
                        permit = Arc::clone(&self.semaphore).acquire_owned() => permit.map_err(|e| {
                            Error::other(format!("Failed to acquire execution permit: {}", e))
                        })?,
                    };
                    self.launch(kind, task_id, permit, pipelines).await;
                }
            }
        }
    }

    async fn launch(
        &self,
        kind: TaskKind,
        task_id: TaskId,
        permit: OwnedSemaphorePermit,
        pipelines: &mut JoinSet<()>,
    ) {
        let scope = match self.scope_of(kind, task_id).await {
            Ok(scope) => scope,
            Err(e) => {
                warn!("Skipping {} {}: {}", kind, task_id, e);
                return;
            }
        };
        let token = self.cancels.register(scope).await;
        let ctx = self.ctx.clone();
        let cancels = self.cancels.clone();
        debug!("Worker {} starting {} {}", ctx.worker_id, kind, task_id);

        pipelines.spawn(async move {
            let outcome = match kind {
                TaskKind::Parent => run_parent(&ctx, task_id, &token).await.map(|p| p.status),
                TaskKind::Child => run_child(&ctx, task_id, &token).await.map(|c| c.status),
            };
            match outcome {
                Ok(status) => {
                    debug!("{} {} left worker {} as {}", kind, task_id, ctx.worker_id, status);
                }
                Err(Error::NotOwner { .. }) => {
                    info!("{} {} was reclaimed from worker {}", kind, task_id, ctx.worker_id);
                }
                Err(e) => {
                    error!("{} {} failed on worker {}: {}", kind, task_id, ctx.worker_id, e);
                }
            }
            cancels.unregister(task_id).await;
            drop(permit);
        });
    }

    async fn scope_of(&self, kind: TaskKind, task_id: TaskId) -> Result<TaskScope> {
        Ok(match kind {
            TaskKind::Parent => {
                let parent = self.ctx.store.get_parent(task_id).await?;
                TaskScope {
                    task_id,
                    parent_id: None,
                    top_id: parent.top_id,
                    tenant: parent.tenant,
                }
            }
            TaskKind::Child => {
                let child = self.ctx.store.get_child(task_id).await?;
                TaskScope {
                    task_id,
                    parent_id: Some(child.parent_id),
                    top_id: child.top_id,
                    tenant: child.tenant,
                }
            }
        })
    }
}

async fn heartbeat_loop(
    store: Arc<dyn TaskStore>,
    worker_id: WorkerId,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = store.heartbeat(worker_id, Utc::now()).await {
                    warn!("Heartbeat for worker {} failed: {}", worker_id, e);
                }
            }
        }
    }
}

async fn control_loop(
    cancels: CancelRegistry,
    mut actions: broadcast::Receiver<ControlAction>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            received = actions.recv() => match received {
                Ok(action) => {
                    cancels.apply(&action).await;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(
                        "Missed {} control actions; running pipelines rely on the store flag",
                        missed
                    );
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Handle to a spawned worker
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    shutdown: CancellationToken,
    join: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    /// Worker id
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Whether the worker task has exited
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop gracefully: abort running pipelines and deregister
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.join
            .await
            .map_err(|e| Error::other(format!("Worker task failed: {}", e)))?
    }

    /// Stop abruptly without deregistering; the worker goes silent until evicted
    pub fn kill(self) {
        warn!("Killing worker {}", self.id);
        self.join.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::StatisticsCollector;
    use crate::queue::WorkQueues;
    use ferrolift_io::{MemoryAdapter, StorageRegistry};
    use ferrolift_store::InMemoryTaskStore;
    use ferrolift_types::{ParentTask, TaskStatus, TopTask};

    struct Fixture {
        worker: Worker,
        memory: MemoryAdapter,
        store: Arc<InMemoryTaskStore>,
        control: ControlChannel,
    }

    async fn fixture(memory: MemoryAdapter) -> Fixture {
        let registry = StorageRegistry::new();
        registry.register("mem", Arc::new(memory.clone())).await;
        let store = Arc::new(InMemoryTaskStore::new());
        let control = ControlChannel::default();
        let ctx = PipelineContext {
            worker_id: WorkerId::new(),
            store: store.clone(),
            registry,
            queues: WorkQueues::new(),
            statistics: StatisticsCollector::new(),
            config: WorkerConfig {
                heartbeat_interval: Duration::from_millis(20),
                poll_interval: Duration::from_millis(10),
                max_concurrent_tasks: 4,
                buffer_size: 1024,
                ..WorkerConfig::default()
            },
        };
        Fixture {
            worker: Worker::new(ctx, control.clone()),
            memory,
            store,
            control,
        }
    }

    async fn wait_registered(store: &InMemoryTaskStore, id: WorkerId) {
        for _ in 0..100 {
            if store.workers().await.unwrap().iter().any(|w| w.id == id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker {} never registered", id);
    }

    /// Assign every ready task of `kind` to `worker` until the predicate holds
    async fn drive_until<F>(store: &InMemoryTaskStore, worker: WorkerId, mut done: F)
    where
        F: FnMut(&TopTask) -> bool,
    {
        for _ in 0..400 {
            for kind in TaskKind::ALL {
                for (_, id) in store.ready_ids(kind, 100).await.unwrap() {
                    store.assign(kind, id, worker).await.unwrap();
                }
            }
            let tops = store.list_tops("tenant-a", None, 10).await.unwrap();
            if tops.iter().all(|top| done(top)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn submit(store: &InMemoryTaskStore, source: &str) -> (TaskId, TaskId) {
        let top = TopTask::new("tenant-a", "alice");
        let parent = ParentTask::new(&top, source, "mem://mem/out", false);
        let parent_id = parent.id;
        let top = store.create_transfer(top, vec![parent]).await.unwrap();
        (top.id, parent_id)
    }

    #[tokio::test]
    async fn test_worker_runs_assigned_tasks() {
        let f = fixture(MemoryAdapter::new()).await;
        f.memory.insert("/in/a.bin", vec![1u8; 2048]).unwrap();
        f.memory.insert("/in/b.bin", vec![2u8; 2048]).unwrap();
        let (top_id, _) = submit(&f.store, "mem://mem/in").await;

        let id = f.worker.id();
        let shutdown = CancellationToken::new();
        let handle = f.worker.spawn(&shutdown);
        wait_registered(&f.store, id).await;

        drive_until(&f.store, id, |top| top.status.is_terminal()).await;
        let top = f.store.get_top(top_id).await.unwrap();
        assert_eq!(top.status, TaskStatus::Completed);
        assert_eq!(f.memory.get("/out/b.bin").unwrap().len(), 2048);

        handle.stop().await.unwrap();
        assert!(f.store.workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_control_action_cancels_running_child() {
        let memory = MemoryAdapter::new().with_read_throttle(1024, Duration::from_millis(10));
        let f = fixture(memory).await;
        f.memory.insert("/in/big.bin", vec![0u8; 1024 * 1024]).unwrap();
        let (top_id, parent_id) = submit(&f.store, "mem://mem/in").await;

        let id = f.worker.id();
        let shutdown = CancellationToken::new();
        let handle = f.worker.spawn(&shutdown);
        wait_registered(&f.store, id).await;

        // Drive until the single child is mid-copy
        drive_until(&f.store, id, |_| true).await;
        for _ in 0..200 {
            drive_until(&f.store, id, |_| true).await;
            let children = f.store.children_of(parent_id).await.unwrap();
            if children.iter().any(|c| c.bytes_transferred > 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(f.store.request_cancel(top_id).await.unwrap().accepted);
        f.control.publish(ControlAction::cancel(top_id, "tenant-a"));

        drive_until(&f.store, id, |top| top.status.is_terminal()).await;
        assert_eq!(f.store.get_top(top_id).await.unwrap().status, TaskStatus::Cancelled);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_killed_worker_stays_registered() {
        let f = fixture(MemoryAdapter::new()).await;
        let id = f.worker.id();
        let handle = f.worker.spawn(&CancellationToken::new());
        wait_registered(&f.store, id).await;

        handle.kill();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let workers = f.store.workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert!(Utc::now() - workers[0].last_heartbeat >= chrono::Duration::milliseconds(40));
    }

    #[test]
    fn test_worker_config_from_defaults() {
        let config = WorkerConfig::from_config(&Config::default()).unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(config.max_concurrent_tasks >= 1);
    }
}
