//! Dispatcher for assigning ready tasks to live workers
//!
//! One dispatcher runs two independent loops, one for the Parent pool and one for the Child
//! pool. Each cycle evicts stale workers, reclaims their assignments, takes in newly
//! published work, and hands a fairly ordered batch of ready tasks to the workers whose
//! backlog is below the threshold. Exclusive ownership is enforced by the task store's
//! atomic assignment, never by this in-memory view.
//!
//! The ready queues only wake the dispatcher; the batch is always read from the task store,
//! never from the deliveries taken off a queue.

use crate::queue::{WorkQueue, WorkQueues};
use chrono::Utc;
use ferrolift_config::Config;
use ferrolift_store::TaskStore;
use ferrolift_types::{Error, Result, TaskId, TaskKind, TenantId, WorkerId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Heartbeat age after which a worker is dead
    pub heartbeat_timeout: Duration,
    /// Workers with fewer assigned tasks than this need work
    pub backlog_threshold: usize,
    /// Upper bound on ready rows read per tenant per cycle
    pub max_ready_rows: usize,
    /// Upper bound on assignments per cycle
    pub max_batch_size: usize,
    /// First idle sleep
    pub idle_backoff_base: Duration,
    /// Longest idle sleep
    pub idle_backoff_max: Duration,
    /// Queue deliveries taken per cycle
    pub queue_prefetch: usize,
}

impl SchedulerConfig {
    /// Create scheduler config from main config
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_timeout: config.dispatch.heartbeat_timeout(),
            backlog_threshold: config.dispatch.backlog_threshold,
            max_ready_rows: config.dispatch.max_ready_rows,
            max_batch_size: config.dispatch.max_batch_size,
            idle_backoff_base: config.dispatch.idle_backoff_base(),
            idle_backoff_max: config.dispatch.idle_backoff_max(),
            queue_prefetch: config.dispatch.queue_prefetch,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What one dispatcher cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Workers dropped for a stale heartbeat
    pub workers_evicted: usize,
    /// Assignments cleared because their worker is gone
    pub assignments_reclaimed: usize,
    /// Queue deliveries acknowledged
    pub intake_acked: usize,
    /// Queue deliveries handed back to the queue
    pub intake_requeued: usize,
    /// Workers below the backlog threshold
    pub needy_workers: usize,
    /// Tasks assigned
    pub assigned: usize,
}

/// Order ready ids for cross-tenant fairness.
///
/// Ids are grouped per tenant, keeping their order, and tenants are visited round-robin in
/// order of first appearance, one id per visit, until `limit` ids are taken.
pub fn fair_interleave(ready: Vec<(TenantId, TaskId)>, limit: usize) -> Vec<TaskId> {
    let mut tenants: Vec<TenantId> = Vec::new();
    let mut lists: HashMap<TenantId, VecDeque<TaskId>> = HashMap::new();
    for (tenant, id) in ready {
        lists
            .entry(tenant.clone())
            .or_insert_with(|| {
                tenants.push(tenant);
                VecDeque::new()
            })
            .push_back(id);
    }

    let mut batch = Vec::with_capacity(limit);
    while batch.len() < limit {
        let before = batch.len();
        for tenant in &tenants {
            if batch.len() == limit {
                break;
            }
            if let Some(id) = lists.get_mut(tenant).and_then(VecDeque::pop_front) {
                batch.push(id);
            }
        }
        if batch.len() == before {
            break;
        }
    }
    batch
}

/// Split a batch into contiguous chunks of `ceil(batch / workers)`, one per worker
pub fn distribute(batch: &[TaskId], workers: &[WorkerId]) -> Vec<(WorkerId, Vec<TaskId>)> {
    if batch.is_empty() || workers.is_empty() {
        return Vec::new();
    }
    let chunk = batch.len().div_ceil(workers.len());
    workers
        .iter()
        .zip(batch.chunks(chunk))
        .map(|(worker, ids)| (*worker, ids.to_vec()))
        .collect()
}

/// Task dispatcher
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    queues: WorkQueues,
    config: SchedulerConfig,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(store: Arc<dyn TaskStore>, queues: WorkQueues, config: SchedulerConfig) -> Self {
        Self {
            store,
            queues,
            config,
        }
    }

    /// Dispatcher configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one cycle for a pool
    pub async fn run_cycle(&self, kind: TaskKind) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let window = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .map_err(|e| Error::config(format!("Invalid heartbeat timeout: {}", e)))?;
        report.workers_evicted = self.store.evict_stale_workers(Utc::now() - window).await?.len();
        report.assignments_reclaimed = self.store.clear_orphaned_assignments(kind).await?;

        self.intake(kind, self.queues.get(kind), &mut report).await;

        let backlogs = self.store.backlogs(kind).await?;
        let mut needy: Vec<(WorkerId, usize)> = backlogs
            .into_iter()
            .filter(|(_, backlog)| *backlog < self.config.backlog_threshold)
            .collect();
        needy.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        report.needy_workers = needy.len();
        if needy.is_empty() {
            return Ok(report);
        }

        let deficit: usize = needy
            .iter()
            .map(|(_, backlog)| self.config.backlog_threshold - backlog)
            .sum();
        let limit = self.config.max_batch_size.min(deficit);
        let ready = self
            .store
            .ready_ids(kind, self.config.max_ready_rows)
            .await?;
        let batch = fair_interleave(ready, limit);

        let workers: Vec<WorkerId> = needy.iter().map(|(worker, _)| *worker).collect();
        for (worker, ids) in distribute(&batch, &workers) {
            for id in ids {
                if self.store.assign(kind, id, worker).await? {
                    report.assigned += 1;
                } else {
                    debug!("{} task {} was no longer assignable", kind, id);
                }
            }
        }
        Ok(report)
    }

    /// Acknowledge deliveries the store has recorded; requeue on store errors
    async fn intake(&self, kind: TaskKind, queue: &WorkQueue, report: &mut CycleReport) {
        for delivery in queue.consume(self.config.queue_prefetch).await {
            match self.store.contains(kind, delivery.task_id).await {
                Ok(true) => {
                    queue.ack(delivery.tag).await;
                    report.intake_acked += 1;
                }
                Ok(false) => {
                    warn!(
                        "Dropping {} delivery for unknown task {}",
                        queue.name(),
                        delivery.task_id
                    );
                    queue.nack(delivery.tag, false).await;
                }
                Err(e) => {
                    warn!(
                        "Requeueing {} delivery for {}: {}",
                        queue.name(),
                        delivery.task_id,
                        e
                    );
                    queue.nack(delivery.tag, true).await;
                    report.intake_requeued += 1;
                }
            }
        }
    }

    /// Run the loop for one pool until `shutdown` fires
    pub async fn run_pool(&self, kind: TaskKind, shutdown: CancellationToken) {
        info!("Dispatcher loop for {} pool started", kind);
        let queue = self.queues.get(kind).clone();
        let mut backoff = self.config.idle_backoff_base;

        while !shutdown.is_cancelled() {
            let assigned = match self.run_cycle(kind).await {
                Ok(report) => {
                    debug!("Dispatcher {} cycle: {:?}", kind, report);
                    report.assigned > 0
                }
                Err(e) => {
                    error!("Dispatcher {} cycle failed: {}", kind, e);
                    false
                }
            };

            if assigned {
                backoff = self.config.idle_backoff_base;
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = queue.published() => {}
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.idle_backoff_max);
        }
        info!("Dispatcher loop for {} pool stopped", kind);
    }

    /// Spawn both pool loops
    pub fn spawn(self: Arc<Self>, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        TaskKind::ALL
            .into_iter()
            .map(|kind| {
                let dispatcher = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { dispatcher.run_pool(kind, shutdown).await })
            })
            .collect()
    }
}
