//! Child pipeline: copy one file, retrying transient failures

use super::{is_bookkeeping_error, sleep_or_cancel, PipelineContext, CANCELLED_BY_REQUEST};
use crate::monitor::ProgressThrottle;
use ferrolift_io::{copy_stream, ProgressReader, ProgressSample, TransferUri};
use ferrolift_types::{ChildTask, Error, Result, TaskId, TaskStatus};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run an assigned child to a terminal status
pub async fn run_child(
    ctx: &PipelineContext,
    id: TaskId,
    cancel: &CancellationToken,
) -> Result<ChildTask> {
    let child = ctx.store.get_child(id).await?;
    let mut attempts_made = child.retry_count;

    loop {
        if ctx.cancel_requested(id, cancel).await? {
            return cancelled(ctx, id).await;
        }
        if !ctx.config.retry.can_retry(attempts_made) {
            ctx.statistics.record_child_failed().await;
            return finish(
                ctx,
                id,
                TaskStatus::Failed,
                0,
                Some(format!("gave up after {} attempts", attempts_made)),
            )
            .await;
        }

        let attempt = ctx.store.begin_child_attempt(id, ctx.worker_id).await?;
        attempts_made = attempt.retry_count;
        ctx.statistics.record_child_attempt(attempts_made > 1).await;
        debug!(
            "Child {} attempt {}: {} -> {}",
            id, attempts_made, attempt.source, attempt.destination
        );

        let started = Instant::now();
        match copy_once(ctx, &attempt, cancel).await {
            Ok(bytes) => {
                if bytes != attempt.size {
                    debug!("Child {} copied {} bytes, listed size was {}", id, bytes, attempt.size);
                }
                ctx.statistics.record_child_completed(bytes, started.elapsed()).await;
                return finish(ctx, id, TaskStatus::Completed, bytes, None).await;
            }
            Err(Error::Cancelled) => {
                info!("Child {} cancelled mid-copy", id);
                return cancelled(ctx, id).await;
            }
            Err(e) if e.should_retry() && ctx.config.retry.can_retry(attempts_made) => {
                let delay = ctx.config.retry.delay_for_attempt(attempts_made - 1);
                warn!(
                    "Child {} attempt {} failed ({}), retrying in {:?}",
                    id, attempts_made, e, delay
                );
                if sleep_or_cancel(delay, cancel).await.is_err() {
                    return cancelled(ctx, id).await;
                }
            }
            Err(e) if is_bookkeeping_error(&e) => return Err(e),
            Err(e) => {
                warn!("Child {} failed after {} attempts: {}", id, attempts_made, e);
                ctx.statistics.record_child_failed().await;
                return finish(ctx, id, TaskStatus::Failed, 0, Some(e.to_string())).await;
            }
        }
    }
}

async fn cancelled(ctx: &PipelineContext, id: TaskId) -> Result<ChildTask> {
    ctx.statistics.record_child_cancelled().await;
    let reason = Some(CANCELLED_BY_REQUEST.to_string());
    finish(ctx, id, TaskStatus::Cancelled, 0, reason).await
}

async fn finish(
    ctx: &PipelineContext,
    id: TaskId,
    status: TaskStatus,
    bytes: u64,
    error: Option<String>,
) -> Result<ChildTask> {
    ctx.store
        .finish_child(id, ctx.worker_id, status, bytes, error)
        .await
}

/// One attempt: stream source to destination while persisting throttled progress
async fn copy_once(
    ctx: &PipelineContext,
    child: &ChildTask,
    cancel: &CancellationToken,
) -> Result<u64> {
    let source = TransferUri::parse(&child.source)?;
    let destination = TransferUri::parse(&child.destination)?;
    let reader = ctx.registry.resolve(&source).await?;
    let writer = ctx.registry.resolve(&destination).await?;

    let input = reader.open_read(source.path()).await?;
    let mut output = writer.open_write(destination.path()).await?;
    let (input, progress) = ProgressReader::new(input);
    let buffer_size = ctx.config.buffer_size;
    let copy_token = cancel.child_token();
    let stop = &copy_token;

    // The reader is dropped when the copy ends, which closes the progress channel
    let copy = async move {
        let mut input = input;
        copy_stream(
            &mut input,
            &mut output,
            buffer_size,
            stop,
            &child.source,
            &child.destination,
        )
        .await
    };
    let (copied, persisted) =
        tokio::join!(copy, persist_progress(ctx, child.id, progress, stop));
    persisted?;
    copied
}

/// Persist the latest progress sample once per window.
///
/// A task reclaimed from this worker fails the write with [`Error::NotOwner`]; `stop` is then
/// fired so the copy ends at its next chunk and never completes the destination.
async fn persist_progress(
    ctx: &PipelineContext,
    id: TaskId,
    mut progress: watch::Receiver<ProgressSample>,
    stop: &CancellationToken,
) -> Result<()> {
    let mut throttle = ProgressThrottle::new(ctx.config.progress_window);
    let mut ticker = throttle.ticker();
    loop {
        tokio::select! {
            changed = progress.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                throttle.offer(*progress.borrow_and_update());
            }
            _ = ticker.tick() => {
                let Some(sample) = throttle.take_pending() else {
                    continue;
                };
                match ctx.store.record_progress(id, ctx.worker_id, sample.bytes).await {
                    Ok(()) => {}
                    Err(e @ Error::NotOwner { .. }) => {
                        warn!(
                            "Child {} was reclaimed from worker {}, stopping copy",
                            id, ctx.worker_id
                        );
                        stop.cancel();
                        return Err(e);
                    }
                    Err(e) => debug!("Progress for child {} not recorded: {}", id, e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::WorkerConfig;
    use crate::monitor::StatisticsCollector;
    use crate::queue::WorkQueues;
    use ferrolift_io::{MemoryAdapter, StorageRegistry};
    use ferrolift_store::{InMemoryTaskStore, TaskStore};
    use ferrolift_types::{
        ChildSpec, ParentTask, RetryConfig, TaskKind, TopTask, WorkerId, WorkerRecord,
    };
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        ctx: PipelineContext,
        memory: MemoryAdapter,
        store: Arc<InMemoryTaskStore>,
    }

    async fn fixture(memory: MemoryAdapter, max_retries: u32) -> Fixture {
        let registry = StorageRegistry::new();
        registry.register("src", Arc::new(memory.clone())).await;
        registry.register("dst", Arc::new(memory.clone())).await;

        let store = Arc::new(InMemoryTaskStore::new());
        let worker_id = WorkerId::new();
        store
            .register_worker(WorkerRecord::new(worker_id, "test-host"))
            .await
            .unwrap();

        let config = WorkerConfig {
            retry: RetryConfig::new(
                max_retries,
                Duration::from_millis(1),
                Duration::from_millis(4),
                2.0,
            )
            .unwrap(),
            progress_window: Duration::from_millis(10),
            buffer_size: 1024,
            ..WorkerConfig::default()
        };
        let ctx = PipelineContext {
            worker_id,
            store: store.clone(),
            registry,
            queues: WorkQueues::new(),
            statistics: StatisticsCollector::new(),
            config,
        };
        Fixture { ctx, memory, store }
    }

    /// Stage one child for `/in/file.bin` and assign it to the fixture's worker
    async fn assigned_child(f: &Fixture, size: u64) -> TaskId {
        let top = TopTask::new("tenant-a", "alice");
        let parent =
            ParentTask::new(&top, "mem://src/in/file.bin", "mem://dst/out/file.bin", false);
        let parent_id = parent.id;
        f.store.create_transfer(top, vec![parent]).await.unwrap();

        let worker = f.ctx.worker_id;
        f.store.assign(TaskKind::Parent, parent_id, worker).await.unwrap();
        f.store.begin_staging(parent_id, worker).await.unwrap();
        let children = f
            .store
            .commit_staging(
                parent_id,
                worker,
                vec![ChildSpec {
                    source: "mem://src/in/file.bin".to_string(),
                    destination: "mem://dst/out/file.bin".to_string(),
                    size,
                }],
            )
            .await
            .unwrap();
        f.store.start_parent(parent_id, worker).await.unwrap();

        let id = children[0].id;
        assert!(f.store.assign(TaskKind::Child, id, worker).await.unwrap());
        id
    }

    #[tokio::test]
    async fn test_copy_completes_and_rolls_up() {
        let f = fixture(MemoryAdapter::new(), 5).await;
        f.memory.insert("/in/file.bin", vec![7u8; 10_240]).unwrap();
        let id = assigned_child(&f, 10_240).await;

        let child = run_child(&f.ctx, id, &CancellationToken::new()).await.unwrap();
        assert_eq!(child.status, TaskStatus::Completed);
        assert_eq!(child.bytes_transferred, 10_240);
        assert_eq!(child.retry_count, 1);
        assert_eq!(f.memory.get("/out/file.bin").unwrap().len(), 10_240);

        let parent = f.store.get_parent(child.parent_id).await.unwrap();
        assert_eq!(parent.status, TaskStatus::Completed);
        assert_eq!(parent.bytes_transferred, 10_240);
        let top = f.store.get_top(child.top_id).await.unwrap();
        assert_eq!(top.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_transient_fault_is_retried() {
        let f = fixture(MemoryAdapter::new(), 5).await;
        f.memory.insert("/in/file.bin", vec![7u8; 4096]).unwrap();
        f.memory.inject_read_faults("/in/file.bin", 2).unwrap();
        let id = assigned_child(&f, 4096).await;

        let child = run_child(&f.ctx, id, &CancellationToken::new()).await.unwrap();
        assert_eq!(child.status, TaskStatus::Completed);
        assert_eq!(child.retry_count, 3);
        assert_eq!(f.memory.read_opens("/in/file.bin"), 3);

        let stats = f.ctx.statistics.snapshot().await;
        assert_eq!(stats.child_attempts, 3);
        assert_eq!(stats.child_retries, 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let f = fixture(MemoryAdapter::new(), 5).await;
        f.memory.insert("/in/file.bin", vec![7u8; 4096]).unwrap();
        f.memory.inject_read_faults("/in/file.bin", 100).unwrap();
        let id = assigned_child(&f, 4096).await;

        let child = run_child(&f.ctx, id, &CancellationToken::new()).await.unwrap();
        assert_eq!(child.status, TaskStatus::Failed);
        assert_eq!(child.retry_count, 5);
        assert_eq!(f.memory.read_opens("/in/file.bin"), 5);
        assert!(child.error.is_some());
    }

    #[tokio::test]
    async fn test_permission_denied_is_not_retried() {
        let f = fixture(MemoryAdapter::new(), 5).await;
        f.memory.insert("/in/file.bin", vec![7u8; 16]).unwrap();
        f.memory.deny("/in/file.bin").unwrap();
        let id = assigned_child(&f, 16).await;

        let child = run_child(&f.ctx, id, &CancellationToken::new()).await.unwrap();
        assert_eq!(child.status, TaskStatus::Failed);
        assert_eq!(child.retry_count, 1);
        assert!(child.error.unwrap().contains("Permission denied"));
    }

    #[tokio::test]
    async fn test_cancel_mid_copy() {
        let memory = MemoryAdapter::new().with_read_throttle(1024, Duration::from_millis(20));
        let f = fixture(memory, 5).await;
        f.memory.insert("/in/file.bin", vec![7u8; 1024 * 1024]).unwrap();
        let id = assigned_child(&f, 1024 * 1024).await;

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            trigger.cancel();
        });

        let child = tokio::time::timeout(Duration::from_secs(5), run_child(&f.ctx, id, &token))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(child.status, TaskStatus::Cancelled);
        assert_eq!(child.error.as_deref(), Some(CANCELLED_BY_REQUEST));
    }

    #[tokio::test]
    async fn test_progress_is_persisted_while_copying() {
        let memory = MemoryAdapter::new().with_read_throttle(1024, Duration::from_millis(5));
        let f = fixture(memory, 5).await;
        f.memory.insert("/in/file.bin", vec![7u8; 64 * 1024]).unwrap();
        let id = assigned_child(&f, 64 * 1024).await;

        let ctx = f.ctx.clone();
        let running =
            tokio::spawn(async move { run_child(&ctx, id, &CancellationToken::new()).await });

        let mut seen = 0;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let child = f.store.get_child(id).await.unwrap();
            if child.status == TaskStatus::InProgress && child.bytes_transferred > 0 {
                seen = child.bytes_transferred;
                break;
            }
        }
        assert!(seen > 0 && seen < 64 * 1024);

        let child = running.await.unwrap().unwrap();
        assert_eq!(child.bytes_transferred, 64 * 1024);
    }

    #[tokio::test]
    async fn test_reclaimed_child_stops_copying() {
        let memory = MemoryAdapter::new().with_read_throttle(1024, Duration::from_millis(5));
        let f = fixture(memory, 5).await;
        f.memory.insert("/in/file.bin", vec![7u8; 64 * 1024]).unwrap();
        let id = assigned_child(&f, 64 * 1024).await;

        let ctx = f.ctx.clone();
        let running = tokio::spawn(async move {
            run_child(&ctx, id, &CancellationToken::new()).await
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        f.store.deregister_worker(f.ctx.worker_id).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_millis(200), running)
            .await
            .expect("copy kept running after the task was reclaimed")
            .unwrap();
        assert!(matches!(outcome, Err(Error::NotOwner { .. })));
        assert!(f.memory.get("/out/file.bin").is_none());

        let child = f.store.get_child(id).await.unwrap();
        assert_eq!(child.status, TaskStatus::InProgress);
        assert_eq!(child.assigned_worker, None);
    }

    #[tokio::test]
    async fn test_last_sample_before_a_stall_is_persisted() {
        let f = fixture(MemoryAdapter::new(), 5).await;
        let id = assigned_child(&f, 4096).await;
        f.store.begin_child_attempt(id, f.ctx.worker_id).await.unwrap();

        let (sender, receiver) = watch::channel(ProgressSample::zero());
        let ctx = f.ctx.clone();
        let persisting = tokio::spawn(async move {
            persist_progress(&ctx, id, receiver, &CancellationToken::new()).await
        });

        // A burst of reads inside one window, then nothing while the sender stays open
        for bytes in [1024, 2048, 3072] {
            sender
                .send(ProgressSample {
                    bytes,
                    at: Instant::now(),
                })
                .unwrap();
        }
        let mut persisted = 0;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            persisted = f.store.get_child(id).await.unwrap().bytes_transferred;
            if persisted == 3072 {
                break;
            }
        }
        assert_eq!(persisted, 3072);

        drop(sender);
        persisting.await.unwrap().unwrap();
    }
}
