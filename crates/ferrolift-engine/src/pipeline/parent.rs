//! Parent pipeline: stat and list the source, materialise one child per file

use super::{is_bookkeeping_error, sleep_or_cancel, PipelineContext, CANCELLED_BY_REQUEST};
use ferrolift_io::TransferUri;
use ferrolift_types::{
    ChildSpec, Error, FileInfo, ParentTask, Result, StorageAdapter, TaskId, TaskKind, TaskStatus,
};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run an assigned parent through staging.
///
/// Returns the parent as last written: IN_PROGRESS (or already rolled up) once its children
/// are published, FAILED or CANCELLED otherwise.
pub async fn run_parent(
    ctx: &PipelineContext,
    id: TaskId,
    cancel: &CancellationToken,
) -> Result<ParentTask> {
    let parent = ctx.store.get_parent(id).await?;
    if ctx.cancel_requested(parent.id, cancel).await? {
        return finish(ctx, id, TaskStatus::Cancelled, CANCELLED_BY_REQUEST.to_string()).await;
    }

    let parent = ctx.store.begin_staging(id, ctx.worker_id).await?;
    if parent.status == TaskStatus::Staged {
        debug!("Parent {} already staged, republishing children", id);
        return publish_and_start(ctx, id).await;
    }

    match stage(ctx, &parent, cancel).await {
        Ok(children) => {
            let count = children.len();
            ctx.store.commit_staging(id, ctx.worker_id, children).await?;
            ctx.statistics.record_parent_staged().await;
            info!("Parent {} staged with {} children", id, count);
            publish_and_start(ctx, id).await
        }
        Err(Error::Cancelled) => {
            finish(ctx, id, TaskStatus::Cancelled, CANCELLED_BY_REQUEST.to_string()).await
        }
        Err(Error::NotFound { path }) if parent.optional => {
            info!("Optional source {} not found, nothing to copy", path);
            ctx.store.commit_staging(id, ctx.worker_id, Vec::new()).await?;
            publish_and_start(ctx, id).await
        }
        Err(e) if is_bookkeeping_error(&e) => Err(e),
        Err(e) => {
            warn!("Parent {} failed during staging: {}", id, e);
            finish(ctx, id, TaskStatus::Failed, e.to_string()).await
        }
    }
}

async fn finish(
    ctx: &PipelineContext,
    id: TaskId,
    status: TaskStatus,
    error: String,
) -> Result<ParentTask> {
    ctx.store
        .finish_parent(id, ctx.worker_id, status, Some(error))
        .await
}

/// Publish the children still waiting to run and hand the parent over to roll-up
async fn publish_and_start(ctx: &PipelineContext, id: TaskId) -> Result<ParentTask> {
    let pending: Vec<TaskId> = ctx
        .store
        .children_of(id)
        .await?
        .into_iter()
        .filter(|child| !child.status.is_terminal())
        .map(|child| child.id)
        .collect();
    ctx.queues.get(TaskKind::Child).publish_all(pending).await;
    ctx.store.start_parent(id, ctx.worker_id).await
}

/// Resolve both systems, then stat and enumerate the source
async fn stage(
    ctx: &PipelineContext,
    parent: &ParentTask,
    cancel: &CancellationToken,
) -> Result<Vec<ChildSpec>> {
    let source = TransferUri::parse(&parent.source)?;
    let destination = TransferUri::parse(&parent.destination)?;
    let reader = ctx.registry.resolve(&source).await?;
    ctx.registry.resolve(&destination).await?;

    let root = with_retry(ctx, parent.id, cancel, || reader.stat(source.path())).await?;
    let children = if root.is_dir() {
        enumerate(ctx, parent.id, &reader, &root, &source, &destination, cancel).await?
    } else {
        vec![ChildSpec {
            source: source.to_string(),
            destination: destination.to_string(),
            size: root.size,
        }]
    };

    if ctx.cancel_requested(parent.id, cancel).await? {
        return Err(Error::Cancelled);
    }
    Ok(children)
}

/// Walk a source directory depth-first, one child per regular file
async fn enumerate(
    ctx: &PipelineContext,
    id: TaskId,
    reader: &Arc<dyn StorageAdapter>,
    root: &FileInfo,
    source: &TransferUri,
    destination: &TransferUri,
    cancel: &CancellationToken,
) -> Result<Vec<ChildSpec>> {
    let limits = &ctx.config;
    let mut children = Vec::new();
    let mut pending = vec![(root.path.clone(), 0usize)];

    while let Some((dir, depth)) = pending.pop() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if depth > limits.max_listing_depth {
            return Err(Error::other(format!(
                "{}: directory nesting exceeds {} levels",
                dir, limits.max_listing_depth
            )));
        }

        let entries = with_retry(ctx, id, cancel, || reader.list(&dir)).await?;
        for entry in entries {
            if entry.is_dir() {
                pending.push((entry.path, depth + 1));
                continue;
            }
            let relative = source.relative_to(&entry.path).ok_or_else(|| {
                Error::other(format!("{} listed outside of {}", entry.path, source))
            })?;
            children.push(ChildSpec {
                source: source.with_path(&entry.path).to_string(),
                destination: destination.join(relative).to_string(),
                size: entry.size,
            });
        }

        if children.len() > limits.max_children_per_parent {
            return Err(Error::other(format!(
                "{} holds more than {} files",
                source, limits.max_children_per_parent
            )));
        }
    }

    children.sort_by(|a, b| a.source.cmp(&b.source));
    Ok(children)
}

/// Retry a listing call on transient errors, counting each retry on the parent
async fn with_retry<T, F, Fut>(
    ctx: &PipelineContext,
    id: TaskId,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.should_retry() && ctx.config.retry.can_retry(attempts + 1) => {
                let delay = ctx.config.retry.delay_for_attempt(attempts);
                let retries = ctx.store.record_parent_retry(id, ctx.worker_id).await?;
                warn!(
                    "Listing for parent {} failed ({}), retry {} in {:?}",
                    id, e, retries, delay
                );
                sleep_or_cancel(delay, cancel).await?;
                attempts += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
