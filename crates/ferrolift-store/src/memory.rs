//! In-memory task store
//!
//! All records live behind a single async mutex; each trait method takes the lock once, so
//! every operation is one serialisable transaction. Validation happens before any field is
//! written, which keeps rejected transitions free of partial mutations.

use crate::snapshot::StoreSnapshot;
use crate::traits::{CancelOutcome, TaskStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferrolift_types::state::{self, ParentView};
use ferrolift_types::{
    ChildSpec, ChildTask, Error, ParentTask, Result, TaskId, TaskKind, TaskStatus, TenantId,
    TopTask, WorkerId, WorkerRecord,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Records held by the store
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) tops: HashMap<TaskId, TopTask>,
    pub(crate) parents: HashMap<TaskId, ParentTask>,
    pub(crate) children: HashMap<TaskId, ChildTask>,
    pub(crate) children_by_parent: HashMap<TaskId, Vec<TaskId>>,
    pub(crate) workers: HashMap<WorkerId, WorkerRecord>,
    /// Parents and children with an accepted cancel below the Top level
    pub(crate) cancel_marks: HashSet<TaskId>,
}

/// Task store keeping every record in process memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<StoreState>>,
}

fn is_ready(kind: TaskKind, status: TaskStatus) -> bool {
    match kind {
        TaskKind::Parent => matches!(
            status,
            TaskStatus::Accepted | TaskStatus::Staging | TaskStatus::Staged
        ),
        TaskKind::Child => matches!(status, TaskStatus::Accepted | TaskStatus::InProgress),
    }
}

/// Validate and apply a status change with its timestamps
fn apply_status(
    kind: TaskKind,
    status: &mut TaskStatus,
    started_at: &mut Option<DateTime<Utc>>,
    ended_at: &mut Option<DateTime<Utc>>,
    to: TaskStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    *status = state::transition(kind, *status, to)?;
    if started_at.is_none() && !to.is_terminal() {
        *started_at = Some(now);
    }
    if to.is_terminal() {
        *ended_at = Some(now);
    }
    Ok(())
}

impl InMemoryTaskStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store populated from a snapshot; workers are not part of a snapshot
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::from(snapshot))),
        }
    }

    /// Capture every task record
    pub async fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.lock().await;
        StoreSnapshot::capture(&state)
    }
}

impl StoreState {
    fn top(&self, id: TaskId) -> Result<&TopTask> {
        self.tops.get(&id).ok_or(Error::TaskNotFound { id })
    }

    fn parent(&self, id: TaskId) -> Result<&ParentTask> {
        self.parents.get(&id).ok_or(Error::TaskNotFound { id })
    }

    fn child(&self, id: TaskId) -> Result<&ChildTask> {
        self.children.get(&id).ok_or(Error::TaskNotFound { id })
    }

    fn owned_parent(&mut self, id: TaskId, worker: WorkerId) -> Result<&mut ParentTask> {
        let parent = self.parents.get_mut(&id).ok_or(Error::TaskNotFound { id })?;
        if parent.assigned_worker == Some(worker) {
            Ok(parent)
        } else {
            Err(Error::NotOwner { task: id })
        }
    }

    fn owned_child(&mut self, id: TaskId, worker: WorkerId) -> Result<&mut ChildTask> {
        let child = self.children.get_mut(&id).ok_or(Error::TaskNotFound { id })?;
        if child.assigned_worker == Some(worker) {
            Ok(child)
        } else {
            Err(Error::NotOwner { task: id })
        }
    }

    fn cancel_requested(&self, top_id: TaskId) -> bool {
        self.tops.get(&top_id).is_some_and(|top| top.cancel_requested)
    }

    /// Whether a cancel was accepted for the task or one of its ancestors
    fn cancel_marked(&self, id: TaskId) -> Result<bool> {
        if let Some(top) = self.tops.get(&id) {
            return Ok(top.cancel_requested);
        }
        let (parent_id, top_id) = if let Some(parent) = self.parents.get(&id) {
            (parent.id, parent.top_id)
        } else if let Some(child) = self.children.get(&id) {
            (child.parent_id, child.top_id)
        } else {
            return Err(Error::TaskNotFound { id });
        };
        Ok(self.cancel_marks.contains(&id)
            || self.cancel_marks.contains(&parent_id)
            || self.cancel_requested(top_id))
    }

    fn child_ids(&self, parent_id: TaskId) -> Vec<TaskId> {
        self.children_by_parent
            .get(&parent_id)
            .cloned()
            .unwrap_or_default()
    }

    fn assignment(&self, kind: TaskKind, id: TaskId) -> Option<(TaskStatus, Option<WorkerId>)> {
        match kind {
            TaskKind::Parent => self.parents.get(&id).map(|p| (p.status, p.assigned_worker)),
            TaskKind::Child => self.children.get(&id).map(|c| (c.status, c.assigned_worker)),
        }
    }

    /// `(id, tenant, status, worker, created_at)` for every task of a kind
    fn rows(
        &self,
        kind: TaskKind,
    ) -> Vec<(TaskId, &TenantId, TaskStatus, Option<WorkerId>, DateTime<Utc>)> {
        match kind {
            TaskKind::Parent => self
                .parents
                .values()
                .map(|p| (p.id, &p.tenant, p.status, p.assigned_worker, p.created_at))
                .collect(),
            TaskKind::Child => self
                .children
                .values()
                .map(|c| (c.id, &c.tenant, c.status, c.assigned_worker, c.created_at))
                .collect(),
        }
    }

    fn set_assignment(&mut self, kind: TaskKind, id: TaskId, worker: Option<WorkerId>) {
        match kind {
            TaskKind::Parent => {
                if let Some(parent) = self.parents.get_mut(&id) {
                    parent.assigned_worker = worker;
                }
            }
            TaskKind::Child => {
                if let Some(child) = self.children.get_mut(&id) {
                    child.assigned_worker = worker;
                }
            }
        }
    }

    fn release_worker(&mut self, worker: WorkerId) -> usize {
        let mut released = 0;
        for parent in self.parents.values_mut() {
            if parent.assigned_worker == Some(worker) {
                parent.assigned_worker = None;
                released += 1;
            }
        }
        for child in self.children.values_mut() {
            if child.assigned_worker == Some(worker) {
                child.assigned_worker = None;
                released += 1;
            }
        }
        released
    }

    /// Move a child's byte count to `bytes`, keeping the parent aggregate in step
    fn set_child_bytes(&mut self, id: TaskId, bytes: u64) {
        let Some(child) = self.children.get_mut(&id) else {
            return;
        };
        let previous = std::mem::replace(&mut child.bytes_transferred, bytes);
        let parent_id = child.parent_id;
        if let Some(parent) = self.parents.get_mut(&parent_id) {
            parent.bytes_transferred = parent
                .bytes_transferred
                .saturating_sub(previous)
                .saturating_add(bytes);
        }
    }

    /// Roll a parent up once every child is terminal. Only an IN_PROGRESS parent rolls up.
    fn roll_up_parent(&mut self, parent_id: TaskId, now: DateTime<Utc>) -> Result<()> {
        let parent = self.parent(parent_id)?;
        if parent.status != TaskStatus::InProgress {
            return Ok(());
        }

        let children: Vec<&ChildTask> = self
            .children_by_parent
            .get(&parent_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.children.get(id))
            .collect();
        // Children only end CANCELLED through a cancel request on them or an ancestor
        let cancel_requested = self.cancel_requested(parent.top_id)
            || children.iter().any(|c| c.status == TaskStatus::Cancelled);
        let Some(outcome) = state::roll_up_parent(
            parent.optional,
            cancel_requested,
            children.iter().map(|c| c.status),
        ) else {
            return Ok(());
        };

        let failed: Vec<&&ChildTask> = children
            .iter()
            .filter(|c| c.status == TaskStatus::Failed)
            .collect();
        let error = match (outcome, failed.first()) {
            (TaskStatus::Failed, Some(first)) | (TaskStatus::Completed, Some(first)) => {
                Some(format!(
                    "{} of {} files failed; first: {}: {}",
                    failed.len(),
                    children.len(),
                    first.source,
                    first.error.as_deref().unwrap_or("unknown error")
                ))
            }
            (TaskStatus::Cancelled, _) => Some("transfer cancelled".to_string()),
            _ => None,
        };
        let bytes: u64 = children.iter().map(|c| c.bytes_transferred).sum();
        let top_id = parent.top_id;

        let parent = self
            .parents
            .get_mut(&parent_id)
            .ok_or(Error::TaskNotFound { id: parent_id })?;
        apply_status(
            TaskKind::Parent,
            &mut parent.status,
            &mut parent.started_at,
            &mut parent.ended_at,
            outcome,
            now,
        )?;
        parent.bytes_transferred = bytes;
        parent.error = error;
        parent.assigned_worker = None;
        info!("Parent {} rolled up to {}", parent_id, outcome);

        self.refresh_top(top_id, now)
    }

    /// Re-derive a Top task status from its parents
    fn refresh_top(&mut self, top_id: TaskId, now: DateTime<Utc>) -> Result<()> {
        let top = self.top(top_id)?;
        let parents: Vec<&ParentTask> = top
            .parent_ids
            .iter()
            .filter_map(|id| self.parents.get(id))
            .collect();
        let views: Vec<ParentView> = parents
            .iter()
            .map(|p| ParentView {
                status: p.status,
                optional: p.optional,
            })
            .collect();

        let next = state::derive_top_status(top.status, top.cancel_requested, &views);
        if next == top.status {
            return Ok(());
        }

        let error = match next {
            TaskStatus::Failed => parents
                .iter()
                .find(|p| !p.optional && p.status == TaskStatus::Failed)
                .map(|p| {
                    format!(
                        "{}: {}",
                        p.source,
                        p.error.as_deref().unwrap_or("transfer failed")
                    )
                }),
            TaskStatus::Cancelled => Some("transfer cancelled".to_string()),
            _ => None,
        };

        let top = self
            .tops
            .get_mut(&top_id)
            .ok_or(Error::TaskNotFound { id: top_id })?;
        top.status = next;
        if next != TaskStatus::Accepted && top.started_at.is_none() {
            top.started_at = Some(now);
        }
        if next.is_terminal() {
            top.ended_at = Some(now);
            info!("Transfer {} finished as {}", top_id, next);
        }
        if error.is_some() {
            top.error = error;
        }
        Ok(())
    }

    /// Cancel an unassigned non-terminal child; an assigned one is reported in flight
    fn cancel_child(
        &mut self,
        id: TaskId,
        outcome: &mut CancelOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let child = self.children.get_mut(&id).ok_or(Error::TaskNotFound { id })?;
        if child.status.is_terminal() {
            return Ok(());
        }
        if child.assigned_worker.is_some() {
            outcome.in_flight.push(id);
            return Ok(());
        }
        apply_status(
            TaskKind::Child,
            &mut child.status,
            &mut child.started_at,
            &mut child.ended_at,
            TaskStatus::Cancelled,
            now,
        )?;
        child.error = Some("cancelled by request".to_string());
        outcome.cancelled.push(id);
        Ok(())
    }

    /// Cancel a parent and its children as far as no worker holds them
    fn cancel_parent(
        &mut self,
        id: TaskId,
        outcome: &mut CancelOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let parent = self.parent(id)?;
        if parent.status.is_terminal() {
            return Ok(());
        }
        let held = parent.assigned_worker.is_some();
        let status = parent.status;

        for child_id in self.child_ids(id) {
            self.cancel_child(child_id, outcome, now)?;
        }

        if held {
            outcome.in_flight.push(id);
        } else if status == TaskStatus::InProgress {
            self.roll_up_parent(id, now)?;
        } else {
            let parent = self.parents.get_mut(&id).ok_or(Error::TaskNotFound { id })?;
            apply_status(
                TaskKind::Parent,
                &mut parent.status,
                &mut parent.started_at,
                &mut parent.ended_at,
                TaskStatus::Cancelled,
                now,
            )?;
            parent.error = Some("cancelled by request".to_string());
            outcome.cancelled.push(id);
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_transfer(&self, mut top: TopTask, parents: Vec<ParentTask>) -> Result<TopTask> {
        if parents.is_empty() {
            return Err(Error::invalid_request("a transfer needs at least one element"));
        }
        if let Some(stray) = parents.iter().find(|p| p.top_id != top.id) {
            return Err(Error::invalid_request(format!(
                "parent {} does not belong to transfer {}",
                stray.id, top.id
            )));
        }

        let mut state = self.state.lock().await;
        if state.tops.contains_key(&top.id) {
            return Err(Error::store(format!("transfer {} already exists", top.id)));
        }

        top.parent_ids = parents.iter().map(|p| p.id).collect();
        for parent in parents {
            state.parents.insert(parent.id, parent);
        }
        state.tops.insert(top.id, top.clone());
        info!(
            "Accepted transfer {} for tenant {} with {} elements",
            top.id,
            top.tenant,
            top.parent_ids.len()
        );
        Ok(top)
    }

    async fn get_top(&self, id: TaskId) -> Result<TopTask> {
        self.state.lock().await.top(id).cloned()
    }

    async fn list_tops(
        &self,
        tenant: &str,
        user: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TopTask>> {
        let state = self.state.lock().await;
        let mut tops: Vec<TopTask> = state
            .tops
            .values()
            .filter(|t| t.tenant == tenant && user.map_or(true, |u| t.user == u))
            .cloned()
            .collect();
        tops.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        tops.truncate(limit);
        Ok(tops)
    }

    async fn get_parent(&self, id: TaskId) -> Result<ParentTask> {
        self.state.lock().await.parent(id).cloned()
    }

    async fn get_child(&self, id: TaskId) -> Result<ChildTask> {
        self.state.lock().await.child(id).cloned()
    }

    async fn parents_of(&self, top_id: TaskId) -> Result<Vec<ParentTask>> {
        let state = self.state.lock().await;
        let top = state.top(top_id)?;
        Ok(top
            .parent_ids
            .iter()
            .filter_map(|id| state.parents.get(id).cloned())
            .collect())
    }

    async fn children_of(&self, parent_id: TaskId) -> Result<Vec<ChildTask>> {
        let state = self.state.lock().await;
        state.parent(parent_id)?;
        Ok(state
            .child_ids(parent_id)
            .iter()
            .filter_map(|id| state.children.get(id).cloned())
            .collect())
    }

    async fn contains(&self, kind: TaskKind, id: TaskId) -> Result<bool> {
        Ok(self.state.lock().await.assignment(kind, id).is_some())
    }

    async fn status_counts(&self, kind: TaskKind) -> Result<HashMap<TaskStatus, usize>> {
        let state = self.state.lock().await;
        let mut counts = HashMap::new();
        for (_, _, status, _, _) in state.rows(kind) {
            *counts.entry(status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn request_cancel(&self, id: TaskId) -> Result<CancelOutcome> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let (top_id, terminal) = if let Some(top) = state.tops.get(&id) {
            (top.id, top.status.is_terminal())
        } else if let Some(parent) = state.parents.get(&id) {
            (parent.top_id, parent.status.is_terminal())
        } else if let Some(child) = state.children.get(&id) {
            (child.top_id, child.status.is_terminal())
        } else {
            return Err(Error::TaskNotFound { id });
        };

        let top = state.top(top_id)?;
        let mut outcome = CancelOutcome {
            top_id,
            tenant: top.tenant.clone(),
            accepted: false,
            cancelled: Vec::new(),
            in_flight: Vec::new(),
        };
        if terminal || top.status.is_terminal() {
            debug!("Cancel of {} ignored, already terminal", id);
            return Ok(outcome);
        }
        outcome.accepted = true;

        if id == top_id {
            if let Some(top) = state.tops.get_mut(&top_id) {
                top.cancel_requested = true;
            }
            let parent_ids = state.top(top_id)?.parent_ids.clone();
            for parent_id in parent_ids {
                state.cancel_parent(parent_id, &mut outcome, now)?;
            }
        } else if state.parents.contains_key(&id) {
            state.cancel_marks.insert(id);
            state.cancel_parent(id, &mut outcome, now)?;
        } else {
            state.cancel_marks.insert(id);
            state.cancel_child(id, &mut outcome, now)?;
            let parent_id = state.child(id)?.parent_id;
            state.roll_up_parent(parent_id, now)?;
        }
        state.refresh_top(top_id, now)?;

        info!(
            "Cancel accepted for {}: {} cancelled, {} in flight",
            id,
            outcome.cancelled.len(),
            outcome.in_flight.len()
        );
        Ok(outcome)
    }

    async fn is_cancel_requested(&self, id: TaskId) -> Result<bool> {
        self.state.lock().await.cancel_marked(id)
    }

    async fn register_worker(&self, worker: WorkerRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        info!("Registered worker {} on {}", worker.id, worker.host);
        state.workers.insert(worker.id, worker);
        Ok(())
    }

    async fn heartbeat(&self, worker: WorkerId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.workers.get_mut(&worker) {
            Some(record) => record.last_heartbeat = at,
            None => {
                warn!("Heartbeat from unknown worker {}, re-registering", worker);
                state.workers.insert(
                    worker,
                    WorkerRecord {
                        id: worker,
                        host: "unknown".to_string(),
                        registered_at: at,
                        last_heartbeat: at,
                    },
                );
            }
        }
        Ok(())
    }

    async fn deregister_worker(&self, worker: WorkerId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.workers.remove(&worker);
        let released = state.release_worker(worker);
        info!("Deregistered worker {}, released {} tasks", worker, released);
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<WorkerRecord>> {
        let state = self.state.lock().await;
        let mut workers: Vec<WorkerRecord> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.id.cmp(&b.id)));
        Ok(workers)
    }

    async fn evict_stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerId>> {
        let mut state = self.state.lock().await;
        let stale: Vec<WorkerId> = state
            .workers
            .values()
            .filter(|w| !w.is_live(cutoff))
            .map(|w| w.id)
            .collect();
        for id in &stale {
            state.workers.remove(id);
            warn!("Evicted stale worker {}", id);
        }
        Ok(stale)
    }

    async fn clear_orphaned_assignments(&self, kind: TaskKind) -> Result<usize> {
        let mut state = self.state.lock().await;
        let orphaned: Vec<(TaskId, WorkerId)> = state
            .rows(kind)
            .into_iter()
            .filter_map(|(id, _, _, worker, _)| worker.map(|w| (id, w)))
            .filter(|(_, worker)| !state.workers.contains_key(worker))
            .collect();

        for (id, worker) in &orphaned {
            state.set_assignment(kind, *id, None);
            warn!("Reclaimed {} task {} from dead worker {}", kind, id, worker);
        }
        Ok(orphaned.len())
    }

    async fn backlogs(&self, kind: TaskKind) -> Result<HashMap<WorkerId, usize>> {
        let state = self.state.lock().await;
        let mut backlogs: HashMap<WorkerId, usize> =
            state.workers.keys().map(|id| (*id, 0)).collect();
        for (_, _, status, worker, _) in state.rows(kind) {
            if let Some(count) = worker
                .filter(|_| !status.is_terminal())
                .and_then(|w| backlogs.get_mut(&w))
            {
                *count += 1;
            }
        }
        Ok(backlogs)
    }

    async fn ready_ids(&self, kind: TaskKind, limit: usize) -> Result<Vec<(TenantId, TaskId)>> {
        let state = self.state.lock().await;
        let mut ready: Vec<_> = state
            .rows(kind)
            .into_iter()
            .filter(|(_, _, status, worker, _)| worker.is_none() && is_ready(kind, *status))
            .collect();
        ready.sort_by(|a, b| a.4.cmp(&b.4).then(a.0.cmp(&b.0)));

        let mut taken: HashMap<&TenantId, usize> = HashMap::new();
        Ok(ready
            .into_iter()
            .filter(|(_, tenant, _, _, _)| {
                let count = taken.entry(*tenant).or_insert(0);
                *count += 1;
                *count <= limit
            })
            .map(|(id, tenant, _, _, _)| (tenant.clone(), id))
            .collect())
    }

    async fn assign(&self, kind: TaskKind, id: TaskId, worker: WorkerId) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.workers.contains_key(&worker) {
            return Ok(false);
        }
        match state.assignment(kind, id) {
            Some((status, None)) if is_ready(kind, status) => {
                state.set_assignment(kind, id, Some(worker));
                debug!("Assigned {} task {} to worker {}", kind, id, worker);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::TaskNotFound { id }),
        }
    }

    async fn assigned_to(&self, kind: TaskKind, worker: WorkerId) -> Result<Vec<TaskId>> {
        let state = self.state.lock().await;
        let mut owned: Vec<_> = state
            .rows(kind)
            .into_iter()
            .filter(|(_, _, status, owner, _)| *owner == Some(worker) && !status.is_terminal())
            .collect();
        owned.sort_by(|a, b| a.4.cmp(&b.4).then(a.0.cmp(&b.0)));
        Ok(owned.into_iter().map(|row| row.0).collect())
    }

    async fn begin_staging(&self, id: TaskId, worker: WorkerId) -> Result<ParentTask> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let parent = state.owned_parent(id, worker)?;
        let current = parent.status;
        match current {
            TaskStatus::Accepted => apply_status(
                TaskKind::Parent,
                &mut parent.status,
                &mut parent.started_at,
                &mut parent.ended_at,
                TaskStatus::Staging,
                now,
            )?,
            TaskStatus::Staging | TaskStatus::Staged => {
                debug!("Resuming parent {} in {}", id, current);
            }
            from => {
                return Err(Error::InvalidTransition {
                    from,
                    to: TaskStatus::Staging,
                })
            }
        }
        let parent = parent.clone();
        state.refresh_top(parent.top_id, now)?;
        Ok(parent)
    }

    async fn record_parent_retry(&self, id: TaskId, worker: WorkerId) -> Result<u32> {
        let mut state = self.state.lock().await;
        let parent = state.owned_parent(id, worker)?;
        parent.retry_count += 1;
        Ok(parent.retry_count)
    }

    async fn commit_staging(
        &self,
        id: TaskId,
        worker: WorkerId,
        children: Vec<ChildSpec>,
    ) -> Result<Vec<ChildTask>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let parent = state.owned_parent(id, worker)?;
        state::transition(TaskKind::Parent, parent.status, TaskStatus::Staged)?;

        let created: Vec<ChildTask> = children
            .into_iter()
            .map(|spec| ChildTask::new(&*parent, spec))
            .collect();
        let total: u64 = created.iter().map(|c| c.size).sum();

        apply_status(
            TaskKind::Parent,
            &mut parent.status,
            &mut parent.started_at,
            &mut parent.ended_at,
            TaskStatus::Staged,
            now,
        )?;
        parent.total_bytes = Some(total);
        parent.child_count = created.len();
        parent.bytes_transferred = 0;

        state
            .children_by_parent
            .insert(id, created.iter().map(|c| c.id).collect());
        for child in &created {
            state.children.insert(child.id, child.clone());
        }
        info!(
            "Parent {} staged {} children, {} bytes",
            id,
            created.len(),
            total
        );
        Ok(created)
    }

    async fn start_parent(&self, id: TaskId, worker: WorkerId) -> Result<ParentTask> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let parent = state.owned_parent(id, worker)?;
        apply_status(
            TaskKind::Parent,
            &mut parent.status,
            &mut parent.started_at,
            &mut parent.ended_at,
            TaskStatus::InProgress,
            now,
        )?;
        parent.assigned_worker = None;
        let top_id = parent.top_id;

        state.roll_up_parent(id, now)?;
        state.refresh_top(top_id, now)?;
        state.parent(id).cloned()
    }

    async fn finish_parent(
        &self,
        id: TaskId,
        worker: WorkerId,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<ParentTask> {
        if !status.is_terminal() {
            return Err(Error::invalid_request(format!(
                "{status} is not a terminal status"
            )));
        }

        let mut state = self.state.lock().await;
        let now = Utc::now();
        let parent = state.owned_parent(id, worker)?;
        apply_status(
            TaskKind::Parent,
            &mut parent.status,
            &mut parent.started_at,
            &mut parent.ended_at,
            status,
            now,
        )?;
        parent.assigned_worker = None;
        parent.error = error;
        let top_id = parent.top_id;

        let mut stranded = CancelOutcome {
            top_id,
            tenant: parent.tenant.clone(),
            accepted: true,
            cancelled: Vec::new(),
            in_flight: Vec::new(),
        };
        for child_id in state.child_ids(id) {
            state.cancel_child(child_id, &mut stranded, now)?;
        }

        info!("Parent {} finished as {}", id, status);
        state.refresh_top(top_id, now)?;
        state.parent(id).cloned()
    }

    async fn begin_child_attempt(&self, id: TaskId, worker: WorkerId) -> Result<ChildTask> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let child = state.owned_child(id, worker)?;
        let current = child.status;
        match current {
            TaskStatus::Accepted => apply_status(
                TaskKind::Child,
                &mut child.status,
                &mut child.started_at,
                &mut child.ended_at,
                TaskStatus::InProgress,
                now,
            )?,
            TaskStatus::InProgress => {}
            from => {
                return Err(Error::InvalidTransition {
                    from,
                    to: TaskStatus::InProgress,
                })
            }
        }
        child.retry_count += 1;
        state.set_child_bytes(id, 0);
        state.child(id).cloned()
    }

    async fn record_progress(&self, id: TaskId, worker: WorkerId, bytes: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.owned_child(id, worker)?;
        state.set_child_bytes(id, bytes);
        Ok(())
    }

    async fn finish_child(
        &self,
        id: TaskId,
        worker: WorkerId,
        status: TaskStatus,
        bytes_transferred: u64,
        error: Option<String>,
    ) -> Result<ChildTask> {
        if !status.is_terminal() {
            return Err(Error::invalid_request(format!(
                "{status} is not a terminal status"
            )));
        }

        let mut state = self.state.lock().await;
        let now = Utc::now();
        let child = state.owned_child(id, worker)?;
        apply_status(
            TaskKind::Child,
            &mut child.status,
            &mut child.started_at,
            &mut child.ended_at,
            status,
            now,
        )?;
        child.assigned_worker = None;
        child.error = error;
        let parent_id = child.parent_id;

        state.set_child_bytes(id, bytes_transferred);
        debug!("Child {} finished as {}", id, status);
        state.roll_up_parent(parent_id, now)?;
        state.child(id).cloned()
    }
}
