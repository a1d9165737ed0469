//! Task state machine
//!
//! Static transition tables for Parent and Child tasks, plus the roll-up rules that derive a
//! Parent's terminal status from its children and a Top task's status from its parents.
//! Everything here is pure; the task store calls it inside its transactions.

use crate::{Error, Result, TaskKind, TaskStatus};

use TaskStatus::{Accepted, Cancelled, Completed, Failed, InProgress, Paused, Staged, Staging};

const PARENT_FROM_ACCEPTED: &[TaskStatus] = &[Staging, Failed, Cancelled, Paused];
const PARENT_FROM_STAGING: &[TaskStatus] = &[Staged, Failed, Cancelled, Paused];
const PARENT_FROM_STAGED: &[TaskStatus] = &[InProgress, Failed, Cancelled, Paused];
const FROM_IN_PROGRESS: &[TaskStatus] = &[Completed, Failed, Cancelled, Paused];
const FROM_PAUSED: &[TaskStatus] = &[InProgress, Cancelled];
const CHILD_FROM_ACCEPTED: &[TaskStatus] = &[InProgress, Failed, Cancelled, Paused];
const NONE: &[TaskStatus] = &[];

/// Statuses reachable from `from` for the given task kind
pub fn allowed_transitions(kind: TaskKind, from: TaskStatus) -> &'static [TaskStatus] {
    match (kind, from) {
        (TaskKind::Parent, Accepted) => PARENT_FROM_ACCEPTED,
        (TaskKind::Parent, Staging) => PARENT_FROM_STAGING,
        (TaskKind::Parent, Staged) => PARENT_FROM_STAGED,
        (TaskKind::Child, Accepted) => CHILD_FROM_ACCEPTED,
        (_, InProgress) => FROM_IN_PROGRESS,
        (_, Paused) => FROM_PAUSED,
        _ => NONE,
    }
}

/// Check a single transition against the table
pub fn can_transition(kind: TaskKind, from: TaskStatus, to: TaskStatus) -> bool {
    allowed_transitions(kind, from).contains(&to)
}

/// Validate a transition, returning the new status
pub fn transition(kind: TaskKind, from: TaskStatus, to: TaskStatus) -> Result<TaskStatus> {
    if can_transition(kind, from, to) {
        Ok(to)
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

/// Terminal status of a parent once every child is terminal.
///
/// Returns `None` while any child is still running. Children of an optional parent are
/// optional themselves, so their failures never fail the parent.
pub fn roll_up_parent<I>(optional: bool, cancel_requested: bool, children: I) -> Option<TaskStatus>
where
    I: IntoIterator<Item = TaskStatus>,
{
    let mut any_failed = false;
    let mut any_cancelled = false;
    for status in children {
        match status {
            Failed => any_failed = true,
            Cancelled => any_cancelled = true,
            Completed => {}
            _ => return None,
        }
    }

    if !optional && any_failed {
        Some(Failed)
    } else if any_cancelled && (cancel_requested || !optional) {
        Some(Cancelled)
    } else {
        Some(Completed)
    }
}

/// Parent status and optional flag, as seen by the top-level roll-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentView {
    /// Current parent status
    pub status: TaskStatus,
    /// Whether the element is optional
    pub optional: bool,
}

/// Derive the Top task status from its parents.
///
/// A terminal `current` is returned unchanged.
pub fn derive_top_status(
    current: TaskStatus,
    cancel_requested: bool,
    parents: &[ParentView],
) -> TaskStatus {
    if current.is_terminal() {
        return current;
    }

    if parents.iter().any(|p| !p.optional && p.status == Failed) {
        return Failed;
    }

    if parents.iter().all(|p| p.status.is_terminal()) {
        let any_cancelled = parents.iter().any(|p| p.status == Cancelled);
        let required_cancelled = parents.iter().any(|p| !p.optional && p.status == Cancelled);
        return if (cancel_requested && any_cancelled) || required_cancelled {
            Cancelled
        } else {
            Completed
        };
    }

    if parents.iter().any(|p| p.status != Accepted) {
        InProgress
    } else {
        Accepted
    }
}
