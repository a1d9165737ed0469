//! JSON snapshots of the task store
//!
//! A snapshot carries every task record but no workers: after a restore, workers register
//! again and assignments held by the old ones are reclaimed as orphans on the first
//! dispatcher cycle.

use crate::memory::{InMemoryTaskStore, StoreState};
use chrono::{DateTime, Utc};
use ferrolift_types::{ChildTask, Error, ParentTask, Result, TopTask};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serializable copy of every task record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Format version
    pub version: u32,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
    /// Top tasks
    pub tops: Vec<TopTask>,
    /// Parent tasks
    pub parents: Vec<ParentTask>,
    /// Child tasks, grouped by parent in staging order
    pub children: Vec<ChildTask>,
}

impl StoreSnapshot {
    pub(crate) fn capture(state: &StoreState) -> Self {
        let mut tops: Vec<TopTask> = state.tops.values().cloned().collect();
        tops.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let parents: Vec<ParentTask> = tops
            .iter()
            .flat_map(|top| top.parent_ids.iter())
            .filter_map(|id| state.parents.get(id).cloned())
            .collect();
        let children: Vec<ChildTask> = parents
            .iter()
            .filter_map(|p| state.children_by_parent.get(&p.id))
            .flatten()
            .filter_map(|id| state.children.get(id).cloned())
            .collect();

        Self {
            version: SNAPSHOT_VERSION,
            taken_at: Utc::now(),
            tops,
            parents,
            children,
        }
    }
}

impl From<StoreSnapshot> for StoreState {
    fn from(snapshot: StoreSnapshot) -> Self {
        let mut children_by_parent: HashMap<_, Vec<_>> = HashMap::new();
        for child in &snapshot.children {
            children_by_parent
                .entry(child.parent_id)
                .or_default()
                .push(child.id);
        }

        Self {
            tops: snapshot.tops.into_iter().map(|t| (t.id, t)).collect(),
            parents: snapshot.parents.into_iter().map(|p| (p.id, p)).collect(),
            children: snapshot.children.into_iter().map(|c| (c.id, c)).collect(),
            children_by_parent,
            workers: HashMap::new(),
            cancel_marks: HashSet::new(),
        }
    }
}

impl InMemoryTaskStore {
    /// Write every task record to `path` as JSON
    pub async fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let snapshot = self.snapshot().await;
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| Error::store(format!("Failed to serialize snapshot: {}", e)))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::from_io(&e, parent.display().to_string()))?;
        }
        fs::write(path, data)
            .await
            .map_err(|e| Error::from_io(&e, path.display().to_string()))?;

        info!(
            "Saved snapshot with {} transfers to {}",
            snapshot.tops.len(),
            path.display()
        );
        Ok(())
    }

    /// Restore a store from a snapshot written by [`save_snapshot`](Self::save_snapshot)
    pub async fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .await
            .map_err(|e| Error::from_io(&e, path.display().to_string()))?;
        let snapshot: StoreSnapshot = serde_json::from_slice(&data).map_err(|e| {
            Error::store(format!(
                "Failed to parse snapshot '{}': {}",
                path.display(),
                e
            ))
        })?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::store(format!(
                "Unsupported snapshot version {} in '{}'",
                snapshot.version,
                path.display()
            )));
        }

        debug!(
            "Loaded snapshot taken at {} with {} children",
            snapshot.taken_at,
            snapshot.children.len()
        );
        Ok(Self::from_snapshot(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskStore;
    use ferrolift_types::{ChildSpec, TaskKind, TaskStatus, WorkerId, WorkerRecord};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_restores_tasks_but_not_workers() {
        let store = InMemoryTaskStore::new();
        let top = TopTask::new("tenant-a", "alice");
        let parent = ParentTask::new(&top, "mem://a/data", "mem://b/data", false);
        let top = store.create_transfer(top, vec![parent.clone()]).await.unwrap();

        let worker = WorkerId::new();
        let now = Utc::now();
        store
            .register_worker(WorkerRecord {
                id: worker,
                host: "node-1".to_string(),
                registered_at: now,
                last_heartbeat: now,
            })
            .await
            .unwrap();
        store.assign(TaskKind::Parent, parent.id, worker).await.unwrap();
        store.begin_staging(parent.id, worker).await.unwrap();
        let spec = ChildSpec {
            source: "/data/a.bin".to_string(),
            destination: "/data/a.bin".to_string(),
            size: 42,
        };
        store.commit_staging(parent.id, worker, vec![spec]).await.unwrap();

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state/snapshot.json");
        store.save_snapshot(&path).await.unwrap();

        let restored = InMemoryTaskStore::load_snapshot(&path).await.unwrap();
        assert_eq!(
            restored.get_top(top.id).await.unwrap(),
            store.get_top(top.id).await.unwrap()
        );
        let restored_parent = restored.get_parent(parent.id).await.unwrap();
        assert_eq!(restored_parent.status, TaskStatus::Staged);
        assert_eq!(restored_parent.total_bytes, Some(42));
        assert_eq!(restored.children_of(parent.id).await.unwrap().len(), 1);
        assert!(restored.workers().await.unwrap().is_empty());

        assert_eq!(
            restored.clear_orphaned_assignments(TaskKind::Parent).await.unwrap(),
            1
        );
        assert_eq!(restored.ready_ids(TaskKind::Parent, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let error = InMemoryTaskStore::load_snapshot(temp_dir.path().join("absent.json"))
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_store_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let error = InMemoryTaskStore::load_snapshot(&path).await.unwrap_err();
        assert!(matches!(error, Error::Store { .. }));
    }
}
