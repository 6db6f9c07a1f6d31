//! Persisted pending-change table.
//!
//! One JSON record per change under state/pending/. The files are the
//! single source of truth: every mutation is written through before it
//! takes effect, and the whole table is reloadable for startup recovery.
//! In-memory state is only a cache of the directory.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use revertit_common::{atomic_write, ChangeState, PendingChange};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct PendingTable {
    dir: PathBuf,
    changes: RwLock<HashMap<String, PendingChange>>,
}

impl PendingTable {
    /// Open the table, creating the directory and loading every record.
    /// Unparseable records are skipped with a warning, not fatal.
    pub fn open(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create pending dir {}", dir.display()))?;

        let mut changes = HashMap::new();
        for entry in std::fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_json::from_str::<PendingChange>(&c).map_err(Into::into))
            {
                Ok(change) => {
                    changes.insert(change.id.clone(), change);
                }
                Err(e) => warn!("Skipping bad pending record {}: {:#}", path.display(), e),
            }
        }

        info!("Loaded {} pending-change records", changes.len());
        Ok(Self {
            dir,
            changes: RwLock::new(changes),
        })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn persist(&self, change: &PendingChange) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(change)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        atomic_write(&self.record_path(&change.id), &json)
    }

    /// Insert a new record, persisting before it becomes visible. An
    /// io::Error here means the change must not proceed.
    pub async fn insert(&self, change: PendingChange) -> std::io::Result<()> {
        self.persist(&change)?;
        self.changes.write().await.insert(change.id.clone(), change);
        Ok(())
    }

    /// Transition a record to a new state. The record is persisted before
    /// memory is updated, so a failed write leaves both sides agreeing on
    /// the old state.
    pub async fn set_state(&self, id: &str, state: ChangeState) -> Result<PendingChange> {
        let mut changes = self.changes.write().await;
        let mut updated = changes
            .get(id)
            .with_context(|| format!("no pending change {}", id))?
            .clone();
        updated.state = state;

        self.persist(&updated)
            .with_context(|| format!("failed to persist state of {}", id))?;
        changes.insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    /// Move a record's deadline, persist-then-update like set_state.
    pub async fn set_deadline(&self, id: &str, deadline: DateTime<Utc>) -> Result<PendingChange> {
        let mut changes = self.changes.write().await;
        let mut updated = changes
            .get(id)
            .with_context(|| format!("no pending change {}", id))?
            .clone();
        updated.deadline = deadline;

        self.persist(&updated)
            .with_context(|| format!("failed to persist deadline of {}", id))?;
        changes.insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    pub async fn get(&self, id: &str) -> Option<PendingChange> {
        self.changes.read().await.get(id).cloned()
    }

    /// The PENDING change for a resource, if one exists. The uniqueness
    /// invariant guarantees at most one.
    pub async fn pending_for(&self, resource: &Path) -> Option<PendingChange> {
        self.changes
            .read()
            .await
            .values()
            .find(|c| c.state == ChangeState::Pending && c.resource == resource)
            .cloned()
    }

    /// Every record, newest first.
    pub async fn all(&self) -> Vec<PendingChange> {
        let mut all: Vec<PendingChange> = self.changes.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Records still awaiting confirmation, newest first.
    pub async fn pending(&self) -> Vec<PendingChange> {
        let mut pending: Vec<PendingChange> = self
            .changes
            .read()
            .await
            .values()
            .filter(|c| c.state == ChangeState::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        pending
    }

    pub async fn count_in_state(&self, state: ChangeState) -> usize {
        self.changes
            .read()
            .await
            .values()
            .filter(|c| c.state == state)
            .count()
    }

    /// Snapshot ids that must not be deleted: anything still pending, mid
    /// revert, or left for manual intervention keeps its snapshot alive.
    pub async fn referenced_snapshots(&self) -> HashSet<String> {
        self.changes
            .read()
            .await
            .values()
            .filter(|c| {
                matches!(
                    c.state,
                    ChangeState::Pending | ChangeState::Expired | ChangeState::RevertFailed
                )
            })
            .map(|c| c.snapshot_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use revertit_common::{new_change_id, ChangeCategory, ChangeKind};

    fn make_change(resource: &str, deadline_offset_secs: i64) -> PendingChange {
        let now = Utc::now();
        PendingChange {
            id: new_change_id(ChangeCategory::System),
            resource: PathBuf::from(resource),
            category: ChangeCategory::System,
            kind: ChangeKind::Modified,
            snapshot_id: "snap-1".to_string(),
            created_at: now,
            deadline: now + Duration::seconds(deadline_offset_secs),
            state: ChangeState::Pending,
        }
    }

    #[tokio::test]
    async fn test_insert_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let change = make_change("/etc/hosts", 300);
        let id = change.id.clone();

        {
            let table = PendingTable::open(dir.path().to_path_buf()).unwrap();
            table.insert(change).await.unwrap();
        }

        let reloaded = PendingTable::open(dir.path().to_path_buf()).unwrap();
        let restored = reloaded.get(&id).await.unwrap();
        assert_eq!(restored.state, ChangeState::Pending);
        assert_eq!(restored.resource, PathBuf::from("/etc/hosts"));
    }

    #[tokio::test]
    async fn test_state_transition_persists() {
        let dir = tempfile::tempdir().unwrap();
        let table = PendingTable::open(dir.path().to_path_buf()).unwrap();

        let change = make_change("/etc/hosts", 300);
        let id = change.id.clone();
        table.insert(change).await.unwrap();
        table.set_state(&id, ChangeState::Confirmed).await.unwrap();

        let reloaded = PendingTable::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(
            reloaded.get(&id).await.unwrap().state,
            ChangeState::Confirmed
        );
    }

    #[tokio::test]
    async fn test_pending_for_ignores_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let table = PendingTable::open(dir.path().to_path_buf()).unwrap();

        let change = make_change("/etc/hosts", 300);
        let id = change.id.clone();
        table.insert(change).await.unwrap();
        assert!(table.pending_for(Path::new("/etc/hosts")).await.is_some());

        table.set_state(&id, ChangeState::Confirmed).await.unwrap();
        assert!(table.pending_for(Path::new("/etc/hosts")).await.is_none());
    }

    #[tokio::test]
    async fn test_referenced_snapshots_cover_failed_reverts() {
        let dir = tempfile::tempdir().unwrap();
        let table = PendingTable::open(dir.path().to_path_buf()).unwrap();

        let a = make_change("/etc/a", 300);
        let mut b = make_change("/etc/b", 300);
        b.snapshot_id = "snap-2".to_string();
        let b_id = b.id.clone();

        table.insert(a).await.unwrap();
        table.insert(b).await.unwrap();
        table.set_state(&b_id, ChangeState::RevertFailed).await.unwrap();

        let referenced = table.referenced_snapshots().await;
        assert!(referenced.contains("snap-1"));
        assert!(referenced.contains("snap-2"));
    }

    #[tokio::test]
    async fn test_bad_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk.json"), "{not json").unwrap();

        let table = PendingTable::open(dir.path().to_path_buf()).unwrap();
        assert!(table.all().await.is_empty());
    }
}
