//! Snapshot store - durable capture and restore of configuration file sets
//!
//! One directory per snapshot under the configured location:
//!
//!   <location>/<id>/metadata.json   manifest
//!   <location>/<id>/files/<path>    captured content, root-relative
//!   <location>/<id>/payloads/<p>/   producer payloads
//!
//! Captures are staged under .staging/<id> and committed with a single
//! rename, so a crash mid-capture never leaves a half-written snapshot
//! visible. The store knows nothing about deadlines or confirmation.

use crate::errors::{CaptureError, RestoreError};
use crate::payload::PayloadProducer;
use chrono::Utc;
use revertit_common::{new_snapshot_id, FileEntry, SnapshotKind, SnapshotMeta};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const STAGING_DIR: &str = ".staging";
const METADATA_FILE: &str = "metadata.json";

/// File content as it should be captured, decoupled from what is currently
/// on disk so callers can supply pre-change state.
#[derive(Debug, Clone)]
pub struct FileBlob {
    pub content: Vec<u8>,
    pub mode: u32,
}

/// One path to capture: either its held pre-change state, or None when the
/// path did not exist in that state.
#[derive(Debug, Clone)]
pub struct CaptureSource {
    pub path: PathBuf,
    pub state: Option<FileBlob>,
}

impl CaptureSource {
    /// Capture a path as it exists on disk right now.
    pub fn live(path: &Path) -> Result<Self, CaptureError> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                state: None,
            });
        }

        let content = std::fs::read(path).map_err(|e| CaptureError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mode = file_mode(path).unwrap_or(0o644);

        Ok(Self {
            path: path.to_path_buf(),
            state: Some(FileBlob { content, mode }),
        })
    }
}

pub struct SnapshotStore {
    location: PathBuf,
    max_snapshots: usize,
    producers: Vec<Box<dyn PayloadProducer>>,
    /// Per-snapshot-id locks so capture, restore and delete of the same
    /// snapshot never interleave.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SnapshotStore {
    pub fn new(
        location: PathBuf,
        max_snapshots: usize,
        producers: Vec<Box<dyn PayloadProducer>>,
    ) -> Self {
        Self {
            location,
            max_snapshots,
            producers,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id.to_string()).or_default().clone()
    }

    fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.location.join(id)
    }

    /// Capture the given sources into a new snapshot. All-or-nothing: if any
    /// file cannot be staged the staging directory is discarded and nothing
    /// is committed. Payload producer failures are recorded in the manifest
    /// but do not fail the capture.
    pub async fn capture(
        &self,
        sources: &[CaptureSource],
        description: &str,
        kind: SnapshotKind,
    ) -> Result<SnapshotMeta, CaptureError> {
        let id = new_snapshot_id(Utc::now());
        let lock = self.lock_for(&id).await;
        let _guard = lock.lock().await;

        let staging = self.location.join(STAGING_DIR).join(&id);

        let result = self.stage(&id, &staging, sources, description, kind).await;
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&staging);
        }
        let meta = result?;

        // Commit: one rename makes the whole snapshot visible.
        let final_dir = self.snapshot_dir(&id);
        std::fs::rename(&staging, &final_dir).map_err(|e| CaptureError::Commit {
            id: id.clone(),
            source: e,
        })?;

        info!(
            "Snapshot {} captured ({} files, {} bytes)",
            id,
            meta.files.len(),
            meta.total_size
        );
        Ok(meta)
    }

    async fn stage(
        &self,
        id: &str,
        staging: &Path,
        sources: &[CaptureSource],
        description: &str,
        kind: SnapshotKind,
    ) -> Result<SnapshotMeta, CaptureError> {
        let files_dir = staging.join("files");
        std::fs::create_dir_all(&files_dir).map_err(|e| CaptureError::Stage {
            id: id.to_string(),
            source: e,
        })?;

        let mut files = Vec::new();
        let mut total_size = 0u64;

        for source in sources {
            match &source.state {
                Some(blob) => {
                    let target = files_dir.join(relative_key(&source.path));
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| CaptureError::Stage {
                            id: id.to_string(),
                            source: e,
                        })?;
                    }
                    std::fs::write(&target, &blob.content).map_err(|e| CaptureError::Stage {
                        id: id.to_string(),
                        source: e,
                    })?;

                    total_size += blob.content.len() as u64;
                    files.push(FileEntry {
                        path: source.path.clone(),
                        size: blob.content.len() as u64,
                        mode: blob.mode,
                        absent: false,
                    });
                }
                None => files.push(FileEntry {
                    path: source.path.clone(),
                    size: 0,
                    mode: 0,
                    absent: true,
                }),
            }
        }

        // Payloads are best-effort: the file capture above is what protects
        // the primary mechanism.
        let mut payloads = Vec::new();
        for producer in &self.producers {
            let dest = staging.join("payloads").join(producer.name());
            match producer.capture(&dest) {
                Ok(entries) => {
                    total_size += entries.iter().map(|e| e.size_bytes).sum::<u64>();
                    payloads.extend(entries);
                }
                Err(e) => {
                    warn!("Payload producer {} failed: {:#}", producer.name(), e);
                    payloads.push(revertit_common::PayloadEntry {
                        producer: producer.name().to_string(),
                        description: producer.describe(),
                        ok: false,
                        error: Some(format!("{:#}", e)),
                        size_bytes: 0,
                    });
                }
            }
        }

        let meta = SnapshotMeta {
            id: id.to_string(),
            created_at: Utc::now(),
            description: description.to_string(),
            kind,
            files,
            payloads,
            total_size,
        };

        let json = serde_json::to_string_pretty(&meta).map_err(|e| CaptureError::Stage {
            id: id.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        std::fs::write(staging.join(METADATA_FILE), json).map_err(|e| CaptureError::Stage {
            id: id.to_string(),
            source: e,
        })?;

        Ok(meta)
    }

    /// Restore every captured file to its original path, preserving modes.
    /// A file captured as absent is deleted. Partial failures are collected
    /// and reported, never swallowed.
    pub async fn restore(&self, id: &str) -> Result<(), RestoreError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let dir = self.snapshot_dir(id);
        if !dir.exists() {
            return Err(RestoreError::NotFound(id.to_string()));
        }

        let meta = self.read_meta(&dir).map_err(|e| RestoreError::Manifest {
            id: id.to_string(),
            detail: format!("{:#}", e),
        })?;

        let files_dir = dir.join("files");
        let mut failures = Vec::new();

        for entry in &meta.files {
            if let Err(e) = restore_file(entry, &files_dir) {
                error!("Failed to restore {}: {}", entry.path.display(), e);
                failures.push(format!("{}: {}", entry.path.display(), e));
            }
        }

        for producer in &self.producers {
            let src = dir.join("payloads").join(producer.name());
            if !src.exists() {
                continue;
            }
            if let Err(e) = producer.restore(&src) {
                error!("Payload producer {} restore failed: {:#}", producer.name(), e);
                failures.push(format!("payload {}: {:#}", producer.name(), e));
            }
        }

        if !failures.is_empty() {
            return Err(RestoreError::Partial {
                id: id.to_string(),
                failed: failures.len(),
                total: meta.files.len(),
                detail: failures.join("; "),
            });
        }

        info!("Snapshot {} restored ({} files)", id, meta.files.len());
        Ok(())
    }

    /// Delete a snapshot's storage. The caller is responsible for ensuring
    /// no pending change still references it.
    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let dir = self.snapshot_dir(id);
        if !dir.exists() {
            anyhow::bail!("snapshot {} not found", id);
        }
        std::fs::remove_dir_all(&dir)?;
        info!("Snapshot {} deleted", id);
        Ok(())
    }

    /// All snapshot manifests, newest first. Unreadable entries are skipped.
    pub async fn list(&self) -> Vec<SnapshotMeta> {
        let mut snapshots = Vec::new();

        let entries = match std::fs::read_dir(&self.location) {
            Ok(entries) => entries,
            Err(_) => return snapshots,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || entry.file_name().to_string_lossy() == STAGING_DIR {
                continue;
            }
            match self.read_meta(&path) {
                Ok(meta) => snapshots.push(meta),
                Err(e) => warn!("Skipping unreadable snapshot at {}: {:#}", path.display(), e),
            }
        }

        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    pub async fn get(&self, id: &str) -> Option<SnapshotMeta> {
        let dir = self.snapshot_dir(id);
        if !dir.exists() {
            return None;
        }
        self.read_meta(&dir).ok()
    }

    /// The captured state of one path inside a snapshot: Some with a blob
    /// for captured content, Some with no state for a path captured as
    /// absent, None when the snapshot does not cover the path.
    pub async fn captured_source(&self, id: &str, path: &Path) -> Option<CaptureSource> {
        let dir = self.snapshot_dir(id);
        let meta = self.read_meta(&dir).ok()?;
        let entry = meta.files.iter().find(|f| f.path == path)?;

        if entry.absent {
            return Some(CaptureSource {
                path: path.to_path_buf(),
                state: None,
            });
        }

        let content = std::fs::read(dir.join("files").join(relative_key(path))).ok()?;
        Some(CaptureSource {
            path: path.to_path_buf(),
            state: Some(FileBlob {
                content,
                mode: entry.mode,
            }),
        })
    }

    /// Delete the oldest unreferenced snapshots beyond the retention limit.
    /// Called after each successful capture.
    pub async fn cleanup(&self, referenced: &HashSet<String>) -> usize {
        let snapshots = self.list().await;
        if snapshots.len() <= self.max_snapshots {
            return 0;
        }

        let mut deleted = 0;
        for meta in snapshots.iter().skip(self.max_snapshots) {
            if referenced.contains(&meta.id) {
                continue;
            }
            match self.delete(&meta.id).await {
                Ok(()) => deleted += 1,
                Err(e) => error!("Failed to delete old snapshot {}: {:#}", meta.id, e),
            }
        }

        if deleted > 0 {
            info!("Retention removed {} old snapshots", deleted);
        }
        deleted
    }

    fn read_meta(&self, dir: &Path) -> anyhow::Result<SnapshotMeta> {
        let content = std::fs::read_to_string(dir.join(METADATA_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Storage key for a captured path: the path with the root stripped.
fn relative_key(path: &Path) -> PathBuf {
    path.strip_prefix("/").unwrap_or(path).to_path_buf()
}

fn restore_file(entry: &FileEntry, files_dir: &Path) -> std::io::Result<()> {
    if entry.absent {
        match std::fs::remove_file(&entry.path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }
    }

    let source = files_dir.join(relative_key(&entry.path));
    let content = std::fs::read(&source)?;

    if let Some(parent) = entry.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&entry.path, content)?;
    set_file_mode(&entry.path, entry.mode)?;
    Ok(())
}

#[cfg(unix)]
pub(crate) fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).ok().map(|m| m.permissions().mode())
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode != 0 {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn file_mode(_path: &Path) -> Option<u32> {
    None
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> SnapshotStore {
        SnapshotStore::new(dir.join("snapshots"), 3, Vec::new())
    }

    #[tokio::test]
    async fn test_capture_then_restore_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let target = dir.path().join("etc").join("firewall.conf");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, "rule A\n").unwrap();

        let source = CaptureSource::live(&target).unwrap();
        let meta = store
            .capture(&[source], "before change", SnapshotKind::Auto)
            .await
            .unwrap();

        // Mutate, then restore.
        std::fs::write(&target, "rule B\n").unwrap();
        store.restore(&meta.id).await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "rule A\n");
    }

    #[tokio::test]
    async fn test_restore_deletes_file_captured_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let target = dir.path().join("new.conf");
        let source = CaptureSource {
            path: target.clone(),
            state: None,
        };
        let meta = store
            .capture(&[source], "pre-create", SnapshotKind::Auto)
            .await
            .unwrap();

        std::fs::write(&target, "created later").unwrap();
        store.restore(&meta.id).await.unwrap();

        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_restore_missing_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let err = store.restore("revertit-none").await.unwrap_err();
        assert!(matches!(err, RestoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let target = dir.path().join("a.conf");
        std::fs::write(&target, "x").unwrap();

        for i in 0..3 {
            let source = CaptureSource::live(&target).unwrap();
            store
                .capture(&[source], &format!("snap {}", i), SnapshotKind::Manual)
                .await
                .unwrap();
        }

        let list = store.list().await;
        assert_eq!(list.len(), 3);
        assert!(list[0].created_at >= list[1].created_at);
        assert!(list[1].created_at >= list[2].created_at);
    }

    #[tokio::test]
    async fn test_cleanup_respects_referenced_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots"), 1, Vec::new());

        let target = dir.path().join("a.conf");
        std::fs::write(&target, "x").unwrap();

        let mut ids = Vec::new();
        for i in 0..3 {
            let source = CaptureSource::live(&target).unwrap();
            let meta = store
                .capture(&[source], &format!("snap {}", i), SnapshotKind::Auto)
                .await
                .unwrap();
            ids.push(meta.id);
        }

        // Protect the oldest snapshot; only the middle one may go.
        let mut referenced = HashSet::new();
        referenced.insert(ids[0].clone());

        let deleted = store.cleanup(&referenced).await;
        assert_eq!(deleted, 1);

        let remaining: HashSet<String> = store.list().await.into_iter().map(|m| m.id).collect();
        assert!(remaining.contains(&ids[0]));
        assert!(remaining.contains(&ids[2]));
        assert!(!remaining.contains(&ids[1]));
    }

    #[tokio::test]
    async fn test_capture_preserves_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let target = dir.path().join("secret.conf");
        std::fs::write(&target, "key").unwrap();
        set_file_mode(&target, 0o100600).unwrap();

        let source = CaptureSource::live(&target).unwrap();
        let meta = store
            .capture(&[source], "perms", SnapshotKind::Auto)
            .await
            .unwrap();

        std::fs::write(&target, "changed").unwrap();
        set_file_mode(&target, 0o100644).unwrap();

        store.restore(&meta.id).await.unwrap();
        assert_eq!(file_mode(&target).unwrap() & 0o777, 0o600);
    }
}
