//! Core data model: watched resources, change events, pending changes,
//! snapshot metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Category of a monitored configuration path. Determines which confirmation
/// timeout policy applies and which services are restarted after a revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCategory {
    Network,
    Ssh,
    Firewall,
    Service,
    System,
}

impl ChangeCategory {
    /// Classify a path by the same keyword rules the monitor uses.
    pub fn from_path(path: &Path) -> Self {
        let p = path.to_string_lossy().to_lowercase();

        if ["network", "netplan", "networkmanager", "interfaces"]
            .iter()
            .any(|k| p.contains(k))
        {
            return ChangeCategory::Network;
        }
        if p.contains("ssh") {
            return ChangeCategory::Ssh;
        }
        if ["iptables", "ufw", "firewall", "nftables"]
            .iter()
            .any(|k| p.contains(k))
        {
            return ChangeCategory::Firewall;
        }
        if p.contains("systemd") || p.ends_with(".service") {
            return ChangeCategory::Service;
        }

        ChangeCategory::System
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeCategory::Network => "network",
            ChangeCategory::Ssh => "ssh",
            ChangeCategory::Firewall => "firewall",
            ChangeCategory::Service => "service",
            ChangeCategory::System => "system",
        }
    }

    pub fn all() -> [ChangeCategory; 5] {
        [
            ChangeCategory::Network,
            ChangeCategory::Ssh,
            ChangeCategory::Firewall,
            ChangeCategory::Service,
            ChangeCategory::System,
        ]
    }
}

impl fmt::Display for ChangeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Observed content state of a file. Content hash where the file is readable,
/// mtime+size where hashing fails, Missing for paths that do not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Fingerprint {
    Sha256(String),
    Meta { mtime_unix: i64, size: u64 },
    Missing,
}

impl Fingerprint {
    pub fn is_missing(&self) -> bool {
        matches!(self, Fingerprint::Missing)
    }
}

/// A single concrete path under monitoring, with the last state we observed
/// for it. Glob patterns in the configuration expand to one of these per
/// matching file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedResource {
    pub path: PathBuf,
    pub category: ChangeCategory,
    pub fingerprint: Fingerprint,
}

/// A settled configuration change, emitted once per debounce window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub category: ChangeCategory,
    pub kind: ChangeKind,
    pub detected_at: DateTime<Utc>,
    pub previous: Fingerprint,
    pub current: Fingerprint,
}

/// Lifecycle of a pending change.
///
/// Transitions are monotonic: Pending -> Confirmed | Expired, and
/// Expired -> Reverted | RevertFailed. Terminal states never transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    Pending,
    Confirmed,
    Expired,
    Reverted,
    RevertFailed,
}

impl ChangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChangeState::Confirmed | ChangeState::Reverted | ChangeState::RevertFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeState::Pending => "pending",
            ChangeState::Confirmed => "confirmed",
            ChangeState::Expired => "expired",
            ChangeState::Reverted => "reverted",
            ChangeState::RevertFailed => "revert_failed",
        }
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configuration change awaiting operator confirmation. One record per
/// change, persisted so deadlines survive a daemon restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: String,
    pub resource: PathBuf,
    pub category: ChangeCategory,
    pub kind: ChangeKind,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub state: ChangeState,
}

impl PendingChange {
    /// Seconds until the deadline, zero if already past.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.deadline - now).num_seconds().max(0)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}

/// Generate a pending-change id: category prefix plus a random suffix.
pub fn new_change_id(category: ChangeCategory) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", category.as_str(), &suffix[..8])
}

/// Generate a snapshot id: timestamp plus a random suffix so concurrent
/// captures within one second never collide.
pub fn new_snapshot_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("revertit-{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..6])
}

/// Was the snapshot taken automatically before a detected change, or
/// requested by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Auto,
    Manual,
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotKind::Auto => "auto",
            SnapshotKind::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// One captured file inside a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    /// Unix permission bits at capture time.
    pub mode: u32,
    /// The path did not exist at capture time; restoring deletes it.
    #[serde(default)]
    pub absent: bool,
}

/// Outcome of one payload producer run inside a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadEntry {
    pub producer: String,
    pub description: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub size_bytes: u64,
}

/// Snapshot metadata manifest, stored alongside the captured files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub kind: SnapshotKind,
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub payloads: Vec<PayloadEntry>,
    pub total_size: u64,
}
