//! IPC protocol definitions for RevertIT
//!
//! Defines message types and communication protocol between daemon and client.
//! JSON lines over a Unix socket: one request per line, one response per line.

use crate::events::EngineEvent;
use crate::types::{PendingChange, SnapshotMeta};
use serde::{Deserialize, Serialize};

/// IPC Request from client to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
}

/// IPC Response from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, String>,
}

/// Request methods
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Method {
    /// Ping daemon (health check)
    Ping,

    /// Get daemon status
    Status,

    /// List changes awaiting confirmation
    ListPending,

    /// Confirm a pending change by id, cancelling its revert deadline
    Confirm { change_id: String },

    /// List snapshots, newest first
    ListSnapshots,

    /// Take a manual snapshot of all monitored paths
    CreateSnapshot { description: String },

    /// Delete a snapshot. Refused while a pending change references it.
    DeleteSnapshot { snapshot_id: String },

    /// Restore a snapshot immediately (operator-initiated revert)
    RestoreSnapshot { snapshot_id: String },

    /// Most recent audit events
    RecentEvents { limit: usize },
}

/// Response data variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ResponseData {
    /// Simple success/pong
    Ok,

    /// Daemon status summary
    Status(StatusData),

    /// Pending changes
    Pending(Vec<PendingChange>),

    /// Confirmation accepted
    Confirmed { change_id: String },

    /// Snapshot metadata list
    Snapshots(Vec<SnapshotMeta>),

    /// Manual snapshot created
    SnapshotCreated { snapshot_id: String },

    /// Snapshot restored
    Restored { snapshot_id: String },

    /// Audit events, newest last
    Events(Vec<EngineEvent>),
}

/// Daemon status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub version: String,
    pub uptime_seconds: u64,
    pub monitored_paths: usize,
    pub pending_changes: usize,
    pub snapshot_count: usize,
    pub failed_reverts: usize,
}
