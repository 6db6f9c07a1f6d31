//! Audit event stream - structured records of everything the engine decides
//!
//! One JSON object per line, appended to state/events.jsonl. The CLI reads
//! the tail; the notifier maps severities to alert channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A monitored path changed and is now under confirmation.
    ChangeDetected,
    /// Snapshot capture failed; the change proceeds unprotected.
    Unprotected,
    /// Operator confirmed the change before the deadline.
    Confirmed,
    /// Deadline passed without confirmation.
    Expired,
    /// The prior snapshot was restored.
    Reverted,
    /// Restore failed; manual intervention required.
    RevertFailed,
}

/// Alert severity, matching the notification channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl EventKind {
    pub fn severity(&self) -> Severity {
        match self {
            EventKind::ChangeDetected | EventKind::Confirmed => Severity::Info,
            EventKind::Expired | EventKind::Reverted => Severity::Warning,
            EventKind::Unprotected | EventKind::RevertFailed => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ChangeDetected => "change_detected",
            EventKind::Unprotected => "unprotected",
            EventKind::Confirmed => "confirmed",
            EventKind::Expired => "expired",
            EventKind::Reverted => "reverted",
            EventKind::RevertFailed => "revert_failed",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub kind: EventKind,
    pub resource: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl EngineEvent {
    pub fn new(kind: EventKind, resource: &Path, change_id: Option<&str>) -> Self {
        Self {
            kind,
            resource: resource.to_path_buf(),
            change_id: change_id.map(|s| s.to_string()),
            timestamp: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Operator-facing one-liner.
    pub fn summary(&self) -> String {
        let path = self.resource.display();
        match self.kind {
            EventKind::ChangeDetected => format!("Change detected on {}", path),
            EventKind::Unprotected => {
                format!("Snapshot failed for {}; change is NOT protected", path)
            }
            EventKind::Confirmed => format!("Change on {} confirmed", path),
            EventKind::Expired => format!("Change on {} was not confirmed in time", path),
            EventKind::Reverted => {
                format!("Change on {} was not confirmed and has been reverted", path)
            }
            EventKind::RevertFailed => format!(
                "CRITICAL: failed to revert change on {}; manual intervention required",
                path
            ),
        }
    }
}

/// Append-only JSONL event log.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, event: &EngineEvent) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{}", line)
    }

    /// Last `limit` events, oldest first. Unparseable lines are skipped.
    pub fn recent(&self, limit: usize) -> std::io::Result<Vec<EngineEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)?;
        let events: Vec<EngineEvent> = BufReader::new(file)
            .lines()
            .filter_map(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        let skip = events.len().saturating_sub(limit);
        Ok(events.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(EventKind::Confirmed.severity(), Severity::Info);
        assert_eq!(EventKind::Reverted.severity(), Severity::Warning);
        assert_eq!(EventKind::RevertFailed.severity(), Severity::Critical);
    }

    #[test]
    fn test_append_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.jsonl"));

        for i in 0..5 {
            let event = EngineEvent::new(
                EventKind::ChangeDetected,
                Path::new("/etc/hosts"),
                Some(&format!("system-{:08}", i)),
            );
            log.append(&event).unwrap();
        }

        let recent = log.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].change_id.as_deref(), Some("system-00000003"));
        assert_eq!(recent[1].change_id.as_deref(), Some("system-00000004"));
    }

    #[test]
    fn test_recent_on_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("none.jsonl"));
        assert!(log.recent(10).unwrap().is_empty());
    }
}
