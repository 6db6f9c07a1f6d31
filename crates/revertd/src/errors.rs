//! Engine error taxonomy.
//!
//! Each variant drives a different recovery path: a failed capture lets the
//! change through unprotected, a failed restore escalates to revert_failed,
//! a confirmation race is reported to the caller, and a deadline that cannot
//! be persisted aborts that pending change before any timer is armed.

use std::path::PathBuf;
use thiserror::Error;

/// Snapshot capture failed. Partial captures are never committed.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("path {path} is unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stage snapshot {id}: {source}")]
    Stage {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to commit snapshot {id}: {source}")]
    Commit {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Snapshot restore failed. Any partially written files are reported.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("snapshot {0} not found")]
    NotFound(String),

    #[error("snapshot {id} manifest unreadable: {detail}")]
    Manifest { id: String, detail: String },

    #[error("restore of snapshot {id} incomplete: {failed} of {total} files failed ({detail})")]
    Partial {
        id: String,
        failed: usize,
        total: usize,
        detail: String,
    },
}

/// Confirmation targeted a change that is not pending.
#[derive(Debug, Error)]
pub enum NotPendingError {
    #[error("unknown change id {0}")]
    Unknown(String),

    #[error("change {id} is already {state}")]
    AlreadyResolved { id: String, state: String },
}

/// A deadline could not be durably recorded. The pending change must not
/// proceed: an unpersisted deadline would be lost on restart.
#[derive(Debug, Error)]
#[error("failed to persist deadline for change {id}: {source}")]
pub struct SchedulerPersistError {
    pub id: String,
    #[source]
    pub source: std::io::Error,
}

/// Why a confirmation request was rejected.
#[derive(Debug, Error)]
pub enum ConfirmError {
    #[error(transparent)]
    NotPending(#[from] NotPendingError),

    #[error("failed to record confirmation of {id}: {detail}")]
    Persist { id: String, detail: String },
}
