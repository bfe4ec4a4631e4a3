//! Error types for NBE Core
//!
//! Provides error handling for:
//! - Structural lookups (unknown worksheet, cell, snapshot, user)
//! - Backend session pool saturation and session start failures
//! - Backend faults (crash, unresponsive interrupt)
//! - Persistence failures
//!
//! Malformed cell directives and backend crashes are *not* engine faults:
//! they are recorded on the cell.

use crate::ids::{CellId, SnapshotId, WorksheetId};
use crate::state::TransitionError;
use std::path::PathBuf;

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Unknown worksheet/cell/snapshot/user
    #[error("not found: {0}")]
    NotFound(#[from] NotFound),

    /// Worker pool saturated; caller should retry later
    #[error("no backend session available (pool capacity {capacity})")]
    SessionUnavailable { capacity: usize },

    /// Backend did not acknowledge an interrupt
    #[error("backend did not respond to interrupt after {attempts} attempts")]
    InterruptTimeout { attempts: u32 },

    /// User may not modify this worksheet
    #[error("user '{user}' may not modify worksheet {worksheet}")]
    PermissionDenied { user: String, worksheet: WorksheetId },

    /// Published worksheets are read-only and never executed
    #[error("worksheet {0} is a published copy and cannot be modified or executed")]
    ReadOnly(WorksheetId),

    /// Operation only valid on a published copy
    #[error("worksheet {0} is not a published copy")]
    NotPublished(WorksheetId),

    /// Purge requested while some user still has the worksheet
    #[error("worksheet {0} has not been deleted by every user")]
    StillInUse(WorksheetId),

    /// Rating outside `0..=4`
    #[error("rating {0} is out of range (0 to 4)")]
    InvalidRating(u8),

    /// Owner name reserved for published copies
    #[error("owner name '{0}' is reserved")]
    ReservedOwner(String),

    /// Data file name that is empty or not a plain file name
    #[error("invalid data file name '{0}'")]
    InvalidFileName(String),

    /// Illegal cell state transition
    #[error("illegal transition: {0}")]
    Transition(#[from] TransitionError),

    /// Worker pool failure
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// Persistence failure
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SessionUnavailable { .. }
                | Self::Pool(PoolError::SessionUnavailable(_))
                | Self::Store(StoreError::Io { .. })
        )
    }

    /// Check if error is a structural lookup failure
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Structural lookup failures (surfaced directly, never retried)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotFound {
    /// Unknown worksheet
    #[error("worksheet {0}")]
    Worksheet(WorksheetId),

    /// Unknown cell in a known worksheet
    #[error("cell {cell} in worksheet {worksheet}")]
    Cell { worksheet: WorksheetId, cell: CellId },

    /// Unknown snapshot
    #[error("snapshot {snapshot} of worksheet {worksheet}")]
    Snapshot {
        worksheet: WorksheetId,
        snapshot: SnapshotId,
    },

    /// Unknown user
    #[error("user '{0}'")]
    User(String),

    /// No data file of that name is attached
    #[error("data file '{name}' of worksheet {worksheet}")]
    DataFile { worksheet: WorksheetId, name: String },
}

/// Worker pool errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    /// Pool at capacity and the acquire wait bound elapsed
    #[error("pool exhausted (max: {0})")]
    SessionUnavailable(usize),

    /// Session could not be started
    #[error("session start for system '{system}' failed after {attempts} attempts: {reason}")]
    StartFailed {
        system: String,
        attempts: u32,
        reason: String,
    },

    /// Pool has been shut down
    #[error("pool is shut down")]
    Closed,
}

/// Errors reported by a backend implementation
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Session process died
    #[error("session crashed: {0}")]
    Crashed(String),

    /// Backend temporarily unable to serve (worth retrying)
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Request refused by the backend
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl BackendError {
    /// Transient faults are retried with backoff
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// IO failure on a path
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Record could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record missing
    #[error("record not found: {0}")]
    Missing(String),

    /// Data file name that could escape the worksheet's directory
    #[error("invalid data file name '{0}'")]
    InvalidName(String),
}

impl StoreError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
