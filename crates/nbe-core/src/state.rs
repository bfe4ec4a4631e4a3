//! Cell state machine
//!
//! ```text
//! Idle --evaluate--> Queued --dispatch--> Computing --complete--> Done
//! Computing --interrupt--> Interrupted --re-evaluate--> Queued
//! Computing --backend error / restart--> Errored
//! Done | Errored | Interrupted --edit--> Idle
//! ```
//!
//! There is no terminal state; a cell is reusable indefinitely.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution state of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CellState {
    /// Not scheduled
    #[default]
    Idle,
    /// Waiting in the worksheet queue
    Queued,
    /// Submitted to the backend (always the queue head)
    Computing,
    /// Last run completed
    Done,
    /// Last run aborted on request
    Interrupted,
    /// Last run failed
    Errored,
}

impl CellState {
    /// Whether the cell is referenced by the worksheet queue
    #[inline]
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Queued | Self::Computing)
    }

    /// Whether the cell carries the result of a finished run
    #[inline]
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Done | Self::Interrupted | Self::Errored)
    }
}

impl fmt::Display for CellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Computing => "computing",
            Self::Done => "done",
            Self::Interrupted => "interrupted",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Attempted transition not in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cell cannot move from {from} to {to}")]
pub struct TransitionError {
    /// Current state
    pub from: CellState,
    /// Requested state
    pub to: CellState,
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: CellState) -> &'static [CellState] {
    use CellState::*;
    match from {
        Idle => &[Queued],
        // dequeue returns to Idle; a directive parse error is rejected before dispatch
        Queued => &[Computing, Idle, Errored],
        Computing => &[Done, Interrupted, Errored],
        Done | Interrupted | Errored => &[Queued, Idle],
    }
}

/// Validate a single transition
///
/// # Errors
/// `TransitionError` when `to` is not reachable from `from`.
pub fn validate_transition(from: CellState, to: CellState) -> Result<(), TransitionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}
