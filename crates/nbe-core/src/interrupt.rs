//! Interrupt outcome reporting
//!
//! An interrupt is retried a bounded number of times with growing waits.
//! Every unanswered attempt adds feedback of increasing severity; when the
//! attempts run out the session is torn down and a restart is suggested.

use crate::ids::CellId;
use serde::{Deserialize, Serialize};

/// Severity of interrupt feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One unanswered interrupt attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptFeedback {
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// How loud the feedback is
    pub severity: Severity,
    /// Human-readable message
    pub message: String,
}

/// How the interrupt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterruptOutcome {
    /// No cell was computing
    NothingToInterrupt,
    /// The backend stopped the cell
    Acknowledged { cell: CellId, attempts: u32 },
    /// The backend ignored every attempt; the session was torn down and the
    /// cell failed
    Escalated { cell: CellId, attempts: u32 },
}

/// Result of `Notebook::interrupt`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptReport {
    /// How the interrupt ended
    pub outcome: InterruptOutcome,
    /// One entry per unanswered attempt
    pub feedback: Vec<InterruptFeedback>,
    /// The session is in doubt and should be restarted
    pub suggest_restart: bool,
}

impl InterruptReport {
    /// No cell was computing
    #[must_use]
    pub fn nothing() -> Self {
        Self {
            outcome: InterruptOutcome::NothingToInterrupt,
            feedback: Vec::new(),
            suggest_restart: false,
        }
    }

    /// The backend stopped `cell`
    #[must_use]
    pub fn acknowledged(cell: CellId, attempts: u32, feedback: Vec<InterruptFeedback>) -> Self {
        Self {
            outcome: InterruptOutcome::Acknowledged { cell, attempts },
            feedback,
            suggest_restart: false,
        }
    }

    /// Every attempt was ignored
    #[must_use]
    pub fn escalated(cell: CellId, attempts: u32, feedback: Vec<InterruptFeedback>) -> Self {
        Self {
            outcome: InterruptOutcome::Escalated { cell, attempts },
            feedback,
            suggest_restart: true,
        }
    }

    /// Whether the computation stopped, by acknowledgment or teardown
    #[must_use]
    pub fn stopped(&self) -> bool {
        !matches!(self.outcome, InterruptOutcome::NothingToInterrupt)
    }
}

/// Feedback for unanswered attempt `attempt` out of `max_attempts`
#[must_use]
pub fn feedback_for(attempt: u32, max_attempts: u32) -> InterruptFeedback {
    let (severity, message) = if attempt >= max_attempts {
        (
            Severity::Critical,
            "Unable to interrupt the computation. The session will be restarted.".to_string(),
        )
    } else if attempt + 1 >= max_attempts {
        (
            Severity::Warning,
            format!("Still no response after {attempt} interrupt attempts. Consider restarting."),
        )
    } else {
        (
            Severity::Info,
            "Interrupt sent, waiting for the computation to stop.".to_string(),
        )
    };
    InterruptFeedback {
        attempt,
        severity,
        message,
    }
}
