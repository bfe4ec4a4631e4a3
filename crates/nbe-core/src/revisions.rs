//! Snapshots and revert
//!
//! A snapshot is an immutable deep copy of a worksheet's cells and metadata
//! tagged with the `state_number` at capture. Persistence goes through the
//! `WorksheetStore`; this module decides *when* to capture and *which* old
//! snapshots to prune.

use crate::cell::Cell;
use crate::config::SnapshotConfig;
use crate::ids::{CellId, SnapshotId, WorksheetId};
use crate::worksheet::Worksheet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Immutable copy of a worksheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    /// Worksheet the snapshot was taken from
    pub worksheet: WorksheetId,
    /// State number at capture time
    pub state_number: u64,
    /// User who triggered the save, `None` for automatic snapshots
    pub saved_by: Option<String>,
    pub taken_at: DateTime<Utc>,
    /// Worksheet name at capture time
    pub name: String,
    /// Backend system at capture time
    pub system: String,
    /// Cells with committed outputs only
    pub cells: Vec<Cell>,
}

impl Snapshot {
    /// Listing entry for this snapshot
    #[must_use]
    pub fn info(&self) -> RevisionInfo {
        RevisionInfo {
            id: self.id,
            state_number: self.state_number,
            saved_by: self.saved_by.clone(),
            taken_at: self.taken_at,
            cell_count: self.cells.len(),
        }
    }
}

/// Snapshot metadata returned by `list_revisions`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionInfo {
    pub id: SnapshotId,
    /// State number of the snapshot
    pub state_number: u64,
    /// User who saved it, if any
    pub saved_by: Option<String>,
    /// Capture time
    pub taken_at: DateTime<Utc>,
    /// Number of cells in the snapshot
    pub cell_count: usize,
}

impl Worksheet {
    /// Capture a snapshot. Queued and computing cells are recorded as idle.
    #[must_use]
    pub fn capture(&self, saved_by: Option<&str>) -> Snapshot {
        Snapshot {
            id: SnapshotId::new(),
            worksheet: self.id.clone(),
            state_number: self.state_number(),
            saved_by: saved_by.map(str::to_string),
            taken_at: Utc::now(),
            name: self.name.clone(),
            system: self.system.clone(),
            cells: self.cells.iter().map(Cell::settled_copy).collect(),
        }
    }

    /// Replace the live cells with the snapshot's.
    ///
    /// Any computation is halted and the queue cleared first. The state
    /// number moves past both the live and the snapshot's value, and the
    /// cell id counter never goes backwards.
    pub fn restore(&mut self, user: Option<&str>, snapshot: &Snapshot) -> u64 {
        self.halt();
        let dropped: Vec<CellId> = self
            .cells
            .iter()
            .map(Cell::id)
            .filter(|old| !snapshot.cells.iter().any(|c| c.id() == *old))
            .collect();
        self.cells = snapshot.cells.clone();
        self.name = snapshot.name.clone();
        self.system = snapshot.system.clone();
        let max_id = self.cells.iter().map(|c| c.id().0 + 1).max().unwrap_or(0);
        self.next_cell_id = self.next_cell_id.max(max_id);

        let number = self.tracker.bump_past(snapshot.state_number);
        if let Some(user) = user {
            self.tracker.record_edit(user);
        }
        for id in dropped {
            self.tracker.record_deletion(id);
        }
        self.tracker.mark_structure_changed();
        self.tracker.mark_metadata_changed();
        for idx in 0..self.cells.len() {
            self.touch_cell(idx);
        }
        tracing::info!(worksheet = %self.id, snapshot = %snapshot.id, state_number = number, "worksheet reverted");
        self.state_number()
    }
}

/// Decides when a cadence snapshot is due
#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    config: SnapshotConfig,
    last_state_number: u64,
    last_taken: Instant,
}

impl SnapshotPolicy {
    /// Policy whose cadence starts at `state_number`
    #[must_use]
    pub fn new(config: SnapshotConfig, state_number: u64) -> Self {
        Self {
            config,
            last_state_number: state_number,
            last_taken: Instant::now(),
        }
    }

    /// Whether the cadence asks for a snapshot at `state_number`
    #[must_use]
    pub fn is_due(&self, state_number: u64, now: Instant) -> bool {
        if state_number <= self.last_state_number {
            return false;
        }
        let by_mutations = self
            .config
            .every_mutations
            .is_some_and(|n| state_number - self.last_state_number >= n);
        let by_time = self
            .config
            .interval_secs
            .is_some_and(|secs| now.duration_since(self.last_taken) >= Duration::from_secs(secs));
        by_mutations || by_time
    }

    /// Remember a capture
    pub fn record(&mut self, state_number: u64, now: Instant) {
        self.last_state_number = state_number;
        self.last_taken = now;
    }

    /// Snapshots kept per worksheet
    #[inline]
    #[must_use]
    pub fn max_snapshots(&self) -> usize {
        self.config.max_snapshots
    }
}

/// Snapshots to delete so that at most `keep` remain, oldest first
#[must_use]
pub fn prune_candidates(revisions: &[RevisionInfo], keep: usize) -> Vec<SnapshotId> {
    let mut ordered: Vec<&RevisionInfo> = revisions.iter().collect();
    ordered.sort_by_key(|r| (r.taken_at, r.id));
    let excess = ordered.len().saturating_sub(keep);
    ordered.into_iter().take(excess).map(|r| r.id).collect()
}

/// Newest first
pub fn sort_newest_first(revisions: &mut [RevisionInfo]) {
    revisions.sort_by(|a, b| (b.taken_at, b.id).cmp(&(a.taken_at, a.id)));
}
