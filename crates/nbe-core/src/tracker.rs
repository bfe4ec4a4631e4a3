//! Collaboration tracker
//!
//! Every client-visible mutation bumps `state_number`. Clients poll with the
//! last number they saw and receive what changed since. Deleted cells leave a
//! tombstone so a delta can report them; once the tombstone log is trimmed past
//! a client's number, that client gets a full resync instead.

use crate::ids::CellId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Tombstones kept before the oldest are dropped
pub const MAX_TOMBSTONES: usize = 256;

/// Per-worksheet version and edit history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    state_number: u64,
    /// State number of the last insert/delete/reorder/revert
    structure_version: u64,
    /// State number of the last rename, system or sharing change
    metadata_version: u64,
    last_edited: DateTime<Utc>,
    last_to_edit: Option<String>,
    tombstones: VecDeque<(CellId, u64)>,
    /// Deltas from numbers below this may have lost tombstones
    history_floor: u64,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    /// Fresh tracker at state 0
    #[must_use]
    pub fn new() -> Self {
        Self {
            state_number: 0,
            structure_version: 0,
            metadata_version: 0,
            last_edited: Utc::now(),
            last_to_edit: None,
            tombstones: VecDeque::new(),
            history_floor: 0,
        }
    }

    /// Bumped on every mutation
    #[inline]
    #[must_use]
    pub fn state_number(&self) -> u64 {
        self.state_number
    }

    /// Bumped when cells are added, removed or reordered
    #[inline]
    #[must_use]
    pub fn structure_version(&self) -> u64 {
        self.structure_version
    }

    /// Bumped on name, system or sharing changes
    #[inline]
    #[must_use]
    pub fn metadata_version(&self) -> u64 {
        self.metadata_version
    }

    #[inline]
    #[must_use]
    pub fn last_edited(&self) -> DateTime<Utc> {
        self.last_edited
    }

    #[inline]
    #[must_use]
    pub fn last_to_edit(&self) -> Option<&str> {
        self.last_to_edit.as_deref()
    }

    /// Record a mutation, returning the new state number
    pub fn bump(&mut self) -> u64 {
        self.state_number += 1;
        self.state_number
    }

    /// Record a mutation made by `user`
    pub fn record_edit(&mut self, user: &str) -> u64 {
        self.last_to_edit = Some(user.to_string());
        self.last_edited = Utc::now();
        self.bump()
    }

    /// Mark the current state number as a structural change
    pub fn mark_structure_changed(&mut self) {
        self.structure_version = self.state_number;
    }

    /// Mark the current state number as a metadata change
    pub fn mark_metadata_changed(&mut self) {
        self.metadata_version = self.state_number;
    }

    /// Remember a deleted cell at the current state number
    pub fn record_deletion(&mut self, cell: CellId) {
        self.tombstones.push_back((cell, self.state_number));
        while self.tombstones.len() > MAX_TOMBSTONES {
            if let Some((_, at)) = self.tombstones.pop_front() {
                self.history_floor = self.history_floor.max(at);
            }
        }
    }

    /// Move past every number handed out so far (used by revert)
    pub fn bump_past(&mut self, recorded: u64) -> u64 {
        self.state_number = self.state_number.max(recorded);
        self.bump()
    }

    /// Whether a delta from `since` is complete
    #[inline]
    #[must_use]
    pub fn can_delta_from(&self, since: u64) -> bool {
        since >= self.history_floor && since <= self.state_number
    }

    /// Cells deleted after `since`
    #[must_use]
    pub fn deleted_since(&self, since: u64) -> Vec<CellId> {
        self.tombstones
            .iter()
            .filter(|(_, at)| *at > since)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Name of another user who edited within `threshold`, if any
    #[must_use]
    pub fn other_recent_editor(&self, user: &str, threshold: Duration) -> Option<&str> {
        let editor = self.last_to_edit.as_deref()?;
        if editor == user {
            return None;
        }
        // negative age (clock skew) counts as recent
        let recent = Utc::now()
            .signed_duration_since(self.last_edited)
            .to_std()
            .map_or(true, |age| age <= threshold);
        recent.then_some(editor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bump_is_monotonic() {
        let mut tracker = Tracker::new();
        assert_eq!(tracker.bump(), 1);
        assert_eq!(tracker.record_edit("alice"), 2);
        assert_eq!(tracker.last_to_edit(), Some("alice"));
    }

    #[test]
    fn bump_past_exceeds_recorded_value() {
        let mut tracker = Tracker::new();
        tracker.bump();
        assert_eq!(tracker.bump_past(10), 11);
        assert_eq!(tracker.bump_past(3), 12);
    }

    #[test]
    fn tombstones_reported_after_since() {
        let mut tracker = Tracker::new();
        tracker.bump();
        tracker.record_deletion(CellId(1));
        tracker.bump();
        tracker.record_deletion(CellId(2));
        assert_eq!(tracker.deleted_since(0), vec![CellId(1), CellId(2)]);
        assert_eq!(tracker.deleted_since(1), vec![CellId(2)]);
        assert!(tracker.can_delta_from(0));
    }

    #[test]
    fn trimmed_tombstones_force_resync() {
        let mut tracker = Tracker::new();
        for i in 0..=MAX_TOMBSTONES {
            tracker.bump();
            tracker.record_deletion(CellId(u32::try_from(i).unwrap()));
        }
        assert!(!tracker.can_delta_from(0));
        assert!(tracker.can_delta_from(tracker.state_number()));
    }

    #[test]
    fn future_since_is_not_a_delta() {
        let tracker = Tracker::new();
        assert!(!tracker.can_delta_from(5));
    }

    #[test]
    fn other_editor_warning() {
        let mut tracker = Tracker::new();
        tracker.record_edit("bob");
        assert_eq!(
            tracker.other_recent_editor("alice", Duration::from_secs(60)),
            Some("bob")
        );
        assert_eq!(tracker.other_recent_editor("bob", Duration::from_secs(60)), None);
    }

    proptest! {
        #[test]
        fn any_sequence_is_strictly_increasing(ops in proptest::collection::vec(0u8..3, 1..50)) {
            let mut tracker = Tracker::new();
            let mut last = tracker.state_number();
            for op in ops {
                let next = match op {
                    0 => tracker.bump(),
                    1 => tracker.record_edit("u"),
                    _ => tracker.bump_past(last / 2),
                };
                prop_assert!(next > last);
                last = next;
            }
        }
    }
}
