//! Worksheet aggregate
//!
//! Owns the ordered cells, the execution queue, sharing metadata, per-user
//! folders, ratings (published copies only) and the collaboration tracker.
//! Every client-visible mutation goes through `record`, which bumps
//! `state_number`.

use crate::cell::Cell;
use crate::error::{EngineError, NotFound};
use crate::ids::{CellId, WorksheetId};
use crate::queue::ExecutionQueue;
use crate::tracker::Tracker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-user placement of a worksheet in their listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Folder {
    #[default]
    Active,
    Archived,
    Trashed,
}

/// A user's rating of a published worksheet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rating {
    /// Who rated
    pub user: String,
    /// Score in `0..=Worksheet::MAX_RATING`
    pub score: u8,
    /// Free-form comment
    pub comment: String,
    /// When the rating was given
    pub rated_at: DateTime<Utc>,
}

/// Where to insert a new cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellPosition {
    /// Directly before the anchor cell
    Before(CellId),
    /// Directly after the anchor cell
    After(CellId),
    /// After the last cell
    End,
}

/// Result of deleting a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedCell {
    /// Id of the deleted cell
    pub id: CellId,
    /// The cell was computing; its computation must be abandoned
    pub was_computing: bool,
}

/// Worksheet aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worksheet {
    pub(crate) id: WorksheetId,
    pub(crate) name: String,
    pub(crate) collaborators: BTreeSet<String>,
    pub(crate) cells: Vec<Cell>,
    #[serde(skip)]
    pub(crate) queue: ExecutionQueue,
    pub(crate) next_cell_id: u32,
    pub(crate) system: String,
    pub(crate) is_published: bool,
    pub(crate) published_id_number: Option<u64>,
    pub(crate) published_filename: Option<String>,
    pub(crate) auto_publish: bool,
    pub(crate) ratings: Vec<Rating>,
    pub(crate) folders: BTreeMap<String, Folder>,
    pub(crate) tracker: Tracker,
    pub(crate) created_at: DateTime<Utc>,
}

impl Worksheet {
    /// Create an empty worksheet
    #[must_use]
    pub fn new(id: WorksheetId, name: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            collaborators: BTreeSet::new(),
            cells: Vec::new(),
            queue: ExecutionQueue::new(),
            next_cell_id: 0,
            system: system.into(),
            is_published: false,
            published_id_number: None,
            published_filename: None,
            auto_publish: false,
            ratings: Vec::new(),
            folders: BTreeMap::new(),
            tracker: Tracker::new(),
            created_at: Utc::now(),
        }
    }

    /// Worksheet id
    #[inline]
    #[must_use]
    pub fn id(&self) -> &WorksheetId {
        &self.id
    }

    /// `owner/number`
    #[must_use]
    pub fn filename(&self) -> String {
        self.id.filename()
    }

    /// Display name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owner's user name
    #[inline]
    #[must_use]
    pub fn owner(&self) -> &str {
        self.id.owner()
    }

    /// Users other than the owner who may edit
    #[inline]
    #[must_use]
    pub fn collaborators(&self) -> &BTreeSet<String> {
        &self.collaborators
    }

    /// Cells in document order
    #[inline]
    #[must_use]
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Cell by id
    #[must_use]
    pub fn cell(&self, id: CellId) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id() == id)
    }

    /// Backend system the cells run on
    #[inline]
    #[must_use]
    pub fn system(&self) -> &str {
        &self.system
    }

    /// Read-only published copy
    #[inline]
    #[must_use]
    pub fn is_published(&self) -> bool {
        self.is_published
    }

    /// Number of this worksheet's published copy
    #[inline]
    #[must_use]
    pub fn published_id_number(&self) -> Option<u64> {
        self.published_id_number
    }

    #[inline]
    #[must_use]
    pub fn published_filename(&self) -> Option<&str> {
        self.published_filename.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn auto_publish(&self) -> bool {
        self.auto_publish
    }

    /// Every rating, in the order given
    #[inline]
    #[must_use]
    pub fn ratings(&self) -> &[Rating] {
        &self.ratings
    }

    /// Change tracking
    #[inline]
    #[must_use]
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Current state number
    #[inline]
    #[must_use]
    pub fn state_number(&self) -> u64 {
        self.tracker.state_number()
    }

    #[inline]
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Next cell id that will be allocated
    #[inline]
    #[must_use]
    pub fn next_cell_id(&self) -> u32 {
        self.next_cell_id
    }

    pub(crate) fn index_of(&self, id: CellId) -> Result<usize, NotFound> {
        self.cells
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| NotFound::Cell {
                worksheet: self.id.clone(),
                cell: id,
            })
    }

    /// Bump the state number, attributing the change when `user` is known
    pub(crate) fn record(&mut self, user: Option<&str>) -> u64 {
        match user {
            Some(user) => self.tracker.record_edit(user),
            None => self.tracker.bump(),
        }
    }

    pub(crate) fn touch_cell(&mut self, idx: usize) {
        let now = self.tracker.state_number();
        self.cells[idx].touch(now);
    }

    pub(crate) fn allocate_cell_id(&mut self) -> CellId {
        let id = CellId(self.next_cell_id);
        self.next_cell_id += 1;
        id
    }

    /// Published copies are read-only
    ///
    /// # Errors
    /// `EngineError::ReadOnly` for published copies.
    pub fn ensure_editable(&self) -> Result<(), EngineError> {
        if self.is_published {
            Err(EngineError::ReadOnly(self.id.clone()))
        } else {
            Ok(())
        }
    }

    /// Owner and collaborators
    pub fn users_with_access(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.owner()).chain(self.collaborators.iter().map(String::as_str))
    }

    /// `user` is a listed collaborator (the owner is not listed)
    #[must_use]
    pub fn is_collaborator(&self, user: &str) -> bool {
        self.collaborators.contains(user)
    }

    /// Owner, collaborator or admin, on a non-published worksheet
    #[must_use]
    pub fn user_can_edit(&self, user: &str, is_admin: bool) -> bool {
        !self.is_published && (is_admin || self.owner() == user || self.is_collaborator(user))
    }

    /// Published copies are world-readable
    #[must_use]
    pub fn user_can_view(&self, user: &str, is_admin: bool) -> bool {
        self.is_published || is_admin || self.owner() == user || self.is_collaborator(user)
    }

    /// Rename
    ///
    /// # Errors
    /// `EngineError::ReadOnly` for published copies.
    pub fn rename(&mut self, user: Option<&str>, name: impl Into<String>) -> Result<(), EngineError> {
        self.ensure_editable()?;
        self.name = name.into();
        self.record(user);
        self.tracker.mark_metadata_changed();
        Ok(())
    }

    /// Change the backend flavor; the next dispatch uses a matching session
    ///
    /// # Errors
    /// `EngineError::ReadOnly` for published copies.
    pub fn set_system(&mut self, user: Option<&str>, system: impl Into<String>) -> Result<(), EngineError> {
        self.ensure_editable()?;
        self.system = system.into();
        self.record(user);
        self.tracker.mark_metadata_changed();
        Ok(())
    }

    /// # Errors
    /// `EngineError::ReadOnly` for published copies.
    pub fn set_auto_publish(&mut self, user: Option<&str>, enabled: bool) -> Result<(), EngineError> {
        self.ensure_editable()?;
        self.auto_publish = enabled;
        self.record(user);
        self.tracker.mark_metadata_changed();
        Ok(())
    }

    /// Share with `collaborator`. Adding the owner is a no-op.
    ///
    /// # Errors
    /// `EngineError::ReadOnly` for published copies.
    pub fn add_collaborator(&mut self, user: Option<&str>, collaborator: &str) -> Result<bool, EngineError> {
        self.ensure_editable()?;
        if collaborator == self.owner() || !self.collaborators.insert(collaborator.to_string()) {
            return Ok(false);
        }
        self.record(user);
        self.tracker.mark_metadata_changed();
        Ok(true)
    }

    /// # Errors
    /// `EngineError::ReadOnly` for published copies.
    pub fn remove_collaborator(&mut self, user: Option<&str>, collaborator: &str) -> Result<bool, EngineError> {
        self.ensure_editable()?;
        if !self.collaborators.remove(collaborator) {
            return Ok(false);
        }
        self.folders.remove(collaborator);
        self.record(user);
        self.tracker.mark_metadata_changed();
        Ok(true)
    }

    /// Insert a new idle cell
    ///
    /// # Errors
    /// - `EngineError::ReadOnly` for published copies
    /// - `EngineError::NotFound` when the anchor cell is unknown
    pub fn insert_cell(
        &mut self,
        user: Option<&str>,
        position: CellPosition,
        input: impl Into<String>,
    ) -> Result<CellId, EngineError> {
        let input = input.into();
        self.insert_with(user, position, |id| Cell::new(id, input))
    }

    /// Insert a text cell, which is shown but never executed
    ///
    /// # Errors
    /// Same as [`Worksheet::insert_cell`].
    pub fn insert_text_cell(
        &mut self,
        user: Option<&str>,
        position: CellPosition,
        html: impl Into<String>,
    ) -> Result<CellId, EngineError> {
        let html = html.into();
        self.insert_with(user, position, |id| Cell::text(id, html))
    }

    fn insert_with(
        &mut self,
        user: Option<&str>,
        position: CellPosition,
        make: impl FnOnce(CellId) -> Cell,
    ) -> Result<CellId, EngineError> {
        self.ensure_editable()?;
        let idx = match position {
            CellPosition::Before(anchor) => self.index_of(anchor)?,
            CellPosition::After(anchor) => self.index_of(anchor)? + 1,
            CellPosition::End => self.cells.len(),
        };
        let id = self.allocate_cell_id();
        self.cells.insert(idx, make(id));
        self.record(user);
        self.tracker.mark_structure_changed();
        self.touch_cell(idx);
        Ok(id)
    }

    /// Replace a cell's input. Returns `false` when nothing changed.
    ///
    /// # Errors
    /// - `EngineError::ReadOnly` for published copies
    /// - `EngineError::NotFound` for an unknown cell
    pub fn edit_cell(
        &mut self,
        user: Option<&str>,
        id: CellId,
        input: impl Into<String>,
    ) -> Result<bool, EngineError> {
        self.ensure_editable()?;
        let idx = self.index_of(id)?;
        if !self.cells[idx].set_input(input) {
            return Ok(false);
        }
        self.record(user);
        self.touch_cell(idx);
        Ok(true)
    }

    /// Delete a cell, removing it from the queue
    ///
    /// # Errors
    /// - `EngineError::ReadOnly` for published copies
    /// - `EngineError::NotFound` for an unknown cell
    pub fn delete_cell(&mut self, user: Option<&str>, id: CellId) -> Result<DeletedCell, EngineError> {
        self.ensure_editable()?;
        let idx = self.index_of(id)?;
        let was_computing = self.computing_cell() == Some(id);
        self.queue.remove(id);
        self.cells.remove(idx);
        self.record(user);
        self.tracker.mark_structure_changed();
        self.tracker.record_deletion(id);
        Ok(DeletedCell { id, was_computing })
    }

    /// Drop every cell's output
    ///
    /// # Errors
    /// `EngineError::ReadOnly` for published copies.
    pub fn clear_output(&mut self, user: Option<&str>) -> Result<(), EngineError> {
        self.ensure_editable()?;
        self.record(user);
        for idx in 0..self.cells.len() {
            if !self.cells[idx].state().is_pending() {
                self.cells[idx].clear_output();
                self.touch_cell(idx);
            }
        }
        Ok(())
    }

    /// The user's folder for this worksheet
    #[must_use]
    pub fn folder(&self, user: &str) -> Folder {
        self.folders.get(user).copied().unwrap_or_default()
    }

    /// Move the worksheet in `user`'s listing only
    pub fn set_folder(&mut self, user: &str, folder: Folder) {
        if folder == Folder::Active {
            self.folders.remove(user);
        } else {
            self.folders.insert(user.to_string(), folder);
        }
    }

    /// Every user with access has trashed the worksheet
    #[must_use]
    pub fn trashed_by_everyone(&self) -> bool {
        self.users_with_access()
            .all(|user| self.folder(user) == Folder::Trashed)
    }

    /// Highest accepted rating score
    pub const MAX_RATING: u8 = 4;

    /// Rate a published copy, replacing the user's earlier rating
    ///
    /// # Errors
    /// - `EngineError::NotPublished` when this is not a published copy
    /// - `EngineError::InvalidRating` for scores above `MAX_RATING`
    pub fn rate(&mut self, user: &str, score: u8, comment: impl Into<String>) -> Result<(), EngineError> {
        if !self.is_published {
            return Err(EngineError::NotPublished(self.id.clone()));
        }
        if score > Self::MAX_RATING {
            return Err(EngineError::InvalidRating(score));
        }
        self.ratings.retain(|r| r.user != user);
        self.ratings.push(Rating {
            user: user.to_string(),
            score,
            comment: comment.into(),
            rated_at: Utc::now(),
        });
        self.record(None);
        self.tracker.mark_metadata_changed();
        Ok(())
    }

    /// Mean score, `None` when unrated
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rating(&self) -> Option<f64> {
        if self.ratings.is_empty() {
            return None;
        }
        let total: f64 = self.ratings.iter().map(|r| f64::from(r.score)).sum();
        Some(total / self.ratings.len() as f64)
    }

    /// `user` has rated this worksheet
    #[must_use]
    pub fn is_rater(&self, user: &str) -> bool {
        self.ratings.iter().any(|r| r.user == user)
    }

    /// Record the published copy of this worksheet
    pub(crate) fn link_published(&mut self, published: &WorksheetId) {
        self.published_filename = Some(published.filename());
        self.record(None);
        self.tracker.mark_metadata_changed();
    }

    /// Copy suitable for persistence: no queue, no transient cell states
    #[must_use]
    pub fn persistable(&self) -> Self {
        let mut copy = self.clone();
        copy.queue.clear();
        copy.cells = self.cells.iter().map(Cell::settled_copy).collect();
        copy
    }

    /// Check the structural invariants
    ///
    /// # Errors
    /// A message naming the first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut ids = BTreeSet::new();
        for cell in &self.cells {
            if !ids.insert(cell.id()) {
                return Err(format!("duplicate cell id {}", cell.id()));
            }
            if cell.id().0 >= self.next_cell_id {
                return Err(format!("cell id {} not below counter {}", cell.id(), self.next_cell_id));
            }
        }
        if self.is_published != self.published_id_number.is_some() {
            return Err("published_id_number set iff is_published violated".into());
        }
        if self.is_published && !self.queue.is_empty() {
            return Err("published worksheet has queued cells".into());
        }
        self.check_queue_invariants()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CellState;
    use pretty_assertions::assert_eq;

    fn sheet() -> Worksheet {
        Worksheet::new(WorksheetId::new("alice", 1), "Untitled", "sage")
    }

    #[test]
    fn insert_positions_and_ids() {
        let mut ws = sheet();
        let a = ws.insert_cell(Some("alice"), CellPosition::End, "a").unwrap();
        let c = ws.insert_cell(Some("alice"), CellPosition::After(a), "c").unwrap();
        let b = ws.insert_cell(Some("alice"), CellPosition::Before(c), "b").unwrap();
        let order: Vec<&str> = ws.cells().iter().map(Cell::input).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!((a, c, b), (CellId(0), CellId(1), CellId(2)));
        assert_eq!(ws.tracker().last_to_edit(), Some("alice"));
    }

    #[test]
    fn ids_never_reused_after_delete() {
        let mut ws = sheet();
        let a = ws.insert_cell(None, CellPosition::End, "a").unwrap();
        ws.delete_cell(None, a).unwrap();
        let b = ws.insert_cell(None, CellPosition::End, "b").unwrap();
        assert_ne!(a, b);
        assert_eq!(ws.tracker().deleted_since(0), vec![a]);
    }

    #[test]
    fn unknown_anchor_is_not_found() {
        let mut ws = sheet();
        let err = ws.insert_cell(None, CellPosition::After(CellId(7)), "x").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn every_mutation_bumps_state_number() {
        let mut ws = sheet();
        let mut last = ws.state_number();
        let id = ws.insert_cell(None, CellPosition::End, "1").unwrap();
        assert!(ws.state_number() > last);
        last = ws.state_number();
        ws.edit_cell(None, id, "2").unwrap();
        assert!(ws.state_number() > last);
        last = ws.state_number();
        ws.rename(None, "Renamed").unwrap();
        assert!(ws.state_number() > last);
        last = ws.state_number();
        ws.delete_cell(None, id).unwrap();
        assert!(ws.state_number() > last);
    }

    #[test]
    fn deleting_queued_cell_removes_it_from_queue() {
        let mut ws = sheet();
        let a = ws.insert_cell(None, CellPosition::End, "a").unwrap();
        let b = ws.insert_cell(None, CellPosition::End, "b").unwrap();
        ws.enqueue_all(None).unwrap();
        ws.prepare_dispatch();
        let deleted = ws.delete_cell(None, a).unwrap();
        assert!(deleted.was_computing);
        assert_eq!(ws.queue(), vec![b]);
        assert_eq!(ws.cell(b).unwrap().state(), CellState::Queued);
        ws.check_invariants().unwrap();
    }

    #[test]
    fn collaborators_and_permissions() {
        let mut ws = sheet();
        assert!(ws.add_collaborator(Some("alice"), "bob").unwrap());
        assert!(!ws.add_collaborator(Some("alice"), "alice").unwrap());
        assert!(ws.user_can_edit("bob", false));
        assert!(!ws.user_can_edit("carol", false));
        assert!(ws.user_can_edit("carol", true));
        assert!(!ws.user_can_view("carol", false));
        assert!(ws.remove_collaborator(None, "bob").unwrap());
        assert!(!ws.user_can_edit("bob", false));
    }

    #[test]
    fn folders_are_per_user() {
        let mut ws = sheet();
        ws.add_collaborator(None, "bob").unwrap();
        ws.set_folder("alice", Folder::Trashed);
        assert_eq!(ws.folder("alice"), Folder::Trashed);
        assert_eq!(ws.folder("bob"), Folder::Active);
        assert!(!ws.trashed_by_everyone());
        ws.set_folder("bob", Folder::Trashed);
        assert!(ws.trashed_by_everyone());
        ws.set_folder("bob", Folder::Archived);
        assert!(!ws.trashed_by_everyone());
    }

    #[test]
    fn rating_only_on_published() {
        let mut ws = sheet();
        assert!(matches!(ws.rate("bob", 3, ""), Err(EngineError::NotPublished(_))));

        ws.is_published = true;
        ws.published_id_number = Some(1);
        ws.rate("bob", 2, "ok").unwrap();
        ws.rate("carol", 4, "great").unwrap();
        ws.rate("bob", 4, "better now").unwrap();
        assert!(matches!(ws.rate("bob", 5, "off the scale"), Err(EngineError::InvalidRating(5))));
        assert_eq!(ws.ratings().len(), 2);
        assert_eq!(ws.rating(), Some(4.0));
        assert!(ws.is_rater("bob"));
        assert!(!ws.is_rater("dave"));
    }

    #[test]
    fn published_is_read_only() {
        let mut ws = sheet();
        ws.is_published = true;
        ws.published_id_number = Some(1);
        assert!(matches!(
            ws.insert_cell(None, CellPosition::End, "x"),
            Err(EngineError::ReadOnly(_))
        ));
        assert!(ws.rename(None, "x").is_err());
    }

    #[test]
    fn persistable_copy_has_no_transient_state() {
        let mut ws = sheet();
        ws.insert_cell(None, CellPosition::End, "a").unwrap();
        ws.enqueue_all(None).unwrap();
        ws.prepare_dispatch();
        let copy = ws.persistable();
        assert!(copy.queue().is_empty());
        assert_eq!(copy.cells()[0].state(), CellState::Idle);
        copy.check_invariants().unwrap();
    }

    #[test]
    fn serde_round_trip_keeps_counter() {
        let mut ws = sheet();
        ws.insert_cell(None, CellPosition::End, "a").unwrap();
        let json = serde_json::to_string(&ws.persistable()).unwrap();
        let back: Worksheet = serde_json::from_str(&json).unwrap();
        assert_eq!(back.next_cell_id(), 1);
        assert_eq!(back.state_number(), ws.state_number());
        assert_eq!(back.cells()[0].input(), "a");
    }
}
