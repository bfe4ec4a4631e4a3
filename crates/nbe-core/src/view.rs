//! Read model handed to the presentation layer
//!
//! Plain serializable values; nothing here borrows engine internals.

use crate::cell::{Cell, CellFailure, CellKind};
use crate::directives::Directive;
use crate::ids::{CellId, WorksheetId};
use crate::state::CellState;
use crate::worksheet::{Folder, Rating, Worksheet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One cell as clients see it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellView {
    /// Cell id
    pub id: CellId,
    /// Compute or text
    pub kind: CellKind,
    /// Current input
    pub input: String,
    /// Plain-text output
    pub output_text: String,
    /// HTML output
    pub output_html: String,
    /// Directives parsed from the input
    pub directives: Vec<Directive>,
    /// Lifecycle state
    pub state: CellState,
    pub evaluated: bool,
    /// Output belongs to an earlier input
    pub stale: bool,
    /// Why the last run failed, if it did
    pub failure: Option<CellFailure>,
}

impl From<&Cell> for CellView {
    fn from(cell: &Cell) -> Self {
        let output = cell.output();
        Self {
            id: cell.id(),
            kind: cell.kind(),
            input: cell.input().to_string(),
            output_text: output.text.clone(),
            output_html: output.html.clone(),
            directives: cell.directives().to_vec(),
            state: cell.state(),
            evaluated: cell.evaluated(),
            stale: cell.output_is_stale(),
            failure: cell.failure().cloned(),
        }
    }
}

/// Whole worksheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorksheetView {
    /// Worksheet id
    pub id: WorksheetId,
    pub filename: String,
    pub name: String,
    pub owner: String,
    pub collaborators: Vec<String>,
    pub system: String,
    pub state_number: u64,
    pub is_published: bool,
    pub published_id_number: Option<u64>,
    pub published_filename: Option<String>,
    pub auto_publish: bool,
    pub ratings: Vec<Rating>,
    pub rating: Option<f64>,
    pub last_edited: DateTime<Utc>,
    /// Last editor, if any
    pub last_to_edit: Option<String>,
    /// Queued cells, front first
    pub queue: Vec<CellId>,
    /// Cell being computed
    pub computing: Option<CellId>,
    /// Cells in document order
    pub cells: Vec<CellView>,
}

impl From<&Worksheet> for WorksheetView {
    fn from(ws: &Worksheet) -> Self {
        Self {
            id: ws.id().clone(),
            filename: ws.filename(),
            name: ws.name().to_string(),
            owner: ws.owner().to_string(),
            collaborators: ws.collaborators().iter().cloned().collect(),
            system: ws.system().to_string(),
            state_number: ws.state_number(),
            is_published: ws.is_published(),
            published_id_number: ws.published_id_number(),
            published_filename: ws.published_filename().map(str::to_string),
            auto_publish: ws.auto_publish(),
            ratings: ws.ratings().to_vec(),
            rating: ws.rating(),
            last_edited: ws.tracker().last_edited(),
            last_to_edit: ws.tracker().last_to_edit().map(str::to_string),
            queue: ws.queue(),
            computing: ws.computing_cell(),
            cells: ws.cells().iter().map(CellView::from).collect(),
        }
    }
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorksheetSummary {
    /// Worksheet id
    pub id: WorksheetId,
    /// Display name
    pub name: String,
    /// Owner's user name
    pub owner: String,
    /// Folder as seen by the listing user
    pub folder: Folder,
    /// Published copy
    pub is_published: bool,
    /// Time of the last edit
    pub last_edited: DateTime<Utc>,
    pub last_to_edit: Option<String>,
}

impl WorksheetSummary {
    /// Listing entry as `user` sees it
    #[must_use]
    pub fn for_user(ws: &Worksheet, user: &str) -> Self {
        Self {
            id: ws.id().clone(),
            name: ws.name().to_string(),
            owner: ws.owner().to_string(),
            folder: ws.folder(user),
            is_published: ws.is_published(),
            last_edited: ws.tracker().last_edited(),
            last_to_edit: ws.tracker().last_to_edit().map(str::to_string),
        }
    }
}

/// Changes since a client's last known `state_number`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollDelta {
    /// Current state number
    pub state_number: u64,
    /// Tombstones were trimmed (or `since` is unknown); `changed` holds every cell
    pub full_resync: bool,
    /// Cells changed since `since`
    pub changed: Vec<CellView>,
    /// Cells deleted since `since`
    pub deleted: Vec<CellId>,
    /// Document order, present when the structure changed
    pub order: Option<Vec<CellId>>,
    /// Queued cells, front first
    pub queue: Vec<CellId>,
    /// Cell being computed
    pub computing: Option<CellId>,
    pub name: String,
    pub system: String,
    pub last_to_edit: Option<String>,
}

impl PollDelta {
    /// Nothing happened since `since`
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.full_resync && self.changed.is_empty() && self.deleted.is_empty() && self.order.is_none()
    }

    /// Compute the delta from `since`. Side-effect free.
    #[must_use]
    pub fn since(ws: &Worksheet, since: u64) -> Self {
        let tracker = ws.tracker();
        let full_resync = !tracker.can_delta_from(since);
        let changed = ws
            .cells()
            .iter()
            .filter(|c| full_resync || c.changed_at() > since)
            .map(CellView::from)
            .collect();
        let deleted = if full_resync {
            Vec::new()
        } else {
            tracker.deleted_since(since)
        };
        let order = (full_resync || tracker.structure_version() > since)
            .then(|| ws.cells().iter().map(Cell::id).collect());
        Self {
            state_number: ws.state_number(),
            full_resync,
            changed,
            deleted,
            order,
            queue: ws.queue(),
            computing: ws.computing_cell(),
            name: ws.name().to_string(),
            system: ws.system().to_string(),
            last_to_edit: tracker.last_to_edit().map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CompletionStatus, OutputChunk};
    use crate::worksheet::CellPosition;

    #[test]
    fn delta_reports_only_changed_cells() {
        let mut ws = Worksheet::new(WorksheetId::new("a", 1), "t", "sage");
        let a = ws.insert_cell(None, CellPosition::End, "a").unwrap();
        let b = ws.insert_cell(None, CellPosition::End, "b").unwrap();
        let seen = ws.state_number();

        ws.edit_cell(None, b, "bb").unwrap();
        let delta = PollDelta::since(&ws, seen);
        assert!(!delta.full_resync);
        assert_eq!(delta.changed.len(), 1);
        assert_eq!(delta.changed[0].id, b);
        assert!(delta.order.is_none());

        ws.delete_cell(None, a).unwrap();
        let delta = PollDelta::since(&ws, seen);
        assert_eq!(delta.deleted, vec![a]);
        assert_eq!(delta.order, Some(vec![b]));
    }

    #[test]
    fn no_changes_is_empty() {
        let mut ws = Worksheet::new(WorksheetId::new("a", 1), "t", "sage");
        ws.insert_cell(None, CellPosition::End, "a").unwrap();
        let delta = PollDelta::since(&ws, ws.state_number());
        assert!(delta.is_empty());
        assert_eq!(delta.state_number, ws.state_number());
    }

    #[test]
    fn unknown_since_forces_resync() {
        let mut ws = Worksheet::new(WorksheetId::new("a", 1), "t", "sage");
        ws.insert_cell(None, CellPosition::End, "a").unwrap();
        let delta = PollDelta::since(&ws, 1000);
        assert!(delta.full_resync);
        assert_eq!(delta.changed.len(), 1);
    }

    #[test]
    fn cell_view_shows_live_output_while_computing() {
        let mut ws = Worksheet::new(WorksheetId::new("a", 1), "t", "sage");
        let id = ws.insert_cell(None, CellPosition::End, "loop").unwrap();
        ws.enqueue_all(None).unwrap();
        ws.prepare_dispatch();
        ws.on_output_chunk(id, &OutputChunk::text("partial"));
        let view = WorksheetView::from(&ws);
        assert_eq!(view.cells[0].output_text, "partial");
        assert_eq!(view.computing, Some(id));
        ws.on_completion(id, &CompletionStatus::Success);
        let view = WorksheetView::from(&ws);
        assert_eq!(view.cells[0].state, CellState::Done);
        assert!(view.queue.is_empty());
    }

    #[test]
    fn view_serializes() {
        let ws = Worksheet::new(WorksheetId::new("a", 1), "t", "sage");
        let json = serde_json::to_value(WorksheetView::from(&ws)).unwrap();
        assert_eq!(json["filename"], "a/1");
        assert_eq!(json["is_published"], false);
    }
}
