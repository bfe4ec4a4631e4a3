//! Published copies
//!
//! Publishing copies a worksheet's cells by value (input plus the output of
//! their last finished run) into a separate, read-only worksheet under the
//! `pub` owner. Republishing overwrites that copy in place, keeping its
//! number, ratings and version history.

use crate::cell::Cell;
use crate::ids::WorksheetId;
use crate::tracker::Tracker;
use crate::worksheet::Worksheet;
use std::collections::{BTreeMap, BTreeSet};

/// Build (or refresh) the published copy of `source`.
///
/// `previous` is the existing copy when republishing; `number` is used only
/// for a first publish.
#[must_use]
pub fn published_copy(source: &Worksheet, previous: Option<Worksheet>, number: u64) -> Worksheet {
    let cells: Vec<Cell> = source.cells.iter().map(Cell::settled_copy).collect();
    match previous {
        Some(mut copy) => {
            copy.name = source.name.clone();
            copy.system = source.system.clone();
            copy.cells = cells;
            copy.next_cell_id = copy.next_cell_id.max(source.next_cell_id);
            copy.published_filename = Some(source.filename());
            let mut tracker = copy.tracker.clone();
            let at = tracker.bump();
            tracker.mark_structure_changed();
            tracker.mark_metadata_changed();
            copy.tracker = tracker;
            for idx in 0..copy.cells.len() {
                copy.cells[idx].touch(at);
            }
            copy
        }
        None => {
            let id = WorksheetId::published(number);
            let mut tracker = Tracker::new();
            let at = tracker.bump();
            tracker.mark_structure_changed();
            let mut cells = cells;
            for cell in &mut cells {
                cell.touch(at);
            }
            Worksheet {
                id,
                name: source.name.clone(),
                collaborators: BTreeSet::new(),
                cells,
                queue: crate::queue::ExecutionQueue::new(),
                next_cell_id: source.next_cell_id,
                system: source.system.clone(),
                is_published: true,
                published_id_number: Some(number),
                published_filename: Some(source.filename()),
                auto_publish: false,
                ratings: Vec::new(),
                folders: BTreeMap::new(),
                tracker,
                created_at: chrono::Utc::now(),
            }
        }
    }
}

/// Id of the existing published copy of `source`, if any
#[must_use]
pub fn published_id_of(source: &Worksheet) -> Option<WorksheetId> {
    source
        .published_filename()
        .and_then(|f| f.parse::<WorksheetId>().ok())
        .filter(WorksheetId::is_published_namespace)
}
