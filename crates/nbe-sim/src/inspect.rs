//! Read-only listing of a filesystem store

use nbe_core::{StoreError, WorksheetStore};
use nbe_store::FsStore;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;

/// One worksheet as found on disk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorksheetListing {
    pub filename: String,
    pub name: String,
    pub system: String,
    pub cells: usize,
    pub state_number: u64,
    pub revisions: usize,
    /// Snapshot id of the newest revision
    pub latest_revision: Option<String>,
    pub published_as: Option<String>,
}

/// Every worksheet under a store root
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreListing {
    pub worksheets: Vec<WorksheetListing>,
}

impl StoreListing {
    /// Table for terminals
    #[must_use]
    pub fn generate_text(&self) -> String {
        if self.worksheets.is_empty() {
            return "no worksheets\n".to_string();
        }
        let mut out = format!(
            "{:<16} {:<24} {:<8} {:>5} {:>7} {:>9}\n",
            "FILENAME", "NAME", "SYSTEM", "CELLS", "STATE", "REVISIONS"
        );
        for ws in &self.worksheets {
            let _ = writeln!(
                out,
                "{:<16} {:<24} {:<8} {:>5} {:>7} {:>9}",
                ws.filename, ws.name, ws.system, ws.cells, ws.state_number, ws.revisions
            );
        }
        out
    }
}

/// List the worksheets under `root`, optionally for one owner
///
/// # Errors
/// `StoreError` if the tree cannot be read or holds a corrupt record.
pub async fn inspect_store(root: &Path, owner: Option<&str>) -> Result<StoreListing, StoreError> {
    let store = FsStore::open(root).await?;
    let mut listing = StoreListing::default();
    for id in store.list_worksheets(owner).await? {
        let Some(ws) = store.load_worksheet(&id).await? else {
            continue;
        };
        let revisions = store.list_snapshots(&id).await?;
        listing.worksheets.push(WorksheetListing {
            filename: ws.filename(),
            name: ws.name().to_string(),
            system: ws.system().to_string(),
            cells: ws.cells().len(),
            state_number: ws.state_number(),
            revisions: revisions.len(),
            latest_revision: revisions.first().map(|r| r.id.to_string()),
            published_as: ws.published_filename().map(str::to_string),
        });
    }
    tracing::debug!(root = %root.display(), count = listing.worksheets.len(), "store inspected");
    Ok(listing)
}
