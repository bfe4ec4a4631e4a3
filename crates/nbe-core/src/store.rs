//! Storage contract
//!
//! The engine persists worksheets, snapshots and attached data files through
//! `WorksheetStore`.
//! `MemoryStore` keeps everything in process; the filesystem implementation
//! lives in `nbe-store`.

use crate::error::StoreError;
use crate::ids::{SnapshotId, WorksheetId};
use crate::revisions::{sort_newest_first, RevisionInfo, Snapshot};
use crate::worksheet::Worksheet;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Persistence for worksheets and their snapshot history
#[async_trait]
pub trait WorksheetStore: Send + Sync + 'static {
    /// Create or overwrite a worksheet record
    async fn save_worksheet(&self, worksheet: &Worksheet) -> Result<(), StoreError>;

    /// Load a worksheet, `None` if absent
    async fn load_worksheet(&self, id: &WorksheetId) -> Result<Option<Worksheet>, StoreError>;

    /// Remove a worksheet with its snapshots and data files
    async fn delete_worksheet(&self, id: &WorksheetId) -> Result<(), StoreError>;

    /// Worksheet ids, optionally restricted to one owner
    async fn list_worksheets(&self, owner: Option<&str>) -> Result<Vec<WorksheetId>, StoreError>;

    /// Persist a snapshot (never overwritten)
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    async fn load_snapshot(
        &self,
        worksheet: &WorksheetId,
        id: SnapshotId,
    ) -> Result<Option<Snapshot>, StoreError>;

    /// Snapshot metadata, newest first
    async fn list_snapshots(&self, worksheet: &WorksheetId) -> Result<Vec<RevisionInfo>, StoreError>;

    async fn delete_snapshot(&self, worksheet: &WorksheetId, id: SnapshotId) -> Result<(), StoreError>;

    /// Highest worksheet number used by `owner`, 0 when none
    async fn max_worksheet_number(&self, owner: &str) -> Result<u64, StoreError>;

    /// Attach (or overwrite) a data file. `name` must pass
    /// [`valid_data_file_name`].
    async fn save_data_file(&self, worksheet: &WorksheetId, name: &str, contents: &[u8]) -> Result<(), StoreError>;

    async fn load_data_file(&self, worksheet: &WorksheetId, name: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Attached file names, sorted
    async fn list_data_files(&self, worksheet: &WorksheetId) -> Result<Vec<String>, StoreError>;

    /// Returns whether the file existed
    async fn delete_data_file(&self, worksheet: &WorksheetId, name: &str) -> Result<bool, StoreError>;
}

/// A bare file name: not empty, not hidden, no path separators
#[must_use]
pub fn valid_data_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.chars().any(|c| matches!(c, '/' | '\\' | '\0'))
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    worksheets: DashMap<WorksheetId, Worksheet>,
    snapshots: DashMap<WorksheetId, Vec<Snapshot>>,
    data_files: DashMap<WorksheetId, BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored worksheets
    #[must_use]
    pub fn len(&self) -> usize {
        self.worksheets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.worksheets.is_empty()
    }
}

#[async_trait]
impl WorksheetStore for MemoryStore {
    async fn save_worksheet(&self, worksheet: &Worksheet) -> Result<(), StoreError> {
        self.worksheets
            .insert(worksheet.id().clone(), worksheet.persistable());
        Ok(())
    }

    async fn load_worksheet(&self, id: &WorksheetId) -> Result<Option<Worksheet>, StoreError> {
        Ok(self.worksheets.get(id).map(|w| w.value().clone()))
    }

    async fn delete_worksheet(&self, id: &WorksheetId) -> Result<(), StoreError> {
        self.worksheets.remove(id);
        self.snapshots.remove(id);
        self.data_files.remove(id);
        Ok(())
    }

    async fn list_worksheets(&self, owner: Option<&str>) -> Result<Vec<WorksheetId>, StoreError> {
        let mut ids: Vec<WorksheetId> = self
            .worksheets
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| owner.map_or(true, |o| id.owner() == o))
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut entry = self.snapshots.entry(snapshot.worksheet.clone()).or_default();
        if !entry.iter().any(|s| s.id == snapshot.id) {
            entry.push(snapshot.clone());
        }
        Ok(())
    }

    async fn load_snapshot(
        &self,
        worksheet: &WorksheetId,
        id: SnapshotId,
    ) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .snapshots
            .get(worksheet)
            .and_then(|list| list.iter().find(|s| s.id == id).cloned()))
    }

    async fn list_snapshots(&self, worksheet: &WorksheetId) -> Result<Vec<RevisionInfo>, StoreError> {
        let mut infos: Vec<RevisionInfo> = self
            .snapshots
            .get(worksheet)
            .map(|list| list.iter().map(Snapshot::info).collect())
            .unwrap_or_default();
        sort_newest_first(&mut infos);
        Ok(infos)
    }

    async fn delete_snapshot(&self, worksheet: &WorksheetId, id: SnapshotId) -> Result<(), StoreError> {
        if let Some(mut list) = self.snapshots.get_mut(worksheet) {
            list.retain(|s| s.id != id);
        }
        Ok(())
    }

    async fn max_worksheet_number(&self, owner: &str) -> Result<u64, StoreError> {
        Ok(self
            .worksheets
            .iter()
            .filter(|e| e.key().owner() == owner)
            .map(|e| e.key().number())
            .max()
            .unwrap_or(0))
    }

    async fn save_data_file(&self, worksheet: &WorksheetId, name: &str, contents: &[u8]) -> Result<(), StoreError> {
        if !valid_data_file_name(name) {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        self.data_files
            .entry(worksheet.clone())
            .or_default()
            .insert(name.to_string(), contents.to_vec());
        Ok(())
    }

    async fn load_data_file(&self, worksheet: &WorksheetId, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .data_files
            .get(worksheet)
            .and_then(|files| files.get(name).cloned()))
    }

    async fn list_data_files(&self, worksheet: &WorksheetId) -> Result<Vec<String>, StoreError> {
        Ok(self
            .data_files
            .get(worksheet)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_data_file(&self, worksheet: &WorksheetId, name: &str) -> Result<bool, StoreError> {
        Ok(self
            .data_files
            .get_mut(worksheet)
            .is_some_and(|mut files| files.remove(name).is_some()))
    }
}
