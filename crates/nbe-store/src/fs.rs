//! Filesystem store
//!
//! Layout under the root directory:
//!
//! ```text
//! home/<owner>/<number>/worksheet.json
//! home/<owner>/<number>/snapshots/<snapshot-id>.json
//! home/<owner>/<number>/data/<file>
//! ```
//!
//! Published copies live under `home/pub/<number>/`. Records are written to a
//! temporary file and renamed into place so a crash never leaves a torn
//! record behind.

use crate::cache::SnapshotCache;
use async_trait::async_trait;
use nbe_core::revisions::sort_newest_first;
use nbe_core::store::valid_data_file_name;
use nbe_core::{RevisionInfo, Snapshot, SnapshotId, StoreError, Worksheet, WorksheetId, WorksheetStore};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const WORKSHEET_FILE: &str = "worksheet.json";
const SNAPSHOT_DIR: &str = "snapshots";
const DATA_DIR: &str = "data";
const TMP_SUFFIX: &str = ".tmp";

/// Worksheets and snapshots as JSON files
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    snapshots: SnapshotCache,
}

impl FsStore {
    /// Open (and create if needed) a store rooted at `root`
    ///
    /// # Errors
    /// `StoreError::Io` if the root cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let home = root.join("home");
        tokio::fs::create_dir_all(&home)
            .await
            .map_err(|e| StoreError::io_error(&home, e))?;
        tracing::debug!(root = %root.display(), "filesystem store opened");
        Ok(Self {
            root,
            snapshots: SnapshotCache::default(),
        })
    }

    /// Replace the snapshot cache (e.g. to change its capacity)
    #[must_use]
    pub fn with_cache(mut self, cache: SnapshotCache) -> Self {
        self.snapshots = cache;
        self
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot cache shared by this store
    #[must_use]
    pub fn cache(&self) -> &SnapshotCache {
        &self.snapshots
    }

    fn owner_dir(&self, owner: &str) -> PathBuf {
        self.root.join("home").join(owner)
    }

    /// Directory of one worksheet
    #[must_use]
    pub fn worksheet_dir(&self, id: &WorksheetId) -> PathBuf {
        self.owner_dir(id.owner()).join(id.number().to_string())
    }

    /// Directory for files the worksheet's code reads and writes
    #[must_use]
    pub fn data_dir(&self, id: &WorksheetId) -> PathBuf {
        self.worksheet_dir(id).join(DATA_DIR)
    }

    fn snapshot_dir(&self, id: &WorksheetId) -> PathBuf {
        self.worksheet_dir(id).join(SNAPSHOT_DIR)
    }

    fn snapshot_path(&self, worksheet: &WorksheetId, id: SnapshotId) -> PathBuf {
        self.snapshot_dir(worksheet).join(format!("{id}.json"))
    }

    fn data_file_path(&self, worksheet: &WorksheetId, name: &str) -> Result<PathBuf, StoreError> {
        if valid_data_file_name(name) {
            Ok(self.data_dir(worksheet).join(name))
        } else {
            Err(StoreError::InvalidName(name.to_string()))
        }
    }

    async fn load_snapshot_file(&self, path: &Path) -> Result<Option<Snapshot>, StoreError> {
        match read_if_exists(path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl WorksheetStore for FsStore {
    async fn save_worksheet(&self, worksheet: &Worksheet) -> Result<(), StoreError> {
        let dir = self.worksheet_dir(worksheet.id());
        create_dir(&dir.join(DATA_DIR)).await?;
        let record = serde_json::to_vec_pretty(&worksheet.persistable())?;
        write_atomic(&dir.join(WORKSHEET_FILE), &record).await?;
        tracing::debug!(worksheet = %worksheet.id(), state_number = worksheet.state_number(), "worksheet saved");
        Ok(())
    }

    async fn load_worksheet(&self, id: &WorksheetId) -> Result<Option<Worksheet>, StoreError> {
        let path = self.worksheet_dir(id).join(WORKSHEET_FILE);
        let Some(bytes) = read_if_exists(&path).await? else {
            return Ok(None);
        };
        let worksheet: Worksheet = serde_json::from_slice(&bytes)?;
        if worksheet.id() != id {
            return Err(StoreError::Missing(format!(
                "{} holds worksheet {}",
                path.display(),
                worksheet.id()
            )));
        }
        Ok(Some(worksheet))
    }

    async fn delete_worksheet(&self, id: &WorksheetId) -> Result<(), StoreError> {
        let dir = self.worksheet_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io_error(&dir, e)),
        }
        self.snapshots.invalidate_worksheet(id);
        tracing::info!(worksheet = %id, "worksheet deleted from disk");
        Ok(())
    }

    async fn list_worksheets(&self, owner: Option<&str>) -> Result<Vec<WorksheetId>, StoreError> {
        let owners = match owner {
            Some(owner) => vec![owner.to_string()],
            None => list_dir_names(&self.root.join("home")).await?,
        };
        let mut ids = Vec::new();
        for owner in owners {
            for entry in list_dir_names(&self.owner_dir(&owner)).await? {
                let Ok(number) = entry.parse::<u64>() else {
                    continue;
                };
                let id = WorksheetId::new(owner.as_str(), number);
                if tokio::fs::try_exists(self.worksheet_dir(&id).join(WORKSHEET_FILE))
                    .await
                    .unwrap_or(false)
                {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let dir = self.snapshot_dir(&snapshot.worksheet);
        create_dir(&dir).await?;
        let path = self.snapshot_path(&snapshot.worksheet, snapshot.id);
        write_atomic(&path, &serde_json::to_vec(snapshot)?).await?;
        self.snapshots.insert(snapshot.clone()).await;
        Ok(())
    }

    async fn load_snapshot(
        &self,
        worksheet: &WorksheetId,
        id: SnapshotId,
    ) -> Result<Option<Snapshot>, StoreError> {
        let path = self.snapshot_path(worksheet, id);
        let loaded = self
            .snapshots
            .try_get_or_load(worksheet, id, || self.load_snapshot_file(&path))
            .await?;
        Ok(loaded.map(|s| (*s).clone()))
    }

    async fn list_snapshots(&self, worksheet: &WorksheetId) -> Result<Vec<RevisionInfo>, StoreError> {
        let dir = self.snapshot_dir(worksheet);
        let mut revisions = Vec::new();
        for name in list_file_names(&dir).await? {
            let Some(id) = name
                .strip_suffix(".json")
                .and_then(|stem| SnapshotId::from_str(stem).ok())
            else {
                continue;
            };
            if let Some(snapshot) = self.load_snapshot(worksheet, id).await? {
                revisions.push(snapshot.info());
            }
        }
        sort_newest_first(&mut revisions);
        Ok(revisions)
    }

    async fn delete_snapshot(&self, worksheet: &WorksheetId, id: SnapshotId) -> Result<(), StoreError> {
        let path = self.snapshot_path(worksheet, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io_error(&path, e)),
        }
        self.snapshots.invalidate(worksheet, id).await;
        Ok(())
    }

    async fn max_worksheet_number(&self, owner: &str) -> Result<u64, StoreError> {
        let max = list_dir_names(&self.owner_dir(owner))
            .await?
            .iter()
            .filter_map(|name| name.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok(max)
    }

    async fn save_data_file(&self, worksheet: &WorksheetId, name: &str, contents: &[u8]) -> Result<(), StoreError> {
        let path = self.data_file_path(worksheet, name)?;
        create_dir(&self.data_dir(worksheet)).await?;
        write_atomic(&path, contents).await?;
        tracing::debug!(%worksheet, file = name, bytes = contents.len(), "data file saved");
        Ok(())
    }

    async fn load_data_file(&self, worksheet: &WorksheetId, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.data_file_path(worksheet, name)?;
        read_if_exists(&path).await
    }

    async fn list_data_files(&self, worksheet: &WorksheetId) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = list_file_names(&self.data_dir(worksheet))
            .await?
            .into_iter()
            .filter(|name| valid_data_file_name(name) && !name.ends_with(TMP_SUFFIX))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn delete_data_file(&self, worksheet: &WorksheetId, name: &str) -> Result<bool, StoreError> {
        let path = self.data_file_path(worksheet, name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io_error(&path, e)),
        }
    }
}

async fn create_dir(dir: &Path) -> Result<(), StoreError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| StoreError::io_error(dir, e))
}

async fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io_error(path, e)),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| StoreError::io_error(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io_error(path, e))
}

async fn list_entries(dir: &Path, want_dirs: bool) -> Result<Vec<String>, StoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io_error(dir, e)),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io_error(dir, e))?
    {
        let is_dir = entry
            .file_type()
            .await
            .map_err(|e| StoreError::io_error(entry.path(), e))?
            .is_dir();
        if is_dir != want_dirs {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

async fn list_dir_names(dir: &Path) -> Result<Vec<String>, StoreError> {
    list_entries(dir, true).await
}

async fn list_file_names(dir: &Path) -> Result<Vec<String>, StoreError> {
    list_entries(dir, false).await
}
