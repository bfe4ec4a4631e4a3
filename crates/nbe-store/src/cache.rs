//! Snapshot cache using moka
//!
//! Snapshots never change once written, so a loaded snapshot can be served
//! from memory until it is pruned.

use moka::future::Cache;
use nbe_core::{Snapshot, SnapshotId, WorksheetId};
use std::future::Future;
use std::sync::Arc;

/// Cache key: snapshot ids are unique, the worksheet scopes invalidation
type Key = (WorksheetId, SnapshotId);

/// Statistics for cache monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of entries in cache
    pub entry_count: u64,
}

/// Loaded snapshots, LRU-evicted
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    inner: Cache<Key, Arc<Snapshot>>,
}

impl SnapshotCache {
    /// Create new cache with max capacity
    #[inline]
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .support_invalidation_closures()
                .build(),
        }
    }

    /// Cache a snapshot, replacing any entry with the same id
    pub async fn insert(&self, snapshot: Snapshot) {
        let key = (snapshot.worksheet.clone(), snapshot.id);
        self.inner.insert(key, Arc::new(snapshot)).await;
    }

    /// Cached snapshot, if present
    #[must_use]
    pub async fn get(&self, worksheet: &WorksheetId, id: SnapshotId) -> Option<Arc<Snapshot>> {
        self.inner.get(&(worksheet.clone(), id)).await
    }

    /// Serve from cache or load; a load of `None` is not cached
    pub async fn try_get_or_load<E, F, Fut>(
        &self,
        worksheet: &WorksheetId,
        id: SnapshotId,
        load: F,
    ) -> Result<Option<Arc<Snapshot>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Snapshot>, E>>,
    {
        if let Some(cached) = self.get(worksheet, id).await {
            return Ok(Some(cached));
        }
        let Some(loaded) = load().await? else {
            return Ok(None);
        };
        let loaded = Arc::new(loaded);
        self.inner
            .insert((worksheet.clone(), id), Arc::clone(&loaded))
            .await;
        Ok(Some(loaded))
    }

    /// Invalidate cache entry
    #[inline]
    pub async fn invalidate(&self, worksheet: &WorksheetId, id: SnapshotId) {
        self.inner.invalidate(&(worksheet.clone(), id)).await;
    }

    /// Drop every cached snapshot of a worksheet
    pub fn invalidate_worksheet(&self, worksheet: &WorksheetId) {
        let target = worksheet.clone();
        if let Err(e) = self
            .inner
            .invalidate_entries_if(move |key: &Key, _| key.0 == target)
        {
            tracing::warn!(%worksheet, error = %e, "snapshot cache invalidation failed");
        }
    }

    /// Get cache statistics
    #[inline]
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.inner.entry_count(),
        }
    }
}

impl Default for SnapshotCache {
    /// Create cache with default capacity (1,000 snapshots)
    fn default() -> Self {
        Self::new(1_000)
    }
}
