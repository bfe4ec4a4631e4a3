//! NBE Store - filesystem persistence
//!
//! Implements [`nbe_core::WorksheetStore`] on top of a directory tree:
//! - One directory per worksheet under `home/<owner>/<number>/`
//! - JSON records written atomically (temp file, then rename)
//! - Snapshots cached in memory once read, since they never change
//!
//! # Example
//!
//! ```rust,ignore
//! use nbe_store::FsStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), nbe_core::StoreError> {
//! let store = Arc::new(FsStore::open("/var/lib/nbe").await?);
//! let notebook = Notebook::new(config, backend, store, users)?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod cache;
pub mod fs;

pub use cache::{CacheStats, SnapshotCache};
pub use fs::FsStore;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
