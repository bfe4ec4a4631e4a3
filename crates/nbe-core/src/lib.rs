//! NBE Core - Notebook Engine
//!
//! The worksheet execution core that:
//! - Keeps worksheets as ordered cells with per-cell execution state
//! - Queues cell evaluations and runs them one at a time per worksheet
//! - Shares a bounded pool of backend sessions between worksheets
//! - Escalates unanswered interrupts to a session teardown
//! - Tracks a monotonic state number per worksheet for delta polling
//! - Captures snapshots, reverts to them and publishes read-only copies
//!
//! # Example
//!
//! ```rust,ignore
//! use nbe_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(backend: Arc<dyn Backend>) -> Result<(), EngineError> {
//! let users = Arc::new(StaticUsers::new().with_user("alice"));
//! let notebook = Notebook::new(EngineConfig::new(), backend, Arc::new(MemoryStore::new()), users)?;
//!
//! let ws = notebook.create_worksheet("alice", "scratch", None).await?;
//! let cell = notebook.append_cell("alice", &ws, "1+1").await?;
//! notebook.evaluate("alice", &ws, cell, None).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod backend;
pub mod body;
pub mod cell;
pub mod config;
pub mod directives;
pub mod error;
pub mod ids;
pub mod interrupt;
pub mod notebook;
pub mod publish;
pub mod queue;
pub mod revisions;
pub mod state;
pub mod store;
pub mod tracker;
pub mod users;
pub mod view;
pub mod worker_pool;
pub mod worksheet;

// Re-exports for convenience
pub use backend::{Backend, BackendSession, ExecuteRequest, OutputEvent};
pub use body::{parse_body, Block};
pub use cell::{Cell, CellFailure, CellKind, CompletionStatus, FailureKind, Output, OutputChunk};
pub use config::{EngineConfig, InterruptConfig, InterruptPolicy, SessionStartConfig, SnapshotConfig};
pub use directives::{parse, Directive, DirectiveError, ParsedInput, SessionCommand};
pub use error::{BackendError, EngineError, NotFound, PoolError, StoreError};
pub use ids::{CellId, InvalidWorksheetId, SessionId, SnapshotId, WorksheetId, PUBLISHED_OWNER};
pub use interrupt::{InterruptFeedback, InterruptOutcome, InterruptReport, Severity};
pub use notebook::Notebook;
pub use revisions::{RevisionInfo, Snapshot};
pub use state::{CellState, TransitionError};
pub use store::{valid_data_file_name, MemoryStore, WorksheetStore};
pub use tracker::Tracker;
pub use users::{StaticUsers, UserDirectory};
pub use view::{CellView, PollDelta, WorksheetSummary, WorksheetView};
pub use worker_pool::{Lease, PoolStats, WorkerPool};
pub use worksheet::{CellPosition, DeletedCell, Folder, Rating, Worksheet};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with NBE Core
    pub use crate::{
        Backend, BackendError, BackendSession, CellId, CellState, CompletionStatus, EngineConfig,
        EngineError, ExecuteRequest, Folder, MemoryStore, Notebook, OutputChunk, OutputEvent,
        PollDelta, SessionId, StaticUsers, WorksheetId, WorksheetStore, WorksheetView,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Backend whose sessions can never be started
    struct Offline;

    #[async_trait]
    impl Backend for Offline {
        async fn start(&self, system: &str) -> Result<Arc<dyn BackendSession>, BackendError> {
            Err(BackendError::Rejected(format!("{system} is offline")))
        }
    }

    fn notebook() -> Notebook {
        let users = StaticUsers::new().with_user("alice").with_user("bob");
        Notebook::new(
            EngineConfig::new().with_pool_capacity(1),
            Arc::new(Offline),
            Arc::new(MemoryStore::new()),
            Arc::new(users),
        )
        .expect("valid config")
    }

    #[tokio::test]
    async fn editing_without_a_backend() {
        let nb = notebook();
        let ws = nb.create_worksheet("alice", "scratch", None).await.unwrap();
        assert_eq!(ws, WorksheetId::new("alice", 1));

        let first = nb.append_cell("alice", &ws, "1+1").await.unwrap();
        let second = nb.insert_cell_before("alice", &ws, first, "x = 3").await.unwrap();
        let view = nb.view(&ws).await.unwrap();
        let order: Vec<CellId> = view.cells.iter().map(|c| c.id).collect();
        assert_eq!(order, vec![second, first]);
        assert!(nb.check_invariants(&ws).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn strangers_cannot_edit() {
        let nb = notebook();
        let ws = nb.create_worksheet("alice", "private", None).await.unwrap();
        let err = nb.append_cell("bob", &ws, "1").await.unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied { .. }));

        nb.add_collaborator("alice", &ws, "bob").await.unwrap();
        assert!(nb.append_cell("bob", &ws, "1").await.is_ok());
    }

    #[tokio::test]
    async fn unstartable_session_fails_the_cell() {
        let nb = notebook();
        let ws = nb.create_worksheet("alice", "offline", None).await.unwrap();
        let cell = nb.append_cell("alice", &ws, "1+1").await.unwrap();
        nb.evaluate("alice", &ws, cell, None).await.unwrap();
        assert!(nb.wait_until_idle(&ws, std::time::Duration::from_secs(5)).await.unwrap());

        let view = nb.view(&ws).await.unwrap();
        assert_eq!(view.cells[0].state, CellState::Errored);
        assert_eq!(view.cells[0].failure.as_ref().map(|f| f.kind), Some(FailureKind::Backend));
    }

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
