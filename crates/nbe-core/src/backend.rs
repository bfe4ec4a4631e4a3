//! Backend capability traits
//!
//! The engine never knows how code is run. A `Backend` starts sessions; a
//! `BackendSession` executes code and streams `OutputEvent`s back over a
//! channel. Closing the channel without a terminal event is treated as a
//! crash.

use crate::cell::{CompletionStatus, OutputChunk};
use crate::error::BackendError;
use crate::ids::SessionId;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Code submitted to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    /// Cell body with directives stripped
    pub code: String,
    /// System to evaluate in (cell override or worksheet system)
    pub system: String,
    /// `%time` / `%timeit` requested
    pub timed: bool,
}

/// Event streamed back while a request runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// Incremental output
    Chunk(OutputChunk),
    /// Run finished (terminal)
    Finished(CompletionStatus),
    /// Run stopped by an interrupt (terminal)
    Interrupted,
    /// Session died (terminal)
    Crashed(String),
}

impl OutputEvent {
    /// Whether no further events follow
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }
}

/// A running backend process bound to one worksheet
#[async_trait]
pub trait BackendSession: Send + Sync + fmt::Debug {
    /// Session identifier
    fn id(&self) -> SessionId;

    /// System the session was started for
    fn system(&self) -> &str;

    /// Submit code; events arrive on the returned channel
    async fn execute(
        &self,
        request: ExecuteRequest,
    ) -> Result<mpsc::Receiver<OutputEvent>, BackendError>;

    /// Ask the running computation to stop. Acknowledgment arrives as
    /// `OutputEvent::Interrupted`; a session may ignore the request.
    async fn interrupt(&self) -> Result<(), BackendError>;

    /// Tear the session down. Must not fail.
    async fn shutdown(&self);
}

/// Factory for backend sessions
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Start a session for `system`
    async fn start(&self, system: &str) -> Result<Arc<dyn BackendSession>, BackendError>;
}
