//! Cells: the unit of input, output and execution state
//!
//! A cell keeps two output buffers:
//! - the committed output of its last finished run (`output_text`/`output_html`)
//! - a live buffer filled by output chunks while it is computing
//!
//! Editing the input keeps the committed output (rendered as stale) until the
//! next run settles.

use crate::directives::{self, Directive, DirectiveError, ParsedInput};
use crate::ids::CellId;
use crate::state::{validate_transition, CellState, TransitionError};
use serde::{Deserialize, Serialize};

/// Accumulated output of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    /// Plain text output
    pub text: String,
    /// Rich (HTML) output
    pub html: String,
}

impl Output {
    /// Whether nothing was produced
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.html.is_empty()
    }

    fn append(&mut self, chunk: &OutputChunk) {
        self.text.push_str(&chunk.text);
        if let Some(html) = &chunk.html {
            self.html.push_str(html);
        }
    }
}

/// Incremental output from a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Text to append
    pub text: String,
    /// HTML to append, if any
    pub html: Option<String>,
}

impl OutputChunk {
    /// Plain text chunk
    #[inline]
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            html: None,
        }
    }

    /// Chunk with an HTML rendering
    #[inline]
    #[must_use]
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }
}

/// How a backend run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    /// Evaluation succeeded
    Success,
    /// Evaluation raised an error in the user's code
    Error(String),
}

/// Classification of an `Errored` cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Code raised an error
    Backend,
    /// Session died mid-computation
    Crashed,
    /// Exceeded the per-cell wall-clock limit
    TimedOut,
    /// Session ignored interrupts and was torn down
    InterruptTimeout,
    /// Session restarted while computing
    Restarted,
    /// Malformed directive
    Parse,
}

/// Reason attached to an `Errored` cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellFailure {
    /// Failure classification
    pub kind: FailureKind,
    /// Human-readable message (also appended to the output text)
    pub message: String,
}

impl CellFailure {
    /// Create failure
    #[inline]
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What a cell holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    /// Code sent to the backend
    #[default]
    Compute,
    /// HTML shown as is; never executed
    Text,
}

/// A worksheet cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    id: CellId,
    #[serde(default)]
    kind: CellKind,
    input: String,
    output: Output,
    #[serde(skip)]
    live: Output,
    directives: Vec<Directive>,
    directive_error: Option<DirectiveError>,
    state: CellState,
    evaluated: bool,
    failure: Option<CellFailure>,
    /// State number of the last change, for poll deltas
    changed_at: u64,
    #[serde(skip)]
    dispatched_input: Option<String>,
}

impl Cell {
    /// Create an idle cell
    #[must_use]
    pub fn new(id: CellId, input: impl Into<String>) -> Self {
        Self::with_kind(id, CellKind::Compute, input.into())
    }

    /// Create a text cell holding `html`
    #[must_use]
    pub fn text(id: CellId, html: impl Into<String>) -> Self {
        Self::with_kind(id, CellKind::Text, html.into())
    }

    fn with_kind(id: CellId, kind: CellKind, input: String) -> Self {
        let mut cell = Self {
            id,
            kind,
            input: String::new(),
            output: Output::default(),
            live: Output::default(),
            directives: Vec::new(),
            directive_error: None,
            state: CellState::Idle,
            evaluated: false,
            failure: None,
            changed_at: 0,
            dispatched_input: None,
        };
        cell.store_input(input);
        cell
    }

    fn store_input(&mut self, input: String) {
        if self.kind == CellKind::Text {
            self.input = input;
            return;
        }
        match directives::parse(&input) {
            Ok(parsed) => {
                self.directives = parsed.directives().to_vec();
                self.directive_error = None;
            }
            Err(err) => {
                self.directives.clear();
                self.directive_error = Some(err);
            }
        }
        self.input = input;
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> CellId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> CellKind {
        self.kind
    }

    /// Text cells are rendered, never executed
    #[inline]
    #[must_use]
    pub fn is_text(&self) -> bool {
        self.kind == CellKind::Text
    }

    #[inline]
    #[must_use]
    pub fn input(&self) -> &str {
        &self.input
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> CellState {
        self.state
    }

    #[inline]
    #[must_use]
    pub fn evaluated(&self) -> bool {
        self.evaluated
    }

    #[inline]
    #[must_use]
    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    #[inline]
    #[must_use]
    pub fn directive_error(&self) -> Option<&DirectiveError> {
        self.directive_error.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn failure(&self) -> Option<&CellFailure> {
        self.failure.as_ref()
    }

    /// Output shown to clients: the live buffer while computing, otherwise the
    /// committed output
    #[inline]
    #[must_use]
    pub fn output(&self) -> &Output {
        if self.state == CellState::Computing {
            &self.live
        } else {
            &self.output
        }
    }

    /// Output of the last settled run
    #[inline]
    #[must_use]
    pub fn committed_output(&self) -> &Output {
        &self.output
    }

    /// Output belongs to an earlier version of the input
    #[inline]
    #[must_use]
    pub fn output_is_stale(&self) -> bool {
        !self.evaluated && !self.output.is_empty() && !self.state.is_pending()
    }

    /// Whether the cell runs on every fresh session
    #[inline]
    #[must_use]
    pub fn is_auto(&self) -> bool {
        self.directives.contains(&Directive::Auto)
    }

    /// Parse the input for dispatch
    ///
    /// # Errors
    /// The directive error recorded at the last edit.
    pub fn parsed_input(&self) -> Result<ParsedInput, DirectiveError> {
        directives::parse(&self.input)
    }

    #[inline]
    #[must_use]
    pub(crate) fn changed_at(&self) -> u64 {
        self.changed_at
    }

    #[inline]
    pub(crate) fn touch(&mut self, state_number: u64) {
        self.changed_at = state_number;
    }

    fn transition(&mut self, to: CellState) -> Result<(), TransitionError> {
        validate_transition(self.state, to)?;
        tracing::trace!(cell = %self.id, from = %self.state, %to, "cell transition");
        self.state = to;
        Ok(())
    }

    /// Replace the input. Settled cells return to `Idle`; pending cells keep
    /// running and will not count as evaluated for the new text.
    ///
    /// Returns `false` when the input is unchanged.
    pub fn set_input(&mut self, input: impl Into<String>) -> bool {
        let input = input.into();
        if input == self.input {
            return false;
        }
        self.store_input(input);
        self.evaluated = false;
        if self.state.is_settled() {
            self.state = CellState::Idle;
        }
        true
    }

    pub(crate) fn mark_queued(&mut self) -> Result<(), TransitionError> {
        self.transition(CellState::Queued)
    }

    pub(crate) fn mark_dequeued(&mut self) -> Result<(), TransitionError> {
        self.transition(CellState::Idle)
    }

    /// Enter `Computing`: clears the failure and resets the live buffer
    pub(crate) fn begin_computing(&mut self) -> Result<(), TransitionError> {
        self.transition(CellState::Computing)?;
        self.failure = None;
        self.live = Output::default();
        self.dispatched_input = Some(self.input.clone());
        Ok(())
    }

    /// Append a chunk to the live buffer; ignored unless computing
    pub(crate) fn append_output(&mut self, chunk: &OutputChunk) -> bool {
        if self.state != CellState::Computing {
            return false;
        }
        self.live.append(chunk);
        true
    }

    /// Settle a run reported complete by the backend
    pub(crate) fn complete(&mut self, status: &CompletionStatus) -> Result<(), TransitionError> {
        match status {
            CompletionStatus::Success => {
                self.transition(CellState::Done)?;
                self.output = std::mem::take(&mut self.live);
                self.evaluated = self.dispatched_input.as_deref() == Some(self.input.as_str());
            }
            CompletionStatus::Error(message) => {
                self.fail(CellFailure::new(FailureKind::Backend, message.clone()))?;
            }
        }
        self.dispatched_input = None;
        Ok(())
    }

    /// Settle an acknowledged interrupt; partial output is kept
    pub(crate) fn interrupted(&mut self) -> Result<(), TransitionError> {
        self.transition(CellState::Interrupted)?;
        self.output = std::mem::take(&mut self.live);
        self.dispatched_input = None;
        Ok(())
    }

    /// Move to `Errored` from `Queued` or `Computing`
    pub(crate) fn fail(&mut self, failure: CellFailure) -> Result<(), TransitionError> {
        let was_computing = self.state == CellState::Computing;
        self.transition(CellState::Errored)?;
        let mut output = if was_computing {
            std::mem::take(&mut self.live)
        } else {
            Output::default()
        };
        if !failure.message.is_empty() {
            if !output.text.is_empty() && !output.text.ends_with('\n') {
                output.text.push('\n');
            }
            output.text.push_str(&failure.message);
        }
        self.output = output;
        self.evaluated = self.dispatched_input.as_deref() == Some(self.input.as_str())
            || (!was_computing && failure.kind == FailureKind::Parse);
        self.failure = Some(failure);
        self.dispatched_input = None;
        Ok(())
    }

    /// Value copy without transient execution state, used by snapshots and
    /// published copies
    #[must_use]
    pub fn settled_copy(&self) -> Self {
        let mut copy = self.clone();
        if copy.state.is_pending() {
            copy.state = CellState::Idle;
        }
        copy.live = Output::default();
        copy.dispatched_input = None;
        copy
    }

    /// Seed the committed output, e.g. from an imported plain-text body.
    /// The output counts as belonging to an earlier run.
    pub(crate) fn set_committed_text(&mut self, text: impl Into<String>) {
        self.output = Output {
            text: text.into(),
            html: String::new(),
        };
        self.evaluated = false;
    }

    /// Drop all output (keeps the input)
    pub(crate) fn clear_output(&mut self) {
        self.output = Output::default();
        self.failure = None;
        self.evaluated = false;
        if self.state.is_settled() {
            self.state = CellState::Idle;
        }
    }
}
