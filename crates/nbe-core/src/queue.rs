//! Per-worksheet execution queue
//!
//! Strict FIFO of cell ids with at most one cell computing, always the head.
//! The queue manager operations live here as an `impl Worksheet` block since
//! every one of them moves a cell and the queue together under the same lock:
//! - `enqueue` / `enqueue_all` / `enqueue_auto_cells`
//! - `prepare_dispatch` (head → Computing)
//! - `on_output_chunk` / `on_completion` / `on_interrupted`
//! - `abort_computing` / `dequeue` / `cancel_queued` / `halt`

use crate::backend::ExecuteRequest;
use crate::cell::{CellFailure, CompletionStatus, FailureKind, OutputChunk};
use crate::config::InterruptPolicy;
use crate::directives::{Directive, SessionCommand};
use crate::error::EngineError;
use crate::ids::CellId;
use crate::state::CellState;
use crate::worksheet::Worksheet;
use std::collections::{HashSet, VecDeque};

/// Ordered cell ids without duplicates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionQueue {
    ids: VecDeque<CellId>,
}

impl ExecutionQueue {
    /// Empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cell is already queued
    #[inline]
    #[must_use]
    pub fn contains(&self, id: CellId) -> bool {
        self.ids.contains(&id)
    }

    /// Append; `false` if already queued
    pub fn push_back(&mut self, id: CellId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.ids.push_back(id);
        true
    }

    /// Insert at `index` (clamped); `false` if already queued
    pub fn insert(&mut self, index: usize, id: CellId) -> bool {
        if self.contains(id) {
            return false;
        }
        let index = index.min(self.ids.len());
        self.ids.insert(index, id);
        true
    }

    /// Drop `id` wherever it sits; `false` if it was not queued
    pub fn remove(&mut self, id: CellId) -> bool {
        match self.ids.iter().position(|q| *q == id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Next cell to run
    #[inline]
    #[must_use]
    pub fn front(&self) -> Option<CellId> {
        self.ids.front().copied()
    }

    /// Remove and return the head
    pub fn pop_front(&mut self) -> Option<CellId> {
        self.ids.pop_front()
    }

    /// Number of queued cells
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids, head first
    pub fn iter(&self) -> impl Iterator<Item = CellId> + '_ {
        self.ids.iter().copied()
    }

    /// Forget every id
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<CellId> {
        self.ids.iter().copied().collect()
    }
}

/// Work handed to the dispatcher for the head cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Submit code to the session
    Execute {
        cell: CellId,
        request: ExecuteRequest,
        /// `%save_server`: persist before executing
        save_first: bool,
    },
    /// Body is a session command; the session is restarted instead
    SessionCommand { cell: CellId, command: SessionCommand },
}

impl Dispatch {
    #[inline]
    #[must_use]
    pub fn cell(&self) -> CellId {
        match self {
            Self::Execute { cell, .. } | Self::SessionCommand { cell, .. } => *cell,
        }
    }
}

impl Worksheet {
    /// Queue a cell. No-op (`Ok(false)`) when it is already queued or is a
    /// text cell.
    ///
    /// # Errors
    /// - `EngineError::ReadOnly` for published copies
    /// - `EngineError::NotFound` for an unknown cell
    pub fn enqueue(&mut self, user: Option<&str>, cell: CellId) -> Result<bool, EngineError> {
        self.ensure_editable()?;
        let idx = self.index_of(cell)?;
        if self.cells[idx].is_text() || self.queue.contains(cell) {
            return Ok(false);
        }
        self.cells[idx].mark_queued()?;
        self.queue.push_back(cell);
        self.record(user);
        self.touch_cell(idx);
        Ok(true)
    }

    /// Queue every cell in document order
    ///
    /// # Errors
    /// `EngineError::ReadOnly` for published copies.
    pub fn enqueue_all(&mut self, user: Option<&str>) -> Result<usize, EngineError> {
        self.ensure_editable()?;
        let ids: Vec<CellId> = self.cells.iter().map(|c| c.id()).collect();
        let mut queued = 0;
        for id in ids {
            if self.enqueue(user, id)? {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Put `%auto` cells at the front of the queue (behind a computing head),
    /// in document order, skipping cells already queued
    pub fn enqueue_auto_cells(&mut self) -> usize {
        if self.is_published {
            return 0;
        }
        let mut at = usize::from(self.computing_cell().is_some());
        let mut queued = 0;
        for idx in 0..self.cells.len() {
            let cell = &self.cells[idx];
            if !cell.is_auto() || self.queue.contains(cell.id()) {
                continue;
            }
            let id = cell.id();
            if self.cells[idx].mark_queued().is_ok() {
                self.queue.insert(at, id);
                at += 1;
                queued += 1;
                self.record(None);
                self.touch_cell(idx);
            }
        }
        if queued > 0 {
            tracing::debug!(worksheet = %self.id, queued, "auto cells queued");
        }
        queued
    }

    /// Move the head to `Computing` and describe the work for it.
    ///
    /// Heads with malformed directives are failed with a parse error and
    /// skipped. Returns `None` when the queue is empty or the head is already
    /// computing.
    pub fn prepare_dispatch(&mut self) -> Option<Dispatch> {
        loop {
            let head = self.queue.front()?;
            let Ok(idx) = self.index_of(head) else {
                self.queue.pop_front();
                continue;
            };
            if self.cells[idx].state() == CellState::Computing {
                return None;
            }

            let parsed = match self.cells[idx].parsed_input() {
                Ok(parsed) => parsed,
                Err(err) => {
                    let failure = CellFailure::new(FailureKind::Parse, err.to_string());
                    if let Err(e) = self.cells[idx].fail(failure) {
                        tracing::warn!(worksheet = %self.id, cell = %head, error = %e, "dropping head");
                    }
                    self.queue.pop_front();
                    self.record(None);
                    self.touch_cell(idx);
                    continue;
                }
            };

            if let Err(e) = self.cells[idx].begin_computing() {
                tracing::warn!(worksheet = %self.id, cell = %head, error = %e, "dropping head");
                self.queue.pop_front();
                continue;
            }
            self.record(None);
            self.touch_cell(idx);

            if let Some(command) = parsed.session_command() {
                return Some(Dispatch::SessionCommand { cell: head, command });
            }
            let request = ExecuteRequest {
                code: parsed.body().to_string(),
                system: parsed.system().unwrap_or(&self.system).to_string(),
                timed: parsed.wants_timing(),
            };
            return Some(Dispatch::Execute {
                cell: head,
                request,
                save_first: parsed.has(&Directive::SaveServer),
            });
        }
    }

    /// Cell currently computing (always the head)
    #[must_use]
    pub fn computing_cell(&self) -> Option<CellId> {
        let head = self.queue.front()?;
        let idx = self.index_of(head).ok()?;
        (self.cells[idx].state() == CellState::Computing).then_some(head)
    }

    fn computing_index(&self, cell: CellId) -> Option<usize> {
        (self.computing_cell() == Some(cell))
            .then(|| self.index_of(cell).ok())
            .flatten()
    }

    /// Append output to the computing cell. Returns `false` for stale chunks.
    pub fn on_output_chunk(&mut self, cell: CellId, chunk: &OutputChunk) -> bool {
        let Some(idx) = self.computing_index(cell) else {
            return false;
        };
        if !self.cells[idx].append_output(chunk) {
            return false;
        }
        self.record(None);
        self.touch_cell(idx);
        true
    }

    /// Settle the computing cell and advance the queue. Returns `false` for
    /// a stale completion.
    pub fn on_completion(&mut self, cell: CellId, status: &CompletionStatus) -> bool {
        let Some(idx) = self.computing_index(cell) else {
            return false;
        };
        if let Err(e) = self.cells[idx].complete(status) {
            tracing::warn!(worksheet = %self.id, %cell, error = %e, "completion rejected");
            return false;
        }
        self.queue.pop_front();
        self.record(None);
        self.touch_cell(idx);
        true
    }

    /// Apply an acknowledged interrupt to the computing cell
    pub fn on_interrupted(&mut self, cell: CellId, policy: InterruptPolicy) -> bool {
        let Some(idx) = self.computing_index(cell) else {
            return false;
        };
        if self.cells[idx].interrupted().is_err() {
            return false;
        }
        self.queue.pop_front();
        self.record(None);
        self.touch_cell(idx);
        if policy == InterruptPolicy::CancelQueued {
            self.cancel_queued();
        }
        true
    }

    /// Fail the computing cell (crash, timeout, restart, unresponsive
    /// interrupt). The rest of the queue is untouched.
    pub fn abort_computing(&mut self, failure: CellFailure) -> Option<CellId> {
        let cell = self.computing_cell()?;
        let idx = self.index_of(cell).ok()?;
        tracing::debug!(worksheet = %self.id, %cell, kind = ?failure.kind, "aborting computation");
        if self.cells[idx].fail(failure).is_err() {
            return None;
        }
        self.queue.pop_front();
        self.record(None);
        self.touch_cell(idx);
        Some(cell)
    }

    /// Fail the queued head without running it (no session could be started)
    pub fn reject_head(&mut self, failure: CellFailure) -> Option<CellId> {
        let head = self.queue.front()?;
        let idx = self.index_of(head).ok()?;
        if self.cells[idx].state() != CellState::Queued {
            return None;
        }
        if self.cells[idx].fail(failure).is_err() {
            return None;
        }
        self.queue.pop_front();
        self.record(None);
        self.touch_cell(idx);
        Some(head)
    }

    /// Remove a queued (not computing) cell from the queue
    ///
    /// # Errors
    /// `EngineError::NotFound` for an unknown cell.
    pub fn dequeue(&mut self, user: Option<&str>, cell: CellId) -> Result<bool, EngineError> {
        let idx = self.index_of(cell)?;
        if self.cells[idx].state() != CellState::Queued || !self.queue.contains(cell) {
            return Ok(false);
        }
        self.cells[idx].mark_dequeued()?;
        self.queue.remove(cell);
        self.record(user);
        self.touch_cell(idx);
        Ok(true)
    }

    /// Return every queued, non-computing cell to `Idle`
    pub fn cancel_queued(&mut self) -> Vec<CellId> {
        let computing = self.computing_cell();
        let pending: Vec<CellId> = self.queue.iter().filter(|id| Some(*id) != computing).collect();
        if pending.is_empty() {
            return pending;
        }
        self.record(None);
        for id in &pending {
            self.queue.remove(*id);
            if let Ok(idx) = self.index_of(*id) {
                if self.cells[idx].mark_dequeued().is_ok() {
                    self.touch_cell(idx);
                }
            }
        }
        pending
    }

    /// Stop everything: the computing cell becomes `Interrupted`, queued cells
    /// return to `Idle`. Used by quit and revert.
    pub fn halt(&mut self) -> bool {
        let mut changed = false;
        if let Some(cell) = self.computing_cell() {
            if let Ok(idx) = self.index_of(cell) {
                if self.cells[idx].interrupted().is_ok() {
                    self.queue.pop_front();
                    self.record(None);
                    self.touch_cell(idx);
                    changed = true;
                }
            }
        }
        changed |= !self.cancel_queued().is_empty();
        changed
    }

    /// Queue ids, head first
    #[must_use]
    pub fn queue(&self) -> Vec<CellId> {
        self.queue.to_vec()
    }

    #[inline]
    #[must_use]
    pub fn has_queued_work(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Check the queue invariants, describing the first violation
    ///
    /// # Errors
    /// A message naming the violated invariant.
    pub fn check_queue_invariants(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for (pos, id) in self.queue.iter().enumerate() {
            if !seen.insert(id) {
                return Err(format!("cell {id} queued twice"));
            }
            let cell = self
                .cell(id)
                .ok_or_else(|| format!("queued cell {id} does not exist"))?;
            match cell.state() {
                CellState::Queued => {}
                CellState::Computing if pos == 0 => {}
                CellState::Computing => return Err(format!("cell {id} computing at position {pos}")),
                other => return Err(format!("queued cell {id} is {other}")),
            }
        }
        for cell in &self.cells {
            if cell.state().is_pending() && !seen.contains(&cell.id()) {
                return Err(format!("cell {} is {} but not queued", cell.id(), cell.state()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::WorksheetId;
    use crate::worksheet::CellPosition;
    use proptest::prelude::*;

    fn sheet(inputs: &[&str]) -> (Worksheet, Vec<CellId>) {
        let mut ws = Worksheet::new(WorksheetId::new("alice", 1), "t", "sage");
        let ids = inputs
            .iter()
            .map(|i| ws.insert_cell(None, CellPosition::End, *i).unwrap())
            .collect();
        (ws, ids)
    }

    fn run_head(ws: &mut Worksheet, text: &str) -> CellId {
        let dispatch = ws.prepare_dispatch().unwrap();
        let cell = dispatch.cell();
        ws.on_output_chunk(cell, &OutputChunk::text(text));
        assert!(ws.on_completion(cell, &CompletionStatus::Success));
        cell
    }

    #[test]
    fn queue_rejects_duplicates() {
        let mut q = ExecutionQueue::new();
        assert!(q.push_back(CellId(1)));
        assert!(!q.push_back(CellId(1)));
        assert!(!q.insert(0, CellId(1)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn enqueue_is_idempotent() {
        let (mut ws, ids) = sheet(&["1+1"]);
        let before = ws.state_number();
        assert!(ws.enqueue(Some("alice"), ids[0]).unwrap());
        assert!(!ws.enqueue(Some("alice"), ids[0]).unwrap());
        assert_eq!(ws.queue(), vec![ids[0]]);
        assert_eq!(ws.state_number(), before + 1);
    }

    #[test]
    fn fifo_dispatch() {
        let (mut ws, ids) = sheet(&["a", "b", "c"]);
        ws.enqueue(None, ids[2]).unwrap();
        ws.enqueue(None, ids[0]).unwrap();
        ws.enqueue(None, ids[1]).unwrap();
        let order: Vec<CellId> = (0..3).map(|_| run_head(&mut ws, "x")).collect();
        assert_eq!(order, vec![ids[2], ids[0], ids[1]]);
        assert!(ws.queue().is_empty());
    }

    #[test]
    fn only_one_computing() {
        let (mut ws, ids) = sheet(&["a", "b"]);
        ws.enqueue_all(None).unwrap();
        assert!(ws.prepare_dispatch().is_some());
        assert!(ws.prepare_dispatch().is_none());
        assert_eq!(ws.computing_cell(), Some(ids[0]));
        ws.check_queue_invariants().unwrap();
    }

    #[test]
    fn dispatch_builds_request_from_directives() {
        let (mut ws, _) = sheet(&["%time\n%python\nprint(1)"]);
        ws.enqueue_all(None).unwrap();
        match ws.prepare_dispatch().unwrap() {
            Dispatch::Execute { request, save_first, .. } => {
                assert_eq!(request.code, "print(1)");
                assert_eq!(request.system, "python");
                assert!(request.timed);
                assert!(!save_first);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_error_recorded_and_skipped() {
        let (mut ws, ids) = sheet(&["%bad dir\n1", "2"]);
        ws.enqueue_all(None).unwrap();
        let dispatch = ws.prepare_dispatch().unwrap();
        assert_eq!(dispatch.cell(), ids[1]);
        let bad = ws.cell(ids[0]).unwrap();
        assert_eq!(bad.state(), CellState::Errored);
        assert_eq!(bad.failure().unwrap().kind, FailureKind::Parse);
        assert!(bad.output().text.contains("malformed directive"));
    }

    #[test]
    fn session_command_dispatch() {
        let (mut ws, _) = sheet(&["restart"]);
        ws.enqueue_all(None).unwrap();
        assert!(matches!(
            ws.prepare_dispatch(),
            Some(Dispatch::SessionCommand { command: SessionCommand::Restart, .. })
        ));
    }

    #[test]
    fn stale_events_ignored() {
        let (mut ws, ids) = sheet(&["a", "b"]);
        ws.enqueue_all(None).unwrap();
        ws.prepare_dispatch();
        assert!(!ws.on_output_chunk(ids[1], &OutputChunk::text("no")));
        assert!(!ws.on_completion(ids[1], &CompletionStatus::Success));
    }

    #[test]
    fn interrupt_keeps_queue_by_default() {
        let (mut ws, ids) = sheet(&["a", "b"]);
        ws.enqueue_all(None).unwrap();
        ws.prepare_dispatch();
        assert!(ws.on_interrupted(ids[0], InterruptPolicy::KeepQueued));
        assert_eq!(ws.cell(ids[0]).unwrap().state(), CellState::Interrupted);
        assert_eq!(ws.queue(), vec![ids[1]]);
    }

    #[test]
    fn interrupt_can_cancel_queue() {
        let (mut ws, ids) = sheet(&["a", "b"]);
        ws.enqueue_all(None).unwrap();
        ws.prepare_dispatch();
        assert!(ws.on_interrupted(ids[0], InterruptPolicy::CancelQueued));
        assert!(ws.queue().is_empty());
        assert_eq!(ws.cell(ids[1]).unwrap().state(), CellState::Idle);
        ws.check_queue_invariants().unwrap();
    }

    #[test]
    fn abort_marks_errored_and_keeps_rest() {
        let (mut ws, ids) = sheet(&["a", "b", "c"]);
        ws.enqueue_all(None).unwrap();
        ws.prepare_dispatch();
        let aborted = ws.abort_computing(CellFailure::new(FailureKind::Crashed, "session died"));
        assert_eq!(aborted, Some(ids[0]));
        assert_eq!(ws.queue(), vec![ids[1], ids[2]]);
        assert_eq!(
            ws.cell(ids[0]).unwrap().failure().unwrap().kind,
            FailureKind::Crashed
        );
    }

    #[test]
    fn text_cells_are_never_queued() {
        let (mut ws, ids) = sheet(&["1", "2"]);
        let note = ws
            .insert_text_cell(None, CellPosition::After(ids[0]), "<p>between</p>")
            .unwrap();

        assert!(!ws.enqueue(None, note).unwrap());
        assert_eq!(ws.enqueue_all(None).unwrap(), 2);
        assert_eq!(ws.queue(), vec![ids[0], ids[1]]);
        assert_eq!(ws.cell(note).unwrap().state(), CellState::Idle);
        ws.check_invariants().unwrap();
    }

    #[test]
    fn dequeue_only_queued() {
        let (mut ws, ids) = sheet(&["a", "b"]);
        ws.enqueue_all(None).unwrap();
        ws.prepare_dispatch();
        assert!(!ws.dequeue(None, ids[0]).unwrap());
        assert!(ws.dequeue(None, ids[1]).unwrap());
        assert_eq!(ws.cell(ids[1]).unwrap().state(), CellState::Idle);
        assert!(ws.dequeue(None, CellId(99)).is_err());
    }

    #[test]
    fn auto_cells_go_first() {
        let (mut ws, ids) = sheet(&["a", "%auto\nb", "#auto\nc"]);
        ws.enqueue(None, ids[0]).unwrap();
        assert_eq!(ws.enqueue_auto_cells(), 2);
        assert_eq!(ws.queue(), vec![ids[1], ids[2], ids[0]]);
        assert_eq!(ws.enqueue_auto_cells(), 0);
    }

    #[test]
    fn reject_head_fails_without_running() {
        let (mut ws, ids) = sheet(&["a", "b"]);
        ws.enqueue_all(None).unwrap();
        let rejected = ws.reject_head(CellFailure::new(FailureKind::Backend, "no session"));
        assert_eq!(rejected, Some(ids[0]));
        assert_eq!(ws.cell(ids[0]).unwrap().output().text, "no session");
        assert_eq!(ws.queue(), vec![ids[1]]);
        ws.prepare_dispatch();
        assert_eq!(ws.reject_head(CellFailure::new(FailureKind::Backend, "x")), None);
    }

    #[test]
    fn halt_clears_everything() {
        let (mut ws, ids) = sheet(&["a", "b"]);
        ws.enqueue_all(None).unwrap();
        ws.prepare_dispatch();
        assert!(ws.halt());
        assert!(ws.queue().is_empty());
        assert_eq!(ws.cell(ids[0]).unwrap().state(), CellState::Interrupted);
        assert_eq!(ws.cell(ids[1]).unwrap().state(), CellState::Idle);
        assert!(!ws.halt());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(usize),
        Dispatch,
        Complete,
        Interrupt,
        Abort,
        Dequeue(usize),
        Edit(usize),
        Delete(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..6).prop_map(Op::Enqueue),
            Just(Op::Dispatch),
            Just(Op::Complete),
            Just(Op::Interrupt),
            Just(Op::Abort),
            (0usize..6).prop_map(Op::Dequeue),
            (0usize..6).prop_map(Op::Edit),
            (0usize..6).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn invariants_hold_under_random_ops(ops in proptest::collection::vec(op(), 1..60)) {
            let (mut ws, ids) = sheet(&["a", "b", "c", "d", "e", "f"]);
            let mut last = ws.state_number();
            for op in ops {
                match op {
                    Op::Enqueue(i) => { let _ = ws.enqueue(None, ids[i]); }
                    Op::Dispatch => { ws.prepare_dispatch(); }
                    Op::Complete => {
                        if let Some(c) = ws.computing_cell() {
                            ws.on_completion(c, &CompletionStatus::Success);
                        }
                    }
                    Op::Interrupt => {
                        if let Some(c) = ws.computing_cell() {
                            ws.on_interrupted(c, InterruptPolicy::KeepQueued);
                        }
                    }
                    Op::Abort => { ws.abort_computing(CellFailure::new(FailureKind::Crashed, "x")); }
                    Op::Dequeue(i) => { let _ = ws.dequeue(None, ids[i]); }
                    Op::Edit(i) => { let _ = ws.edit_cell(None, ids[i], "edited"); }
                    Op::Delete(i) => { let _ = ws.delete_cell(None, ids[i]); }
                }
                prop_assert!(ws.check_queue_invariants().is_ok(), "{:?}", ws.check_queue_invariants());
                prop_assert!(ws.state_number() >= last);
                last = ws.state_number();
            }
        }
    }
}
