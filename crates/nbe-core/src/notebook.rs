//! Notebook engine
//!
//! The entry point that:
//! - Owns the loaded worksheets and the backend worker pool
//! - Runs one dispatcher task per worksheet while it has queued cells
//! - Drives interrupt escalation, restart and quit
//! - Persists worksheets, captures snapshots and publishes copies
//!
//! Worksheet state sits behind a `parking_lot::Mutex` that is never held
//! across an `.await`; state numbers are broadcast to pollers on a
//! `tokio::sync::watch` channel. Session teardown and restart take the
//! worksheet's session lock, which the dispatcher also holds from the
//! binding check until the request is submitted, so no cell is ever sent to
//! a session that is being torn down.

use crate::backend::{Backend, OutputEvent};
use crate::cell::{CellFailure, CompletionStatus, FailureKind, OutputChunk};
use crate::config::{EngineConfig, InterruptPolicy};
use crate::error::{EngineError, NotFound, PoolError};
use crate::ids::{CellId, SnapshotId, WorksheetId, PUBLISHED_OWNER};
use crate::interrupt::{feedback_for, InterruptReport};
use crate::publish::{published_copy, published_id_of};
use crate::queue::Dispatch;
use crate::revisions::{prune_candidates, RevisionInfo, SnapshotPolicy};
use crate::store::{valid_data_file_name, WorksheetStore};
use crate::users::UserDirectory;
use crate::view::{PollDelta, WorksheetSummary, WorksheetView};
use crate::worker_pool::{PoolStats, WorkerPool};
use crate::worksheet::{CellPosition, Folder, Worksheet};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

/// Live worksheet plus its dispatcher bookkeeping
struct WorksheetHandle {
    id: WorksheetId,
    state: Mutex<Worksheet>,
    /// Latest state number, for pollers
    version: watch::Sender<u64>,
    driver_running: AtomicBool,
    /// Held while the session is dispatched to, torn down or restarted
    session_lock: tokio::sync::Mutex<()>,
    /// Held from the published-copy lookup until the copy is linked
    publish_lock: tokio::sync::Mutex<()>,
    /// Bumped whenever the in-flight computation is abandoned
    generation: AtomicU64,
    abort: Notify,
    last_activity: Mutex<Instant>,
    snapshots: Mutex<SnapshotPolicy>,
}

impl WorksheetHandle {
    fn new(worksheet: Worksheet, config: &EngineConfig) -> Self {
        let number = worksheet.state_number();
        let (version, _) = watch::channel(number);
        Self {
            id: worksheet.id().clone(),
            state: Mutex::new(worksheet),
            version,
            driver_running: AtomicBool::new(false),
            session_lock: tokio::sync::Mutex::new(()),
            publish_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            abort: Notify::new(),
            last_activity: Mutex::new(Instant::now()),
            snapshots: Mutex::new(SnapshotPolicy::new(config.snapshots, number)),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Worksheet) -> R) -> R {
        f(&self.state.lock())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Worksheet) -> R) -> R {
        let (result, number) = {
            let mut ws = self.state.lock();
            let result = f(&mut ws);
            (result, ws.state_number())
        };
        self.announce(number);
        result
    }

    /// Mutate and abandon whatever the dispatcher is running
    fn abort_with<R>(&self, f: impl FnOnce(&mut Worksheet) -> R) -> R {
        let (result, number) = {
            let mut ws = self.state.lock();
            let result = f(&mut ws);
            self.generation.fetch_add(1, Ordering::SeqCst);
            (result, ws.state_number())
        };
        self.abort.notify_one();
        self.announce(number);
        result
    }

    fn announce(&self, number: u64) {
        self.version.send_if_modified(|current| {
            if *current < number {
                *current = number;
                true
            } else {
                false
            }
        });
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

struct Inner {
    config: EngineConfig,
    pool: WorkerPool,
    store: Arc<dyn WorksheetStore>,
    users: Arc<dyn UserDirectory>,
    worksheets: DashMap<WorksheetId, Arc<WorksheetHandle>>,
    /// Serializes worksheet number allocation
    numbering: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// The worksheet execution engine
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct Notebook {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Notebook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notebook")
            .field("worksheets", &self.inner.worksheets.len())
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

impl Notebook {
    /// Create an engine
    ///
    /// # Errors
    /// `EngineError::Config` when the configuration is invalid.
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn Backend>,
        store: Arc<dyn WorksheetStore>,
        users: Arc<dyn UserDirectory>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let pool = WorkerPool::new(backend, &config);
        let (shutdown, _) = watch::channel(false);
        tracing::info!(capacity = config.pool_capacity, system = %config.default_system, "notebook engine started");
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pool,
                store,
                users,
                worksheets: DashMap::new(),
                numbering: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
                shutdown,
            }),
        })
    }

    /// Configuration the engine was started with
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Worksheet management
    // ------------------------------------------------------------------

    /// Create and persist an empty worksheet owned by `owner`
    ///
    /// # Errors
    /// - `EngineError::ReservedOwner` when `owner` is the published namespace
    /// - `EngineError::NotFound` for an unknown owner
    /// - `EngineError::Store` if it cannot be persisted
    pub async fn create_worksheet(
        &self,
        owner: &str,
        name: &str,
        system: Option<&str>,
    ) -> Result<WorksheetId, EngineError> {
        if owner == PUBLISHED_OWNER {
            return Err(EngineError::ReservedOwner(owner.to_string()));
        }
        if !self.inner.users.user_exists(owner) {
            return Err(NotFound::User(owner.to_string()).into());
        }
        let _numbering = self.inner.numbering.lock().await;
        let number = self.inner.next_number(owner).await?;
        let id = WorksheetId::new(owner, number);
        let system = system.unwrap_or(&self.inner.config.default_system);
        let mut worksheet = Worksheet::new(id.clone(), name, system);
        worksheet.record(Some(owner));
        self.inner.store.save_worksheet(&worksheet).await?;
        self.inner
            .worksheets
            .insert(id.clone(), Arc::new(WorksheetHandle::new(worksheet, &self.inner.config)));
        tracing::info!(worksheet = %id, name, system, "worksheet created");
        Ok(id)
    }

    /// Load a worksheet from the store if it is not already live
    ///
    /// # Errors
    /// `EngineError::NotFound` if the store has no such worksheet.
    pub async fn open_worksheet(&self, id: &WorksheetId) -> Result<WorksheetView, EngineError> {
        let handle = self.inner.handle(id).await?;
        Ok(handle.read(|ws| WorksheetView::from(ws)))
    }

    /// Current read model of a worksheet
    ///
    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet.
    pub async fn view(&self, id: &WorksheetId) -> Result<WorksheetView, EngineError> {
        self.open_worksheet(id).await
    }

    /// Read model as seen by `user`: owners, collaborators and admins see
    /// private worksheets, everyone sees published copies
    ///
    /// # Errors
    /// `EngineError::PermissionDenied` or `NotFound`.
    pub async fn view_as(&self, user: &str, id: &WorksheetId) -> Result<WorksheetView, EngineError> {
        let handle = self.viewable(user, id).await?;
        Ok(handle.read(|ws| WorksheetView::from(ws)))
    }

    /// Worksheets `user` owns or collaborates on, in `folder`, most recently
    /// edited first
    ///
    /// # Errors
    /// `EngineError::Store` if the listing cannot be read.
    pub async fn list_worksheets(&self, user: &str, folder: Folder) -> Result<Vec<WorksheetSummary>, EngineError> {
        let mut ids = self.inner.store.list_worksheets(None).await?;
        ids.extend(self.inner.worksheets.iter().map(|e| e.key().clone()));
        ids.sort();
        ids.dedup();

        let mut listed = Vec::new();
        for id in ids.iter().filter(|id| !id.is_published_namespace()) {
            let handle = match self.inner.handle(id).await {
                Ok(handle) => handle,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let summary = handle.read(|ws| {
                let member = ws.owner() == user || ws.is_collaborator(user);
                (member && ws.folder(user) == folder).then(|| WorksheetSummary::for_user(ws, user))
            });
            listed.extend(summary);
        }
        listed.sort_by(|a, b| b.last_edited.cmp(&a.last_edited));
        Ok(listed)
    }

    /// # Errors
    /// `EngineError::PermissionDenied`, `ReadOnly` or `NotFound`.
    pub async fn rename(&self, user: &str, id: &WorksheetId, name: &str) -> Result<(), EngineError> {
        self.edit(user, id, |ws| ws.rename(Some(user), name)).await
    }

    /// # Errors
    /// `EngineError::PermissionDenied`, `ReadOnly` or `NotFound`.
    pub async fn set_system(&self, user: &str, id: &WorksheetId, system: &str) -> Result<(), EngineError> {
        self.edit(user, id, |ws| ws.set_system(Some(user), system)).await
    }

    /// # Errors
    /// `EngineError::PermissionDenied`, `ReadOnly` or `NotFound`.
    pub async fn set_auto_publish(&self, user: &str, id: &WorksheetId, enabled: bool) -> Result<(), EngineError> {
        self.edit(user, id, |ws| ws.set_auto_publish(Some(user), enabled)).await
    }

    /// Share a worksheet. Only the owner or an admin may do this.
    ///
    /// # Errors
    /// - `EngineError::NotFound` for an unknown collaborator
    /// - `EngineError::PermissionDenied` for anyone but the owner or an admin
    pub async fn add_collaborator(&self, user: &str, id: &WorksheetId, collaborator: &str) -> Result<bool, EngineError> {
        if !self.inner.users.user_exists(collaborator) {
            return Err(NotFound::User(collaborator.to_string()).into());
        }
        let handle = self.inner.handle(id).await?;
        let is_admin = self.inner.users.is_admin(user);
        handle.mutate(|ws| {
            ensure_owner(ws, user, is_admin)?;
            ws.add_collaborator(Some(user), collaborator)
        })
    }

    /// # Errors
    /// `EngineError::PermissionDenied` for anyone but the owner or an admin.
    pub async fn remove_collaborator(&self, user: &str, id: &WorksheetId, collaborator: &str) -> Result<bool, EngineError> {
        let handle = self.inner.handle(id).await?;
        let is_admin = self.inner.users.is_admin(user);
        handle.mutate(|ws| {
            ensure_owner(ws, user, is_admin)?;
            ws.remove_collaborator(Some(user), collaborator)
        })
    }

    // ------------------------------------------------------------------
    // Cells
    // ------------------------------------------------------------------

    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet or anchor cell.
    pub async fn insert_cell_before(
        &self,
        user: &str,
        id: &WorksheetId,
        before: CellId,
        input: &str,
    ) -> Result<CellId, EngineError> {
        self.edit(user, id, |ws| ws.insert_cell(Some(user), CellPosition::Before(before), input))
            .await
    }

    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet or anchor cell.
    pub async fn insert_cell_after(
        &self,
        user: &str,
        id: &WorksheetId,
        after: CellId,
        input: &str,
    ) -> Result<CellId, EngineError> {
        self.edit(user, id, |ws| ws.insert_cell(Some(user), CellPosition::After(after), input))
            .await
    }

    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet.
    pub async fn append_cell(&self, user: &str, id: &WorksheetId, input: &str) -> Result<CellId, EngineError> {
        self.edit(user, id, |ws| ws.insert_cell(Some(user), CellPosition::End, input))
            .await
    }

    /// Append a text cell. Text cells are rendered, never executed.
    ///
    /// # Errors
    /// `EngineError::PermissionDenied`, `ReadOnly` or `NotFound`.
    pub async fn append_text_cell(&self, user: &str, id: &WorksheetId, html: &str) -> Result<CellId, EngineError> {
        self.edit(user, id, |ws| ws.insert_text_cell(Some(user), CellPosition::End, html))
            .await
    }

    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet or anchor cell.
    pub async fn insert_text_cell_after(
        &self,
        user: &str,
        id: &WorksheetId,
        after: CellId,
        html: &str,
    ) -> Result<CellId, EngineError> {
        self.edit(user, id, |ws| ws.insert_text_cell(Some(user), CellPosition::After(after), html))
            .await
    }

    /// Change a cell's input without running it
    ///
    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet or cell.
    pub async fn edit_cell(&self, user: &str, id: &WorksheetId, cell: CellId, input: &str) -> Result<bool, EngineError> {
        self.edit(user, id, |ws| ws.edit_cell(Some(user), cell, input)).await
    }

    /// Delete a cell. Deleting the computing cell abandons its computation
    /// and tears the session down.
    ///
    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet or cell.
    pub async fn delete_cell(&self, user: &str, id: &WorksheetId, cell: CellId) -> Result<(), EngineError> {
        let handle = self.editable(user, id).await?;
        let _session = handle.session_lock.lock().await;
        let computing = handle.read(|ws| ws.computing_cell()) == Some(cell);
        let deleted = if computing {
            handle.abort_with(|ws| ws.delete_cell(Some(user), cell))?
        } else {
            handle.mutate(|ws| ws.delete_cell(Some(user), cell))?
        };
        if deleted.was_computing {
            tracing::info!(worksheet = %id, %cell, "computing cell deleted, tearing down session");
            self.inner.pool.discard(id).await;
            ensure_driver(&self.inner, &handle);
        }
        self.inner.after_mutation(&handle).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Queue a cell, optionally replacing its input first. Returns as soon as
    /// the cell is queued; output arrives asynchronously.
    ///
    /// # Errors
    /// - `EngineError::NotFound` for an unknown worksheet or cell
    /// - `EngineError::ReadOnly` for published copies
    pub async fn evaluate(
        &self,
        user: &str,
        id: &WorksheetId,
        cell: CellId,
        new_input: Option<&str>,
    ) -> Result<(), EngineError> {
        let handle = self.inner.handle(id).await?;
        let is_admin = self.inner.users.is_admin(user);
        handle.mutate(|ws| {
            authorize_edit(ws, user, is_admin)?;
            if let Some(input) = new_input {
                ws.edit_cell(Some(user), cell, input)?;
            }
            ws.enqueue(Some(user), cell)
        })?;
        handle.touch();
        tracing::debug!(worksheet = %id, %cell, "cell queued");
        ensure_driver(&self.inner, &handle);
        self.inner.after_mutation(&handle).await;
        Ok(())
    }

    /// Queue every cell in document order
    ///
    /// # Errors
    /// `EngineError::NotFound` or `ReadOnly`.
    pub async fn evaluate_all(&self, user: &str, id: &WorksheetId) -> Result<usize, EngineError> {
        let handle = self.inner.handle(id).await?;
        let is_admin = self.inner.users.is_admin(user);
        let queued = handle.mutate(|ws| {
            authorize_edit(ws, user, is_admin)?;
            ws.enqueue_all(Some(user))
        })?;
        handle.touch();
        ensure_driver(&self.inner, &handle);
        self.inner.after_mutation(&handle).await;
        Ok(queued)
    }

    /// Remove a queued (not computing) cell from the queue
    ///
    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet or cell.
    pub async fn dequeue(&self, user: &str, id: &WorksheetId, cell: CellId) -> Result<bool, EngineError> {
        self.edit(user, id, |ws| ws.dequeue(Some(user), cell)).await
    }

    /// Drop the output of every settled cell. Cells still queued or
    /// computing keep theirs.
    ///
    /// # Errors
    /// `EngineError::PermissionDenied`, `ReadOnly` or `NotFound`.
    pub async fn clear_output(&self, user: &str, id: &WorksheetId) -> Result<(), EngineError> {
        self.edit(user, id, |ws| ws.clear_output(Some(user))).await
    }

    /// Start the worksheet's backend session ahead of the first evaluation.
    /// `%auto` cells are queued when a new session comes up. Returns whether
    /// a new session was started.
    ///
    /// # Errors
    /// - `EngineError::SessionUnavailable` when the pool stays full past the
    ///   acquire timeout
    /// - `EngineError::Pool` when the session cannot be started
    /// - `EngineError::PermissionDenied`, `ReadOnly` or `NotFound`
    pub async fn start_session(&self, user: &str, id: &WorksheetId) -> Result<bool, EngineError> {
        let handle = self.inner.handle(id).await?;
        let is_admin = self.inner.users.is_admin(user);
        let system = handle.read(|ws| authorize_edit(ws, user, is_admin).map(|()| ws.system().to_string()))?;
        let lease = self.inner.pool.acquire(id, &system).await.map_err(|err| match err {
            PoolError::SessionUnavailable(capacity) => EngineError::SessionUnavailable { capacity },
            other => EngineError::Pool(other),
        })?;
        handle.touch();
        if lease.fresh {
            handle.mutate(Worksheet::enqueue_auto_cells);
            ensure_driver(&self.inner, &handle);
        }
        Ok(lease.fresh)
    }

    /// Interrupt the computing cell.
    ///
    /// Sends up to `interrupt.max_attempts` signals with growing waits. If the
    /// backend never acknowledges, the session is torn down and the cell fails
    /// with an interrupt timeout. A no-op when nothing is computing.
    ///
    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet.
    pub async fn interrupt(&self, id: &WorksheetId) -> Result<InterruptReport, EngineError> {
        let inner = &self.inner;
        let handle = inner.handle(id).await?;
        let Some((cell, generation)) = handle.read(|ws| ws.computing_cell().map(|c| (c, handle.generation()))) else {
            return Ok(InterruptReport::nothing());
        };
        let session = inner.pool.session(id);
        let mut versions = handle.version.subscribe();
        let max_attempts = inner.config.interrupt.max_attempts;
        let mut feedback = Vec::new();

        for attempt in 1..=max_attempts {
            if let Some(session) = &session {
                if let Err(e) = session.interrupt().await {
                    tracing::warn!(worksheet = %id, %cell, attempt, error = %e, "interrupt signal failed");
                }
            }
            tracing::info!(worksheet = %id, %cell, attempt, "interrupt sent");
            let wait = inner.config.interrupt.wait_for(attempt);
            let settled = tokio::time::timeout(wait, wait_until_stopped(&handle, &mut versions, cell, generation));
            if settled.await.is_ok() {
                return Ok(InterruptReport::acknowledged(cell, attempt, feedback));
            }
            feedback.push(feedback_for(attempt, max_attempts));
        }

        let policy = inner.config.interrupt_policy;
        let message = EngineError::InterruptTimeout { attempts: max_attempts }.to_string();
        let _session = handle.session_lock.lock().await;
        let escalated = handle.abort_with(|ws| {
            if handle.generation() != generation || ws.computing_cell() != Some(cell) {
                return false;
            }
            ws.abort_computing(CellFailure::new(FailureKind::InterruptTimeout, message));
            if policy == InterruptPolicy::CancelQueued {
                ws.cancel_queued();
            }
            true
        });
        if !escalated {
            return Ok(InterruptReport::acknowledged(cell, max_attempts, feedback));
        }
        tracing::error!(worksheet = %id, %cell, attempts = max_attempts, "backend ignored interrupt, tearing down session");
        inner.pool.discard(id).await;
        ensure_driver(inner, &handle);
        Ok(InterruptReport::escalated(cell, max_attempts, feedback))
    }

    /// Tear down and re-create the worksheet's session. The computing cell
    /// fails as restarted; the rest of the queue is kept and re-dispatched.
    ///
    /// # Errors
    /// - `EngineError::NotFound` for an unknown worksheet
    /// - `EngineError::ReadOnly` for published copies
    pub async fn restart(&self, id: &WorksheetId) -> Result<(), EngineError> {
        let handle = self.inner.handle(id).await?;
        handle.read(Worksheet::ensure_editable)?;
        {
            let _session = handle.session_lock.lock().await;
            handle.abort_with(|ws| ws.abort_computing(CellFailure::new(FailureKind::Restarted, "restarted")));
            self.inner.restart_session(&handle).await;
        }
        ensure_driver(&self.inner, &handle);
        Ok(())
    }

    /// Stop the worksheet's session: the computing cell is interrupted,
    /// queued cells return to idle, the slot is freed and the worksheet saved.
    ///
    /// # Errors
    /// `EngineError::NotFound` or `EngineError::Store`.
    pub async fn quit(&self, id: &WorksheetId) -> Result<(), EngineError> {
        let handle = self.inner.handle(id).await?;
        {
            let _session = handle.session_lock.lock().await;
            handle.abort_with(Worksheet::halt);
            if self.inner.pool.discard(id).await {
                tracing::info!(worksheet = %id, "worksheet session quit");
            }
        }
        self.inner.persist(&handle).await
    }

    // ------------------------------------------------------------------
    // Collaboration
    // ------------------------------------------------------------------

    /// Changes since `since`. Side-effect free.
    ///
    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet.
    pub async fn poll(&self, id: &WorksheetId, since: u64) -> Result<PollDelta, EngineError> {
        let handle = self.inner.handle(id).await?;
        Ok(handle.read(|ws| PollDelta::since(ws, since)))
    }

    /// `poll` on behalf of `user`
    ///
    /// # Errors
    /// `EngineError::PermissionDenied` or `NotFound`.
    pub async fn poll_as(&self, user: &str, id: &WorksheetId, since: u64) -> Result<PollDelta, EngineError> {
        let handle = self.viewable(user, id).await?;
        Ok(handle.read(|ws| PollDelta::since(ws, since)))
    }

    /// Wait until the state number exceeds `since` or `timeout` elapses;
    /// returns the current state number
    ///
    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet.
    pub async fn wait_for_change(&self, id: &WorksheetId, since: u64, timeout: Duration) -> Result<u64, EngineError> {
        let handle = self.inner.handle(id).await?;
        let mut versions = handle.version.subscribe();
        let wait = async {
            loop {
                let current = *versions.borrow_and_update();
                if current > since {
                    return current;
                }
                if versions.changed().await.is_err() {
                    return current;
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(number) => Ok(number),
            Err(_) => Ok(handle.read(Worksheet::state_number)),
        }
    }

    /// Record that `user` is looking at the worksheet (keeps its session
    /// from being reaped)
    ///
    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet.
    pub async fn ping(&self, user: &str, id: &WorksheetId) -> Result<(), EngineError> {
        let handle = self.inner.handle(id).await?;
        if handle.read(Worksheet::is_published) {
            return Ok(());
        }
        handle.touch();
        self.inner.pool.touch(id);
        tracing::trace!(worksheet = %id, user, "ping");
        Ok(())
    }

    /// Another user who edited within `threshold`
    ///
    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet.
    pub async fn warn_about_other_editor(
        &self,
        id: &WorksheetId,
        user: &str,
        threshold: Duration,
    ) -> Result<Option<String>, EngineError> {
        let handle = self.inner.handle(id).await?;
        Ok(handle.read(|ws| ws.tracker().other_recent_editor(user, threshold).map(str::to_string)))
    }

    // ------------------------------------------------------------------
    // Persistence, snapshots, publishing
    // ------------------------------------------------------------------

    /// Persist the worksheet and snapshot it. Republishes when
    /// `auto_publish` is set.
    ///
    /// # Errors
    /// `EngineError::Store`, `PermissionDenied` or `NotFound`.
    pub async fn save(&self, user: &str, id: &WorksheetId) -> Result<SnapshotId, EngineError> {
        let handle = self.inner.handle(id).await?;
        let is_admin = self.inner.users.is_admin(user);
        let auto_publish = handle.read(|ws| authorize_edit(ws, user, is_admin).map(|()| ws.auto_publish()))?;
        self.inner.persist(&handle).await?;
        let snapshot = self.inner.take_snapshot(&handle, Some(user)).await?;
        if auto_publish {
            self.publish(user, id).await?;
        }
        Ok(snapshot)
    }

    /// Capture a snapshot now
    ///
    /// # Errors
    /// `EngineError::Store` or `NotFound`.
    pub async fn snapshot(&self, user: &str, id: &WorksheetId) -> Result<SnapshotId, EngineError> {
        let handle = self.inner.handle(id).await?;
        self.inner.take_snapshot(&handle, Some(user)).await
    }

    /// Replace the live cells with a snapshot's. Any computation is
    /// abandoned and the queue cleared. Returns the new state number.
    ///
    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet or snapshot.
    pub async fn revert(&self, user: &str, id: &WorksheetId, snapshot: SnapshotId) -> Result<u64, EngineError> {
        let handle = self.inner.handle(id).await?;
        let is_admin = self.inner.users.is_admin(user);
        handle.read(|ws| authorize_edit(ws, user, is_admin))?;
        let saved = self
            .inner
            .store
            .load_snapshot(id, snapshot)
            .await?
            .filter(|s| &s.worksheet == id)
            .ok_or_else(|| NotFound::Snapshot {
                worksheet: id.clone(),
                snapshot,
            })?;
        let number = {
            let _session = handle.session_lock.lock().await;
            let (was_computing, number) = handle.abort_with(|ws| {
                let was_computing = ws.computing_cell().is_some();
                (was_computing, ws.restore(Some(user), &saved))
            });
            if was_computing {
                self.inner.pool.discard(id).await;
            }
            number
        };
        self.inner.persist(&handle).await?;
        Ok(number)
    }

    /// The worksheet as an editable plain-text body
    ///
    /// # Errors
    /// `EngineError::PermissionDenied` or `NotFound`.
    pub async fn export_text(&self, user: &str, id: &WorksheetId) -> Result<String, EngineError> {
        let handle = self.viewable(user, id).await?;
        Ok(handle.read(Worksheet::body_text))
    }

    /// Replace the cells with a plain-text body. Like `revert`, any
    /// computation is abandoned and the queue cleared. Returns the new state
    /// number.
    ///
    /// # Errors
    /// `EngineError::PermissionDenied`, `ReadOnly` or `NotFound`.
    pub async fn import_text(&self, user: &str, id: &WorksheetId, body: &str) -> Result<u64, EngineError> {
        let handle = self.editable(user, id).await?;
        let number = {
            let _session = handle.session_lock.lock().await;
            let (was_computing, number) = handle.abort_with(|ws| {
                let was_computing = ws.computing_cell().is_some();
                ws.replace_body(Some(user), body).map(|number| (was_computing, number))
            })?;
            if was_computing {
                self.inner.pool.discard(id).await;
            }
            number
        };
        self.inner.persist(&handle).await?;
        self.inner.after_mutation(&handle).await;
        Ok(number)
    }

    // ------------------------------------------------------------------
    // Data files
    // ------------------------------------------------------------------

    /// Attach a data file to the worksheet, replacing one of the same name
    ///
    /// # Errors
    /// - `EngineError::InvalidFileName` unless `name` is a bare file name
    /// - `EngineError::PermissionDenied`, `ReadOnly`, `NotFound` or `Store`
    pub async fn attach_data_file(&self, user: &str, id: &WorksheetId, name: &str, contents: &[u8]) -> Result<(), EngineError> {
        self.editable(user, id).await?;
        ensure_file_name(name)?;
        self.inner.store.save_data_file(id, name, contents).await?;
        tracing::info!(worksheet = %id, file = name, bytes = contents.len(), "data file attached");
        Ok(())
    }

    /// # Errors
    /// `EngineError::PermissionDenied`, `NotFound` or `Store`.
    pub async fn data_file(&self, user: &str, id: &WorksheetId, name: &str) -> Result<Vec<u8>, EngineError> {
        self.viewable(user, id).await?;
        ensure_file_name(name)?;
        self.inner
            .store
            .load_data_file(id, name)
            .await?
            .ok_or_else(|| NotFound::DataFile {
                worksheet: id.clone(),
                name: name.to_string(),
            })
            .map_err(EngineError::from)
    }

    /// Names of the attached data files, sorted
    ///
    /// # Errors
    /// `EngineError::PermissionDenied`, `NotFound` or `Store`.
    pub async fn list_data_files(&self, user: &str, id: &WorksheetId) -> Result<Vec<String>, EngineError> {
        self.viewable(user, id).await?;
        Ok(self.inner.store.list_data_files(id).await?)
    }

    /// Returns whether the file existed
    ///
    /// # Errors
    /// `EngineError::PermissionDenied`, `ReadOnly`, `NotFound` or `Store`.
    pub async fn delete_data_file(&self, user: &str, id: &WorksheetId, name: &str) -> Result<bool, EngineError> {
        self.editable(user, id).await?;
        ensure_file_name(name)?;
        let existed = self.inner.store.delete_data_file(id, name).await?;
        if existed {
            tracing::info!(worksheet = %id, file = name, "data file deleted");
        }
        Ok(existed)
    }

    /// Snapshots of a worksheet, newest first
    ///
    /// # Errors
    /// `EngineError::Store`.
    pub async fn list_revisions(&self, id: &WorksheetId) -> Result<Vec<RevisionInfo>, EngineError> {
        Ok(self.inner.store.list_snapshots(id).await?)
    }

    /// Create or refresh the published copy. Never executes anything.
    ///
    /// # Errors
    /// - `EngineError::ReadOnly` when `id` is itself a published copy
    /// - `EngineError::PermissionDenied`, `NotFound` or `Store`
    pub async fn publish(&self, user: &str, id: &WorksheetId) -> Result<WorksheetId, EngineError> {
        let inner = &self.inner;
        let handle = inner.handle(id).await?;
        let is_admin = inner.users.is_admin(user);
        let _publishing = handle.publish_lock.lock().await;
        let (source, existing) = handle.read(|ws| {
            authorize_edit(ws, user, is_admin).map(|()| (ws.persistable(), published_id_of(ws)))
        })?;

        let existing = match existing {
            Some(pub_id) => match inner.handle(&pub_id).await {
                Ok(h) => Some(h),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        let copy = match existing {
            Some(pub_handle) => pub_handle.mutate(|ws| {
                let refreshed = published_copy(&source, Some(ws.clone()), 0);
                *ws = refreshed;
                ws.clone()
            }),
            None => {
                let _numbering = inner.numbering.lock().await;
                let number = inner.next_number(PUBLISHED_OWNER).await?;
                let copy = published_copy(&source, None, number);
                inner
                    .worksheets
                    .insert(copy.id().clone(), Arc::new(WorksheetHandle::new(copy.clone(), &inner.config)));
                copy
            }
        };
        inner.store.save_worksheet(&copy).await?;
        handle.mutate(|ws| ws.link_published(copy.id()));
        inner.persist(&handle).await?;
        tracing::info!(worksheet = %id, published = %copy.id(), "worksheet published");
        Ok(copy.id().clone())
    }

    /// Rate a published copy, replacing the user's earlier rating
    ///
    /// # Errors
    /// - `EngineError::NotFound` for an unknown user or worksheet
    /// - `EngineError::NotPublished` when `published` is not a published copy
    /// - `EngineError::InvalidRating` for a score above 4
    pub async fn rate(&self, published: &WorksheetId, user: &str, score: u8, comment: &str) -> Result<(), EngineError> {
        if !self.inner.users.user_exists(user) {
            return Err(NotFound::User(user.to_string()).into());
        }
        let handle = self.inner.handle(published).await?;
        handle.mutate(|ws| ws.rate(user, score, comment))?;
        self.inner.persist(&handle).await
    }

    // ------------------------------------------------------------------
    // Per-user folders
    // ------------------------------------------------------------------

    /// # Errors
    /// `EngineError::PermissionDenied` for users without access.
    pub async fn move_to_trash(&self, user: &str, id: &WorksheetId) -> Result<(), EngineError> {
        self.set_folder(user, id, Folder::Trashed).await
    }

    /// # Errors
    /// `EngineError::PermissionDenied` for users without access.
    pub async fn move_to_archive(&self, user: &str, id: &WorksheetId) -> Result<(), EngineError> {
        self.set_folder(user, id, Folder::Archived).await
    }

    /// # Errors
    /// `EngineError::PermissionDenied` for users without access.
    pub async fn set_active(&self, user: &str, id: &WorksheetId) -> Result<(), EngineError> {
        self.set_folder(user, id, Folder::Active).await
    }

    async fn set_folder(&self, user: &str, id: &WorksheetId, folder: Folder) -> Result<(), EngineError> {
        let handle = self.inner.handle(id).await?;
        handle.mutate(|ws| {
            if ws.owner() != user && !ws.is_collaborator(user) {
                return Err(EngineError::PermissionDenied {
                    user: user.to_string(),
                    worksheet: ws.id().clone(),
                });
            }
            ws.set_folder(user, folder);
            Ok(())
        })?;
        self.inner.persist(&handle).await
    }

    /// Delete a worksheet for good once every user with access trashed it
    ///
    /// # Errors
    /// - `EngineError::StillInUse` while someone still has it
    /// - `EngineError::PermissionDenied` for anyone but the owner or an admin
    pub async fn purge(&self, user: &str, id: &WorksheetId) -> Result<(), EngineError> {
        let handle = self.inner.handle(id).await?;
        let is_admin = self.inner.users.is_admin(user);
        handle.read(|ws| {
            ensure_owner(ws, user, is_admin)?;
            if ws.trashed_by_everyone() {
                Ok(())
            } else {
                Err(EngineError::StillInUse(id.clone()))
            }
        })?;
        {
            let _session = handle.session_lock.lock().await;
            handle.abort_with(Worksheet::halt);
            self.inner.pool.discard(id).await;
        }
        self.inner.worksheets.remove(id);
        self.inner.store.delete_worksheet(id).await?;
        tracing::info!(worksheet = %id, "worksheet purged");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Release sessions idle longer than `idle_timeout` with nothing queued.
    /// Returns how many were released.
    pub async fn release_idle_sessions(&self) -> usize {
        let timeout = self.inner.config.idle_timeout();
        if timeout.is_zero() {
            return 0;
        }
        let mut released = 0;
        for id in self.inner.pool.bound_worksheets() {
            let Some(handle) = self.inner.worksheets.get(&id).map(|h| Arc::clone(h.value())) else {
                continue;
            };
            let pool_idle = self.inner.pool.idle_for(&id).unwrap_or_default();
            let idle = pool_idle.min(handle.idle_for());
            let _session = handle.session_lock.lock().await;
            if idle < timeout || handle.read(Worksheet::has_queued_work) {
                continue;
            }
            if self.inner.pool.discard(&id).await {
                tracing::info!(worksheet = %id, idle_secs = idle.as_secs(), "released idle session");
                released += 1;
            }
        }
        released
    }

    /// Background task: reaps idle sessions and takes time-based snapshots
    /// every `maintenance_interval_secs` until `shutdown`
    #[must_use]
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let notebook = self.clone();
        let period = Duration::from_secs(self.inner.config.maintenance_interval_secs.max(1));
        let mut stop = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        notebook.release_idle_sessions().await;
                        notebook.snapshot_due_worksheets().await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("maintenance task stopped");
        })
    }

    async fn snapshot_due_worksheets(&self) {
        let handles: Vec<Arc<WorksheetHandle>> =
            self.inner.worksheets.iter().map(|e| Arc::clone(e.value())).collect();
        for handle in handles {
            self.inner.after_mutation(&handle).await;
        }
    }

    /// Stop all computation, persist every live worksheet and tear down the
    /// pool
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(true);
        let handles: Vec<Arc<WorksheetHandle>> =
            self.inner.worksheets.iter().map(|e| Arc::clone(e.value())).collect();
        for handle in &handles {
            handle.abort_with(Worksheet::halt);
            if let Err(e) = self.inner.persist(handle).await {
                tracing::error!(worksheet = %handle.id, error = %e, "failed to persist on shutdown");
            }
        }
        self.inner.pool.shutdown_all().await;
        tracing::info!(worksheets = handles.len(), "notebook engine stopped");
    }

    /// Pool statistics
    pub async fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats().await
    }

    /// Whether the worksheet currently holds a backend session
    #[must_use]
    pub fn has_session(&self, id: &WorksheetId) -> bool {
        self.inner.pool.is_bound(id)
    }

    /// Ids of the worksheets currently live in memory
    #[must_use]
    pub fn loaded_worksheets(&self) -> Vec<WorksheetId> {
        self.inner.worksheets.iter().map(|e| e.key().clone()).collect()
    }

    /// Check a worksheet's structural and queue invariants
    ///
    /// # Errors
    /// `EngineError::NotFound`; the inner `Result` names a violation.
    pub async fn check_invariants(&self, id: &WorksheetId) -> Result<Result<(), String>, EngineError> {
        let handle = self.inner.handle(id).await?;
        Ok(handle.read(Worksheet::check_invariants))
    }

    /// Wait until the worksheet has nothing queued or computing
    ///
    /// # Errors
    /// `EngineError::NotFound` for an unknown worksheet.
    pub async fn wait_until_idle(&self, id: &WorksheetId, timeout: Duration) -> Result<bool, EngineError> {
        let handle = self.inner.handle(id).await?;
        let mut versions = handle.version.subscribe();
        let wait = async {
            loop {
                if !handle.read(Worksheet::has_queued_work) {
                    return;
                }
                if versions.changed().await.is_err() {
                    return;
                }
            }
        };
        Ok(tokio::time::timeout(timeout, wait).await.is_ok())
    }

    async fn editable(&self, user: &str, id: &WorksheetId) -> Result<Arc<WorksheetHandle>, EngineError> {
        let handle = self.inner.handle(id).await?;
        let is_admin = self.inner.users.is_admin(user);
        handle.read(|ws| authorize_edit(ws, user, is_admin))?;
        Ok(handle)
    }

    async fn viewable(&self, user: &str, id: &WorksheetId) -> Result<Arc<WorksheetHandle>, EngineError> {
        let handle = self.inner.handle(id).await?;
        let is_admin = self.inner.users.is_admin(user);
        if handle.read(|ws| ws.user_can_view(user, is_admin)) {
            Ok(handle)
        } else {
            Err(EngineError::PermissionDenied {
                user: user.to_string(),
                worksheet: id.clone(),
            })
        }
    }

    async fn edit<R>(
        &self,
        user: &str,
        id: &WorksheetId,
        f: impl FnOnce(&mut Worksheet) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let handle = self.inner.handle(id).await?;
        let is_admin = self.inner.users.is_admin(user);
        let result = handle.mutate(|ws| {
            authorize_edit(ws, user, is_admin)?;
            f(ws)
        })?;
        self.inner.after_mutation(&handle).await;
        Ok(result)
    }
}

fn authorize_edit(ws: &Worksheet, user: &str, is_admin: bool) -> Result<(), EngineError> {
    ws.ensure_editable()?;
    if ws.user_can_edit(user, is_admin) {
        Ok(())
    } else {
        Err(EngineError::PermissionDenied {
            user: user.to_string(),
            worksheet: ws.id().clone(),
        })
    }
}

fn ensure_file_name(name: &str) -> Result<(), EngineError> {
    if valid_data_file_name(name) {
        Ok(())
    } else {
        Err(EngineError::InvalidFileName(name.to_string()))
    }
}

fn ensure_owner(ws: &Worksheet, user: &str, is_admin: bool) -> Result<(), EngineError> {
    if ws.owner() == user || is_admin {
        Ok(())
    } else {
        Err(EngineError::PermissionDenied {
            user: user.to_string(),
            worksheet: ws.id().clone(),
        })
    }
}

/// Resolves once `cell` is no longer computing or its run was abandoned
async fn wait_until_stopped(
    handle: &WorksheetHandle,
    versions: &mut watch::Receiver<u64>,
    cell: CellId,
    generation: u64,
) {
    loop {
        let stopped = handle.read(|ws| ws.computing_cell() != Some(cell)) || handle.generation() != generation;
        if stopped {
            return;
        }
        if versions.changed().await.is_err() {
            return;
        }
    }
}

/// Start the worksheet's dispatcher unless one is already running
fn ensure_driver(inner: &Arc<Inner>, handle: &Arc<WorksheetHandle>) {
    if inner.closed.load(Ordering::SeqCst) || !handle.read(Worksheet::has_queued_work) {
        return;
    }
    if handle
        .driver_running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        tokio::spawn(Arc::clone(inner).drive(Arc::clone(handle)));
    }
}

impl Inner {
    async fn handle(&self, id: &WorksheetId) -> Result<Arc<WorksheetHandle>, EngineError> {
        if let Some(handle) = self.worksheets.get(id) {
            return Ok(Arc::clone(handle.value()));
        }
        let loaded = self
            .store
            .load_worksheet(id)
            .await?
            .ok_or_else(|| NotFound::Worksheet(id.clone()))?;
        tracing::debug!(worksheet = %id, "worksheet loaded");
        let handle = Arc::new(WorksheetHandle::new(loaded, &self.config));
        Ok(Arc::clone(self.worksheets.entry(id.clone()).or_insert(handle).value()))
    }

    async fn next_number(&self, owner: &str) -> Result<u64, EngineError> {
        let stored = self.store.max_worksheet_number(owner).await?;
        let live = self
            .worksheets
            .iter()
            .filter(|e| e.key().owner() == owner)
            .map(|e| e.key().number())
            .max()
            .unwrap_or(0);
        Ok(stored.max(live) + 1)
    }

    async fn persist(&self, handle: &WorksheetHandle) -> Result<(), EngineError> {
        let record = handle.read(Worksheet::persistable);
        self.store.save_worksheet(&record).await?;
        Ok(())
    }

    async fn take_snapshot(&self, handle: &WorksheetHandle, saved_by: Option<&str>) -> Result<SnapshotId, EngineError> {
        let snapshot = handle.read(|ws| ws.capture(saved_by));
        self.store.save_snapshot(&snapshot).await?;
        let keep = {
            let mut policy = handle.snapshots.lock();
            policy.record(snapshot.state_number, Instant::now());
            policy.max_snapshots()
        };
        let existing = self.store.list_snapshots(&handle.id).await?;
        for doomed in prune_candidates(&existing, keep) {
            self.store.delete_snapshot(&handle.id, doomed).await?;
        }
        tracing::info!(worksheet = %handle.id, snapshot = %snapshot.id, state_number = snapshot.state_number, "snapshot taken");
        Ok(snapshot.id)
    }

    /// Cadence snapshots
    async fn after_mutation(&self, handle: &WorksheetHandle) {
        if handle.read(Worksheet::is_published) {
            return;
        }
        let number = handle.read(Worksheet::state_number);
        let due = handle.snapshots.lock().is_due(number, Instant::now());
        if due {
            if let Err(e) = self.take_snapshot(handle, None).await {
                tracing::warn!(worksheet = %handle.id, error = %e, "cadence snapshot failed");
            }
        }
    }

    async fn restart_session(&self, handle: &WorksheetHandle) {
        match self.pool.restart(&handle.id).await {
            Ok(Some(lease)) => {
                if lease.fresh {
                    handle.mutate(Worksheet::enqueue_auto_cells);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(worksheet = %handle.id, error = %e, "restart could not start a new session"),
        }
    }

    /// Dispatcher loop: runs queued cells one at a time until the queue
    /// drains
    async fn drive(self: Arc<Self>, handle: Arc<WorksheetHandle>) {
        let id = handle.id.clone();
        tracing::debug!(worksheet = %id, "dispatcher started");
        loop {
            if self.closed.load(Ordering::SeqCst) {
                handle.driver_running.store(false, Ordering::SeqCst);
                break;
            }
            let (has_work, system) = handle.read(|ws| (ws.has_queued_work(), ws.system().to_string()));
            if !has_work {
                handle.driver_running.store(false, Ordering::SeqCst);
                // work queued between the check and the store
                let again = handle.read(Worksheet::has_queued_work)
                    && handle
                        .driver_running
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok();
                if again {
                    continue;
                }
                break;
            }

            let lease = match self.pool.acquire(&id, &system).await {
                Ok(lease) => lease,
                Err(PoolError::SessionUnavailable(capacity)) => {
                    tracing::warn!(worksheet = %id, capacity, "no backend session available, still waiting");
                    continue;
                }
                Err(PoolError::Closed) => {
                    handle.driver_running.store(false, Ordering::SeqCst);
                    break;
                }
                Err(err) => {
                    let message = err.to_string();
                    let rejected = handle.mutate(|ws| ws.reject_head(CellFailure::new(FailureKind::Backend, message)));
                    tracing::error!(worksheet = %id, cell = ?rejected, error = %err, "could not start a session for the queued cell");
                    if rejected.is_none() {
                        handle.driver_running.store(false, Ordering::SeqCst);
                        break;
                    }
                    continue;
                }
            };

            let session_guard = handle.session_lock.lock().await;
            let still_bound = self
                .pool
                .session(&id)
                .is_some_and(|bound| bound.id() == lease.session.id());
            if !still_bound {
                // torn down or restarted while we waited
                continue;
            }
            if lease.fresh {
                handle.mutate(Worksheet::enqueue_auto_cells);
            }

            let Some((dispatch, generation)) =
                handle.mutate(|ws| ws.prepare_dispatch().map(|d| (d, handle.generation())))
            else {
                continue;
            };
            self.pool.touch(&id);

            match dispatch {
                Dispatch::SessionCommand { cell, .. } => {
                    self.run_session_command(&handle, cell, generation, &system).await;
                    drop(session_guard);
                }
                Dispatch::Execute {
                    cell,
                    request,
                    save_first,
                } => {
                    if save_first {
                        if let Err(e) = self.persist(&handle).await {
                            tracing::warn!(worksheet = %id, error = %e, "save before execute failed");
                        }
                    }
                    tracing::debug!(worksheet = %id, %cell, system = %request.system, session = %lease.session.id(), "dispatching cell");
                    let submitted = lease.session.execute(request).await;
                    drop(session_guard);
                    match submitted {
                        Ok(events) => self.stream_output(&handle, cell, events, generation).await,
                        Err(e) => {
                            self.fail_session(&handle, cell, generation, FailureKind::Crashed, e.to_string())
                                .await;
                        }
                    }
                }
            }
            self.pool.touch(&id);
            self.after_mutation(&handle).await;
        }
        tracing::debug!(worksheet = %id, "dispatcher idle");
    }

    async fn run_session_command(&self, handle: &WorksheetHandle, cell: CellId, generation: u64, system: &str) {
        tracing::info!(worksheet = %handle.id, %cell, "session command, restarting");
        let restarted = self.pool.restart(&handle.id).await;
        let message = format!("Exited {system} process");
        let fresh = match &restarted {
            Ok(lease) => lease.as_ref().is_some_and(|l| l.fresh),
            Err(e) => {
                tracing::warn!(worksheet = %handle.id, error = %e, "restart could not start a new session");
                false
            }
        };
        handle.mutate(|ws| {
            if handle.generation() == generation {
                ws.on_output_chunk(cell, &OutputChunk::text(message));
                ws.on_completion(cell, &CompletionStatus::Success);
            }
            if fresh {
                ws.enqueue_auto_cells();
            }
        });
    }

    /// Apply a running cell's events until a terminal one, the time limit,
    /// or abandonment
    async fn stream_output(
        &self,
        handle: &WorksheetHandle,
        cell: CellId,
        mut events: mpsc::Receiver<OutputEvent>,
        generation: u64,
    ) {
        let deadline = self
            .config
            .cell_timeout()
            .map(|limit| tokio::time::Instant::now() + limit);

        loop {
            let timed_out = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                event = events.recv() => {
                    if handle.generation() != generation {
                        return;
                    }
                    match event {
                        Some(OutputEvent::Chunk(chunk)) => {
                            handle.mutate(|ws| ws.on_output_chunk(cell, &chunk));
                        }
                        Some(OutputEvent::Finished(status)) => {
                            handle.mutate(|ws| ws.on_completion(cell, &status));
                            tracing::debug!(worksheet = %handle.id, %cell, ok = matches!(status, CompletionStatus::Success), "cell finished");
                            return;
                        }
                        Some(OutputEvent::Interrupted) => {
                            let policy = self.config.interrupt_policy;
                            handle.mutate(|ws| ws.on_interrupted(cell, policy));
                            tracing::info!(worksheet = %handle.id, %cell, "cell interrupted");
                            return;
                        }
                        Some(OutputEvent::Crashed(reason)) => {
                            self.fail_session(handle, cell, generation, FailureKind::Crashed, reason).await;
                            return;
                        }
                        None => {
                            self.fail_session(
                                handle,
                                cell,
                                generation,
                                FailureKind::Crashed,
                                "backend session closed unexpectedly".to_string(),
                            )
                            .await;
                            return;
                        }
                    }
                }
                () = timed_out => {
                    let message = format!(
                        "computation exceeded the {}s time limit",
                        self.config.cell_timeout_secs
                    );
                    self.fail_session(handle, cell, generation, FailureKind::TimedOut, message).await;
                    return;
                }
                () = handle.abort.notified() => {
                    if handle.generation() != generation {
                        return;
                    }
                }
            }
        }
    }

    /// Fail the computing cell and tear down its (unhealthy) session. The
    /// dispatcher acquires a fresh session for the rest of the queue.
    async fn fail_session(
        &self,
        handle: &WorksheetHandle,
        cell: CellId,
        generation: u64,
        kind: FailureKind,
        message: String,
    ) {
        let _session = handle.session_lock.lock().await;
        let failed = handle.mutate(|ws| {
            handle.generation() == generation
                && ws.abort_computing(CellFailure::new(kind, message.clone())).is_some()
        });
        if failed {
            tracing::warn!(worksheet = %handle.id, %cell, ?kind, reason = %message, "session unhealthy, tearing down");
            self.pool.discard(&handle.id).await;
        }
    }
}
