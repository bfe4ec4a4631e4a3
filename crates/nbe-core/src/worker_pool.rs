//! Worker pool for backend sessions
//!
//! Provides bounded session reuse and lifecycle management:
//! - Session acquisition per worksheet (reuse or create)
//! - FIFO waiting when every slot is taken
//! - Teardown of unhealthy sessions and restart
//! - Pool statistics and monitoring

use crate::backend::{Backend, BackendSession};
use crate::config::{EngineConfig, SessionStartConfig};
use crate::error::{BackendError, PoolError};
use crate::ids::WorksheetId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// Session handed to a worksheet's dispatcher
#[derive(Debug, Clone)]
pub struct Lease {
    /// The bound session
    pub session: Arc<dyn BackendSession>,
    /// The session was started by this acquire (auto cells must run)
    pub fresh: bool,
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total sessions started
    pub total_created: usize,
    /// Sessions currently bound to a worksheet
    pub active_count: usize,
    /// Acquires answered by an existing session
    pub reused: usize,
    /// Sessions torn down (release, restart, unhealthy)
    pub torn_down: usize,
    /// Dispatchers waiting for a slot
    pub waiting: usize,
}

/// A session bound to one worksheet; dropping it frees the slot
#[derive(Debug)]
struct BoundSession {
    session: Arc<dyn BackendSession>,
    permit: OwnedSemaphorePermit,
    last_used: Instant,
}

/// Bounded pool of backend sessions, at most one per worksheet
pub struct WorkerPool {
    /// Maximum concurrent sessions
    capacity: usize,
    backend: Arc<dyn Backend>,
    /// Fair semaphore: waiters are served FIFO
    slots: Arc<Semaphore>,
    /// Bound sessions
    active: DashMap<WorksheetId, BoundSession>,
    start: SessionStartConfig,
    acquire_timeout: Option<Duration>,
    waiting: AtomicUsize,
    /// Statistics
    stats: Mutex<PoolStats>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Create new pool
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: &EngineConfig) -> Self {
        Self {
            capacity: config.pool_capacity,
            backend,
            slots: Arc::new(Semaphore::new(config.pool_capacity)),
            active: DashMap::new(),
            start: config.session_start,
            acquire_timeout: config.acquire_timeout(),
            waiting: AtomicUsize::new(0),
            stats: Mutex::new(PoolStats::default()),
        }
    }

    /// Maximum number of live sessions
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Session bound to `worksheet`, or a new one.
    ///
    /// Blocks (FIFO) while the pool is full. A bound session started for a
    /// different system is replaced.
    ///
    /// # Errors
    /// - `PoolError::SessionUnavailable` if the acquire timeout elapsed
    /// - `PoolError::StartFailed` once start retries are exhausted
    /// - `PoolError::Closed` after `shutdown_all`
    pub async fn acquire(&self, worksheet: &WorksheetId, system: &str) -> Result<Lease, PoolError> {
        let reused = self.active.get_mut(worksheet).and_then(|mut bound| {
            (bound.session.system() == system).then(|| {
                bound.last_used = Instant::now();
                Arc::clone(&bound.session)
            })
        });
        if let Some(session) = reused {
            self.stats.lock().await.reused += 1;
            return Ok(Lease { session, fresh: false });
        }
        if self.is_bound(worksheet) {
            tracing::debug!(%worksheet, system, "system changed, replacing session");
            self.discard(worksheet).await;
        }

        let permit = self.wait_for_slot().await?;
        let session = self.start_session(system).await?;
        tracing::info!(%worksheet, session = %session.id(), system, "backend session started");

        let bound_meanwhile = match self.active.entry(worksheet.clone()) {
            Entry::Occupied(existing) => Some(Arc::clone(&existing.get().session)),
            Entry::Vacant(slot) => {
                slot.insert(BoundSession {
                    session: Arc::clone(&session),
                    permit,
                    last_used: Instant::now(),
                });
                None
            }
        };
        if let Some(current) = bound_meanwhile {
            // never overwrite a binding; the extra session and its slot go
            tracing::debug!(%worksheet, session = %session.id(), "worksheet bound meanwhile, dropping new session");
            session.shutdown().await;
            return Ok(Lease {
                session: current,
                fresh: false,
            });
        }

        let mut stats = self.stats.lock().await;
        stats.total_created += 1;
        stats.active_count = self.active.len();

        Ok(Lease { session, fresh: true })
    }

    async fn wait_for_slot(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let acquire = Arc::clone(&self.slots).acquire_owned();
        let result = match self.acquire_timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(permit) => permit.map_err(|_| PoolError::Closed),
                Err(_) => Err(PoolError::SessionUnavailable(self.capacity)),
            },
            None => acquire.await.map_err(|_| PoolError::Closed),
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Start a session, retrying transient faults with exponential backoff
    async fn start_session(&self, system: &str) -> Result<Arc<dyn BackendSession>, PoolError> {
        let mut attempt = 1;
        loop {
            match self.backend.start(system).await {
                Ok(session) => return Ok(session),
                Err(err) if err.is_transient() && attempt < self.start.max_attempts => {
                    let delay = self.start.delay_for(attempt);
                    tracing::warn!(system, attempt, ?delay, error = %err, "session start failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(system, attempt, error = %err, "session start failed");
                    return Err(start_failed(system, attempt, &err));
                }
            }
        }
    }

    /// Session currently bound to `worksheet`
    #[must_use]
    pub fn session(&self, worksheet: &WorksheetId) -> Option<Arc<dyn BackendSession>> {
        self.active.get(worksheet).map(|b| Arc::clone(&b.session))
    }

    /// Whether `worksheet` holds a session
    #[must_use]
    pub fn is_bound(&self, worksheet: &WorksheetId) -> bool {
        self.active.contains_key(worksheet)
    }

    /// How long the worksheet's session has been unused
    #[must_use]
    pub fn idle_for(&self, worksheet: &WorksheetId) -> Option<Duration> {
        self.active.get(worksheet).map(|b| b.last_used.elapsed())
    }

    /// Mark the session as in use now
    pub fn touch(&self, worksheet: &WorksheetId) {
        if let Some(mut bound) = self.active.get_mut(worksheet) {
            bound.last_used = Instant::now();
        }
    }

    /// Worksheets currently holding a session
    #[must_use]
    pub fn bound_worksheets(&self) -> Vec<WorksheetId> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Tear down the worksheet's session and free its slot. Used for
    /// release, quit and unhealthy sessions alike.
    pub async fn discard(&self, worksheet: &WorksheetId) -> bool {
        let Some((_, bound)) = self.active.remove(worksheet) else {
            return false;
        };
        bound.session.shutdown().await;
        tracing::info!(%worksheet, session = %bound.session.id(), "backend session torn down");
        drop(bound);

        let mut stats = self.stats.lock().await;
        stats.torn_down += 1;
        stats.active_count = self.active.len();
        true
    }

    /// Replace the worksheet's session with a fresh one, keeping its slot.
    ///
    /// The binding stays in place while the new session starts, so a
    /// concurrent `acquire` for the same worksheet never takes a second slot.
    /// Returns `Ok(None)` when no session was bound.
    ///
    /// # Errors
    /// `PoolError::StartFailed` if the replacement cannot be started; the
    /// binding is dropped and the slot freed in that case.
    pub async fn restart(&self, worksheet: &WorksheetId) -> Result<Option<Lease>, PoolError> {
        let Some(old) = self.session(worksheet) else {
            return Ok(None);
        };
        let system = old.system().to_string();
        old.shutdown().await;
        tracing::info!(%worksheet, session = %old.id(), "restarting backend session");
        self.stats.lock().await.torn_down += 1;

        let session = match self.start_session(&system).await {
            Ok(session) => session,
            Err(err) => {
                self.active.remove_if(worksheet, |_, bound| bound.session.id() == old.id());
                self.stats.lock().await.active_count = self.active.len();
                return Err(err);
            }
        };
        let replaced = self
            .active
            .get_mut(worksheet)
            .filter(|bound| bound.session.id() == old.id())
            .map(|mut bound| {
                bound.session = Arc::clone(&session);
                bound.last_used = Instant::now();
            })
            .is_some();
        if !replaced {
            // discarded while the replacement was starting
            session.shutdown().await;
            return Ok(None);
        }

        self.stats.lock().await.total_created += 1;
        Ok(Some(Lease { session, fresh: true }))
    }

    /// Shutdown all sessions and refuse further acquires
    pub async fn shutdown_all(&self) {
        self.slots.close();
        let bound: Vec<WorksheetId> = self.bound_worksheets();
        let sessions: Vec<Arc<dyn BackendSession>> = bound
            .iter()
            .filter_map(|id| self.active.remove(id).map(|(_, b)| b.session))
            .collect();
        futures::future::join_all(sessions.iter().map(|s| s.shutdown())).await;

        let mut stats = self.stats.lock().await;
        stats.torn_down += sessions.len();
        stats.active_count = self.active.len();
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let mut stats = self.stats.lock().await.clone();
        stats.waiting = self.waiting.load(Ordering::SeqCst);
        stats
    }

    /// Get active session count
    #[inline]
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

fn start_failed(system: &str, attempts: u32, err: &BackendError) -> PoolError {
    PoolError::StartFailed {
        system: system.to_string(),
        attempts,
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExecuteRequest, OutputEvent};
    use crate::ids::SessionId;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct NullSession {
        id: SessionId,
        system: String,
    }

    #[async_trait]
    impl BackendSession for NullSession {
        fn id(&self) -> SessionId {
            self.id
        }

        fn system(&self) -> &str {
            &self.system
        }

        async fn execute(&self, _request: ExecuteRequest) -> Result<mpsc::Receiver<OutputEvent>, BackendError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn interrupt(&self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn shutdown(&self) {}
    }

    /// Fails the first `failures` starts with a transient error
    #[derive(Default)]
    struct FlakyBackend {
        failures: u32,
        permanent: bool,
        start_delay: Duration,
        starts: AtomicU32,
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        async fn start(&self, system: &str) -> Result<Arc<dyn BackendSession>, BackendError> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst);
            if !self.start_delay.is_zero() {
                tokio::time::sleep(self.start_delay).await;
            }
            if self.permanent {
                return Err(BackendError::Rejected("no such system".into()));
            }
            if n < self.failures {
                return Err(BackendError::Unavailable("warming up".into()));
            }
            Ok(Arc::new(NullSession {
                id: SessionId::new(),
                system: system.to_string(),
            }))
        }
    }

    fn config(capacity: usize) -> EngineConfig {
        EngineConfig::new()
            .with_pool_capacity(capacity)
            .with_session_start(SessionStartConfig {
                max_attempts: 3,
                base_delay_ms: 1,
            })
    }

    fn pool(capacity: usize) -> WorkerPool {
        WorkerPool::new(Arc::new(FlakyBackend::default()), &config(capacity))
    }

    #[tokio::test]
    async fn worker_pool_reuses_bound_session() {
        let pool = pool(2);
        let w = WorksheetId::new("a", 1);

        let first = pool.acquire(&w, "sage").await.unwrap();
        assert!(first.fresh);
        let second = pool.acquire(&w, "sage").await.unwrap();
        assert!(!second.fresh);
        assert_eq!(first.session.id(), second.session.id());

        let stats = pool.stats().await;
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.active_count, 1);
    }

    #[tokio::test]
    async fn worker_pool_saturation_times_out() {
        let pool = WorkerPool::new(
            Arc::new(FlakyBackend::default()),
            &config(1).with_acquire_timeout_ms(20),
        );
        pool.acquire(&WorksheetId::new("a", 1), "sage").await.unwrap();

        let result = pool.acquire(&WorksheetId::new("a", 2), "sage").await;
        assert!(matches!(result, Err(PoolError::SessionUnavailable(1))));
    }

    #[tokio::test]
    async fn worker_pool_waiter_proceeds_after_discard() {
        let pool = Arc::new(pool(1));
        let w1 = WorksheetId::new("a", 1);
        let w2 = WorksheetId::new("a", 2);
        pool.acquire(&w1, "sage").await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let w2 = w2.clone();
            tokio::spawn(async move { pool.acquire(&w2, "sage").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.stats().await.waiting, 1);

        assert!(pool.discard(&w1).await);
        let lease = waiter.await.unwrap().unwrap();
        assert!(lease.fresh);
        assert!(pool.is_bound(&w2));
        assert!(!pool.is_bound(&w1));
    }

    #[tokio::test]
    async fn worker_pool_retries_transient_start_failures() {
        let backend = Arc::new(FlakyBackend {
            failures: 2,
            ..FlakyBackend::default()
        });
        let pool = WorkerPool::new(backend.clone(), &config(1));
        pool.acquire(&WorksheetId::new("a", 1), "sage").await.unwrap();
        assert_eq!(backend.starts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn worker_pool_start_failure_frees_slot() {
        let backend = Arc::new(FlakyBackend {
            permanent: true,
            ..FlakyBackend::default()
        });
        let pool = WorkerPool::new(backend, &config(1));
        let err = pool.acquire(&WorksheetId::new("a", 1), "sage").await.unwrap_err();
        assert!(matches!(err, PoolError::StartFailed { attempts: 1, .. }));
        assert_eq!(pool.slots.available_permits(), 1);
    }

    #[tokio::test]
    async fn worker_pool_restart_replaces_session() {
        let pool = pool(1);
        let w = WorksheetId::new("a", 1);
        let old = pool.acquire(&w, "sage").await.unwrap();
        let new = pool.restart(&w).await.unwrap().unwrap();
        assert!(new.fresh);
        assert_ne!(old.session.id(), new.session.id());
        assert_eq!(pool.active_count(), 1);
        assert!(pool.restart(&WorksheetId::new("a", 9)).await.unwrap().is_none());
    }

    fn slow_pool(capacity: usize) -> Arc<WorkerPool> {
        let backend = FlakyBackend {
            start_delay: Duration::from_millis(30),
            ..FlakyBackend::default()
        };
        Arc::new(WorkerPool::new(Arc::new(backend), &config(capacity)))
    }

    /// Tenet: a restarting worksheet keeps its binding and its slot.
    #[tokio::test]
    async fn worker_pool_acquire_during_restart_keeps_the_slot() {
        let pool = slow_pool(1);
        let w = WorksheetId::new("a", 1);
        pool.acquire(&w, "sage").await.unwrap();

        let restart = {
            let pool = Arc::clone(&pool);
            let w = w.clone();
            tokio::spawn(async move { pool.restart(&w).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pool.is_bound(&w));

        let during = tokio::time::timeout(Duration::from_millis(500), pool.acquire(&w, "sage"))
            .await
            .expect("acquire waited on the worksheet's own slot")
            .unwrap();
        assert!(!during.fresh);

        let new = restart.await.unwrap().unwrap().unwrap();
        assert_eq!(pool.session(&w).unwrap().id(), new.session.id());
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.slots.available_permits(), 0);
    }

    #[tokio::test]
    async fn worker_pool_never_overwrites_a_binding() {
        let pool = slow_pool(2);
        let w = WorksheetId::new("a", 1);
        let (a, b) = tokio::join!(pool.acquire(&w, "sage"), pool.acquire(&w, "sage"));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.session.id(), b.session.id());
        assert!(a.fresh != b.fresh);
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.slots.available_permits(), 1);
        assert_eq!(pool.stats().await.total_created, 1);
    }

    #[tokio::test]
    async fn worker_pool_system_change_replaces_session() {
        let pool = pool(1);
        let w = WorksheetId::new("a", 1);
        pool.acquire(&w, "sage").await.unwrap();
        let lease = pool.acquire(&w, "python").await.unwrap();
        assert!(lease.fresh);
        assert_eq!(lease.session.system(), "python");
        assert_eq!(pool.stats().await.torn_down, 1);
    }

    #[tokio::test]
    async fn worker_pool_shutdown_closes() {
        let pool = pool(2);
        pool.acquire(&WorksheetId::new("a", 1), "sage").await.unwrap();
        pool.shutdown_all().await;
        assert_eq!(pool.active_count(), 0);
        let result = pool.acquire(&WorksheetId::new("a", 2), "sage").await;
        assert!(matches!(result, Err(PoolError::Closed)));
    }
}
