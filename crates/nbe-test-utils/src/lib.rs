//! Testing utilities for NBE workspace
//!
//! Shared test helpers, fixtures, and a scripted backend.

#![allow(missing_docs)]

use async_trait::async_trait;
use nbe_core::{
    Backend, BackendError, BackendSession, CompletionStatus, EngineConfig, ExecuteRequest,
    InterruptConfig, MemoryStore, Notebook, OutputChunk, OutputEvent, SessionId, StaticUsers,
    WorksheetId, WorksheetView,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

/// How the scripted backend answers one piece of code
#[derive(Debug, Clone)]
pub enum Reply {
    /// Emit the chunks, then finish successfully
    Output(Vec<String>),
    /// Finish with an error
    Error(String),
    /// Wait, then answer with `Output`; interruptible
    Delayed(Duration, String),
    /// Run until interrupted
    Hang,
    /// Ignore interrupts and never finish
    Stubborn,
    /// Emit the chunks, then die
    Crash(Vec<String>),
    /// Close the event channel without a terminal event
    Vanish,
}

#[derive(Debug, Default)]
struct Script {
    replies: HashMap<String, Reply>,
    /// Upcoming start attempts that fail transiently
    transient_start_failures: usize,
    refuse_starts: bool,
    start_delay: Option<Duration>,
}

/// Everything the backend was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    pub session: SessionId,
    pub request: ExecuteRequest,
}

/// In-process backend driven by a script of replies keyed by code.
///
/// Unscripted code that is a sum of integers (`1+1`) evaluates to the sum;
/// anything else is echoed back.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
    executed: Arc<Mutex<Vec<Executed>>>,
    started: AtomicUsize,
    start_attempts: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    interrupts: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the reply for `code`
    pub fn on(&self, code: impl Into<String>, reply: Reply) {
        self.script.lock().replies.insert(code.into(), reply);
    }

    /// Make the next `count` session starts fail transiently
    pub fn fail_next_starts(&self, count: usize) {
        self.script.lock().transient_start_failures = count;
    }

    /// Refuse every session start permanently
    pub fn refuse_starts(&self, refuse: bool) {
        self.script.lock().refuse_starts = refuse;
    }

    /// Make every session start take `delay`
    pub fn slow_starts(&self, delay: Duration) {
        self.script.lock().start_delay = Some(delay);
    }

    /// Code executed so far, in submission order
    #[must_use]
    pub fn executed_code(&self) -> Vec<String> {
        self.executed.lock().iter().map(|e| e.request.code.clone()).collect()
    }

    #[must_use]
    pub fn executed(&self) -> Vec<Executed> {
        self.executed.lock().clone()
    }

    /// Sessions successfully started
    #[must_use]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn start_attempts(&self) -> usize {
        self.start_attempts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Interrupt signals received
    #[must_use]
    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn start(&self, system: &str) -> Result<Arc<dyn BackendSession>, BackendError> {
        self.start_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = {
            let mut script = self.script.lock();
            if script.refuse_starts {
                return Err(BackendError::Rejected(format!("no {system} installed")));
            }
            if script.transient_start_failures > 0 {
                script.transient_start_failures -= 1;
                return Err(BackendError::Unavailable("backend warming up".to_string()));
            }
            script.start_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(ScriptedSession {
            id: SessionId::new(),
            system: system.to_string(),
            script: Arc::clone(&self.script),
            executed: Arc::clone(&self.executed),
            shutdowns: Arc::clone(&self.shutdowns),
            interrupts: Arc::clone(&self.interrupts),
            current: Mutex::new(None),
            closed,
        }))
    }
}

/// Session created by `ScriptedBackend`
#[derive(Debug)]
pub struct ScriptedSession {
    id: SessionId,
    system: String,
    script: Arc<Mutex<Script>>,
    executed: Arc<Mutex<Vec<Executed>>>,
    shutdowns: Arc<AtomicUsize>,
    interrupts: Arc<AtomicUsize>,
    /// Interrupt signal of the running request
    current: Mutex<Option<Arc<Notify>>>,
    closed: watch::Sender<bool>,
}

impl ScriptedSession {
    fn reply_for(&self, code: &str) -> Reply {
        if let Some(reply) = self.script.lock().replies.get(code) {
            return reply.clone();
        }
        let sum: Option<i64> = code
            .split('+')
            .map(|term| term.trim().parse::<i64>().ok())
            .sum();
        Reply::Output(vec![sum.map_or_else(|| code.to_string(), |n| n.to_string())])
    }
}

#[async_trait]
impl BackendSession for ScriptedSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn system(&self) -> &str {
        &self.system
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<mpsc::Receiver<OutputEvent>, BackendError> {
        if *self.closed.borrow() {
            return Err(BackendError::Crashed("session already shut down".to_string()));
        }
        let reply = self.reply_for(&request.code);
        self.executed.lock().push(Executed {
            session: self.id,
            request,
        });

        let interrupt = Arc::new(Notify::new());
        *self.current.lock() = Some(Arc::clone(&interrupt));
        let mut closed = self.closed.subscribe();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let finish = |chunks: Vec<String>| {
                let mut events: Vec<OutputEvent> = chunks
                    .into_iter()
                    .map(|c| OutputEvent::Chunk(OutputChunk::text(c)))
                    .collect();
                events.push(OutputEvent::Finished(CompletionStatus::Success));
                events
            };
            let events = match reply {
                Reply::Output(chunks) => finish(chunks),
                Reply::Error(message) => vec![
                    OutputEvent::Chunk(OutputChunk::text(message.clone())),
                    OutputEvent::Finished(CompletionStatus::Error(message)),
                ],
                Reply::Delayed(delay, text) => tokio::select! {
                    () = tokio::time::sleep(delay) => finish(vec![text]),
                    () = interrupt.notified() => vec![OutputEvent::Interrupted],
                    _ = closed.changed() => Vec::new(),
                },
                Reply::Hang => tokio::select! {
                    () = interrupt.notified() => vec![OutputEvent::Interrupted],
                    _ = closed.changed() => Vec::new(),
                },
                Reply::Stubborn => {
                    let _ = closed.changed().await;
                    Vec::new()
                }
                Reply::Crash(chunks) => {
                    let mut events: Vec<OutputEvent> = chunks
                        .into_iter()
                        .map(|c| OutputEvent::Chunk(OutputChunk::text(c)))
                        .collect();
                    events.push(OutputEvent::Crashed("segmentation fault".to_string()));
                    events
                }
                Reply::Vanish => Vec::new(),
            };
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        if let Some(signal) = self.current.lock().as_ref() {
            signal.notify_one();
        }
        Ok(())
    }

    async fn shutdown(&self) {
        if !self.closed.send_replace(true) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Users known to every fixture: alice, bob, carol and the admin `root`
#[must_use]
pub fn test_users() -> StaticUsers {
    StaticUsers::new()
        .with_user("alice")
        .with_user("bob")
        .with_user("carol")
        .with_admin("root")
}

/// Configuration with short interrupt waits for fast tests
#[must_use]
pub fn test_config() -> EngineConfig {
    EngineConfig::new()
        .with_pool_capacity(2)
        .with_interrupt(InterruptConfig {
            max_attempts: 3,
            initial_wait_ms: 100,
            backoff_factor: 2,
        })
}

/// Engine wired to a fresh scripted backend and memory store
pub struct Fixture {
    pub notebook: Notebook,
    pub backend: Arc<ScriptedBackend>,
    pub store: Arc<MemoryStore>,
}

impl Fixture {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// # Panics
    /// If the configuration is invalid.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        let backend = ScriptedBackend::new();
        let store = Arc::new(MemoryStore::new());
        let notebook = Notebook::new(
            config,
            Arc::clone(&backend) as Arc<dyn Backend>,
            Arc::clone(&store) as Arc<dyn nbe_core::WorksheetStore>,
            Arc::new(test_users()),
        )
        .expect("test config is valid");
        Self {
            notebook,
            backend,
            store,
        }
    }

    /// Create a worksheet for `owner` with one cell per input
    ///
    /// # Panics
    /// On any engine error.
    pub async fn worksheet(&self, owner: &str, inputs: &[&str]) -> (WorksheetId, Vec<nbe_core::CellId>) {
        let id = self
            .notebook
            .create_worksheet(owner, "test", None)
            .await
            .expect("create worksheet");
        let mut cells = Vec::with_capacity(inputs.len());
        for input in inputs {
            cells.push(self.notebook.append_cell(owner, &id, input).await.expect("append cell"));
        }
        (id, cells)
    }

    /// Wait (bounded) until nothing is queued or computing
    ///
    /// # Panics
    /// If the worksheet does not settle within five seconds.
    pub async fn settle(&self, id: &WorksheetId) -> WorksheetView {
        let idle = self
            .notebook
            .wait_until_idle(id, Duration::from_secs(5))
            .await
            .expect("worksheet exists");
        assert!(idle, "worksheet {id} did not settle");
        self.notebook.view(id).await.expect("worksheet exists")
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Output text of every cell, in document order
#[must_use]
pub fn outputs(view: &WorksheetView) -> Vec<String> {
    view.cells.iter().map(|c| c.output_text.clone()).collect()
}

/// Poll until `cond` holds (bounded)
///
/// # Panics
/// If the condition does not hold within five seconds.
pub async fn eventually<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
