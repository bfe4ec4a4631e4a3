//! Seeded workload simulator
//!
//! Builds a set of worksheets whose cells are scripted on the
//! [`ScriptedBackend`] (fixed answers, random delays, random crashes), runs
//! them all at once against a small pool, and then checks what came back:
//! - Every cell ran exactly once, in document order
//! - Crashed cells failed alone; the cells after them still completed
//! - Live sessions never exceeded the pool capacity
//! - Published copies stay untouched while their source runs again

use futures::future::join_all;
use nbe_core::{
    CellState, EngineConfig, EngineError, FailureKind, MemoryStore, Notebook, StaticUsers, WorksheetId,
};
use nbe_test_utils::{Reply, ScriptedBackend};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Worksheet owners are spread round-robin over this many users
const OWNERS: usize = 3;

/// Simulator configuration
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    pub worksheets: usize,
    pub cells_per_worksheet: usize,
    /// Pool capacity (overrides the engine config)
    pub capacity: usize,
    /// Probability that a cell kills its session
    pub crash_rate: f64,
    /// Upper bound for the random per-cell delay
    pub max_delay_ms: u64,
    /// How long a worksheet may take to drain its queue
    pub settle_timeout_secs: u64,
    pub engine: EngineConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            worksheets: 8,
            cells_per_worksheet: 10,
            capacity: 2,
            crash_rate: 0.05,
            max_delay_ms: 5,
            settle_timeout_secs: 60,
            engine: EngineConfig::new(),
        }
    }
}

impl SimulatorConfig {
    /// Reject workloads the simulator cannot run
    ///
    /// # Errors
    /// `EngineError::Config` for a crash rate outside `[0, 1]` or an empty
    /// workload.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&self.crash_rate) {
            return Err(EngineError::Config(format!(
                "crash rate {} is not a probability",
                self.crash_rate
            )));
        }
        if self.worksheets == 0 || self.cells_per_worksheet == 0 {
            return Err(EngineError::Config("workload is empty".into()));
        }
        Ok(())
    }
}

/// A broken guarantee
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// A worksheet did not drain its queue in time
    Stalled { worksheet: String },
    /// Cells ran out of document order, twice, or not at all
    OrderBroken {
        worksheet: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    /// A cell ended in the wrong state or with the wrong output
    WrongOutcome {
        worksheet: String,
        cell: usize,
        expected: String,
        state: CellState,
        output: String,
    },
    /// `state_number` did not advance across a run
    StateNumberStuck { worksheet: String, before: u64, after: u64 },
    /// More sessions were live than the pool allows
    CapacityExceeded { peak: usize, capacity: usize },
    /// Sessions still bound after every worksheet quit
    LeakedSessions { active: usize },
    /// A published copy changed after its source ran again
    PublishedCopyChanged { worksheet: String },
    /// Structural check failed
    Invariant { worksheet: String, detail: String },
}

/// Statistics for a simulation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulatorStats {
    pub cells: usize,
    pub executions: usize,
    pub crashes_scripted: usize,
    pub sessions_started: usize,
    pub peak_active_sessions: usize,
    pub published: usize,
    pub elapsed_ms: u128,
}

/// Final report from the simulator
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    pub config: SimulatorConfig,
    pub stats: SimulatorStats,
    pub violations: Vec<Violation>,
}

impl SimulatorReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable summary
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "=== NBE Simulator Report ===\n");
        let _ = writeln!(report, "Seed: {}", self.config.seed);
        let _ = writeln!(
            report,
            "Worksheets: {} x {} cells, pool capacity {}",
            self.config.worksheets, self.config.cells_per_worksheet, self.config.capacity
        );
        let _ = writeln!(report, "Executions: {}", self.stats.executions);
        let _ = writeln!(report, "Crashes scripted: {}", self.stats.crashes_scripted);
        let _ = writeln!(report, "Sessions started: {}", self.stats.sessions_started);
        let _ = writeln!(report, "Peak live sessions: {}", self.stats.peak_active_sessions);
        let _ = writeln!(report, "Published copies: {}", self.stats.published);
        let _ = writeln!(report, "Elapsed: {}ms", self.stats.elapsed_ms);
        let _ = writeln!(report, "Violations: {}", self.violations.len());

        if !self.violations.is_empty() {
            let _ = writeln!(report, "\n=== Violations ===");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(report, "{}. {v:?}", i + 1);
            }
        }

        let _ = writeln!(
            report,
            "\n=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        report
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expected {
    Output(String),
    Crash,
}

impl Expected {
    fn describe(&self) -> String {
        match self {
            Self::Output(text) => format!("done with {text:?}"),
            Self::Crash => "errored by a crash".into(),
        }
    }
}

#[derive(Debug)]
struct Sheet {
    index: usize,
    owner: String,
    id: WorksheetId,
    expected: Vec<Expected>,
}

fn owner_name(index: usize) -> String {
    format!("user{}", index % OWNERS)
}

fn cell_code(sheet: usize, cell: usize) -> String {
    format!("w{sheet}c{cell}")
}

/// Script one cell's reply and return what the engine should record
fn script_cell(backend: &ScriptedBackend, rng: &mut StdRng, config: &SimulatorConfig, code: String) -> Expected {
    if rng.gen_bool(config.crash_rate) {
        backend.on(code, Reply::Crash(vec!["partial".into()]));
        return Expected::Crash;
    }
    let value = rng.gen_range(0..10_000u32).to_string();
    let delay = rng.gen_range(0..=config.max_delay_ms);
    let reply = if delay == 0 {
        Reply::Output(vec![value.clone()])
    } else {
        Reply::Delayed(Duration::from_millis(delay), value.clone())
    };
    backend.on(code, reply);
    Expected::Output(value)
}

/// Run the simulator
///
/// # Errors
/// Invalid configuration, or an engine call the workload relies on failed.
/// Broken guarantees are reported as violations, not errors.
pub async fn run_simulator(config: SimulatorConfig) -> Result<SimulatorReport, EngineError> {
    config.validate()?;
    let started_at = Instant::now();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let backend = ScriptedBackend::new();
    let users = (0..OWNERS).fold(StaticUsers::new(), |users, n| users.with_user(owner_name(n)));
    let notebook = Notebook::new(
        config.engine.clone().with_pool_capacity(config.capacity),
        backend.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(users),
    )?;
    tracing::info!(
        seed = config.seed,
        worksheets = config.worksheets,
        cells = config.cells_per_worksheet,
        capacity = config.capacity,
        "simulation starting"
    );

    let mut stats = SimulatorStats::default();
    let mut violations = Vec::new();
    let mut sheets = Vec::with_capacity(config.worksheets);
    for index in 0..config.worksheets {
        let owner = owner_name(index);
        let id = notebook
            .create_worksheet(&owner, &format!("sim {index}"), None)
            .await?;
        let mut expected = Vec::with_capacity(config.cells_per_worksheet);
        for cell in 0..config.cells_per_worksheet {
            let code = cell_code(index, cell);
            notebook.append_cell(&owner, &id, &code).await?;
            expected.push(script_cell(&backend, &mut rng, &config, code));
        }
        stats.cells += expected.len();
        stats.crashes_scripted += expected.iter().filter(|e| **e == Expected::Crash).count();
        sheets.push(Sheet {
            index,
            owner,
            id,
            expected,
        });
    }

    let settle = Duration::from_secs(config.settle_timeout_secs);
    let (stop, peak) = spawn_sampler(notebook.clone());

    // Round one: every worksheet at once
    run_round(&notebook, &sheets, settle, &mut violations).await?;
    for sheet in &sheets {
        check_order(&backend, sheet, &mut violations);
    }

    // Round two: publish everything, then rerun the first worksheet with
    // new answers; only the source may change
    let mut published = Vec::with_capacity(sheets.len());
    for sheet in &sheets {
        let copy = notebook.publish(&sheet.owner, &sheet.id).await?;
        let cells = notebook.view(&copy).await?.cells;
        published.push((copy, cells));
    }
    stats.published = published.len();

    let first = &mut sheets[0];
    for (cell, expected) in first.expected.iter_mut().enumerate() {
        let value = format!("rerun {cell}");
        backend.on(cell_code(first.index, cell), Reply::Output(vec![value.clone()]));
        *expected = Expected::Output(value);
    }
    run_round(&notebook, &sheets[..1], settle, &mut violations).await?;

    for (copy, before) in &published {
        let after = notebook.view(copy).await?.cells;
        if &after != before {
            violations.push(Violation::PublishedCopyChanged {
                worksheet: copy.to_string(),
            });
        }
    }

    let _ = stop.send(true);
    let final_stats = notebook.pool_stats().await;
    if final_stats.active_count != 0 {
        violations.push(Violation::LeakedSessions {
            active: final_stats.active_count,
        });
    }
    stats.peak_active_sessions = peak.load(Ordering::SeqCst);
    if stats.peak_active_sessions > config.capacity {
        violations.push(Violation::CapacityExceeded {
            peak: stats.peak_active_sessions,
            capacity: config.capacity,
        });
    }
    stats.executions = backend.executed().len();
    stats.sessions_started = backend.started();
    stats.elapsed_ms = started_at.elapsed().as_millis();
    notebook.shutdown().await;

    for violation in &violations {
        tracing::warn!(?violation, "guarantee broken");
    }
    tracing::info!(
        executions = stats.executions,
        sessions = stats.sessions_started,
        violations = violations.len(),
        "simulation finished"
    );

    Ok(SimulatorReport {
        config,
        stats,
        violations,
    })
}

/// Evaluate, drain and quit each worksheet concurrently, then check outcomes
async fn run_round(
    notebook: &Notebook,
    sheets: &[Sheet],
    settle: Duration,
    violations: &mut Vec<Violation>,
) -> Result<(), EngineError> {
    let mut before = Vec::with_capacity(sheets.len());
    for sheet in sheets {
        before.push(notebook.view(&sheet.id).await?.state_number);
    }

    let runs = sheets.iter().map(|sheet| async move {
        notebook.evaluate_all(&sheet.owner, &sheet.id).await?;
        let settled = notebook.wait_until_idle(&sheet.id, settle).await?;
        notebook.quit(&sheet.id).await?;
        Ok::<_, EngineError>(settled)
    });
    let settled = join_all(runs).await;

    for ((sheet, settled), before) in sheets.iter().zip(settled).zip(before) {
        let worksheet = sheet.id.to_string();
        if !settled? {
            violations.push(Violation::Stalled { worksheet });
            continue;
        }
        let view = notebook.view(&sheet.id).await?;
        if view.state_number <= before {
            violations.push(Violation::StateNumberStuck {
                worksheet: worksheet.clone(),
                before,
                after: view.state_number,
            });
        }
        for (cell, (shown, expected)) in view.cells.iter().zip(&sheet.expected).enumerate() {
            let ok = match expected {
                Expected::Output(text) => shown.state == CellState::Done && shown.output_text == *text,
                Expected::Crash => {
                    shown.state == CellState::Errored
                        && shown.failure.as_ref().map(|f| f.kind) == Some(FailureKind::Crashed)
                }
            };
            if !ok {
                violations.push(Violation::WrongOutcome {
                    worksheet: worksheet.clone(),
                    cell,
                    expected: expected.describe(),
                    state: shown.state,
                    output: shown.output_text.clone(),
                });
            }
        }
        if let Err(detail) = notebook.check_invariants(&sheet.id).await? {
            violations.push(Violation::Invariant { worksheet, detail });
        }
    }
    Ok(())
}

/// Cells of one worksheet must have run once each, in document order
fn check_order(backend: &ScriptedBackend, sheet: &Sheet, violations: &mut Vec<Violation>) {
    let prefix = format!("w{}c", sheet.index);
    let actual: Vec<usize> = backend
        .executed_code()
        .iter()
        .filter_map(|code| code.strip_prefix(&prefix)?.parse().ok())
        .collect();
    let expected: Vec<usize> = (0..sheet.expected.len()).collect();
    if actual != expected {
        violations.push(Violation::OrderBroken {
            worksheet: sheet.id.to_string(),
            expected,
            actual,
        });
    }
}

/// Track the highest number of live sessions until told to stop
fn spawn_sampler(notebook: Notebook) -> (watch::Sender<bool>, Arc<AtomicUsize>) {
    let (stop, mut stopped) = watch::channel(false);
    let peak = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&peak);
    tokio::spawn(async move {
        loop {
            let active = notebook.pool_stats().await.active_count;
            seen.fetch_max(active, Ordering::SeqCst);
            tokio::select! {
                _ = stopped.changed() => break,
                () = tokio::time::sleep(Duration::from_millis(2)) => {}
            }
        }
    });
    (stop, peak)
}
