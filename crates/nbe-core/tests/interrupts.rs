//! Functional tests for interrupt escalation, restart and quit.
//!
//! Core guarantees exercised here:
//! - Interrupting an idle worksheet is a harmless no-op, however often.
//! - A backend that acknowledges stops the cell; queued cells keep running
//!   unless the configured policy cancels them.
//! - A backend that never acknowledges is torn down after a bounded number
//!   of attempts, with escalating feedback.
//! - Restart and quit never leave a cell stuck in `Computing`.

use nbe_core::{CellState, FailureKind, InterruptOutcome, InterruptPolicy, Severity};
use nbe_test_utils::{eventually, test_config, Fixture, Reply};
use pretty_assertions::assert_eq;
use std::time::Duration;

async fn started_running(fx: &Fixture, runs: usize) {
    let backend = &fx.backend;
    eventually(|| backend.executed_code().len() >= runs).await;
}

#[tokio::test]
async fn interrupting_an_idle_worksheet_is_a_no_op() {
    let fx = Fixture::new();
    let (ws, _) = fx.worksheet("alice", &["1+1"]).await;
    let before = fx.notebook.view(&ws).await.unwrap().state_number;

    for _ in 0..3 {
        let report = fx.notebook.interrupt(&ws).await.unwrap();
        assert_eq!(report.outcome, InterruptOutcome::NothingToInterrupt);
        assert!(!report.stopped());
    }

    assert_eq!(fx.notebook.view(&ws).await.unwrap().state_number, before);
    assert_eq!(fx.backend.interrupts(), 0);
}

/// Tenet: an acknowledged interrupt stops only the computing cell.
#[tokio::test]
async fn acknowledged_interrupt_keeps_the_queue() {
    let fx = Fixture::new();
    fx.backend.on("loop", Reply::Hang);
    let (ws, cells) = fx.worksheet("alice", &["loop", "1+1"]).await;

    fx.notebook.evaluate_all("alice", &ws).await.unwrap();
    started_running(&fx, 1).await;

    let report = fx.notebook.interrupt(&ws).await.unwrap();
    assert!(matches!(
        report.outcome,
        InterruptOutcome::Acknowledged { cell, .. } if cell == cells[0]
    ));
    assert!(!report.suggest_restart);

    let view = fx.settle(&ws).await;
    assert_eq!(view.cells[0].state, CellState::Interrupted);
    assert_eq!(view.cells[1].output_text, "2");
    assert_eq!(fx.backend.started(), 1);

    let again = fx.notebook.interrupt(&ws).await.unwrap();
    assert_eq!(again.outcome, InterruptOutcome::NothingToInterrupt);
}

#[tokio::test]
async fn cancel_policy_returns_queued_cells_to_idle() {
    let fx = Fixture::with_config(test_config().with_interrupt_policy(InterruptPolicy::CancelQueued));
    fx.backend.on("loop", Reply::Hang);
    let (ws, _) = fx.worksheet("alice", &["loop", "1+1", "2+2"]).await;

    fx.notebook.evaluate_all("alice", &ws).await.unwrap();
    started_running(&fx, 1).await;
    fx.notebook.interrupt(&ws).await.unwrap();

    let view = fx.settle(&ws).await;
    let states: Vec<CellState> = view.cells.iter().map(|c| c.state).collect();
    assert_eq!(states, vec![CellState::Interrupted, CellState::Idle, CellState::Idle]);
    assert_eq!(fx.backend.executed_code(), vec!["loop"]);
}

/// Tenet: an unresponsive backend cannot wedge the worksheet.
///
/// After the configured number of unanswered interrupts the session is torn
/// down, the cell fails with an interrupt timeout, and the queue continues in
/// a fresh session.
#[tokio::test]
async fn unresponsive_backend_is_escalated() {
    let fx = Fixture::new();
    fx.backend.on("spin", Reply::Stubborn);
    let (ws, cells) = fx.worksheet("alice", &["spin", "1+1"]).await;

    fx.notebook.evaluate_all("alice", &ws).await.unwrap();
    started_running(&fx, 1).await;

    let report = fx.notebook.interrupt(&ws).await.unwrap();
    assert_eq!(
        report.outcome,
        InterruptOutcome::Escalated {
            cell: cells[0],
            attempts: 3
        }
    );
    assert!(report.suggest_restart);
    let severities: Vec<Severity> = report.feedback.iter().map(|f| f.severity).collect();
    assert_eq!(severities, vec![Severity::Info, Severity::Warning, Severity::Critical]);
    assert_eq!(fx.backend.interrupts(), 3);

    let view = fx.settle(&ws).await;
    assert_eq!(
        view.cells[0].failure.as_ref().map(|f| f.kind),
        Some(FailureKind::InterruptTimeout)
    );
    assert_eq!(view.cells[1].output_text, "2");
    assert_eq!(fx.backend.started(), 2);
    assert!(fx.backend.shutdowns() >= 1);
}

#[tokio::test]
async fn restart_fails_the_computing_cell_and_continues() {
    let fx = Fixture::new();
    fx.backend.on("spin", Reply::Stubborn);
    let (ws, _) = fx.worksheet("alice", &["%auto\nx = 1", "spin", "2+2"]).await;

    fx.notebook.evaluate_all("alice", &ws).await.unwrap();
    started_running(&fx, 2).await;

    fx.notebook.restart(&ws).await.unwrap();
    let view = fx.settle(&ws).await;

    assert_eq!(view.cells[1].failure.as_ref().map(|f| f.kind), Some(FailureKind::Restarted));
    assert_eq!(view.cells[2].output_text, "4");
    assert_eq!(fx.backend.started(), 2);
    // auto cell ran in both sessions
    let auto_runs = fx.backend.executed_code().iter().filter(|c| *c == "x = 1").count();
    assert_eq!(auto_runs, 2);
}

/// Tenet: restarting a worksheet that holds the only slot cannot starve its
/// own queue, even while the new session is still starting.
#[tokio::test]
async fn restart_at_capacity_one_keeps_the_queue_running() {
    let fx = Fixture::with_config(test_config().with_pool_capacity(1));
    fx.backend.on("spin", Reply::Hang);
    let (ws, _) = fx.worksheet("alice", &["spin", "2+2"]).await;

    fx.notebook.evaluate_all("alice", &ws).await.unwrap();
    started_running(&fx, 1).await;

    fx.backend.slow_starts(Duration::from_millis(50));
    fx.notebook.restart(&ws).await.unwrap();
    let view = fx.settle(&ws).await;

    assert_eq!(view.cells[0].failure.as_ref().map(|f| f.kind), Some(FailureKind::Restarted));
    assert_eq!(view.cells[1].output_text, "4");
    assert_eq!(fx.backend.started(), 2);

    fx.notebook.quit(&ws).await.unwrap();
    assert_eq!(fx.backend.shutdowns(), fx.backend.started());
    assert_eq!(fx.notebook.pool_stats().await.active_count, 0);
}

#[tokio::test]
async fn restart_during_dispatch_leaks_no_session() {
    let fx = Fixture::new();
    fx.backend.on("spin", Reply::Hang);
    let (ws, _) = fx.worksheet("alice", &["spin", "2+2"]).await;

    fx.notebook.evaluate_all("alice", &ws).await.unwrap();
    started_running(&fx, 1).await;

    fx.backend.slow_starts(Duration::from_millis(50));
    fx.notebook.restart(&ws).await.unwrap();
    let view = fx.settle(&ws).await;

    assert_eq!(view.cells[1].output_text, "4");
    assert_eq!(fx.backend.started(), 2);
    assert_eq!(fx.notebook.pool_stats().await.active_count, 1);

    fx.notebook.quit(&ws).await.unwrap();
    assert_eq!(fx.backend.shutdowns(), fx.backend.started());
}

#[tokio::test]
async fn restart_of_an_idle_worksheet_succeeds() {
    let fx = Fixture::new();
    let (ws, _) = fx.worksheet("alice", &["1"]).await;
    fx.notebook.restart(&ws).await.unwrap();
    assert!(fx.notebook.check_invariants(&ws).await.unwrap().is_ok());
}

#[tokio::test]
async fn quit_stops_everything_and_frees_the_slot() {
    let fx = Fixture::new();
    fx.backend.on("spin", Reply::Stubborn);
    let (ws, _) = fx.worksheet("alice", &["spin", "1", "2"]).await;

    fx.notebook.evaluate_all("alice", &ws).await.unwrap();
    started_running(&fx, 1).await;

    fx.notebook.quit(&ws).await.unwrap();
    let view = fx.settle(&ws).await;

    let states: Vec<CellState> = view.cells.iter().map(|c| c.state).collect();
    assert_eq!(states, vec![CellState::Interrupted, CellState::Idle, CellState::Idle]);
    assert!(!fx.notebook.has_session(&ws));
    assert_eq!(fx.notebook.pool_stats().await.active_count, 0);
    assert_eq!(fx.backend.executed_code(), vec!["spin"]);
}

#[tokio::test]
async fn published_copies_cannot_be_restarted() {
    let fx = Fixture::new();
    let (ws, _) = fx.worksheet("alice", &["1"]).await;
    let published = fx.notebook.publish("alice", &ws).await.unwrap();

    let err = fx.notebook.restart(&published).await.unwrap_err();
    assert!(matches!(err, nbe_core::EngineError::ReadOnly(_)));
}
