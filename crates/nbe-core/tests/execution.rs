//! Functional tests for queued cell execution.
//!
//! Core guarantees exercised here:
//! - Cells run one at a time per worksheet, in the order they were queued.
//! - Output is committed when a run completes and bumps the state number.
//! - A session that dies fails only the computing cell; the rest of the queue
//!   continues in a fresh session.
//! - The pool never holds more sessions than its capacity; a worksheet
//!   waiting for a slot proceeds once another worksheet quits.

use nbe_core::{
    CellState, EngineConfig, EngineError, FailureKind, PoolError, SessionStartConfig,
};
use nbe_test_utils::{eventually, outputs, test_config, Fixture, Reply};
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test]
async fn cells_produce_output_and_advance_state() {
    let fx = Fixture::new();
    let (ws, cells) = fx.worksheet("alice", &["1+1", "2+2"]).await;
    let baseline = fx.notebook.view(&ws).await.unwrap().state_number;

    for cell in &cells {
        fx.notebook.evaluate("alice", &ws, *cell, None).await.unwrap();
    }
    let view = fx.settle(&ws).await;

    assert_eq!(outputs(&view), vec!["2".to_string(), "4".to_string()]);
    assert!(view.cells.iter().all(|c| c.state == CellState::Done && c.evaluated));
    assert!(view.state_number >= baseline + 2);
    assert!(view.queue.is_empty());
    assert_eq!(view.computing, None);
}

/// Tenet: execution order is queue order, not document order.
#[tokio::test]
async fn queued_cells_run_in_fifo_order() {
    let fx = Fixture::new();
    let (ws, cells) = fx.worksheet("alice", &["1", "2", "3", "4", "5"]).await;

    for idx in [2, 0, 3] {
        fx.notebook.evaluate("alice", &ws, cells[idx], None).await.unwrap();
    }
    let view = fx.settle(&ws).await;

    assert_eq!(fx.backend.executed_code(), vec!["3", "1", "4"]);
    assert_eq!(view.cells[1].state, CellState::Idle);
    assert_eq!(view.cells[4].state, CellState::Idle);
}

#[tokio::test]
async fn evaluating_a_queued_cell_twice_runs_it_once() {
    let fx = Fixture::new();
    fx.backend.on("slow", Reply::Delayed(Duration::from_millis(50), "done".into()));
    let (ws, cells) = fx.worksheet("alice", &["slow", "1+1"]).await;

    fx.notebook.evaluate("alice", &ws, cells[0], None).await.unwrap();
    fx.notebook.evaluate("alice", &ws, cells[1], None).await.unwrap();
    fx.notebook.evaluate("alice", &ws, cells[1], None).await.unwrap();
    fx.settle(&ws).await;

    assert_eq!(fx.backend.executed_code(), vec!["slow", "1+1"]);
}

#[tokio::test]
async fn evaluate_can_replace_the_input() {
    let fx = Fixture::new();
    let (ws, cells) = fx.worksheet("alice", &["1+1"]).await;

    fx.notebook.evaluate("alice", &ws, cells[0], Some("3+4")).await.unwrap();
    let view = fx.settle(&ws).await;

    assert_eq!(view.cells[0].input, "3+4");
    assert_eq!(view.cells[0].output_text, "7");
}

#[tokio::test]
async fn evaluate_all_runs_in_document_order() {
    let fx = Fixture::new();
    let (ws, _) = fx.worksheet("alice", &["10", "20", "30"]).await;

    let queued = fx.notebook.evaluate_all("alice", &ws).await.unwrap();
    fx.settle(&ws).await;

    assert_eq!(queued, 3);
    assert_eq!(fx.backend.executed_code(), vec!["10", "20", "30"]);
}

/// Tenet: a crash fails exactly the computing cell.
///
/// Queued cells behind it must still run, in a newly started session, and
/// the partial output of the crashed run stays visible.
#[tokio::test]
async fn crash_fails_only_the_computing_cell() {
    let fx = Fixture::new();
    fx.backend.on("boom", Reply::Crash(vec!["partial".into()]));
    let (ws, _) = fx.worksheet("alice", &["boom", "1+1", "2+2"]).await;

    fx.notebook.evaluate_all("alice", &ws).await.unwrap();
    let view = fx.settle(&ws).await;

    let crashed = &view.cells[0];
    assert_eq!(crashed.state, CellState::Errored);
    assert_eq!(crashed.failure.as_ref().map(|f| f.kind), Some(FailureKind::Crashed));
    assert!(crashed.output_text.starts_with("partial"));
    assert_eq!(view.cells[1].output_text, "2");
    assert_eq!(view.cells[2].output_text, "4");
    assert_eq!(fx.backend.started(), 2);
    assert!(fx.backend.shutdowns() >= 1);
}

#[tokio::test]
async fn closed_event_stream_counts_as_crash() {
    let fx = Fixture::new();
    fx.backend.on("gone", Reply::Vanish);
    let (ws, cells) = fx.worksheet("alice", &["gone"]).await;

    fx.notebook.evaluate("alice", &ws, cells[0], None).await.unwrap();
    let view = fx.settle(&ws).await;

    assert_eq!(view.cells[0].failure.as_ref().map(|f| f.kind), Some(FailureKind::Crashed));
    assert!(!fx.notebook.has_session(&ws));
}

#[tokio::test]
async fn backend_error_keeps_the_session() {
    let fx = Fixture::new();
    fx.backend.on("1/0", Reply::Error("ZeroDivisionError".into()));
    let (ws, _) = fx.worksheet("alice", &["1/0", "5+5"]).await;

    fx.notebook.evaluate_all("alice", &ws).await.unwrap();
    let view = fx.settle(&ws).await;

    assert_eq!(view.cells[0].state, CellState::Errored);
    assert_eq!(view.cells[0].failure.as_ref().map(|f| f.kind), Some(FailureKind::Backend));
    assert!(view.cells[0].output_text.contains("ZeroDivisionError"));
    assert_eq!(view.cells[1].output_text, "10");
    assert_eq!(fx.backend.started(), 1);
}

#[tokio::test]
async fn malformed_directive_is_recorded_as_output() {
    let fx = Fixture::new();
    let (ws, _) = fx.worksheet("alice", &["%\n1+1", "2+2"]).await;

    fx.notebook.evaluate_all("alice", &ws).await.unwrap();
    let view = fx.settle(&ws).await;

    assert_eq!(view.cells[0].failure.as_ref().map(|f| f.kind), Some(FailureKind::Parse));
    assert!(view.cells[0].output_text.contains("empty directive"));
    assert_eq!(view.cells[1].output_text, "4");
    assert_eq!(fx.backend.executed_code(), vec!["2+2"]);
}

#[tokio::test]
async fn system_directive_overrides_worksheet_system() {
    let fx = Fixture::new();
    let (ws, cells) = fx.worksheet("alice", &["%python\n%time\n1+1"]).await;

    fx.notebook.evaluate("alice", &ws, cells[0], None).await.unwrap();
    fx.settle(&ws).await;

    let executed = fx.backend.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].request.system, "python");
    assert_eq!(executed[0].request.code, "1+1");
    assert!(executed[0].request.timed);
}

/// Tenet: `%auto` cells run first whenever a fresh session starts.
#[tokio::test]
async fn auto_cells_run_when_a_session_starts() {
    let fx = Fixture::new();
    let (ws, cells) = fx.worksheet("alice", &["%auto\nx = 1", "2+2"]).await;

    fx.notebook.evaluate("alice", &ws, cells[1], None).await.unwrap();
    let view = fx.settle(&ws).await;

    assert_eq!(fx.backend.executed_code(), vec!["x = 1", "2+2"]);
    assert_eq!(view.cells[0].state, CellState::Done);

    // same session: auto cells do not run again
    fx.notebook.evaluate("alice", &ws, cells[1], None).await.unwrap();
    fx.settle(&ws).await;
    assert_eq!(fx.backend.executed_code(), vec!["x = 1", "2+2", "2+2"]);
}

#[tokio::test]
async fn starting_a_session_ahead_runs_auto_cells() {
    let fx = Fixture::new();
    let (ws, _) = fx.worksheet("alice", &["%auto\nx = 1", "2+2"]).await;

    assert!(fx.notebook.start_session("alice", &ws).await.unwrap());
    let view = fx.settle(&ws).await;
    assert_eq!(fx.backend.executed_code(), vec!["x = 1"]);
    assert_eq!(view.cells[1].state, CellState::Idle);

    assert!(!fx.notebook.start_session("alice", &ws).await.unwrap());
    assert_eq!(fx.backend.started(), 1);

    let err = fx.notebook.start_session("bob", &ws).await.unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied { .. }));
}

/// Tenet: a saturated pool surfaces as a retryable error, never a hang.
#[tokio::test]
async fn starting_a_session_on_a_full_pool_is_retryable() {
    let fx = Fixture::with_config(test_config().with_pool_capacity(1).with_acquire_timeout_ms(50));
    let (w1, _) = fx.worksheet("alice", &["1"]).await;
    let (w2, _) = fx.worksheet("bob", &["2"]).await;
    fx.notebook.start_session("alice", &w1).await.unwrap();

    let err = fx.notebook.start_session("bob", &w2).await.unwrap_err();
    assert!(matches!(err, EngineError::SessionUnavailable { capacity: 1 }));
    assert!(err.is_retryable());

    fx.notebook.quit(&w1).await.unwrap();
    assert!(fx.notebook.start_session("bob", &w2).await.unwrap());
}

#[tokio::test]
async fn unstartable_session_is_reported_to_the_caller() {
    let fx = Fixture::new();
    fx.backend.refuse_starts(true);
    let (ws, _) = fx.worksheet("alice", &["1"]).await;

    let err = fx.notebook.start_session("alice", &ws).await.unwrap_err();
    assert!(matches!(err, EngineError::Pool(PoolError::StartFailed { .. })));
    assert!(!fx.notebook.has_session(&ws));
}

#[tokio::test]
async fn clear_output_keeps_inputs_and_pending_cells() {
    let fx = Fixture::new();
    fx.backend.on("spin", Reply::Hang);
    let (ws, cells) = fx.worksheet("alice", &["1+1", "spin"]).await;
    fx.notebook.evaluate("alice", &ws, cells[0], None).await.unwrap();
    fx.settle(&ws).await;
    fx.notebook.evaluate("alice", &ws, cells[1], None).await.unwrap();
    eventually(|| fx.backend.executed_code().len() == 2).await;

    let before = fx.notebook.view(&ws).await.unwrap().state_number;
    fx.notebook.clear_output("alice", &ws).await.unwrap();
    let view = fx.notebook.view(&ws).await.unwrap();

    assert!(view.state_number > before);
    assert_eq!(view.cells[0].input, "1+1");
    assert_eq!(view.cells[0].output_text, "");
    assert_eq!(view.cells[0].state, CellState::Idle);
    assert_eq!(view.cells[1].state, CellState::Computing);

    let err = fx.notebook.clear_output("carol", &ws).await.unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied { .. }));
    fx.notebook.quit(&ws).await.unwrap();
}

#[tokio::test]
async fn restart_body_restarts_the_session() {
    let fx = Fixture::new();
    let (ws, cells) = fx.worksheet("alice", &["%auto\nx = 1", "restart"]).await;

    fx.notebook.evaluate("alice", &ws, cells[1], None).await.unwrap();
    let view = fx.settle(&ws).await;

    assert_eq!(view.cells[1].output_text, "Exited sage process");
    assert_eq!(view.cells[1].state, CellState::Done);
    assert_eq!(fx.backend.started(), 2);
    // once for the first session, once after the restart
    assert_eq!(fx.backend.executed_code(), vec!["x = 1", "x = 1"]);
}

/// Tenet: the pool never exceeds its capacity.
///
/// With a single slot, a second worksheet waits until the first one quits.
#[tokio::test]
async fn capacity_one_blocks_until_quit() {
    let fx = Fixture::with_config(test_config().with_pool_capacity(1));
    let (w1, c1) = fx.worksheet("alice", &["1+1"]).await;
    let (w2, c2) = fx.worksheet("bob", &["2+2"]).await;

    fx.notebook.evaluate("alice", &w1, c1[0], None).await.unwrap();
    fx.settle(&w1).await;
    fx.notebook.evaluate("bob", &w2, c2[0], None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let waiting = fx.notebook.view(&w2).await.unwrap();
    assert_eq!(waiting.cells[0].state, CellState::Queued);
    assert_eq!(waiting.computing, None);
    assert_eq!(fx.notebook.pool_stats().await.active_count, 1);

    fx.notebook.quit(&w1).await.unwrap();
    let view = fx.settle(&w2).await;

    assert_eq!(view.cells[0].output_text, "4");
    assert!(!fx.notebook.has_session(&w1));
    assert!(fx.notebook.has_session(&w2));
    assert_eq!(fx.notebook.pool_stats().await.active_count, 1);
}

#[tokio::test]
async fn transient_start_failures_are_retried() {
    let config = test_config().with_session_start(SessionStartConfig {
        max_attempts: 3,
        base_delay_ms: 5,
    });
    let fx = Fixture::with_config(config);
    fx.backend.fail_next_starts(2);
    let (ws, cells) = fx.worksheet("alice", &["1+1"]).await;

    fx.notebook.evaluate("alice", &ws, cells[0], None).await.unwrap();
    let view = fx.settle(&ws).await;

    assert_eq!(view.cells[0].output_text, "2");
    assert_eq!(fx.backend.start_attempts(), 3);
}

#[tokio::test]
async fn refused_start_fails_the_cell_then_recovers() {
    let fx = Fixture::new();
    fx.backend.refuse_starts(true);
    let (ws, cells) = fx.worksheet("alice", &["1+1"]).await;

    fx.notebook.evaluate("alice", &ws, cells[0], None).await.unwrap();
    let view = fx.settle(&ws).await;
    assert_eq!(view.cells[0].failure.as_ref().map(|f| f.kind), Some(FailureKind::Backend));

    fx.backend.refuse_starts(false);
    fx.notebook.evaluate("alice", &ws, cells[0], None).await.unwrap();
    let view = fx.settle(&ws).await;
    assert_eq!(view.cells[0].state, CellState::Done);
    assert_eq!(view.cells[0].failure, None);
}

#[tokio::test]
async fn cell_timeout_tears_the_session_down() {
    let fx = Fixture::with_config(test_config().with_cell_timeout(1));
    fx.backend.on("loop", Reply::Hang);
    let (ws, _) = fx.worksheet("alice", &["loop", "1+1"]).await;

    fx.notebook.evaluate_all("alice", &ws).await.unwrap();
    let view = fx.settle(&ws).await;

    assert_eq!(view.cells[0].failure.as_ref().map(|f| f.kind), Some(FailureKind::TimedOut));
    assert_eq!(view.cells[1].output_text, "2");
    assert_eq!(fx.backend.started(), 2);
}

#[tokio::test]
async fn deleting_the_computing_cell_abandons_it() {
    let fx = Fixture::new();
    fx.backend.on("loop", Reply::Stubborn);
    let (ws, cells) = fx.worksheet("alice", &["loop", "1+1"]).await;

    fx.notebook.evaluate_all("alice", &ws).await.unwrap();
    let backend = &fx.backend;
    eventually(|| backend.executed_code().len() == 1).await;

    fx.notebook.delete_cell("alice", &ws, cells[0]).await.unwrap();
    let view = fx.settle(&ws).await;

    assert_eq!(view.cells.len(), 1);
    assert_eq!(view.cells[0].output_text, "2");
    assert!(fx.notebook.check_invariants(&ws).await.unwrap().is_ok());
}

#[tokio::test]
async fn unknown_cells_and_worksheets_are_not_found() {
    let fx = Fixture::new();
    let (ws, _) = fx.worksheet("alice", &["1"]).await;

    let err = fx
        .notebook
        .evaluate("alice", &ws, nbe_core::CellId(99), None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let missing = nbe_core::WorksheetId::new("alice", 42);
    assert!(fx.notebook.view(&missing).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let config = EngineConfig::new().with_pool_capacity(0);
    let result = nbe_core::Notebook::new(
        config,
        nbe_test_utils::ScriptedBackend::new(),
        std::sync::Arc::new(nbe_core::MemoryStore::new()),
        std::sync::Arc::new(nbe_test_utils::test_users()),
    );
    assert!(matches!(result, Err(EngineError::Config(_))));
}
