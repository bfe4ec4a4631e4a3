//! NBE Simulator
//!
//! Drives a [`nbe_core::Notebook`] with a seeded random workload against the
//! scripted backend and checks the engine's guarantees:
//! - Cells of one worksheet run in the order they were queued
//! - No more sessions are live than the pool allows
//! - A crashed session fails only its computing cell
//! - Published copies do not change when the source runs again
//!
//! Also hosts the logging setup shared by the `nbe` binary.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod inspect;
pub mod logging;
pub mod simulator;

pub use inspect::{inspect_store, StoreListing, WorksheetListing};
pub use logging::{init_logging, LogFormat};
pub use simulator::{run_simulator, SimulatorConfig, SimulatorReport, SimulatorStats, Violation};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
