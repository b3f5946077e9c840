//! Core library for the lab_orchestrator application.
//!
//! This library moves physical plates through multi-step laboratory workflows.
//! It is organised leaves first:
//!
//! - [`routing`]: shortest-path router over device places and the robot path planner.
//! - [`state_machine`]: transition tables, the workflow engine and error recovery.
//! - [`executor`]: one sequential executor per physical device.
//! - [`plate`]: plate locations, active plates, factories and worklists.
//! - [`devices`]: device contracts, the executor-backed station and simulated hardware.
//! - [`scheduler`]: the worklist loop and the robot scheduler.
//!
//! Hardware drivers, protocol parsers and operator UIs are collaborators that
//! plug in through the traits in [`devices`] and [`state_machine::recovery`].

pub mod config;
pub mod devices;
pub mod error;
pub mod executor;
pub mod plate;
pub mod routing;
pub mod scheduler;
pub mod state_machine;

pub use error::{AppResult, OrchestratorError};
