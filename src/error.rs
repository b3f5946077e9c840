//! Custom error types for the application.
//!
//! Each layer owns a focused error enum next to the code that raises it:
//!
//! - **`RouteError`** ([`crate::routing`]): malformed graphs. Negative or NaN edge costs and
//!   node ids that do not belong to the graph. An unreachable destination is *not* an error;
//!   the router returns an empty path for it.
//! - **`TableError`** ([`crate::state_machine`]): a workflow transition table that cannot be
//!   built (duplicate transitions, dead-end states, error states without Retry/Abort).
//! - **`WorkflowError`** ([`crate::state_machine`]): the typed outcome of a failed workflow
//!   run. Aborts carry the last recorded device error.
//! - **`SchedulerError`** ([`crate::scheduler`]): worklist processing failures such as a task
//!   naming a device type that is not registered.
//! - **`ConfigError`** ([`crate::config`]): figment load and validation problems.
//!
//! `OrchestratorError` consolidates them with `#[from]` so application code can use `?`
//! across layers. Device drivers and workflow entry actions use `anyhow::Result` instead;
//! the engine folds those failures into its Fail trigger.

use thiserror::Error;

use crate::config::ConfigError;
use crate::routing::RouteError;
use crate::scheduler::SchedulerError;
use crate::state_machine::{TableError, WorkflowError};

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, OrchestratorError>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The routing graph was malformed.
    #[error("Routing error: {0}")]
    Route(#[from] RouteError),

    /// A workflow transition table could not be built.
    #[error("Workflow table error: {0}")]
    Table(#[from] TableError),

    /// A workflow run did not reach its end state.
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Worklist processing failed.
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// A device collaborator reported a failure outside of a workflow.
    #[error("Device error: {0}")]
    Device(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
