//! Plate and robot scheduling.
//!
//! - [`PlateScheduler`] processes worklists: it releases active plates under the per-role
//!   ceilings, offers each free plate its next task and reserves a location for it.
//! - [`RobotScheduler`] carries plates between locations along routes planned by
//!   [`crate::routing::PathPlanner`].

use thiserror::Error;

use crate::routing::RouteError;
use crate::state_machine::{TableError, WorkflowError};

pub mod plate_scheduler;
pub mod robot_scheduler;

pub use plate_scheduler::{PlateScheduler, WorklistReport};
pub use robot_scheduler::RobotScheduler;

/// Scheduling failures.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// A task names a device type nobody registered.
    #[error("no device of type {0} is registered")]
    NoDeviceOfType(String),

    /// The scheduler stopped before the worklist finished.
    #[error("scheduler stopped while processing worklist {0}")]
    Stopped(String),

    /// A plate has no location to move from or to.
    #[error("{0} has no current or destination location")]
    NoLocation(String),

    /// The locations are not connected by any robot.
    #[error("no route for {plate} from {from} to {to}")]
    NoRoute {
        /// Plate display name
        plate: String,
        /// Current location
        from: String,
        /// Destination location
        to: String,
    },

    /// A route names a robot that is not registered.
    #[error("route uses unknown robot {0}")]
    UnknownRobot(String),

    /// The world graph is malformed.
    #[error(transparent)]
    Route(#[from] RouteError),

    /// A workflow definition is inconsistent.
    #[error(transparent)]
    Table(#[from] TableError),

    /// A transfer workflow did not complete.
    #[error(transparent)]
    Transfer(#[from] WorkflowError),
}
