//! Plates in motion: locations, tasks, active plates and the worklists that feed them.

pub mod active;
pub mod factory;
pub mod location;
pub mod registry;
pub mod task;
pub mod worklist;

pub use active::{ActivePlate, Commit};
pub use factory::ActivePlateFactory;
pub use location::{LocationState, LocationStatus, PlateId, PlateLocation};
pub use registry::PlateRegistry;
pub use task::{Parameter, PlateTask};
pub use worklist::{Plate, PlateRole, TaskLists, Transfer, Worklist};
