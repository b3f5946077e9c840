//! Device contracts consumed by the orchestration core.
//!
//! Drivers live outside this crate. The core sees them through three traits:
//!
//! - [`DeviceInterface`]: connect, home and run named commands.
//! - [`RobotInterface`]: a device that moves plates between [`PlacePoint`]s.
//! - [`PlateSchedulerDevice`]: a device that owns plate locations and accepts jobs from the
//!   plate scheduler.
//!
//! All traits take `&self`; implementations keep their state behind interior mutability so they
//! can be shared as `Arc<dyn ...>` between the schedulers and executor tasks.
//!
//! [`DeviceManager`] is the registry the schedulers look devices up in.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::executor::{ExecutorInfo, StateMachineExecutor};
use crate::plate::{ActivePlate, Parameter, PlateLocation};
use crate::state_machine::workflows::home_workflow;
use crate::state_machine::{ErrorReporter, RetryPolicy};

pub mod sim;
pub mod station;

pub use sim::{SimDevice, SimRobot};
pub use station::Station;

/// A robot teachpoint: one way of reaching a location on a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlacePoint {
    /// Device name
    pub device: String,
    /// Location name on the device
    pub location: String,
    /// Place (teachpoint) name within the location
    pub place: String,
}

impl PlacePoint {
    /// Create a place point.
    pub fn new(device: impl Into<String>, location: impl Into<String>, place: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            location: location.into(),
            place: place.into(),
        }
    }
}

impl fmt::Display for PlacePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.device, self.location, self.place)
    }
}

// =============================================================================
// Driver Contracts
// =============================================================================

/// Abstract driver contract.
///
/// Every method may fail; workflow steps turn errors into the Fail trigger.
#[async_trait]
pub trait DeviceInterface: Send + Sync {
    /// Unique device name
    fn name(&self) -> &str;

    /// Product type, matched against [`crate::plate::PlateTask::device_type`]
    fn product_name(&self) -> &str;

    /// Establish the hardware connection
    async fn connect(&self) -> Result<()>;

    /// True once connected
    fn is_connected(&self) -> bool;

    /// Move to the reference position
    async fn home(&self) -> Result<()>;

    /// True once homed
    fn is_homed(&self) -> bool;

    /// Run a named command.
    ///
    /// `Ok(false)` means the device ran the command and reported failure.
    async fn execute_command(&self, command: &str, parameters: &[Parameter]) -> Result<bool>;

    /// Stop whatever the device is doing
    async fn abort(&self) -> Result<()> {
        Ok(())
    }
}

/// A plate-handling robot.
#[async_trait]
pub trait RobotInterface: DeviceInterface {
    /// Cost of carrying a plate from `from` to `to`.
    ///
    /// Zero or infinite weights mean the robot cannot make the move.
    fn transfer_weight(&self, from: &PlacePoint, to: &PlacePoint) -> f64;

    /// Pick the plate at `from`
    async fn pick(&self, from: &PlacePoint) -> Result<()>;

    /// Place the held plate at `to`
    async fn place(&self, to: &PlacePoint) -> Result<()>;

    /// Pick at `from` and place at `to`
    async fn transfer_plate(&self, from: &PlacePoint, to: &PlacePoint) -> Result<()> {
        self.pick(from).await?;
        self.place(to).await
    }
}

/// A device the plate scheduler can send plates to.
#[async_trait]
pub trait PlateSchedulerDevice: Send + Sync {
    /// Unique device name
    fn name(&self) -> &str;

    /// Product type, matched against [`crate::plate::PlateTask::device_type`]
    fn product_name(&self) -> &str;

    /// All locations owned by the device
    fn plate_locations(&self) -> Vec<Arc<PlateLocation>>;

    /// Whether robots can reach the device's locations
    fn is_accessible(&self) -> bool {
        true
    }

    /// Spawn background workers and queue homing. Called once from within the runtime.
    fn start(&self) {}

    /// A location that could take `plate` for its current task, if any
    fn get_available_location(&self, plate: &ActivePlate) -> Option<Arc<PlateLocation>>;

    /// Reserve `location` for `plate`; `false` means pick another location
    fn reserve_location(&self, location: &Arc<PlateLocation>, plate: &ActivePlate) -> bool;

    /// Run the plate's current task once the plate has arrived
    fn add_job(&self, plate: Arc<ActivePlate>);

    /// Executor status of the device
    fn executor_info(&self) -> ExecutorInfo;

    /// Stop background workers
    async fn shutdown(&self);
}

// =============================================================================
// DeviceManager - registry of devices and robots
// =============================================================================

/// A robot together with the executor that serialises its moves.
#[derive(Clone)]
pub struct RobotHandle {
    /// The robot driver
    pub robot: Arc<dyn RobotInterface>,
    /// Runs the robot's transfer workflows one at a time
    pub executor: Arc<StateMachineExecutor>,
}

impl fmt::Debug for RobotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RobotHandle")
            .field("robot", &self.robot.name())
            .finish_non_exhaustive()
    }
}

/// Registered devices and robots, in registration order.
#[derive(Default)]
pub struct DeviceManager {
    devices: Vec<Arc<dyn PlateSchedulerDevice>>,
    robots: Vec<RobotHandle>,
    executor_config: ExecutorConfig,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl DeviceManager {
    /// Empty registry; robot executors use the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry whose robot executors use `config`.
    pub fn with_executor_config(config: ExecutorConfig) -> Self {
        Self {
            executor_config: config,
            ..Self::default()
        }
    }

    /// Resolve robot homing failures with `reporter`; homing aborts on the first failure
    /// otherwise.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Register a plate scheduler device.
    pub fn add_device(&mut self, device: Arc<dyn PlateSchedulerDevice>) {
        info!(device = %device.name(), product = %device.product_name(), "Registered device");
        if self.device(device.name()).is_some() {
            warn!(device = %device.name(), "Device name registered twice");
        }
        self.devices.push(device);
    }

    /// Register a robot and create its executor.
    pub fn add_robot(&mut self, robot: Arc<dyn RobotInterface>) {
        info!(robot = %robot.name(), "Registered robot");
        let executor = Arc::new(StateMachineExecutor::with_config(
            robot.name(),
            &self.executor_config,
        ));
        self.robots.push(RobotHandle { robot, executor });
    }

    /// All devices.
    pub fn devices(&self) -> &[Arc<dyn PlateSchedulerDevice>] {
        &self.devices
    }

    /// Devices whose product type is `product`, in registration order.
    pub fn devices_of_type(&self, product: &str) -> Vec<Arc<dyn PlateSchedulerDevice>> {
        self.devices
            .iter()
            .filter(|d| d.product_name() == product)
            .cloned()
            .collect()
    }

    /// Device by name.
    pub fn device(&self, name: &str) -> Option<Arc<dyn PlateSchedulerDevice>> {
        self.devices.iter().find(|d| d.name() == name).cloned()
    }

    /// Devices robots can reach.
    pub fn accessible_devices(&self) -> impl Iterator<Item = &Arc<dyn PlateSchedulerDevice>> {
        self.devices.iter().filter(|d| d.is_accessible())
    }

    /// All robots.
    pub fn robots(&self) -> &[RobotHandle] {
        &self.robots
    }

    /// Robot by name.
    pub fn robot(&self, name: &str) -> Option<&RobotHandle> {
        self.robots.iter().find(|r| r.robot.name() == name)
    }

    /// Start robot executors and device workers. Every robot is homed before its first move.
    pub fn start(&self) {
        let reporter = self
            .reporter
            .clone()
            .unwrap_or_else(|| Arc::new(RetryPolicy::never()));
        for robot in &self.robots {
            robot.executor.start();
            queue_homing(&robot.executor, robot.robot.clone(), reporter.clone());
        }
        for device in &self.devices {
            device.start();
        }
    }

    /// Stop robot executors and device workers.
    pub async fn shutdown(&self) {
        for device in &self.devices {
            device.shutdown().await;
        }
        for robot in &self.robots {
            robot.executor.stop().await;
        }
        info!("All devices shut down");
    }
}

/// Queue a homing workflow for `device` on `executor`; the outcome is logged.
pub(crate) fn queue_homing<D>(executor: &StateMachineExecutor, device: Arc<D>, reporter: Arc<dyn ErrorReporter>)
where
    D: DeviceInterface + ?Sized + 'static,
{
    let name = device.name().to_string();
    let workflow = match home_workflow(device, reporter) {
        Ok(workflow) => workflow,
        Err(e) => {
            error!(device = %name, error = %e, "Invalid homing workflow");
            return;
        }
    };
    let done = executor.submit(workflow);
    tokio::spawn(async move {
        match done.await {
            Ok(Ok(())) => debug!(device = %name, "Homed"),
            Ok(Err(e)) => warn!(device = %name, error = %e, "Homing failed"),
            Err(_) => debug!(device = %name, "Homing dropped"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lab() -> DeviceManager {
        let mut manager = DeviceManager::new();
        for (name, product) in [("Sealer1", "Sealer"), ("Stacker1", "Stacker"), ("Sealer2", "Sealer")] {
            let device = Arc::new(SimDevice::new(name, product));
            manager.add_device(Arc::new(Station::new(device, vec![PlateLocation::new(name, "Nest")])));
        }
        manager.add_robot(Arc::new(SimRobot::new("Arm", Duration::ZERO)));
        manager
    }

    #[test]
    fn test_devices_of_type_keeps_registration_order() {
        let manager = lab();
        let sealers: Vec<String> = manager
            .devices_of_type("Sealer")
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(sealers, vec!["Sealer1", "Sealer2"]);
        assert!(manager.devices_of_type("Centrifuge").is_empty());
    }

    #[test]
    fn test_lookup_by_name() {
        let manager = lab();
        assert_eq!(manager.device("Stacker1").map(|d| d.product_name().to_string()), Some("Stacker".into()));
        assert!(manager.device("Stacker9").is_none());
        assert!(manager.robot("Arm").is_some());
        assert_eq!(manager.robots().len(), 1);
    }

    #[tokio::test]
    async fn test_start_homes_robots_and_stations() {
        let manager = lab();
        let robot = Arc::new(SimRobot::new("Gripper", Duration::ZERO));
        let sealer = Arc::new(SimDevice::new("Sealer3", "Sealer"));
        let mut manager = manager.with_reporter(Arc::new(RetryPolicy::never()));
        manager.add_robot(robot.clone());
        manager.add_device(Arc::new(Station::new(sealer.clone(), vec![PlateLocation::new("Sealer3", "Nest")])));
        manager.start();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !(robot.is_homed() && sealer.is_homed()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("homed in time");
        assert!(sealer.is_connected());
        assert!(sealer.executed().is_empty());
        manager.shutdown().await;
    }

    #[test]
    fn test_place_point_display() {
        let point = PlacePoint::new("Sealer1", "Nest", "Approach");
        assert_eq!(point.to_string(), "Sealer1/Nest/Approach");
    }
}
