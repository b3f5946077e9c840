//! Simulated Devices
//!
//! Stand-ins for real drivers, used by the demo binary and the tests.
//! All simulated devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Simulations
//!
//! - `SimDevice` - Generic instrument with configurable command time and failure injection
//! - `SimRobot` - Plate-handling robot with a single gripper

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info};

use super::{DeviceInterface, PlacePoint, RobotInterface};
use crate::plate::Parameter;

/// Consume one unit of an injected failure budget.
fn take_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// =============================================================================
// SimDevice - Simulated Instrument
// =============================================================================

/// Simulated instrument
///
/// Simulates a device with:
/// - a fixed command duration
/// - a random failure rate (the command reports `false`)
/// - a budget of injected faults (the command returns an error)
///
/// # Example
///
/// ```rust,ignore
/// let sealer = SimDevice::new("Sealer1", "Sealer").with_delay(Duration::from_millis(200));
/// sealer.connect().await?;
/// assert!(sealer.execute_command("Seal", &[]).await?);
/// ```
#[derive(Debug)]
pub struct SimDevice {
    name: String,
    product: String,
    delay: Duration,
    fail_rate: f64,
    faults: AtomicU32,
    connected: AtomicBool,
    homed: AtomicBool,
    executed: Mutex<Vec<String>>,
}

impl SimDevice {
    /// Create a simulated device that completes commands immediately.
    pub fn new(name: impl Into<String>, product: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            product: product.into(),
            delay: Duration::ZERO,
            fail_rate: 0.0,
            faults: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            homed: AtomicBool::new(false),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Set the time each command takes
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the probability (0.0-1.0) that a command reports failure
    #[must_use]
    pub fn with_fail_rate(mut self, fail_rate: f64) -> Self {
        self.fail_rate = fail_rate.clamp(0.0, 1.0);
        self
    }

    /// Make the next `count` commands fail with an error
    pub fn inject_faults(&self, count: u32) {
        self.faults.store(count, Ordering::SeqCst);
    }

    /// Commands that completed successfully, in order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl DeviceInterface for SimDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn product_name(&self) -> &str {
        &self.product
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        info!(device = %self.name, "SimDevice connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn home(&self) -> Result<()> {
        if !self.is_connected() {
            bail!("{} is not connected", self.name);
        }
        self.homed.store(true, Ordering::SeqCst);
        debug!(device = %self.name, "SimDevice homed");
        Ok(())
    }

    fn is_homed(&self) -> bool {
        self.homed.load(Ordering::SeqCst)
    }

    async fn execute_command(&self, command: &str, parameters: &[Parameter]) -> Result<bool> {
        if !self.is_connected() {
            bail!("{} is not connected", self.name);
        }
        debug!(device = %self.name, command, parameters = parameters.len(), "SimDevice executing");
        sleep(self.delay).await;

        if take_failure(&self.faults) {
            bail!("simulated fault in {command}");
        }
        if self.fail_rate > 0.0 && rand::thread_rng().gen_bool(self.fail_rate) {
            debug!(device = %self.name, command, "SimDevice reporting failure");
            return Ok(false);
        }
        self.executed.lock().push(command.to_string());
        Ok(true)
    }
}

// =============================================================================
// SimRobot - Simulated Plate Robot
// =============================================================================

/// Simulated single-gripper robot
///
/// Every move between reachable devices weighs 1.0. Picking with a full gripper or placing
/// with an empty one is an error, so a broken transfer sequence shows up in tests.
#[derive(Debug)]
pub struct SimRobot {
    name: String,
    delay: Duration,
    reachable: Option<HashSet<String>>,
    pick_faults: AtomicU32,
    connected: AtomicBool,
    homed: AtomicBool,
    gripper: Mutex<Option<PlacePoint>>,
    moves: Mutex<Vec<(PlacePoint, PlacePoint)>>,
}

impl SimRobot {
    /// Create a robot that reaches every device; `delay` is the time of each pick or place.
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            reachable: None,
            pick_faults: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            homed: AtomicBool::new(false),
            gripper: Mutex::new(None),
            moves: Mutex::new(Vec::new()),
        }
    }

    /// Restrict the robot to the named devices
    #[must_use]
    pub fn reaching<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reachable = Some(devices.into_iter().map(Into::into).collect());
        self
    }

    /// Make the next `count` picks fail
    pub fn inject_pick_faults(&self, count: u32) {
        self.pick_faults.store(count, Ordering::SeqCst);
    }

    /// Completed moves, in order
    pub fn moves(&self) -> Vec<(PlacePoint, PlacePoint)> {
        self.moves.lock().clone()
    }

    fn reaches(&self, device: &str) -> bool {
        self.reachable.as_ref().map_or(true, |r| r.contains(device))
    }
}

#[async_trait]
impl DeviceInterface for SimRobot {
    fn name(&self) -> &str {
        &self.name
    }

    fn product_name(&self) -> &str {
        "Robot"
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        info!(robot = %self.name, "SimRobot connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn home(&self) -> Result<()> {
        if self.gripper.lock().is_some() {
            bail!("{} cannot home while holding a plate", self.name);
        }
        self.homed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_homed(&self) -> bool {
        self.homed.load(Ordering::SeqCst)
    }

    async fn execute_command(&self, command: &str, _parameters: &[Parameter]) -> Result<bool> {
        debug!(robot = %self.name, command, "SimRobot ignoring command");
        Ok(true)
    }

    async fn abort(&self) -> Result<()> {
        self.homed.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl RobotInterface for SimRobot {
    fn transfer_weight(&self, from: &PlacePoint, to: &PlacePoint) -> f64 {
        if self.reaches(&from.device) && self.reaches(&to.device) {
            1.0
        } else {
            f64::INFINITY
        }
    }

    async fn pick(&self, from: &PlacePoint) -> Result<()> {
        if self.gripper.lock().is_some() {
            bail!("{} already holds a plate", self.name);
        }
        sleep(self.delay).await;
        if take_failure(&self.pick_faults) {
            bail!("no plate detected at {from}");
        }
        *self.gripper.lock() = Some(from.clone());
        debug!(robot = %self.name, %from, "Picked plate");
        Ok(())
    }

    async fn place(&self, to: &PlacePoint) -> Result<()> {
        let Some(from) = self.gripper.lock().take() else {
            bail!("{} has no plate to place", self.name);
        };
        sleep(self.delay).await;
        debug!(robot = %self.name, %to, "Placed plate");
        self.moves.lock().push((from, to.clone()));
        Ok(())
    }
}
