//! Robot scheduler: carries plates between locations.
//!
//! Jobs are processed one at a time, in the order they were added. For each job the scheduler
//! plans a route from the plate's current location to its destination and runs one transfer
//! workflow per hop on the executor of the robot making that hop. Once every hop succeeded the
//! old location is vacated and the destination marked occupied, which releases the device
//! worker waiting for the plate.
//!
//! A job that cannot be routed, or whose transfer fails, leaves the plate where it is for an
//! operator to recover.

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::SchedulerError;
use crate::devices::DeviceManager;
use crate::plate::ActivePlate;
use crate::routing::{PathPlanner, RouteError};
use crate::state_machine::workflows::transfer_workflow;
use crate::state_machine::{ErrorReporter, WorkflowError};

type JobQueue = mpsc::UnboundedReceiver<Arc<ActivePlate>>;

/// Sequential multi-hop plate mover.
pub struct RobotScheduler {
    devices: Arc<DeviceManager>,
    reporter: Arc<dyn ErrorReporter>,
    jobs: mpsc::UnboundedSender<Arc<ActivePlate>>,
    queue: Mutex<Option<JobQueue>>,
    pending: Arc<Mutex<Vec<Arc<ActivePlate>>>>,
    consumer: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl RobotScheduler {
    /// Create a scheduler for the robots in `devices`.
    ///
    /// Transfer failures are resolved by `reporter`.
    pub fn new(devices: Arc<DeviceManager>, reporter: Arc<dyn ErrorReporter>) -> Self {
        let (jobs, queue) = mpsc::unbounded_channel();
        Self {
            devices,
            reporter,
            jobs,
            queue: Mutex::new(Some(queue)),
            pending: Arc::new(Mutex::new(Vec::new())),
            consumer: Mutex::new(None),
        }
    }

    /// Build the world graph and start processing jobs.
    ///
    /// Jobs added before `start` are kept and processed once it runs. Calling `start` twice
    /// logs a warning and does nothing.
    ///
    /// # Errors
    ///
    /// Returns a [`RouteError`] when a robot reports an invalid transfer weight.
    pub fn start(&self) -> Result<(), RouteError> {
        let Some(queue) = self.queue.lock().take() else {
            warn!("RobotScheduler already started");
            return Ok(());
        };
        let planner = match PathPlanner::build_world(&self.devices) {
            Ok(planner) => planner,
            Err(e) => {
                *self.queue.lock() = Some(queue);
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_jobs(
            queue,
            planner,
            self.devices.clone(),
            self.reporter.clone(),
            self.pending.clone(),
            cancel.clone(),
        ));
        *self.consumer.lock() = Some((handle, cancel));
        info!(robots = self.devices.robots().len(), "RobotScheduler started");
        Ok(())
    }

    /// Stop processing jobs. A move in progress is abandoned.
    pub async fn stop(&self) {
        let consumer = self.consumer.lock().take();
        if let Some((handle, cancel)) = consumer {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "RobotScheduler task failed");
            }
            info!("RobotScheduler stopped");
        }
    }

    /// Queue a move of `plate` from its current to its destination location.
    pub fn add_job(&self, plate: Arc<ActivePlate>) {
        debug!(plate = %plate, "Queued robot job");
        self.pending.lock().push(plate.clone());
        if self.jobs.send(plate.clone()).is_err() {
            error!(plate = %plate, "RobotScheduler is stopped, plate stuck");
            self.pending.lock().retain(|p| !Arc::ptr_eq(p, &plate));
        }
    }

    /// Number of plates waiting for or in a move.
    pub fn pending_jobs(&self) -> usize {
        self.pending.lock().len()
    }

    /// Status of the plates waiting for a move.
    pub fn status(&self) -> String {
        let pending = self.pending.lock();
        if pending.is_empty() {
            return "RobotScheduler has no pending jobs".to_string();
        }
        let mut status = format!("RobotScheduler has {} pending jobs\n", pending.len());
        for plate in pending.iter() {
            let _ = write!(status, "{plate}: {}", plate.status_report());
        }
        status
    }
}

async fn run_jobs(
    mut queue: JobQueue,
    planner: PathPlanner,
    devices: Arc<DeviceManager>,
    reporter: Arc<dyn ErrorReporter>,
    pending: Arc<Mutex<Vec<Arc<ActivePlate>>>>,
    cancel: CancellationToken,
) {
    loop {
        let plate = tokio::select! {
            _ = cancel.cancelled() => break,
            job = queue.recv() => match job {
                Some(plate) => plate,
                None => break,
            },
        };

        let moved = tokio::select! {
            _ = cancel.cancelled() => break,
            moved = move_plate(&planner, &devices, &reporter, &plate) => moved,
        };
        if let Err(e) = moved {
            error!(plate = %plate, error = %e, "Move failed, plate stuck");
        }
        pending.lock().retain(|p| !Arc::ptr_eq(p, &plate));
    }
    debug!("RobotScheduler job loop exited");
}

async fn move_plate(
    planner: &PathPlanner,
    devices: &DeviceManager,
    reporter: &Arc<dyn ErrorReporter>,
    plate: &ActivePlate,
) -> Result<(), SchedulerError> {
    let (Some(from), Some(to)) = (plate.current_location(), plate.destination_location()) else {
        return Err(SchedulerError::NoLocation(plate.to_string()));
    };
    let hops = planner
        .plan_path(&from, &to)?
        .ok_or_else(|| SchedulerError::NoRoute {
            plate: plate.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })?;
    info!(plate = %plate, from = %from, to = %to, hops = hops.len(), "Moving plate");

    for hop in hops {
        let handle = devices
            .robot(&hop.robot)
            .ok_or_else(|| SchedulerError::UnknownRobot(hop.robot.clone()))?;
        debug!(plate = %plate, hop = %hop, "Queueing transfer");
        let workflow = transfer_workflow(handle.robot.clone(), hop.from.clone(), hop.to.clone(), reporter.clone())?;
        handle
            .executor
            .submit(workflow)
            .await
            .map_err(|_| WorkflowError::Flushed {
                machine: hop.to_string(),
            })??;
    }

    from.mark_vacated();
    to.mark_occupied(Some(plate.serial_number()));
    info!(plate = %plate, location = %to, "Plate delivered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{PlateSchedulerDevice, SimDevice, SimRobot, Station};
    use crate::plate::{Commit, Plate, PlateLocation, PlateRole, PlateTask};
    use crate::state_machine::RetryPolicy;
    use std::time::Duration;

    fn station(name: &str) -> Arc<dyn PlateSchedulerDevice> {
        Arc::new(Station::new(
            Arc::new(SimDevice::new(name, name)),
            vec![PlateLocation::new(name, "Nest")],
        ))
    }

    fn lab(robot: SimRobot) -> (Arc<DeviceManager>, Arc<SimRobot>) {
        let robot = Arc::new(robot);
        let mut devices = DeviceManager::new();
        devices.add_device(station("Stacker"));
        devices.add_device(station("Sealer"));
        devices.add_robot(robot.clone());
        devices.start();
        (Arc::new(devices), robot)
    }

    fn nest(devices: &DeviceManager, name: &str) -> Arc<PlateLocation> {
        devices.device(name).expect("device").plate_locations()[0].clone()
    }

    /// A plate sitting at `from` and committed to `to`.
    fn plate_moving(from: &Arc<PlateLocation>, to: &Arc<PlateLocation>) -> Arc<ActivePlate> {
        let plate = Arc::new(ActivePlate::new(
            7,
            PlateRole::Destination,
            0,
            Plate::new("D0", "384 well"),
            vec![
                PlateTask::new("Stacker", "Downstack"),
                PlateTask::new("Sealer", "Seal"),
            ],
        ));
        assert!(from.reserve(7));
        assert_eq!(plate.commit(from.clone()), Commit::Sourced);
        from.mark_occupied(Some(7));
        plate.mark_job_completed();

        assert!(to.reserve(7));
        assert_eq!(plate.commit(to.clone()), Commit::Move);
        plate
    }

    #[tokio::test]
    async fn test_move_vacates_source_and_occupies_destination() {
        let (devices, robot) = lab(SimRobot::new("Arm", Duration::ZERO));
        let scheduler = RobotScheduler::new(devices.clone(), Arc::new(RetryPolicy::never()));
        scheduler.start().expect("start");

        let (from, to) = (nest(&devices, "Stacker"), nest(&devices, "Sealer"));
        let plate = plate_moving(&from, &to);
        scheduler.add_job(plate.clone());

        tokio::time::timeout(Duration::from_secs(2), plate.wait_for_plate())
            .await
            .expect("delivered in time");
        assert!(from.is_available());
        assert_eq!(to.holder(), Some(7));
        assert_eq!(robot.moves().len(), 1);

        scheduler.stop().await;
        devices.shutdown().await;
    }

    #[tokio::test]
    async fn test_unroutable_plate_stays_put() {
        let (devices, robot) = lab(SimRobot::new("Arm", Duration::ZERO).reaching(["Stacker"]));
        let scheduler = RobotScheduler::new(devices.clone(), Arc::new(RetryPolicy::never()));
        scheduler.start().expect("start");

        let (from, to) = (nest(&devices, "Stacker"), nest(&devices, "Sealer"));
        let plate = plate_moving(&from, &to);
        scheduler.add_job(plate.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.pending_jobs(), 0);
        assert!(from.is_occupied());
        assert!(to.is_reserved());
        assert!(plate.is_busy());
        assert!(robot.moves().is_empty());

        scheduler.stop().await;
        devices.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_pick_leaves_plate_stuck() {
        let (devices, robot) = lab(SimRobot::new("Arm", Duration::ZERO));
        robot.inject_pick_faults(1);
        let scheduler = RobotScheduler::new(devices.clone(), Arc::new(RetryPolicy::never()));
        scheduler.start().expect("start");

        let (from, to) = (nest(&devices, "Stacker"), nest(&devices, "Sealer"));
        let plate = plate_moving(&from, &to);
        scheduler.add_job(plate.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(from.is_occupied());
        assert!(!to.is_occupied());

        scheduler.stop().await;
        devices.shutdown().await;
    }

    #[tokio::test]
    async fn test_jobs_added_before_start_are_kept() {
        let (devices, _robot) = lab(SimRobot::new("Arm", Duration::ZERO));
        let scheduler = RobotScheduler::new(devices.clone(), Arc::new(RetryPolicy::never()));
        assert_eq!(scheduler.status(), "RobotScheduler has no pending jobs");

        let (from, to) = (nest(&devices, "Stacker"), nest(&devices, "Sealer"));
        let plate = plate_moving(&from, &to);
        scheduler.add_job(plate.clone());
        assert_eq!(scheduler.pending_jobs(), 1);
        assert!(scheduler.status().contains("ActiveDestinationPlate0"));

        scheduler.start().expect("start");
        tokio::time::timeout(Duration::from_secs(2), plate.wait_for_plate())
            .await
            .expect("delivered in time");

        scheduler.stop().await;
        devices.shutdown().await;
    }
}
