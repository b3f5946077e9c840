//! Plate scheduler: processes worklists.
//!
//! Worklists are queued and processed one at a time. While a worklist runs, a polling loop
//! repeatedly
//!
//! 1. retires finished plates,
//! 2. releases at most one new plate per role, subject to the configured ceilings,
//! 3. offers every free plate its next task: the first device of the task's type with an
//!    available location is reserved, the plate is committed to it and, if the plate has to
//!    travel, the move is handed to the [`RobotScheduler`]. The device then gets the job.
//!
//! Plates of one role visit each step in worklist order: a plate waits while a lower-index plate
//! of the same role is still at the same step.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{RobotScheduler, SchedulerError};
use crate::config::SchedulerConfig;
use crate::devices::DeviceManager;
use crate::plate::{ActivePlate, ActivePlateFactory, Commit, PlateRegistry, PlateRole, Worklist};

/// Outcome of one worklist run.
#[derive(Debug, Clone)]
pub struct WorklistReport {
    /// Worklist name
    pub worklist: String,
    /// Worklist id
    pub id: Uuid,
    /// Source plates released
    pub source_plates: usize,
    /// Destination plates released
    pub destination_plates: usize,
    /// When processing started
    pub started_at: DateTime<Utc>,
    /// When processing ended
    pub finished_at: DateTime<Utc>,
    /// `Ok` when every plate finished its to-do list
    pub outcome: Result<(), SchedulerError>,
}

impl WorklistReport {
    fn new(worklist: &Worklist, started_at: DateTime<Utc>) -> Self {
        Self {
            worklist: worklist.name.clone(),
            id: worklist.id,
            source_plates: 0,
            destination_plates: 0,
            started_at,
            finished_at: started_at,
            outcome: Ok(()),
        }
    }

    /// Wall-clock processing time.
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// True when the worklist completed.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

type WorklistJob = (Worklist, oneshot::Sender<WorklistReport>);

struct Core {
    config: SchedulerConfig,
    devices: Arc<DeviceManager>,
    robot_scheduler: Arc<RobotScheduler>,
    registry: Arc<PlateRegistry>,
}

/// Worklist processor.
pub struct PlateScheduler {
    core: Arc<Core>,
    worklists: mpsc::UnboundedSender<WorklistJob>,
    queue: Mutex<Option<mpsc::UnboundedReceiver<WorklistJob>>>,
    worker: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl PlateScheduler {
    /// Create a scheduler dispatching to `devices` and moving plates with `robot_scheduler`.
    pub fn new(config: SchedulerConfig, devices: Arc<DeviceManager>, robot_scheduler: Arc<RobotScheduler>) -> Self {
        let (worklists, queue) = mpsc::unbounded_channel();
        Self {
            core: Arc::new(Core {
                config,
                devices,
                robot_scheduler,
                registry: Arc::new(PlateRegistry::new()),
            }),
            worklists,
            queue: Mutex::new(Some(queue)),
            worker: Mutex::new(None),
        }
    }

    /// Start processing queued worklists.
    pub fn start(&self) {
        let Some(queue) = self.queue.lock().take() else {
            warn!("PlateScheduler already started");
            return;
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_worklists(self.core.clone(), queue, cancel.clone()));
        *self.worker.lock() = Some((handle, cancel));
        info!(
            source_ceiling = self.core.config.source_plate_ceiling,
            destination_ceiling = self.core.config.destination_plate_ceiling,
            "PlateScheduler started"
        );
    }

    /// Queue `worklist`. The receiver resolves once it has been processed.
    pub fn enqueue_worklist(&self, worklist: Worklist) -> oneshot::Receiver<WorklistReport> {
        let (done, report) = oneshot::channel();
        info!(worklist = %worklist.name, id = %worklist.id, "Queued worklist");
        if let Err(mpsc::error::SendError((worklist, done))) = self.worklists.send((worklist, done)) {
            error!(worklist = %worklist.name, "PlateScheduler is stopped");
            let _ = done.send(stopped_report(&worklist));
        }
        report
    }

    /// Stop the scheduler. The running and queued worklists report [`SchedulerError::Stopped`].
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some((handle, cancel)) = worker {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "PlateScheduler task failed");
            }
            info!("PlateScheduler stopped");
        }
    }

    /// One line per live plate.
    pub fn status(&self) -> String {
        let plates = self.core.registry.snapshot();
        if plates.is_empty() {
            return "No active plates".to_string();
        }
        plates
            .iter()
            .map(|plate| {
                let task = plate
                    .current_todo()
                    .map_or_else(|| "done".to_string(), |task| task.to_string());
                let state = if plate.is_busy() { "busy" } else { "waiting" };
                format!("{plate} (S/N {}): step {} {task}, {state}", plate.serial_number(), plate.current_step())
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The live-plate registry.
    pub fn registry(&self) -> &Arc<PlateRegistry> {
        &self.core.registry
    }
}

fn stopped_report(worklist: &Worklist) -> WorklistReport {
    let mut report = WorklistReport::new(worklist, Utc::now());
    report.outcome = Err(SchedulerError::Stopped(worklist.name.clone()));
    report
}

async fn run_worklists(core: Arc<Core>, mut queue: mpsc::UnboundedReceiver<WorklistJob>, cancel: CancellationToken) {
    loop {
        let (worklist, done) = tokio::select! {
            _ = cancel.cancelled() => break,
            job = queue.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let report = core.process(worklist, &cancel).await;
        if done.send(report).is_err() {
            debug!("Worklist report dropped by caller");
        }
    }

    queue.close();
    while let Ok((worklist, done)) = queue.try_recv() {
        warn!(worklist = %worklist.name, "Dropping queued worklist");
        let _ = done.send(stopped_report(&worklist));
    }
}

impl Core {
    async fn process(&self, worklist: Worklist, cancel: &CancellationToken) -> WorklistReport {
        let mut report = WorklistReport::new(&worklist, Utc::now());
        let worklist = Arc::new(worklist);
        info!(
            worklist = %worklist.name,
            sources = worklist.plate_count(PlateRole::Source),
            destinations = worklist.plate_count(PlateRole::Destination),
            "Processing worklist"
        );

        let mut factories = [
            ActivePlateFactory::source(worklist.clone(), self.config.source_plate_ceiling),
            ActivePlateFactory::destination(worklist.clone(), self.config.destination_plate_ceiling),
        ];
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        report.outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(SchedulerError::Stopped(worklist.name.clone())),
                _ = ticker.tick() => {}
            }

            self.registry.remove_finished();
            if factories.iter().all(|f| f.remaining() == 0) && self.registry.is_empty() {
                break Ok(());
            }

            for factory in &mut factories {
                if let Some(plate) = factory.try_release_active_plate(&self.registry) {
                    info!(plate = %plate, barcode = %plate.barcode(), "Released plate");
                    match plate.role() {
                        PlateRole::Source => report.source_plates += 1,
                        PlateRole::Destination => report.destination_plates += 1,
                    }
                }
            }

            if let Err(e) = self.dispatch() {
                break Err(e);
            }
        };

        report.finished_at = Utc::now();
        match &report.outcome {
            Ok(()) => info!(
                worklist = %report.worklist,
                elapsed_ms = report.elapsed().num_milliseconds(),
                "Worklist complete"
            ),
            Err(e) => {
                error!(worklist = %report.worklist, error = %e, "Worklist failed");
                let abandoned = self.registry.snapshot();
                if !abandoned.is_empty() {
                    warn!(plates = abandoned.len(), "Abandoning live plates");
                    self.registry.clear();
                }
            }
        }
        report
    }

    /// Offer every free plate its next task.
    fn dispatch(&self) -> Result<(), SchedulerError> {
        let plates = self.registry.snapshot();
        for plate in &plates {
            if plate.is_busy() {
                continue;
            }
            let Some(task) = plate.current_todo() else {
                continue;
            };
            if waits_behind(plate, &plates) {
                continue;
            }

            let candidates = self.devices.devices_of_type(&task.device_type);
            if candidates.is_empty() {
                return Err(SchedulerError::NoDeviceOfType(task.device_type));
            }
            for device in candidates {
                let Some(location) = device.get_available_location(plate) else {
                    continue;
                };
                if !device.reserve_location(&location, plate) {
                    continue;
                }
                let commit = plate.commit(location.clone());
                debug!(plate = %plate, task = %task, device = %device.name(), %location, ?commit, "Dispatched task");
                if commit == Commit::Move {
                    self.robot_scheduler.add_job(plate.clone());
                }
                device.add_job(plate.clone());
                break;
            }
        }
        Ok(())
    }
}

/// A lower-index plate of the same role is still at the same step.
fn waits_behind(plate: &ActivePlate, plates: &[Arc<ActivePlate>]) -> bool {
    plates.iter().any(|other| {
        other.role() == plate.role()
            && other.instance_index() < plate.instance_index()
            && other.current_step() == plate.current_step()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::devices::{SimDevice, SimRobot, Station};
    use crate::plate::{Plate, PlateLocation, PlateTask, Transfer};
    use crate::state_machine::RetryPolicy;
    use std::time::Duration;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval_ms: 5,
            ..SchedulerConfig::default()
        }
    }

    fn station(name: &str, product: &str, nests: usize, delay: Duration) -> Station {
        let locations = (1..=nests)
            .map(|n| PlateLocation::new(name, format!("Nest{n}")))
            .collect();
        Station::new(Arc::new(SimDevice::new(name, product).with_delay(delay)), locations)
            .with_executor_config(&ExecutorConfig { shutdown_timeout_ms: 50 })
    }

    fn lab(delay: Duration) -> Arc<DeviceManager> {
        let mut devices = DeviceManager::new();
        devices.add_device(Arc::new(station("Input1", "InputStacker", 1, delay)));
        devices.add_device(Arc::new(station("Hitpicker1", "Hitpicker", 2, delay)));
        devices.add_device(Arc::new(
            station("Output1", "OutputStacker", 1, delay).consuming(["Upstack"]),
        ));
        devices.add_robot(Arc::new(SimRobot::new("Arm", Duration::ZERO)));
        devices.start();
        Arc::new(devices)
    }

    fn worklist(sources: usize, destinations: usize) -> Worklist {
        let mut worklist = Worklist::new("test run");
        worklist.source_plates = (0..sources).map(|i| Plate::new(format!("S{i}"), "96 well")).collect();
        worklist.destination_plates = (0..destinations)
            .map(|i| Plate::new(format!("D{i}"), "384 well"))
            .collect();
        for s in 0..sources {
            for d in 0..destinations {
                worklist.transfers.push(Transfer {
                    source_plate: format!("S{s}"),
                    destination_plate: format!("D{d}"),
                    volume_ul: 2.5,
                });
            }
        }
        for pre in [&mut worklist.tasks.source_prehitpick, &mut worklist.tasks.destination_prehitpick] {
            pre.push(PlateTask::new("InputStacker", "Downstack"));
        }
        for post in [&mut worklist.tasks.source_posthitpick, &mut worklist.tasks.destination_posthitpick] {
            post.push(PlateTask::new("OutputStacker", "Upstack"));
        }
        worklist
    }

    fn schedulers(devices: &Arc<DeviceManager>) -> (PlateScheduler, Arc<RobotScheduler>) {
        let robots = Arc::new(RobotScheduler::new(devices.clone(), Arc::new(RetryPolicy::never())));
        robots.start().expect("world graph");
        (PlateScheduler::new(config(), devices.clone(), robots.clone()), robots)
    }

    #[tokio::test]
    async fn test_worklist_runs_to_completion() {
        let devices = lab(Duration::ZERO);
        let (scheduler, robots) = schedulers(&devices);
        scheduler.start();

        let report = tokio::time::timeout(Duration::from_secs(10), scheduler.enqueue_worklist(worklist(2, 2)))
            .await
            .expect("finished in time")
            .expect("report");
        assert!(report.is_success(), "{:?}", report.outcome);
        assert_eq!(report.source_plates, 2);
        assert_eq!(report.destination_plates, 2);
        assert!(scheduler.registry().is_empty());
        assert_eq!(scheduler.status(), "No active plates");

        scheduler.stop().await;
        robots.stop().await;
        devices.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_device_type_fails_worklist() {
        let devices = lab(Duration::ZERO);
        let (scheduler, robots) = schedulers(&devices);
        scheduler.start();

        let mut list = worklist(1, 1);
        list.tasks.destination_posthitpick.insert(0, PlateTask::new("Sealer", "Seal"));
        let report = tokio::time::timeout(Duration::from_secs(10), scheduler.enqueue_worklist(list))
            .await
            .expect("finished in time")
            .expect("report");
        assert!(matches!(report.outcome, Err(SchedulerError::NoDeviceOfType(ref t)) if t == "Sealer"));
        assert!(scheduler.registry().is_empty());

        scheduler.stop().await;
        robots.stop().await;
        devices.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_reports_running_and_queued_worklists() {
        let devices = lab(Duration::from_secs(30));
        let (scheduler, robots) = schedulers(&devices);
        scheduler.start();

        let running = scheduler.enqueue_worklist(worklist(1, 1));
        let queued = scheduler.enqueue_worklist(worklist(1, 1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.status().contains("busy"));
        scheduler.stop().await;

        for report in [running.await.expect("report"), queued.await.expect("report")] {
            assert!(matches!(report.outcome, Err(SchedulerError::Stopped(_))));
        }
        robots.stop().await;
        devices.shutdown().await;
    }

    #[tokio::test]
    async fn test_lower_index_plate_goes_first() {
        let devices = lab(Duration::from_secs(30));
        let (scheduler, robots) = schedulers(&devices);
        let core = &scheduler.core;
        let list = Arc::new(worklist(2, 1));
        let mut factory = ActivePlateFactory::source(list, 2);
        let first = factory.try_release_active_plate(&core.registry).expect("first");
        let second = factory.try_release_active_plate(&core.registry).expect("second");

        core.dispatch().expect("dispatch");
        assert!(first.is_busy());
        assert!(!second.is_busy());
        assert!(waits_behind(&second, &core.registry.snapshot()));

        robots.stop().await;
        devices.shutdown().await;
    }

    #[test]
    fn test_report_elapsed() {
        let mut report = WorklistReport::new(&Worklist::new("timing"), Utc::now());
        report.finished_at = report.started_at + chrono::Duration::milliseconds(1500);
        assert_eq!(report.elapsed().num_milliseconds(), 1500);
        assert!(report.is_success());
    }
}
