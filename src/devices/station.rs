//! Executor-backed plate scheduler device.
//!
//! A [`Station`] adapts any [`DeviceInterface`] to the plate scheduler. It owns the device's
//! plate locations and one [`StateMachineExecutor`], so the commands of all plates visiting the
//! station run strictly one after another.
//!
//! Starting a station homes its device ahead of any command. For every job a worker task waits for the plate to arrive, queues a command workflow and
//! reports completion back to the plate. Failed workflows leave the plate busy at its task for
//! an operator to deal with.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{queue_homing, DeviceInterface, PlateSchedulerDevice};
use crate::config::ExecutorConfig;
use crate::executor::{ExecutorInfo, StateMachineExecutor};
use crate::plate::{ActivePlate, PlateLocation};
use crate::state_machine::workflows::command_workflow;
use crate::state_machine::{ErrorReporter, RetryPolicy};

/// Plate scheduler device driving one [`DeviceInterface`].
pub struct Station {
    device: Arc<dyn DeviceInterface>,
    locations: Vec<Arc<PlateLocation>>,
    executor: Arc<StateMachineExecutor>,
    reporter: Arc<dyn ErrorReporter>,
    consuming: HashSet<String>,
    workers: CancellationToken,
}

impl Station {
    /// Wrap `device` with the given locations.
    ///
    /// Failed commands abort immediately until a reporter is set with
    /// [`Station::with_reporter`].
    pub fn new(device: Arc<dyn DeviceInterface>, locations: Vec<PlateLocation>) -> Self {
        let executor = Arc::new(StateMachineExecutor::new(device.name()));
        Self {
            locations: locations.into_iter().map(Arc::new).collect(),
            executor,
            reporter: Arc::new(RetryPolicy::never()),
            consuming: HashSet::new(),
            workers: CancellationToken::new(),
            device,
        }
    }

    /// Resolve command failures with `reporter`
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Use `config` for the station's executor
    #[must_use]
    pub fn with_executor_config(mut self, config: &ExecutorConfig) -> Self {
        self.executor = Arc::new(StateMachineExecutor::with_config(self.device.name(), config));
        self
    }

    /// Commands after which the plate leaves the system through this station (trash, upstack)
    #[must_use]
    pub fn consuming<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.consuming.extend(commands.into_iter().map(Into::into));
        self
    }

    /// The wrapped device
    pub fn device(&self) -> &Arc<dyn DeviceInterface> {
        &self.device
    }

    /// The station's executor
    pub fn executor(&self) -> &Arc<StateMachineExecutor> {
        &self.executor
    }

    fn owns(&self, location: &Arc<PlateLocation>) -> bool {
        self.locations.iter().any(|l| Arc::ptr_eq(l, location))
    }
}

#[async_trait]
impl PlateSchedulerDevice for Station {
    fn name(&self) -> &str {
        self.device.name()
    }

    fn product_name(&self) -> &str {
        self.device.product_name()
    }

    fn plate_locations(&self) -> Vec<Arc<PlateLocation>> {
        self.locations.clone()
    }

    fn start(&self) {
        self.executor.start();
        queue_homing(&self.executor, self.device.clone(), self.reporter.clone());
    }

    fn get_available_location(&self, plate: &ActivePlate) -> Option<Arc<PlateLocation>> {
        // a plate already sitting here keeps its location for the next task
        if let Some(current) = plate.current_location() {
            if self.owns(&current) && current.holder() == Some(plate.serial_number()) {
                return Some(current);
            }
        }
        self.locations.iter().find(|l| l.is_available()).cloned()
    }

    fn reserve_location(&self, location: &Arc<PlateLocation>, plate: &ActivePlate) -> bool {
        if !self.owns(location) {
            warn!(station = %self.name(), %location, "Refusing to reserve a foreign location");
            return false;
        }
        location.reserve(plate.serial_number())
    }

    fn add_job(&self, plate: Arc<ActivePlate>) {
        let Some(location) = plate.destination_location() else {
            error!(station = %self.name(), plate = %plate, "Job without destination location");
            return;
        };
        let Some(task) = plate.current_todo() else {
            warn!(station = %self.name(), plate = %plate, "Job for a plate with nothing to do");
            return;
        };

        let device = self.device.clone();
        let executor = self.executor.clone();
        let reporter = self.reporter.clone();
        let consumes = self.consuming.contains(&task.command);
        let cancel = self.workers.clone();

        let job = async move {
            let sourcing = plate
                .current_location()
                .is_some_and(|current| Arc::ptr_eq(&current, &location))
                && !location.is_occupied();
            if sourcing {
                debug!(plate = %plate, %location, "Presenting plate");
                location.mark_occupied(Some(plate.serial_number()));
            }
            plate.wait_for_plate().await;

            let workflow = match command_workflow(device, &task, reporter) {
                Ok(workflow) => workflow,
                Err(e) => {
                    error!(plate = %plate, task = %task, error = %e, "Invalid command workflow, plate stuck");
                    return;
                }
            };
            match executor.submit(workflow).await {
                Ok(Ok(())) => {
                    info!(plate = %plate, task = %task, "Task completed");
                    plate.mark_job_completed();
                    if consumes {
                        location.mark_vacated();
                        debug!(plate = %plate, %location, "Plate consumed");
                    }
                }
                Ok(Err(e)) => {
                    error!(plate = %plate, task = %task, error = %e, "Task failed, plate stuck");
                }
                Err(_) => {
                    error!(plate = %plate, task = %task, "Executor dropped the task, plate stuck");
                }
            }
        };

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = job => {}
            }
        });
    }

    fn executor_info(&self) -> ExecutorInfo {
        self.executor.executor_info()
    }

    async fn shutdown(&self) {
        self.workers.cancel();
        self.executor.stop().await;
        info!(station = %self.name(), "Station shut down");
    }
}
