//! Active plates: physical plates in motion and their remaining work.
//!
//! An [`ActivePlate`] is shared as `Arc<ActivePlate>` between the plate scheduler, the robot
//! scheduler and device workers. All mutable state sits behind one mutex, so the cursor, the
//! busy flag and the two locations always change together.
//!
//! Lifecycle: created with a to-do list, then alternates between free and busy once per task
//! (`commit` makes it busy, `mark_job_completed` frees it), and is finished once it is free
//! with nothing left to do.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::location::{PlateId, PlateLocation};
use super::task::PlateTask;
use super::worklist::{Plate, PlateRole};

#[derive(Debug)]
struct PlateState {
    todo: Vec<PlateTask>,
    cursor: usize,
    busy: bool,
    current: Option<Arc<PlateLocation>>,
    destination: Option<Arc<PlateLocation>>,
}

/// Outcome of [`ActivePlate::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// First placement of the plate: it is presented where it was reserved.
    Sourced,
    /// The plate stays where it is for the next task.
    InPlace,
    /// The plate must be carried from its current location to the new one.
    Move,
}

/// A plate moving through the system.
#[derive(Debug)]
pub struct ActivePlate {
    serial: PlateId,
    role: PlateRole,
    instance_index: usize,
    plate: Plate,
    state: Mutex<PlateState>,
}

impl ActivePlate {
    /// Create a free plate with `todo` as its work list.
    pub fn new(
        serial: PlateId,
        role: PlateRole,
        instance_index: usize,
        plate: Plate,
        todo: Vec<PlateTask>,
    ) -> Self {
        let plate = Self {
            serial,
            role,
            instance_index,
            plate,
            state: Mutex::new(PlateState {
                todo,
                cursor: 0,
                busy: false,
                current: None,
                destination: None,
            }),
        };
        info!(plate = %plate, serial, barcode = %plate.plate.barcode, "Created active plate");
        plate
    }

    /// Process-wide serial number.
    pub fn serial_number(&self) -> PlateId {
        self.serial
    }

    /// Source or destination.
    pub fn role(&self) -> PlateRole {
        self.role
    }

    /// Index among plates of the same role in the worklist.
    pub fn instance_index(&self) -> usize {
        self.instance_index
    }

    /// Plate barcode.
    pub fn barcode(&self) -> &str {
        &self.plate.barcode
    }

    /// Labware name.
    pub fn labware(&self) -> &str {
        &self.plate.labware
    }

    /// Next unfinished task.
    pub fn current_todo(&self) -> Option<PlateTask> {
        let state = self.state.lock();
        state.todo.get(state.cursor).cloned()
    }

    /// Position of the cursor in the to-do list.
    pub fn current_step(&self) -> usize {
        self.state.lock().cursor
    }

    /// Move the cursor past the current task.
    pub fn advance_current_todo(&self) {
        let mut state = self.state.lock();
        if state.cursor < state.todo.len() {
            state.cursor += 1;
        }
    }

    /// True while tasks remain.
    pub fn still_have_todos(&self) -> bool {
        let state = self.state.lock();
        state.cursor < state.todo.len()
    }

    /// True while a dispatched task has not been marked completed.
    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    /// Free and without remaining tasks.
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        !state.busy && state.cursor >= state.todo.len()
    }

    /// Where the plate is now.
    pub fn current_location(&self) -> Option<Arc<PlateLocation>> {
        self.state.lock().current.clone()
    }

    /// Where the plate is going for its current task.
    pub fn destination_location(&self) -> Option<Arc<PlateLocation>> {
        self.state.lock().destination.clone()
    }

    /// Bind the plate to `location` for its current task and mark it busy.
    ///
    /// The location must already be reserved for this plate.
    pub fn commit(&self, location: Arc<PlateLocation>) -> Commit {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.busy = true;
        let commit = match state.current.as_ref() {
            None => Commit::Sourced,
            Some(current) if Arc::ptr_eq(current, &location) => Commit::InPlace,
            Some(_) => Commit::Move,
        };
        if commit == Commit::Sourced {
            state.current = Some(location.clone());
        }
        debug!(plate = %self, location = %location, ?commit, "Committed plate");
        state.destination = Some(location);
        commit
    }

    /// Wait until the plate physically sits at its destination.
    ///
    /// Returns immediately when no destination is set.
    pub async fn wait_for_plate(&self) {
        let destination = self.destination_location();
        match destination {
            Some(location) => location.wait_occupied().await,
            None => warn!(plate = %self, "Waiting for a plate without destination"),
        }
    }

    /// Record the successful completion of the current task.
    ///
    /// Advances the cursor, releases the destination reservation, moves the plate to its
    /// destination and frees it. Returns `false`, changing nothing, when the plate was not busy,
    /// so each dispatched task is completed exactly once.
    pub fn mark_job_completed(&self) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.busy {
            warn!(plate = %self, "Job completion reported for a plate that is not busy");
            return false;
        }
        debug!(
            plate = %self,
            current = ?state.current.as_ref().map(ToString::to_string),
            destination = ?state.destination.as_ref().map(ToString::to_string),
            "Marking job completed"
        );

        let cursor = state.cursor;
        if let Some(task) = state.todo.get_mut(cursor) {
            task.completed = true;
            state.cursor += 1;
        }
        if let Some(destination) = &state.destination {
            destination.clear_reservation(self.serial);
        }
        state.current = state.destination.clone();
        state.busy = false;
        true
    }

    /// Multi-line status report.
    pub fn status_report(&self) -> String {
        let state = self.state.lock();
        let mut report = String::new();
        let _ = writeln!(report, "Info for {} plate S/N: {}", self.role, self.serial);
        let _ = writeln!(report, "\tInstanceIndex: {}", self.instance_index);
        let _ = writeln!(report, "\tBarcode: {}", self.plate.barcode);
        let _ = writeln!(report, "\tLabware: {}", self.plate.labware);
        let _ = writeln!(report, "\tBusy: {}", state.busy);
        for (label, location) in [("Current", &state.current), ("Destination", &state.destination)] {
            match location {
                Some(location) => {
                    let _ = writeln!(report, "\t{label} location: {location}, {}", location.state());
                }
                None => {
                    let _ = writeln!(report, "\t{label} location: none");
                }
            }
        }
        let _ = writeln!(report, "\tToDoList:");
        for (i, task) in state.todo.iter().enumerate() {
            let marker = if i == state.cursor { ">" } else { " " };
            let _ = writeln!(
                report,
                "\t{marker} #{} {} completed: {}",
                i + 1,
                task,
                task.completed
            );
        }
        report
    }
}

impl fmt::Display for ActivePlate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            PlateRole::Source => write!(f, "ActiveSourcePlate{}", self.instance_index),
            PlateRole::Destination => write!(f, "ActiveDestinationPlate{}", self.instance_index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plate::location::LocationState;
    use std::time::Duration;

    fn plate(todo: Vec<PlateTask>) -> ActivePlate {
        ActivePlate::new(
            1,
            PlateRole::Source,
            0,
            Plate::new("S0001", "96 Greiner"),
            todo,
        )
    }

    #[test]
    fn test_empty_todo_list_is_finished() {
        let plate = plate(Vec::new());
        assert!(!plate.still_have_todos());
        assert!(plate.current_todo().is_none());
        assert!(plate.is_finished());
    }

    #[test]
    fn test_cursor_advances_and_stops() {
        let plate = plate(vec![PlateTask::new("A", "a"), PlateTask::new("B", "b")]);
        assert_eq!(plate.current_todo().map(|t| t.command), Some("a".into()));
        plate.advance_current_todo();
        assert_eq!(plate.current_todo().map(|t| t.command), Some("b".into()));
        plate.advance_current_todo();
        plate.advance_current_todo();
        assert!(!plate.still_have_todos());
        assert_eq!(plate.current_step(), 2);
    }

    #[test]
    fn test_mark_job_completed_moves_plate_once() {
        let plate = plate(vec![PlateTask::new("A", "a"), PlateTask::new("B", "b")]);
        let first = Arc::new(PlateLocation::new("A", "slot"));
        let second = Arc::new(PlateLocation::new("B", "slot"));

        assert!(first.reserve(plate.serial_number()));
        assert_eq!(plate.commit(first.clone()), Commit::Sourced);
        first.mark_occupied(None);
        assert!(plate.is_busy());
        assert!(plate.mark_job_completed());
        assert!(!plate.is_busy());

        assert!(second.reserve(plate.serial_number()));
        assert_eq!(plate.commit(second.clone()), Commit::Move);
        assert!(plate.mark_job_completed());
        assert_eq!(second.state(), LocationState::Free);
        assert!(Arc::ptr_eq(&plate.current_location().expect("moved"), &second));

        // a second report without a new commit changes nothing
        assert!(!plate.mark_job_completed());
        assert!(!plate.still_have_todos());
        assert!(plate.is_finished());
    }

    #[test]
    fn test_commit_in_place() {
        let plate = plate(vec![PlateTask::new("A", "a"), PlateTask::new("A", "b")]);
        let location = Arc::new(PlateLocation::new("A", "slot"));
        location.reserve(plate.serial_number());
        plate.commit(location.clone());
        location.mark_occupied(None);
        plate.mark_job_completed();

        assert!(location.reserve(plate.serial_number()));
        assert_eq!(plate.commit(location.clone()), Commit::InPlace);
    }

    #[test]
    fn test_busy_plate_is_not_finished() {
        let plate = plate(vec![PlateTask::new("A", "a")]);
        let location = Arc::new(PlateLocation::new("A", "slot"));
        plate.commit(location);
        plate.advance_current_todo();
        assert!(!plate.still_have_todos());
        assert!(!plate.is_finished());
    }

    #[tokio::test]
    async fn test_wait_for_plate_blocks_until_occupied() {
        let plate = Arc::new(plate(vec![PlateTask::new("A", "a")]));
        let location = Arc::new(PlateLocation::new("A", "slot"));
        location.reserve(plate.serial_number());
        plate.commit(location.clone());

        let waiter = {
            let plate = plate.clone();
            tokio::spawn(async move { plate.wait_for_plate().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        location.mark_occupied(None);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("plate arrived")
            .expect("waiter task should not panic");
    }

    #[test]
    fn test_status_report_lists_tasks() {
        let plate = plate(vec![PlateTask::new("Sealer", "seal")]);
        let report = plate.status_report();
        assert!(report.contains("source plate S/N: 1"));
        assert!(report.contains("Sealer:seal"));
        assert_eq!(plate.to_string(), "ActiveSourcePlate0");
    }
}
