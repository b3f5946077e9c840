//! Role-specific active plate factories with admission control.
//!
//! A factory knows how many plates of its role the worklist still needs and how many may be in
//! flight at once. [`ActivePlateFactory::try_release_active_plate`] is the backpressure point:
//! it only creates a plate while the registry holds fewer live plates of the role than the
//! ceiling allows.

use std::sync::Arc;

use tracing::{debug, warn};

use super::active::ActivePlate;
use super::registry::PlateRegistry;
use super::worklist::{PlateRole, Worklist};

/// Hands out active plates of one role for one worklist.
#[derive(Debug)]
pub struct ActivePlateFactory {
    role: PlateRole,
    worklist: Arc<Worklist>,
    remaining: usize,
    next_index: usize,
    ceiling: usize,
}

impl ActivePlateFactory {
    /// Create a factory for `role` that keeps at most `ceiling` plates in flight.
    pub fn new(role: PlateRole, worklist: Arc<Worklist>, ceiling: usize) -> Self {
        let remaining = worklist.plate_count(role);
        debug!(%role, remaining, ceiling, worklist = %worklist.name, "Created plate factory");
        Self {
            role,
            worklist,
            remaining,
            next_index: 0,
            ceiling,
        }
    }

    /// Factory for source plates.
    pub fn source(worklist: Arc<Worklist>, ceiling: usize) -> Self {
        Self::new(PlateRole::Source, worklist, ceiling)
    }

    /// Factory for destination plates.
    pub fn destination(worklist: Arc<Worklist>, ceiling: usize) -> Self {
        Self::new(PlateRole::Destination, worklist, ceiling)
    }

    /// Role of the plates this factory creates.
    pub fn role(&self) -> PlateRole {
        self.role
    }

    /// Plates still to be created.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Maximum number of live plates of this role.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Build the next plate, or `None` once the worklist has no more plates of this role.
    ///
    /// Does not register the plate; see [`Self::try_release_active_plate`].
    pub fn create_active_plate(&mut self, registry: &PlateRegistry) -> Option<ActivePlate> {
        if self.remaining == 0 {
            return None;
        }
        let index = self.next_index;
        let Some(plate) = self.worklist.plates(self.role).get(index).cloned() else {
            warn!(
                role = %self.role,
                index,
                worklist = %self.worklist.name,
                "Worklist transfers name more plates than it lists"
            );
            self.remaining = 0;
            return None;
        };
        self.remaining -= 1;
        self.next_index += 1;
        Some(ActivePlate::new(
            registry.next_serial(),
            self.role,
            index,
            plate,
            self.worklist.todo_list(self.role),
        ))
    }

    /// True when the factory has plates left and the ceiling has room.
    pub fn release_allowed(&self, registry: &PlateRegistry) -> bool {
        self.remaining > 0 && registry.count(self.role) < self.ceiling
    }

    /// Create and register a plate if the ceiling allows it.
    pub fn try_release_active_plate(&mut self, registry: &PlateRegistry) -> Option<Arc<ActivePlate>> {
        if self.remaining == 0 {
            return None;
        }
        let role = self.role;
        let ceiling = self.ceiling;
        registry.admit(role, ceiling, || self.create_active_plate(registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plate::worklist::{Plate, Transfer};

    fn worklist(sources: usize, destinations: usize) -> Arc<Worklist> {
        let mut worklist = Worklist::new("factory");
        for s in 0..sources {
            worklist.source_plates.push(Plate::new(format!("S{s}"), "source labware"));
            for d in 0..destinations {
                worklist.transfers.push(Transfer {
                    source_plate: format!("S{s}"),
                    destination_plate: format!("D{d}"),
                    volume_ul: 5.0,
                });
            }
        }
        for d in 0..destinations {
            worklist.destination_plates.push(Plate::new(format!("D{d}"), "dest labware"));
        }
        Arc::new(worklist)
    }

    #[test]
    fn test_create_refuses_when_exhausted() {
        let registry = PlateRegistry::new();
        let mut factory = ActivePlateFactory::source(worklist(2, 1), 3);
        let first = factory.create_active_plate(&registry).expect("first plate");
        let second = factory.create_active_plate(&registry).expect("second plate");
        assert_eq!(first.instance_index(), 0);
        assert_eq!(second.instance_index(), 1);
        assert_eq!(second.barcode(), "S1");
        assert!(second.serial_number() > first.serial_number());
        assert!(factory.create_active_plate(&registry).is_none());
        assert_eq!(factory.remaining(), 0);
    }

    #[test]
    fn test_ceiling_blocks_until_a_plate_finishes() {
        let registry = PlateRegistry::new();
        let mut factory = ActivePlateFactory::destination(worklist(1, 4), 2);

        let a = factory.try_release_active_plate(&registry).expect("below ceiling");
        let _b = factory.try_release_active_plate(&registry).expect("below ceiling");
        assert!(factory.try_release_active_plate(&registry).is_none());
        assert!(!factory.release_allowed(&registry));
        assert_eq!(factory.remaining(), 2);

        // finish `a` by running through its whole to-do list
        while a.still_have_todos() {
            a.advance_current_todo();
        }
        assert_eq!(registry.remove_finished().len(), 1);

        let c = factory.try_release_active_plate(&registry).expect("room again");
        assert_eq!(c.instance_index(), 2);
    }

    #[test]
    fn test_missing_plate_records_stop_the_factory() {
        let registry = PlateRegistry::new();
        let mut list = (*worklist(2, 1)).clone();
        list.source_plates.truncate(1);
        let mut factory = ActivePlateFactory::source(Arc::new(list), 3);
        assert!(factory.try_release_active_plate(&registry).is_some());
        assert!(factory.try_release_active_plate(&registry).is_none());
        assert_eq!(factory.remaining(), 0);
    }
}
