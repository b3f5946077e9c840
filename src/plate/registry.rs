//! Process-scoped registry of live plates.
//!
//! The registry is owned by the plate scheduler and handed to factories by reference. It hands
//! out serial numbers and is the single place where the per-role concurrency ceiling is checked,
//! under the same lock that inserts the new plate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::active::ActivePlate;
use super::location::PlateId;
use super::worklist::PlateRole;

/// Live plates plus the serial number counter.
#[derive(Debug, Default)]
pub struct PlateRegistry {
    plates: Mutex<Vec<Arc<ActivePlate>>>,
    serial: AtomicU64,
}

impl PlateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next serial number, starting at 1.
    pub fn next_serial(&self) -> PlateId {
        self.serial.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of live plates.
    pub fn len(&self) -> usize {
        self.plates.lock().len()
    }

    /// True when no plate is live.
    pub fn is_empty(&self) -> bool {
        self.plates.lock().is_empty()
    }

    /// Number of live plates with `role`.
    pub fn count(&self, role: PlateRole) -> usize {
        self.plates.lock().iter().filter(|p| p.role() == role).count()
    }

    /// Live plates in admission order.
    pub fn snapshot(&self) -> Vec<Arc<ActivePlate>> {
        self.plates.lock().clone()
    }

    /// Insert the plate built by `create` if fewer than `ceiling` plates of `role` are live.
    ///
    /// The count, the construction and the insertion happen under one lock, so concurrent
    /// callers can never exceed the ceiling.
    pub fn admit<F>(&self, role: PlateRole, ceiling: usize, create: F) -> Option<Arc<ActivePlate>>
    where
        F: FnOnce() -> Option<ActivePlate>,
    {
        let mut plates = self.plates.lock();
        let live = plates.iter().filter(|p| p.role() == role).count();
        if live >= ceiling {
            return None;
        }
        let plate = Arc::new(create()?);
        plates.push(plate.clone());
        Some(plate)
    }

    /// Remove and return the plates that are finished.
    pub fn remove_finished(&self) -> Vec<Arc<ActivePlate>> {
        let mut plates = self.plates.lock();
        let (finished, live): (Vec<_>, Vec<_>) = plates.drain(..).partition(|p| p.is_finished());
        *plates = live;
        for plate in &finished {
            info!(plate = %plate, "Removed finished plate");
        }
        finished
    }

    /// Drop every live plate.
    pub fn clear(&self) {
        self.plates.lock().clear();
    }
}
