//! Plate locations and the Free/Reserved/Occupied reservation protocol.
//!
//! A [`PlateLocation`] is a named slot on a device. Its status is published through a
//! `tokio::sync::watch` channel so that workers can block until a plate physically arrives
//! ([`PlateLocation::wait_occupied`]) without polling.
//!
//! Transition rules:
//!
//! | from       | operation             | to                 |
//! |------------|-----------------------|--------------------|
//! | `Free`     | `reserve(p)`          | `Reserved(p)`      |
//! | `Reserved` | `mark_occupied`       | `Occupied` (holder kept) |
//! | `Free`     | `mark_occupied(p)`    | `Occupied(p)`      |
//! | `Reserved(p)` | `clear_reservation(p)` | `Free`        |
//! | `Occupied` | `mark_vacated`        | `Free`             |
//!
//! At most one plate holds a location at a time; the first reservation wins.

use std::fmt;

use serde::Serialize;
use tokio::sync::watch;

/// Serial number of an active plate.
pub type PlateId = u64;

/// Observable state of a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LocationState {
    /// Nothing sits here and nobody is coming.
    Free,
    /// A plate has been promised this slot but has not arrived yet.
    Reserved,
    /// A plate physically sits here.
    Occupied,
}

impl fmt::Display for LocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationState::Free => write!(f, "free"),
            LocationState::Reserved => write!(f, "reserved"),
            LocationState::Occupied => write!(f, "occupied"),
        }
    }
}

/// State plus the plate holding the location, if known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LocationStatus {
    /// Current state
    pub state: LocationState,
    /// Plate that reserved or occupies the location
    pub holder: Option<PlateId>,
}

impl LocationStatus {
    const FREE: Self = Self {
        state: LocationState::Free,
        holder: None,
    };
}

/// Named slot on a device that can hold one plate.
#[derive(Debug)]
pub struct PlateLocation {
    device: String,
    name: String,
    places: Vec<String>,
    status: watch::Sender<LocationStatus>,
}

impl PlateLocation {
    /// Create a free location with a single place named after the location.
    pub fn new(device: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self::with_places(device, name.clone(), vec![name])
    }

    /// Create a free location reachable through several robot places (teachpoints).
    pub fn with_places(device: impl Into<String>, name: impl Into<String>, places: Vec<String>) -> Self {
        let name = name.into();
        let places = if places.is_empty() {
            vec![name.clone()]
        } else {
            places
        };
        let (status, _) = watch::channel(LocationStatus::FREE);
        Self {
            device: device.into(),
            name,
            places,
            status,
        }
    }

    /// Device that owns this location.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Location name, unique within its device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Robot places through which the location can be reached.
    pub fn places(&self) -> &[String] {
        &self.places
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> LocationStatus {
        *self.status.borrow()
    }

    /// Current state.
    pub fn state(&self) -> LocationState {
        self.status.borrow().state
    }

    /// Plate holding the location.
    pub fn holder(&self) -> Option<PlateId> {
        self.status.borrow().holder
    }

    /// Neither reserved nor occupied.
    pub fn is_available(&self) -> bool {
        self.state() == LocationState::Free
    }

    /// A plate is on its way.
    pub fn is_reserved(&self) -> bool {
        self.state() == LocationState::Reserved
    }

    /// A plate sits here.
    pub fn is_occupied(&self) -> bool {
        self.state() == LocationState::Occupied
    }

    /// Promise the location to `plate`.
    ///
    /// Returns `false` when another plate holds the location; callers should pick a different
    /// location. Reserving a location the plate already holds succeeds without changes.
    pub fn reserve(&self, plate: PlateId) -> bool {
        let mut granted = false;
        self.status.send_if_modified(|status| match status.state {
            LocationState::Free => {
                *status = LocationStatus {
                    state: LocationState::Reserved,
                    holder: Some(plate),
                };
                granted = true;
                true
            }
            _ => {
                granted = status.holder == Some(plate);
                false
            }
        });
        granted
    }

    /// Release a reservation held by `plate`.
    ///
    /// Occupied locations are left alone: the plate is already there and the device that
    /// received it clears occupancy when it leaves.
    pub fn clear_reservation(&self, plate: PlateId) -> bool {
        self.status.send_if_modified(|status| {
            if status.state == LocationState::Reserved && status.holder == Some(plate) {
                *status = LocationStatus::FREE;
                true
            } else {
                false
            }
        })
    }

    /// A plate physically arrived.
    ///
    /// A reserved location keeps its holder. `plate` names the holder for locations that were
    /// filled without a reservation, such as a storage device presenting a plate.
    pub fn mark_occupied(&self, plate: Option<PlateId>) -> bool {
        self.status.send_if_modified(|status| match status.state {
            LocationState::Occupied => false,
            LocationState::Reserved => {
                status.state = LocationState::Occupied;
                if status.holder.is_none() {
                    status.holder = plate;
                }
                true
            }
            LocationState::Free => {
                *status = LocationStatus {
                    state: LocationState::Occupied,
                    holder: plate,
                };
                true
            }
        })
    }

    /// The plate left the location.
    pub fn mark_vacated(&self) -> bool {
        self.status.send_if_modified(|status| {
            if status.state == LocationState::Occupied {
                *status = LocationStatus::FREE;
                true
            } else {
                false
            }
        })
    }

    /// Wait until a plate physically sits here.
    pub async fn wait_occupied(&self) {
        let mut rx = self.status.subscribe();
        // the sender is owned by `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|s| s.state == LocationState::Occupied).await;
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<LocationStatus> {
        self.status.subscribe()
    }
}

impl fmt::Display for PlateLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_first_reservation_wins() {
        let location = PlateLocation::new("Sealer", "stage");
        assert!(location.is_available());
        assert!(location.reserve(1));
        assert!(!location.reserve(2));
        assert_eq!(location.holder(), Some(1));
        // the holder may re-confirm its own reservation
        assert!(location.reserve(1));
    }

    #[test]
    fn test_clear_reservation_only_by_holder() {
        let location = PlateLocation::new("Sealer", "stage");
        location.reserve(1);
        assert!(!location.clear_reservation(2));
        assert!(location.is_reserved());
        assert!(location.clear_reservation(1));
        assert!(location.is_available());
    }

    #[test]
    fn test_arrival_keeps_reservation_holder() {
        let location = PlateLocation::new("Sealer", "stage");
        location.reserve(7);
        assert!(location.mark_occupied(None));
        assert_eq!(
            location.status(),
            LocationStatus {
                state: LocationState::Occupied,
                holder: Some(7)
            }
        );
        // clearing a reservation does not evict a plate that already arrived
        assert!(!location.clear_reservation(7));
        assert!(location.is_occupied());
        assert!(location.mark_vacated());
        assert!(location.is_available());
        assert_eq!(location.holder(), None);
    }

    #[test]
    fn test_occupied_location_cannot_be_reserved_by_another_plate() {
        let location = PlateLocation::new("Stacker", "out");
        location.mark_occupied(Some(3));
        assert!(!location.reserve(4));
        assert!(location.reserve(3));
        assert!(!location.is_available());
    }

    #[test]
    fn test_places_default_to_location_name() {
        let location = PlateLocation::new("Hitpicker", "deck");
        assert_eq!(location.places(), ["deck".to_string()]);
        let location =
            PlateLocation::with_places("Hitpicker", "deck", vec!["deck_a".into(), "deck_b".into()]);
        assert_eq!(location.places().len(), 2);
        assert_eq!(location.to_string(), "Hitpicker/deck");
    }

    #[tokio::test]
    async fn test_wait_occupied_wakes_on_arrival() {
        let location = Arc::new(PlateLocation::new("Sealer", "stage"));
        location.reserve(1);

        let waiter = {
            let location = location.clone();
            tokio::spawn(async move { location.wait_occupied().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        location.mark_occupied(None);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter task should not panic");
    }

    #[tokio::test]
    async fn test_wait_occupied_returns_immediately_when_occupied() {
        let location = PlateLocation::new("Sealer", "stage");
        location.mark_occupied(Some(1));
        tokio::time::timeout(Duration::from_millis(100), location.wait_occupied())
            .await
            .expect("already occupied");
    }
}
