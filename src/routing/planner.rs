//! Robot path planning over device places.
//!
//! The world graph has one node per (device, location, place) of every accessible device. For
//! every robot and every ordered pair of places on different locations, the robot's transfer
//! weight becomes a connection carrying the robot's name. Weights that are zero or infinite mean
//! the robot cannot make that move and add no connection.

use std::fmt;

use tracing::{debug, warn};

use super::graph::{Connection, Graph, NodeId, Route, RouteError};
use crate::devices::{DeviceManager, PlacePoint};
use crate::plate::PlateLocation;

/// One robot move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    /// Robot making the move
    pub robot: String,
    /// Pick place
    pub from: PlacePoint,
    /// Place place
    pub to: PlacePoint,
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.robot, self.from, self.to)
    }
}

/// Plans multi-hop robot moves between plate locations.
#[derive(Debug, Clone, Default)]
pub struct PathPlanner {
    graph: Graph<PlacePoint, String>,
}

impl PathPlanner {
    /// Build the world graph from the registered devices and robots.
    ///
    /// Places no robot can leave are logged as warnings.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NegativeCost`] or [`RouteError::InvalidCost`] when a robot reports a
    /// negative or NaN transfer weight.
    pub fn build_world(devices: &DeviceManager) -> Result<Self, RouteError> {
        let mut graph = Graph::new();
        let mut points: Vec<(NodeId, PlacePoint)> = Vec::new();
        for device in devices.accessible_devices() {
            for location in device.plate_locations() {
                for place in location.places() {
                    let point = PlacePoint::new(device.name(), location.name(), place.as_str());
                    points.push((graph.add_node(point.clone()), point));
                }
            }
        }

        for handle in devices.robots() {
            let robot = &handle.robot;
            for (from_id, from) in &points {
                for (to_id, to) in &points {
                    if from.device == to.device && from.location == to.location {
                        continue;
                    }
                    let weight = robot.transfer_weight(from, to);
                    if weight.is_nan() {
                        return Err(RouteError::InvalidCost {
                            from: from_id.index(),
                            to: to_id.index(),
                        });
                    }
                    if weight < 0.0 {
                        return Err(RouteError::NegativeCost {
                            from: from_id.index(),
                            to: to_id.index(),
                            cost: weight,
                        });
                    }
                    if weight > 0.0 && weight.is_finite() {
                        graph.connect_with(*from_id, *to_id, weight, robot.name().to_string())?;
                    }
                }
            }
        }

        for (id, point) in &points {
            if graph.node(*id).is_some_and(|n| n.connections().is_empty()) {
                warn!(place = %point, "No robot can move plates away from this place");
            }
        }
        debug!(places = points.len(), robots = devices.robots().len(), "Built world graph");
        Ok(Self { graph })
    }

    /// The world graph.
    pub fn graph(&self) -> &Graph<PlacePoint, String> {
        &self.graph
    }

    /// Cheapest hop sequence from `from` to `to`.
    ///
    /// Every place pair of the two locations is considered; among equally cheap routes the
    /// first pair in place order wins. Returns `Some(vec![])` when both are the same location and
    /// `None` when they are not connected.
    ///
    /// # Errors
    ///
    /// Propagates graph errors; a planner built by [`PathPlanner::build_world`] produces none.
    pub fn plan_path(&self, from: &PlateLocation, to: &PlateLocation) -> Result<Option<Vec<Hop>>, RouteError> {
        if from.device() == to.device() && from.name() == to.name() {
            return Ok(Some(Vec::new()));
        }

        let mut best: Option<Route> = None;
        for from_place in from.places() {
            let Some(start) = self.find(from, from_place) else {
                continue;
            };
            for to_place in to.places() {
                let Some(end) = self.find(to, to_place) else {
                    continue;
                };
                if let Some(route) = self.graph.shortest_route(start, end)? {
                    if best.as_ref().map_or(true, |b| route.cost < b.cost) {
                        best = Some(route);
                    }
                }
            }
        }

        best.map(|route| self.hops(&route)).transpose()
    }

    fn find(&self, location: &PlateLocation, place: &str) -> Option<NodeId> {
        self.graph
            .find(&PlacePoint::new(location.device(), location.name(), place))
    }

    fn hops(&self, route: &Route) -> Result<Vec<Hop>, RouteError> {
        route
            .nodes
            .windows(2)
            .map(|pair| {
                let (from, to) = (pair[0], pair[1]);
                let robot = self
                    .graph
                    .connection_between(from, to)
                    .and_then(Connection::payload)
                    .ok_or(RouteError::MissingConnection {
                        from: from.index(),
                        to: to.index(),
                    })?;
                let from_point = self.graph.key(from).ok_or(RouteError::UnknownNode(from.index()))?;
                let to_point = self.graph.key(to).ok_or(RouteError::UnknownNode(to.index()))?;
                Ok(Hop {
                    robot: robot.clone(),
                    from: from_point.clone(),
                    to: to_point.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{PlateSchedulerDevice, SimDevice, SimRobot, Station};
    use std::sync::Arc;
    use std::time::Duration;

    fn station(name: &str, locations: Vec<PlateLocation>) -> Arc<dyn PlateSchedulerDevice> {
        Arc::new(Station::new(Arc::new(SimDevice::new(name, name)), locations))
    }

    fn location(devices: &DeviceManager, device: &str) -> Arc<PlateLocation> {
        devices.device(device).expect("device").plate_locations()[0].clone()
    }

    #[test]
    fn test_single_robot_single_hop() {
        let mut devices = DeviceManager::new();
        devices.add_device(station("Stacker", vec![PlateLocation::new("Stacker", "Nest")]));
        devices.add_device(station("Sealer", vec![PlateLocation::new("Sealer", "Nest")]));
        devices.add_robot(Arc::new(SimRobot::new("Arm", Duration::ZERO)));

        let planner = PathPlanner::build_world(&devices).expect("world");
        let hops = planner
            .plan_path(&location(&devices, "Stacker"), &location(&devices, "Sealer"))
            .expect("plan")
            .expect("connected");
        assert_eq!(
            hops,
            vec![Hop {
                robot: "Arm".into(),
                from: PlacePoint::new("Stacker", "Nest", "Nest"),
                to: PlacePoint::new("Sealer", "Nest", "Nest"),
            }]
        );
    }

    #[test]
    fn test_handoff_between_robots() {
        let mut devices = DeviceManager::new();
        devices.add_device(station("Stacker", vec![PlateLocation::new("Stacker", "Nest")]));
        devices.add_device(station("Transfer", vec![PlateLocation::new("Transfer", "Shelf")]));
        devices.add_device(station("Sealer", vec![PlateLocation::new("Sealer", "Nest")]));
        devices.add_robot(Arc::new(
            SimRobot::new("Left", Duration::ZERO).reaching(["Stacker", "Transfer"]),
        ));
        devices.add_robot(Arc::new(
            SimRobot::new("Right", Duration::ZERO).reaching(["Transfer", "Sealer"]),
        ));

        let planner = PathPlanner::build_world(&devices).expect("world");
        let hops = planner
            .plan_path(&location(&devices, "Stacker"), &location(&devices, "Sealer"))
            .expect("plan")
            .expect("connected");
        let robots: Vec<&str> = hops.iter().map(|h| h.robot.as_str()).collect();
        assert_eq!(robots, vec!["Left", "Right"]);
        assert_eq!(hops[0].to.device, "Transfer");
        assert_eq!(hops[1].from.device, "Transfer");
    }

    #[test]
    fn test_unreachable_location_is_none() {
        let mut devices = DeviceManager::new();
        devices.add_device(station("Stacker", vec![PlateLocation::new("Stacker", "Nest")]));
        devices.add_device(station("Sealer", vec![PlateLocation::new("Sealer", "Nest")]));
        devices.add_robot(Arc::new(SimRobot::new("Arm", Duration::ZERO).reaching(["Stacker"])));

        let planner = PathPlanner::build_world(&devices).expect("world");
        let path = planner
            .plan_path(&location(&devices, "Stacker"), &location(&devices, "Sealer"))
            .expect("plan");
        assert!(path.is_none());
    }

    #[test]
    fn test_same_location_needs_no_hops() {
        let mut devices = DeviceManager::new();
        devices.add_device(station("Stacker", vec![PlateLocation::new("Stacker", "Nest")]));
        let planner = PathPlanner::build_world(&devices).expect("world");
        let nest = location(&devices, "Stacker");
        assert_eq!(planner.plan_path(&nest, &nest).expect("plan"), Some(vec![]));
    }

    #[test]
    fn test_every_place_becomes_a_node() {
        let mut devices = DeviceManager::new();
        devices.add_device(station(
            "Hitpicker",
            vec![
                PlateLocation::with_places("Hitpicker", "Source", vec!["Portrait".into(), "Landscape".into()]),
                PlateLocation::new("Hitpicker", "Destination"),
            ],
        ));
        devices.add_robot(Arc::new(SimRobot::new("Arm", Duration::ZERO)));

        let planner = PathPlanner::build_world(&devices).expect("world");
        assert_eq!(planner.graph().len(), 3);
        let from = location(&devices, "Hitpicker");
        let to = devices.device("Hitpicker").expect("device").plate_locations()[1].clone();
        let hops = planner.plan_path(&from, &to).expect("plan").expect("connected");
        // equal weights: the first place of the source location wins
        assert_eq!(hops[0].from.place, "Portrait");
    }
}
