//! Routing: a generic shortest-path router and the robot path planner built on it.
//!
//! [`Graph`] knows nothing about plates or robots. [`PathPlanner`] fills a graph with the
//! places of every accessible device and the moves robots can make between them, then turns
//! the cheapest route between two locations into robot hops.

pub mod graph;
pub mod planner;

pub use graph::{Connection, Graph, Node, NodeId, Route, RouteError};
pub use planner::{Hop, PathPlanner};
