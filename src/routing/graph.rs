//! Arena-backed directed graph with a Dijkstra shortest-path search.
//!
//! Nodes live in a `Vec` and are addressed by [`NodeId`]. Connections are directed and carry a
//! non-negative cost plus an optional payload (the robot that can make the hop, for instance).
//! A cost of `0.0` is a mandatory hop, `1.0` a normal hop and `f64::INFINITY` an edge that can
//! never be taken.
//!
//! Search state (distances, predecessors) is local to each call, so a graph can be searched from
//! several tasks at once as long as nobody mutates it.
//!
//! # Tie-breaking
//!
//! Distances are only updated on strict improvement and the next node to settle is the first
//! minimum in discovery order. Among equal-cost alternatives the path through the connection
//! declared first therefore wins.

use thiserror::Error;

/// Errors raised for malformed graphs or foreign node references.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    /// The node id was not created by this graph.
    #[error("node {0} does not belong to this graph")]
    UnknownNode(usize),

    /// The node has no connection at the given index.
    #[error("node {node} has no connection {index}")]
    UnknownConnection {
        /// Source node index
        node: usize,
        /// Connection index within the node
        index: usize,
    },

    /// Negative costs break the relaxation invariant.
    #[error("connection from node {from} to node {to} has negative cost {cost}")]
    NegativeCost {
        /// Source node index
        from: usize,
        /// Target node index
        to: usize,
        /// Rejected cost
        cost: f64,
    },

    /// Two consecutive route nodes are not directly connected.
    #[error("node {from} has no connection to node {to}")]
    MissingConnection {
        /// Source node index
        from: usize,
        /// Target node index
        to: usize,
    },

    /// NaN costs cannot be ordered.
    #[error("connection from node {from} to node {to} has a cost that is not a number")]
    InvalidCost {
        /// Source node index
        from: usize,
        /// Target node index
        to: usize,
    },
}

/// Index of a node inside a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Position of the node in insertion order.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Directed, weighted edge.
#[derive(Debug, Clone)]
pub struct Connection<P> {
    target: NodeId,
    cost: f64,
    payload: Option<P>,
}

impl<P> Connection<P> {
    /// Node this connection leads to.
    pub fn target(&self) -> NodeId {
        self.target
    }

    /// Cost of taking this connection.
    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Opaque data attached by the graph builder.
    pub fn payload(&self) -> Option<&P> {
        self.payload.as_ref()
    }
}

/// Keyed vertex owning its outgoing connections.
#[derive(Debug, Clone)]
pub struct Node<K, P> {
    key: K,
    connections: Vec<Connection<P>>,
}

impl<K, P> Node<K, P> {
    /// Caller-supplied key identifying the vertex.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Outgoing connections in declaration order.
    pub fn connections(&self) -> &[Connection<P>] {
        &self.connections
    }
}

/// Result of a successful search.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Nodes from start to end, both inclusive.
    pub nodes: Vec<NodeId>,
    /// Sum of the connection costs along `nodes`.
    pub cost: f64,
}

/// Directed graph keyed by `K` with optional connection payloads `P`.
#[derive(Debug, Clone)]
pub struct Graph<K, P = ()> {
    nodes: Vec<Node<K, P>>,
}

impl<K, P> Default for Graph<K, P> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<K, P> Graph<K, P> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node and return its id.
    pub fn add_node(&mut self, key: K) -> NodeId {
        self.nodes.push(Node {
            key,
            connections: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> Option<&Node<K, P>> {
        self.nodes.get(id.0)
    }

    /// Key of a node.
    pub fn key(&self, id: NodeId) -> Option<&K> {
        self.node(id).map(Node::key)
    }

    /// First node whose key equals `key`.
    pub fn find(&self, key: &K) -> Option<NodeId>
    where
        K: PartialEq,
    {
        self.nodes.iter().position(|n| &n.key == key).map(NodeId)
    }

    /// Iterate over all node ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    /// Add a connection without payload. Returns the connection's index on `from`.
    pub fn connect(&mut self, from: NodeId, to: NodeId, cost: f64) -> Result<usize, RouteError> {
        self.push_connection(from, to, cost, None)
    }

    /// Add a connection carrying `payload`. Returns the connection's index on `from`.
    pub fn connect_with(
        &mut self,
        from: NodeId,
        to: NodeId,
        cost: f64,
        payload: P,
    ) -> Result<usize, RouteError> {
        self.push_connection(from, to, cost, Some(payload))
    }

    /// Change the cost of an existing connection.
    ///
    /// # Errors
    ///
    /// Rejects negative and NaN costs, and unknown node or connection indices.
    pub fn set_cost(&mut self, from: NodeId, index: usize, cost: f64) -> Result<(), RouteError> {
        self.check(from)?;
        let node = &mut self.nodes[from.0];
        let connection = node
            .connections
            .get_mut(index)
            .ok_or(RouteError::UnknownConnection {
                node: from.0,
                index,
            })?;
        validate_cost(from, connection.target, cost)?;
        connection.cost = cost;
        Ok(())
    }

    /// Cheapest connection from `from` to `to`; the first declared one on ties.
    pub fn connection_between(&self, from: NodeId, to: NodeId) -> Option<&Connection<P>> {
        let mut best: Option<&Connection<P>> = None;
        for connection in self.node(from)?.connections.iter() {
            if connection.target == to && best.map_or(true, |b| connection.cost < b.cost) {
                best = Some(connection);
            }
        }
        best
    }

    /// Shortest path from `start` to `end`, both inclusive.
    ///
    /// Returns an empty vector when `end` cannot be reached.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::UnknownNode`] if either endpoint is not part of this graph.
    pub fn find_shortest_path(&self, start: NodeId, end: NodeId) -> Result<Vec<NodeId>, RouteError> {
        Ok(self
            .shortest_route(start, end)?
            .map(|route| route.nodes)
            .unwrap_or_default())
    }

    /// Shortest route from `start` to `end` with its total cost, or `None` when unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::UnknownNode`] if either endpoint is not part of this graph.
    pub fn shortest_route(&self, start: NodeId, end: NodeId) -> Result<Option<Route>, RouteError> {
        self.check(start)?;
        self.check(end)?;

        if start == end {
            return Ok(Some(Route {
                nodes: vec![start],
                cost: 0.0,
            }));
        }

        let world = self.flood(start);
        let mut slot = vec![None; self.nodes.len()];
        for (i, id) in world.iter().enumerate() {
            slot[id.0] = Some(i);
        }
        if slot[end.0].is_none() {
            return Ok(None);
        }

        let mut distance = vec![f64::INFINITY; world.len()];
        let mut previous: Vec<Option<NodeId>> = vec![None; world.len()];
        let mut settled = vec![false; world.len()];
        distance[0] = 0.0;

        let mut reached = None;
        loop {
            let mut best: Option<usize> = None;
            for i in 0..world.len() {
                if !settled[i] && best.map_or(true, |b| distance[i] < distance[b]) {
                    best = Some(i);
                }
            }
            let Some(current) = best else { break };
            if distance[current].is_infinite() {
                break;
            }
            settled[current] = true;

            let current_id = world[current];
            if current_id == end {
                reached = Some(current);
                break;
            }

            for connection in &self.nodes[current_id.0].connections {
                let Some(target) = slot[connection.target.0] else {
                    continue;
                };
                let candidate = distance[current] + connection.cost;
                if candidate < distance[target] {
                    distance[target] = candidate;
                    previous[target] = Some(current_id);
                }
            }
        }

        let Some(terminal) = reached else {
            return Ok(None);
        };

        let mut nodes = vec![end];
        let mut cursor = previous[terminal];
        while let Some(id) = cursor {
            nodes.push(id);
            cursor = slot[id.0].and_then(|s| previous[s]);
        }
        nodes.reverse();

        Ok(Some(Route {
            nodes,
            cost: distance[terminal],
        }))
    }

    fn push_connection(
        &mut self,
        from: NodeId,
        to: NodeId,
        cost: f64,
        payload: Option<P>,
    ) -> Result<usize, RouteError> {
        self.check(from)?;
        self.check(to)?;
        validate_cost(from, to, cost)?;
        let connections = &mut self.nodes[from.0].connections;
        connections.push(Connection {
            target: to,
            cost,
            payload,
        });
        Ok(connections.len() - 1)
    }

    fn check(&self, id: NodeId) -> Result<(), RouteError> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(RouteError::UnknownNode(id.0))
        }
    }

    /// Nodes reachable from `start` in depth-first discovery order, `start` first.
    fn flood(&self, start: NodeId) -> Vec<NodeId> {
        let mut seen = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if seen[id.0] {
                continue;
            }
            seen[id.0] = true;
            order.push(id);
            // reversed so the first declared connection is expanded first
            for connection in self.nodes[id.0].connections.iter().rev() {
                if !seen[connection.target.0] {
                    stack.push(connection.target);
                }
            }
        }
        order
    }
}

fn validate_cost(from: NodeId, to: NodeId, cost: f64) -> Result<(), RouteError> {
    if cost.is_nan() {
        return Err(RouteError::InvalidCost {
            from: from.0,
            to: to.0,
        });
    }
    if cost < 0.0 {
        return Err(RouteError::NegativeCost {
            from: from.0,
            to: to.0,
            cost,
        });
    }
    Ok(())
}
