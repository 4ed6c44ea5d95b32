use crate::topology::node::Nodes;
use crate::types::NodeId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Route {
    pub first_hop: NodeId,
    pub latency: u64,
}

/// Shortest-path view over the node table. Recomputed on demand when
/// something marked it dirty; a refresh with no graph change emits nothing
/// and leaves the table identical.
pub(crate) struct Routing {
    dirty: bool,
    table: HashMap<NodeId, Route>,
}

impl Routing {
    pub fn new() -> Self {
        Routing {
            dirty: true,
            table: HashMap::new(),
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn next_hop(&self, target: &NodeId) -> Option<&NodeId> {
        self.table.get(target).map(|route| &route.first_hop)
    }

    pub fn path_latency(&self, target: &NodeId) -> Option<u64> {
        self.table.get(target).map(|route| route.latency)
    }

    pub fn reachable(&self) -> impl Iterator<Item = (&NodeId, &Route)> {
        self.table.iter()
    }

    /// Recompute shortest paths from self. Returns the ids that became
    /// reachable and the ids that stopped being reachable, in stable order.
    pub fn refresh(&mut self, nodes: &Nodes) -> (Vec<NodeId>, Vec<NodeId>) {
        if !self.dirty {
            return (Vec::new(), Vec::new());
        }
        self.dirty = false;
        let fresh = dijkstra(nodes);

        let mut available: Vec<NodeId> = fresh
            .keys()
            .filter(|id| !self.table.contains_key(*id))
            .cloned()
            .collect();
        let mut unavailable: Vec<NodeId> = self
            .table
            .keys()
            .filter(|id| !fresh.contains_key(*id))
            .cloned()
            .collect();
        available.sort();
        unavailable.sort();

        self.table = fresh;
        (available, unavailable)
    }
}

/// Min-latency paths from the self node. Ties break on lower accumulated
/// latency, then lexicographic first-hop id, then node insertion order.
fn dijkstra(nodes: &Nodes) -> HashMap<NodeId, Route> {
    let our = nodes.our_id();
    let mut settled: HashMap<NodeId, Route> = HashMap::new();
    // (latency, first hop, insertion order, node)
    let mut heap: BinaryHeap<Reverse<(u64, NodeId, u64, NodeId)>> = BinaryHeap::new();

    let Some(ours) = nodes.get(our) else {
        return settled;
    };
    for (neighbor, weight) in &ours.outgoing {
        let order = nodes.get(neighbor).map(|n| n.order).unwrap_or(u64::MAX);
        heap.push(Reverse((
            *weight,
            neighbor.clone(),
            order,
            neighbor.clone(),
        )));
    }

    while let Some(Reverse((latency, first_hop, _, id))) = heap.pop() {
        if id == *our || settled.contains_key(&id) {
            continue;
        }
        settled.insert(
            id.clone(),
            Route {
                first_hop: first_hop.clone(),
                latency,
            },
        );
        let Some(node) = nodes.get(&id) else {
            continue;
        };
        for (neighbor, weight) in &node.outgoing {
            if neighbor == our || settled.contains_key(neighbor) {
                continue;
            }
            let order = nodes.get(neighbor).map(|n| n.order).unwrap_or(u64::MAX);
            heap.push(Reverse((
                latency + weight,
                first_hop.clone(),
                order,
                neighbor.clone(),
            )));
        }
    }
    settled
}
