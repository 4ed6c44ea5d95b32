use crate::types::{DetailsEntry, Neighbor, NodeId, SummaryEntry};
use std::collections::{HashMap, HashSet};

/// Version comparison with wrap-around: `a` is newer than `b` when the
/// wrapped distance from `b` to `a` is below half the range.
pub(crate) fn version_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < u32::MAX / 2
}

/// One known node of the mesh, ours included. Gossip keeps the `outgoing`
/// edge set mirroring the newest `NodeDetails` any peer has advertised;
/// `version` is the reconciliation cursor.
pub(crate) struct TopologyNode {
    pub id: NodeId,
    pub version: u32,
    /// We have ever applied routing details for this node (always true for
    /// self). Distinguishes a fresh record from one legitimately at an
    /// arbitrary version.
    pub known: bool,
    /// Reachable over a currently connected peer.
    pub direct: bool,
    /// Effective outgoing edges, sorted by neighbor id.
    pub outgoing: Vec<(NodeId, u64)>,
    /// Peers currently advertising this node.
    pub reachable_via: HashSet<NodeId>,
    /// Insertion index, the final routing tie-break.
    pub order: u64,
}

impl TopologyNode {
    fn new(id: NodeId, order: u64) -> Self {
        TopologyNode {
            id,
            version: 0,
            known: false,
            direct: false,
            outgoing: Vec::new(),
            reachable_via: HashSet::new(),
            order,
        }
    }

    /// Apply the edge set a peer advertised for this node. Returns true iff
    /// the effective routing information changed (edges or version moved).
    pub fn update_routing(&mut self, peer: &NodeId, version: u32, neighbors: &[Neighbor]) -> bool {
        self.reachable_via.insert(peer.clone());
        if self.known && !version_newer(version, self.version) {
            return false;
        }
        let mut edges: Vec<(NodeId, u64)> = neighbors
            .iter()
            .map(|n| (n.id.clone(), n.latency))
            .collect();
        edges.sort();
        let changed = !self.known || version != self.version || edges != self.outgoing;
        self.known = true;
        self.version = version;
        self.outgoing = edges;
        changed
    }

    /// Drop one peer's advertisement of this node. When no advertiser
    /// remains and the node is not a direct neighbor, its edges are gone
    /// with it. Returns true iff the routing graph changed.
    pub fn remove_routing(&mut self, peer: &NodeId) -> bool {
        self.reachable_via.remove(peer);
        if self.reachable_via.is_empty() && !self.direct && self.known {
            self.known = false;
            self.outgoing.clear();
            return true;
        }
        false
    }
}

/// The node table, with the self record pinned at creation.
pub(crate) struct Nodes {
    our: NodeId,
    map: HashMap<NodeId, TopologyNode>,
    next_order: u64,
}

impl Nodes {
    pub fn new(our: NodeId) -> Self {
        let mut nodes = Nodes {
            our: our.clone(),
            map: HashMap::new(),
            next_order: 0,
        };
        let ours = nodes.get_or_insert(&our);
        ours.direct = true;
        ours.known = true;
        nodes
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our
    }

    pub fn get(&self, id: &NodeId) -> Option<&TopologyNode> {
        self.map.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut TopologyNode> {
        self.map.get_mut(id)
    }

    pub fn get_or_insert(&mut self, id: &NodeId) -> &mut TopologyNode {
        let order = &mut self.next_order;
        self.map.entry(id.clone()).or_insert_with(|| {
            let node = TopologyNode::new(id.clone(), *order);
            *order += 1;
            node
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopologyNode> {
        self.map.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TopologyNode> {
        self.map.values_mut()
    }

    pub fn our_version(&self) -> u32 {
        self.map[&self.our].version
    }

    /// Replace the self node's outgoing set with the current direct peers.
    /// Bumps the version iff the set differs. Input must be sorted.
    pub fn rebuild_self(&mut self, edges: Vec<(NodeId, u64)>) -> bool {
        let ours = self.map.get_mut(&self.our).expect("self node is pinned");
        if ours.outgoing == edges {
            return false;
        }
        ours.outgoing = edges;
        ours.version = ours.version.wrapping_add(1);
        true
    }

    /// Nodes worth gossiping: everything with at least one outgoing edge,
    /// the self node excluded (its version rides alongside the summary).
    pub fn summary_entries(&self) -> Vec<SummaryEntry> {
        let mut entries: Vec<SummaryEntry> = self
            .map
            .values()
            .filter(|n| n.id != self.our && !n.outgoing.is_empty())
            .map(|n| SummaryEntry {
                id: n.id.clone(),
                version: n.version,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Answer a `NodeRequest` from what we currently know.
    pub fn details_for(&self, ids: &[NodeId]) -> Vec<DetailsEntry> {
        ids.iter()
            .filter_map(|id| self.map.get(id))
            .filter(|n| n.known)
            .map(|n| DetailsEntry {
                id: n.id.clone(),
                version: n.version,
                neighbors: n
                    .outgoing
                    .iter()
                    .map(|(id, latency)| Neighbor {
                        id: id.clone(),
                        latency: *latency,
                    })
                    .collect(),
            })
            .collect()
    }
}
