use crate::request_reply::RequestReplyHelper;
use crate::topology::node::{version_newer, Nodes};
use crate::topology::routing::Routing;
use crate::types::{
    Command, ConnId, NetworkEvent, NetworkEventSender, NodeId, PeerEvent, SummaryEntry, WireFrame,
};
use crate::utils::{print_debug, print_loud, PrintSender};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time;

mod messaging;
pub(crate) mod node;
pub(crate) mod routing;

/// Changes are batched for this long before a summary goes out, so a burst
/// of churn costs one broadcast.
const BROADCAST_COALESCE: Duration = Duration::from_millis(100);

/// What the orchestrator tracks per active peer.
pub(crate) struct PeerDetails {
    conn: ConnId,
    frame_tx: UnboundedSender<WireFrame>,
    /// Latest mean round-trip, ms. Never zero.
    latency: u64,
    /// Node ids this peer currently advertises routes for.
    advertised: HashSet<NodeId>,
    /// Ids of the outstanding NodeRequest to this peer, if any.
    requested: HashSet<NodeId>,
}

/// The orchestrator: single owner of the peer table, the node table and the
/// routing view. Everything that mutates topology funnels through its task,
/// so no lock is needed beyond the event queue.
pub(crate) struct Topology {
    endpoint: bool,
    nodes: Nodes,
    peers: HashMap<NodeId, PeerDetails>,
    routing: Routing,
    pending: RequestReplyHelper,
    event_tx: NetworkEventSender,
    print_tx: PrintSender,
    broadcast_at: Option<time::Instant>,
}

impl Topology {
    pub fn new(
        our: NodeId,
        endpoint: bool,
        request_timeout: Duration,
        event_tx: NetworkEventSender,
        print_tx: PrintSender,
    ) -> Self {
        Topology {
            endpoint,
            nodes: Nodes::new(our),
            peers: HashMap::new(),
            routing: Routing::new(),
            pending: RequestReplyHelper::new(request_timeout),
            event_tx,
            print_tx,
            broadcast_at: None,
        }
    }

    /// Run until both the command side and every peer event sender are gone.
    /// Dropping the peer table on exit closes each peer's outbound channel,
    /// which makes the peer tasks say Bye and wind down.
    pub async fn run(
        mut self,
        mut peer_rx: UnboundedReceiver<PeerEvent>,
        mut cmd_rx: UnboundedReceiver<Command>,
    ) {
        loop {
            tokio::select! {
                event = peer_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_peer_event(event);
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd);
                }
                _ = sleep_until_opt(self.broadcast_at) => {
                    self.broadcast_at = None;
                    self.broadcast();
                }
            }
            self.refresh_routing();
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send {
                target,
                kind,
                payload,
                done,
            } => self.send_data(target, kind, payload, done),
            Command::Diagnostics { reply } => {
                let _ = reply.send(self.render_diagnostics());
            }
        }
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected {
                conn,
                remote,
                frame_tx,
                latency,
            } => self.add_peer(conn, remote, frame_tx, latency),
            PeerEvent::Disconnected { conn, remote, reason } => {
                print_debug(
                    &self.print_tx,
                    &format!("topology: peer {remote} gone: {reason}"),
                );
                self.remove_peer(conn, &remote);
            }
            PeerEvent::Latency {
                conn,
                remote,
                latency,
            } => {
                let Some(details) = self.peers.get_mut(&remote) else {
                    return;
                };
                if details.conn != conn {
                    return;
                }
                details.latency = latency.max(1);
                self.rebuild_self_edges();
            }
            PeerEvent::Frame { conn, remote, frame } => {
                // ignore traffic from a link that lost the duplicate race
                if self.peers.get(&remote).map(|d| d.conn) != Some(conn) {
                    return;
                }
                self.handle_frame(remote, frame);
            }
        }
    }

    /// Track a freshly negotiated peer. A second link to the same remote is
    /// ignored: dropping its channel here is what tears the newcomer down.
    fn add_peer(
        &mut self,
        conn: ConnId,
        remote: NodeId,
        frame_tx: UnboundedSender<WireFrame>,
        latency: Option<u64>,
    ) {
        if self.peers.contains_key(&remote) {
            print_debug(
                &self.print_tx,
                &format!("topology: already connected to {remote}, dropping duplicate link"),
            );
            return;
        }
        print_loud(&self.print_tx, &format!("connected to {remote}"));
        self.peers.insert(
            remote.clone(),
            PeerDetails {
                conn,
                frame_tx,
                latency: latency.unwrap_or(1).max(1),
                advertised: HashSet::from([remote.clone()]),
                requested: HashSet::new(),
            },
        );
        let node = self.nodes.get_or_insert(&remote);
        node.direct = true;
        node.reachable_via.insert(remote.clone());
        self.rebuild_self_edges();
        self.routing.mark_dirty();
        self.schedule_broadcast();
    }

    fn remove_peer(&mut self, conn: ConnId, remote: &NodeId) {
        let Some(details) = self.peers.get(remote) else {
            return;
        };
        if details.conn != conn {
            // the duplicate link dying, not the tracked one
            return;
        }
        self.peers.remove(remote);
        if let Some(node) = self.nodes.get_mut(remote) {
            node.direct = false;
        }
        for node in self.nodes.iter_mut() {
            node.remove_routing(remote);
        }
        self.rebuild_self_edges();
        self.routing.mark_dirty();
        self.schedule_broadcast();
    }

    fn handle_frame(&mut self, remote: NodeId, frame: WireFrame) {
        match frame {
            WireFrame::NodeSummary { own_version, nodes } => {
                self.handle_summary(remote, own_version, nodes);
            }
            WireFrame::NodeRequest { nodes } => {
                self.handle_request(remote, nodes);
            }
            WireFrame::NodeDetails { nodes } => {
                self.handle_details(remote, nodes);
            }
            WireFrame::Data {
                source,
                target,
                id,
                kind,
                path,
                payload,
            } => self.handle_data(remote, source, target, id, kind, path, payload),
            WireFrame::DataAck { id, target, path } => self.handle_ack(id, target, path),
            WireFrame::DataReject {
                id,
                target,
                path,
                code,
            } => self.handle_reject(id, target, path, code),
            other => {
                print_debug(
                    &self.print_tx,
                    &format!("topology: unexpected frame {other:?} from {remote}"),
                );
            }
        }
    }

    /// Compare a peer's summary against our records and pull what is newer.
    /// The peer also stops being a route provider for anything it no longer
    /// lists.
    fn handle_summary(&mut self, remote: NodeId, own_version: u32, entries: Vec<SummaryEntry>) {
        let our = self.nodes.our_id().clone();
        let mut request: Vec<NodeId> = Vec::new();

        let peer_node = self.nodes.get_or_insert(&remote);
        if !peer_node.known || version_newer(own_version, peer_node.version) {
            request.push(remote.clone());
        }

        let mut listed: HashSet<NodeId> = HashSet::from([remote.clone()]);
        for entry in &entries {
            if entry.id == our {
                continue;
            }
            listed.insert(entry.id.clone());
            let node = self.nodes.get_or_insert(&entry.id);
            if !node.known || version_newer(entry.version, node.version) {
                request.push(entry.id.clone());
            }
        }

        let Some(details) = self.peers.get_mut(&remote) else {
            return;
        };
        let dropped: Vec<NodeId> = details
            .advertised
            .iter()
            .filter(|id| !listed.contains(*id))
            .cloned()
            .collect();
        details.advertised = listed;
        if !request.is_empty() {
            details.requested = request.into_iter().collect();
            let _ = details.frame_tx.send(WireFrame::NodeRequest {
                nodes: details.requested.iter().cloned().collect(),
            });
        }

        let mut changed = false;
        for id in dropped {
            if self.peers.contains_key(&id) {
                // still a direct neighbor of ours; the peer's silence about
                // it does not make it unreachable
                continue;
            }
            if let Some(node) = self.nodes.get_mut(&id) {
                changed |= node.remove_routing(&remote);
            }
        }
        if changed {
            self.routing.mark_dirty();
            self.schedule_broadcast();
        }
    }

    /// Answer a pull with the details we hold. Endpoints expose themselves
    /// only.
    fn handle_request(&mut self, remote: NodeId, ids: Vec<NodeId>) {
        let our = self.nodes.our_id().clone();
        let ids: Vec<NodeId> = if self.endpoint {
            ids.into_iter().filter(|id| *id == our).collect()
        } else {
            ids
        };
        let details = self.nodes.details_for(&ids);
        if details.is_empty() {
            return;
        }
        if let Some(peer) = self.peers.get(&remote) {
            let _ = peer.frame_tx.send(WireFrame::NodeDetails { nodes: details });
        }
    }

    /// Ingest pulled details. Entries that would overwrite our own record
    /// are refused; requested ids the peer stayed silent about lose this
    /// peer as a provider.
    fn handle_details(&mut self, remote: NodeId, entries: Vec<crate::types::DetailsEntry>) {
        let our = self.nodes.our_id().clone();
        let mut changed = false;
        let mut received: HashSet<NodeId> = HashSet::new();
        for entry in entries {
            if entry.id == our {
                continue;
            }
            received.insert(entry.id.clone());
            let node = self.nodes.get_or_insert(&entry.id);
            changed |= node.update_routing(&remote, entry.version, &entry.neighbors);
        }

        let Some(details) = self.peers.get_mut(&remote) else {
            return;
        };
        details.advertised.extend(received.iter().cloned());
        let missing: Vec<NodeId> = details
            .requested
            .iter()
            .filter(|id| !received.contains(*id))
            .cloned()
            .collect();
        details.requested.clear();
        for id in &missing {
            details.advertised.remove(id);
        }
        for id in missing {
            if self.peers.contains_key(&id) {
                continue;
            }
            if let Some(node) = self.nodes.get_mut(&id) {
                changed |= node.remove_routing(&remote);
            }
        }

        if changed {
            self.routing.mark_dirty();
            self.schedule_broadcast();
        }
    }

    /// Rebuild the self node's edges from the current peer set, bumping the
    /// version when it differs.
    fn rebuild_self_edges(&mut self) {
        let mut edges: Vec<(NodeId, u64)> = self
            .peers
            .iter()
            .map(|(id, details)| (id.clone(), details.latency))
            .collect();
        edges.sort();
        if self.nodes.rebuild_self(edges) {
            self.routing.mark_dirty();
            self.schedule_broadcast();
        }
    }

    fn schedule_broadcast(&mut self) {
        if self.endpoint {
            // endpoints consume gossip but never produce it
            return;
        }
        if self.broadcast_at.is_none() {
            self.broadcast_at = Some(time::Instant::now() + BROADCAST_COALESCE);
        }
    }

    fn broadcast(&mut self) {
        let frame = WireFrame::NodeSummary {
            own_version: self.nodes.our_version(),
            nodes: self.nodes.summary_entries(),
        };
        for details in self.peers.values() {
            let _ = details.frame_tx.send(frame.clone());
        }
    }

    fn refresh_routing(&mut self) {
        let (available, unavailable) = self.routing.refresh(&self.nodes);
        for id in unavailable {
            let _ = self.event_tx.send(NetworkEvent::NodeUnavailable { id });
        }
        for id in available {
            let _ = self.event_tx.send(NetworkEvent::NodeAvailable { id });
        }
    }

    fn render_diagnostics(&self) -> String {
        let mut printout = String::new();
        printout.push_str(&format!("our id: {}\r\n", self.nodes.our_id()));
        printout.push_str(&format!(
            "we have connections with {} peers:\r\n",
            self.peers.len()
        ));
        for (id, details) in &self.peers {
            printout.push_str(&format!(
                "    {id}, latency {}ms, advertising {} nodes\r\n",
                details.latency,
                details.advertised.len()
            ));
        }
        printout.push_str(&format!(
            "we know {} nodes:\r\n",
            self.nodes.iter().count()
        ));
        for node in self.nodes.iter() {
            printout.push_str(&format!(
                "    {} v{} direct={} edges={}\r\n",
                node.id,
                node.version,
                node.direct,
                node.outgoing.len()
            ));
        }
        for (id, route) in self.routing.reachable() {
            printout.push_str(&format!(
                "    route to {id} via {} ({}ms)\r\n",
                route.first_hop, route.latency
            ));
        }
        printout.push_str(&format!(
            "{} sends awaiting ack\r\n",
            self.pending.outstanding()
        ));
        printout
    }
}

/// Pending-or-never sleep for the coalescing timer. The deadline is
/// absolute, so re-polling across loop iterations does not stretch it.
async fn sleep_until_opt(deadline: Option<time::Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
