//! Peer-to-peer mesh overlay engine. Nodes connect over pluggable framed
//! transports, negotiate version, capabilities and authentication per link,
//! gossip their view of the mesh, and deliver application messages to any
//! node by multi-hop shortest-path routing.
//!
//! The embedding application supplies transports (any source of
//! [`TransportLink`]s) and drains two channels: network events and terminal
//! printouts.

pub mod auth;
pub mod failure;
pub mod mock;
mod peer;
pub mod request_reply;
mod topology;
pub mod types;
pub mod utils;

pub use types::{
    DeliveryError, DisconnectReason, LinkSecurity, LinkSide, NetworkEvent, NetworkEventReceiver,
    NetworkOptions, NoLatency, NodeId, TransportLink, WireFrame,
};

use crate::auth::AuthRegistry;
use crate::peer::PeerConfig;
use crate::topology::Topology;
use crate::types::{Command, PeerEventSender};
use crate::utils::PrintSender;
use tokio::sync::{mpsc, oneshot};

/// Handle to one node of the mesh. Spawns the orchestrator task; dropping
/// the handle (or calling [`Network::shutdown`]) winds the node down,
/// saying Bye on every active link.
pub struct Network {
    our: NodeId,
    peer_config: PeerConfig,
    peer_event_tx: PeerEventSender,
    cmd_tx: mpsc::UnboundedSender<Command>,
    print_tx: PrintSender,
    handle: tokio::task::JoinHandle<()>,
}

impl Network {
    /// Bring a node online. Returns the handle and the stream of
    /// [`NetworkEvent`]s: node availability and delivered messages.
    pub fn spawn(options: NetworkOptions, print_tx: PrintSender) -> (Network, NetworkEventReceiver) {
        let our = options.id.clone().unwrap_or_else(NodeId::random);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (peer_event_tx, peer_event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let topology = Topology::new(
            our.clone(),
            options.endpoint,
            options.request_timeout,
            event_tx,
            print_tx.clone(),
        );
        let handle = tokio::spawn(topology.run(peer_event_rx, cmd_rx));
        let peer_config = PeerConfig {
            our: our.clone(),
            registry: AuthRegistry::new(options.providers),
            negotiation_timeout: options.negotiation_timeout,
            ping_interval: options.ping_interval,
            ping_check_interval: options.ping_check_interval,
            failure_threshold: options.failure_threshold,
        };
        (
            Network {
                our,
                peer_config,
                peer_event_tx,
                cmd_tx,
                print_tx,
                handle,
            },
            event_rx,
        )
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our
    }

    /// Hand a freshly connected transport link to the engine. The link gets
    /// its own peer task which negotiates it up to Active; only then does
    /// the node show up in routing.
    pub fn attach(&self, link: TransportLink, side: LinkSide) {
        peer::spawn_peer(
            self.peer_config.clone(),
            side,
            link,
            self.peer_event_tx.clone(),
            self.print_tx.clone(),
        );
    }

    /// Deliver a payload to any reachable node. Resolves once the target
    /// acknowledged, rejects with a [`DeliveryError`] otherwise.
    pub async fn send(
        &self,
        target: &NodeId,
        kind: &str,
        payload: Vec<u8>,
    ) -> Result<(), DeliveryError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Send {
                target: target.clone(),
                kind: kind.to_string(),
                payload,
                done: done_tx,
            })
            .is_err()
        {
            return Err(DeliveryError::NoRoute);
        }
        done_rx.await.unwrap_or(Err(DeliveryError::NoRoute))
    }

    /// Human-readable dump of peers, known nodes and routes.
    pub async fn diagnostics(&self) -> Option<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Diagnostics { reply: reply_tx })
            .ok()?;
        reply_rx.await.ok()
    }

    /// Wind the node down and wait for the orchestrator to finish.
    pub async fn shutdown(self) {
        drop(self.cmd_tx);
        let _ = self.handle.await;
    }
}
