use crate::auth::AuthProvider;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Opaque node identifier. Compared and hashed over the whole byte string;
/// the hex rendering exists only for terminal output.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Vec<u8>);

impl NodeId {
    /// The distinguished "unknown" id: empty bytes. A peer's remote id holds
    /// this value until the handshake reveals the real one.
    pub fn unknown() -> Self {
        NodeId(Vec::new())
    }

    pub fn is_unknown(&self) -> bool {
        self.0.is_empty()
    }

    /// Generate a fresh 16-byte random id for this session.
    pub fn random() -> Self {
        NodeId(rand::random::<[u8; 16]>().to_vec())
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        NodeId(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_unknown() {
            write!(f, "<unknown>")
        } else {
            write!(f, "{}", hex::encode(&self.0))
        }
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

/// One entry of a [`WireFrame::NodeSummary`]: a node the sender can route to,
/// with the version of its routing details.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub id: NodeId,
    pub version: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: NodeId,
    pub latency: u64,
}

/// One entry of a [`WireFrame::NodeDetails`]: the full outgoing edge set of
/// a node, as last observed by the sender.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetailsEntry {
    pub id: NodeId,
    pub version: u32,
    pub neighbors: Vec<Neighbor>,
}

/// Why a forwarded `Data` was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    NoRoute,
    Loop,
    Rejected,
}

/// Every frame that can cross a link. Transports move these as opaque typed
/// values; the bundled mock link and tests encode them with MessagePack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WireFrame {
    Hello {
        id: NodeId,
        capabilities: HashSet<String>,
    },
    Select {
        id: NodeId,
        capabilities: HashSet<String>,
    },
    Auth {
        method: String,
        data: Vec<u8>,
    },
    AuthData {
        data: Vec<u8>,
    },
    Ok,
    Reject,
    Begin,
    Ping,
    Pong,
    Bye,
    NodeSummary {
        own_version: u32,
        nodes: Vec<SummaryEntry>,
    },
    NodeRequest {
        nodes: Vec<NodeId>,
    },
    NodeDetails {
        nodes: Vec<DetailsEntry>,
    },
    Data {
        source: NodeId,
        target: NodeId,
        id: u32,
        kind: String,
        path: Vec<NodeId>,
        payload: Vec<u8>,
    },
    DataAck {
        id: u32,
        target: NodeId,
        path: Vec<NodeId>,
    },
    DataReject {
        id: u32,
        target: NodeId,
        path: Vec<NodeId>,
        code: RejectCode,
    },
}

/// Why a peer went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    Manual,
    NegotiationFailed,
    AuthReject,
    PingTimeout,
    TransportError,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Manual => write!(f, "manual disconnect"),
            DisconnectReason::NegotiationFailed => write!(f, "negotiation failed"),
            DisconnectReason::AuthReject => write!(f, "authentication rejected"),
            DisconnectReason::PingTimeout => write!(f, "ping timeout"),
            DisconnectReason::TransportError => write!(f, "transport error"),
        }
    }
}

/// Rejection surfaced to a `send()` caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("no route to target")]
    NoRoute,
    #[error("routing loop detected")]
    Loop,
    #[error("Timed out")]
    Timeout,
    #[error("peer rejected message")]
    PeerRejected,
}

impl From<RejectCode> for DeliveryError {
    fn from(code: RejectCode) -> Self {
        match code {
            RejectCode::NoRoute => DeliveryError::NoRoute,
            RejectCode::Loop => DeliveryError::Loop,
            RejectCode::Rejected => DeliveryError::PeerRejected,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("no latency samples recorded")]
pub struct NoLatency;

/// Events the overlay surfaces to the embedding application.
#[derive(Clone, Debug, PartialEq)]
pub enum NetworkEvent {
    NodeAvailable {
        id: NodeId,
    },
    NodeUnavailable {
        id: NodeId,
    },
    Message {
        source: NodeId,
        kind: String,
        payload: Vec<u8>,
    },
}

pub type NetworkEventSender = UnboundedSender<NetworkEvent>;
pub type NetworkEventReceiver = UnboundedReceiver<NetworkEvent>;

/// Which side of a link we are: the client initiated the connection, the
/// server accepted it. The two roles differ only in who says Hello first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkSide {
    Client,
    Server,
}

/// Channel-binding material a transport may supply for auth providers.
#[derive(Clone, Debug, Default)]
pub struct LinkSecurity {
    pub local_public_security: Option<Vec<u8>>,
    pub remote_public_security: Option<Vec<u8>>,
}

/// A connected bidirectional link, as handed to the engine by a transport.
/// The transport owns the socket and the wire encoding; the engine sees
/// ordered typed frames. Closing either channel is a disconnect.
pub struct TransportLink {
    pub frame_tx: UnboundedSender<WireFrame>,
    pub frame_rx: UnboundedReceiver<WireFrame>,
    pub security: LinkSecurity,
}

/// Engine tuning. The defaults match the protocol constants; tests shrink
/// the timers.
#[derive(Clone)]
pub struct NetworkOptions {
    /// This node's id. Generated randomly when not set.
    pub id: Option<NodeId>,
    /// Endpoints consume gossip but never broadcast and never forward.
    pub endpoint: bool,
    /// Ordered authentication providers. Client peers try them in order.
    pub providers: Vec<Arc<dyn AuthProvider>>,
    pub negotiation_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_check_interval: Duration,
    pub request_timeout: Duration,
    /// Failure probability at which a silent peer is declared dead.
    pub failure_threshold: f64,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        NetworkOptions {
            id: None,
            endpoint: false,
            providers: vec![Arc::new(crate::auth::AnonymousAuth)],
            negotiation_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            ping_check_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            failure_threshold: 0.98,
        }
    }
}

/// Internal connection identifier, random per attached link. Lets the
/// orchestrator tell two links to the same remote apart.
pub(crate) type ConnId = u64;

/// What a peer task reports up to the topology orchestrator.
pub(crate) enum PeerEvent {
    /// Negotiation completed; the link is usable. Carries the channel the
    /// orchestrator uses to push outbound frames to this link.
    Connected {
        conn: ConnId,
        remote: NodeId,
        frame_tx: UnboundedSender<WireFrame>,
        latency: Option<u64>,
    },
    /// A post-negotiation routing or data frame.
    Frame {
        conn: ConnId,
        remote: NodeId,
        frame: WireFrame,
    },
    /// A fresh latency average after a ping round trip.
    Latency {
        conn: ConnId,
        remote: NodeId,
        latency: u64,
    },
    /// The peer task exited. Sent exactly once, on every exit path.
    Disconnected {
        conn: ConnId,
        remote: NodeId,
        reason: DisconnectReason,
    },
}

pub(crate) type PeerEventSender = UnboundedSender<PeerEvent>;

/// Commands from the [`crate::Network`] handle to the orchestrator task.
pub(crate) enum Command {
    Send {
        target: NodeId,
        kind: String,
        payload: Vec<u8>,
        done: tokio::sync::oneshot::Sender<Result<(), DeliveryError>>,
    },
    Diagnostics {
        reply: tokio::sync::oneshot::Sender<String>,
    },
}
