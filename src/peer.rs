use crate::auth::{
    AuthContext, AuthProvider, AuthRegistry, ClientAuthFlow, ClientAuthReply, ServerAuthFlow,
    ServerAuthReply,
};
use crate::failure::FailureDetector;
use crate::types::{
    ConnId, DisconnectReason, LinkSecurity, LinkSide, NoLatency, NodeId, PeerEvent,
    PeerEventSender, TransportLink, WireFrame,
};
use crate::utils::{self, print_debug, PrintSender};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{self, MissedTickBehavior};

/// Bounded window of round-trip samples; the oldest is evicted.
const LATENCY_SAMPLE_COUNT: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PeerState {
    Initial,
    WaitingForHello,
    WaitingForSelect,
    WaitingForSelectAck,
    WaitingForAuth,
    WaitingForAuthAck,
    WaitingForAuthData,
    WaitingForBegin,
    Active,
}

pub(crate) struct LatencySamples {
    samples: VecDeque<u64>,
}

impl LatencySamples {
    pub(crate) fn new() -> Self {
        LatencySamples {
            samples: VecDeque::with_capacity(LATENCY_SAMPLE_COUNT),
        }
    }

    pub(crate) fn record(&mut self, ms: u64) {
        if self.samples.len() == LATENCY_SAMPLE_COUNT {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    /// Integer mean of the recorded samples.
    pub(crate) fn average(&self) -> Result<u64, NoLatency> {
        if self.samples.is_empty() {
            return Err(NoLatency);
        }
        Ok(self.samples.iter().sum::<u64>() / self.samples.len() as u64)
    }
}

/// A round trip never weighs zero: sub-millisecond measurements clamp to 1.
fn elapsed_ms(since: Instant) -> u64 {
    (since.elapsed().as_millis() as u64).max(1)
}

#[derive(Clone)]
pub(crate) struct PeerConfig {
    pub our: NodeId,
    pub registry: AuthRegistry,
    pub negotiation_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_check_interval: Duration,
    pub failure_threshold: f64,
}

/// Spawn the task that owns one link: drives negotiation, then keeps the
/// peer alive with pings until something disconnects it. All state machine
/// steps happen on this task, so they are serialized per link.
///
/// Returns the connection id the task will tag its events with.
pub(crate) fn spawn_peer(
    config: PeerConfig,
    side: LinkSide,
    link: TransportLink,
    events: PeerEventSender,
    print_tx: PrintSender,
) -> ConnId {
    let conn = utils::conn_id();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let detector = FailureDetector::new(config.ping_interval, config.failure_threshold);
    let peer = Peer {
        conn,
        side,
        state: PeerState::Initial,
        remote_id: NodeId::unknown(),
        latency: LatencySamples::new(),
        latency_clock: None,
        security: link.security,
        provider_queue: VecDeque::new(),
        client_flow: None,
        server_flow: None,
        detector,
        wire_tx: link.frame_tx,
        events,
        print_tx,
        config,
    };
    tokio::spawn(peer.run(link.frame_rx, out_tx, out_rx));
    conn
}

struct Peer {
    conn: ConnId,
    side: LinkSide,
    state: PeerState,
    remote_id: NodeId,
    latency: LatencySamples,
    latency_clock: Option<Instant>,
    security: LinkSecurity,
    provider_queue: VecDeque<Arc<dyn AuthProvider>>,
    client_flow: Option<Box<dyn ClientAuthFlow>>,
    server_flow: Option<Box<dyn ServerAuthFlow>>,
    detector: FailureDetector,
    wire_tx: UnboundedSender<WireFrame>,
    events: PeerEventSender,
    print_tx: PrintSender,
    config: PeerConfig,
}

impl Peer {
    async fn run(
        mut self,
        mut frame_rx: UnboundedReceiver<WireFrame>,
        out_tx: UnboundedSender<WireFrame>,
        mut out_rx: UnboundedReceiver<WireFrame>,
    ) {
        let reason = match self.negotiate(&mut frame_rx).await {
            Ok(()) => {
                // hand our outbound channel to the orchestrator; from here on
                // it owns routing traffic onto this link
                let _ = self.events.send(PeerEvent::Connected {
                    conn: self.conn,
                    remote: self.remote_id.clone(),
                    frame_tx: out_tx,
                    latency: self.latency.average().ok(),
                });
                // Begin goes out after the transition: we are connected even
                // if it never arrives
                if self.side == LinkSide::Client {
                    if self.send(WireFrame::Begin).is_err() {
                        print_debug(&self.print_tx, "peer: failed to send Begin");
                    }
                }
                self.active_loop(&mut frame_rx, &mut out_rx).await
            }
            Err(reason) => reason,
        };
        if let Some(mut flow) = self.server_flow.take() {
            flow.destroy().await;
        }
        print_debug(
            &self.print_tx,
            &format!("peer: {} disconnected: {}", self.remote_id, reason),
        );
        let _ = self.events.send(PeerEvent::Disconnected {
            conn: self.conn,
            remote: self.remote_id.clone(),
            reason,
        });
    }

    /// Drive the link from raw to Active. The deadline is rearmed on every
    /// received negotiation frame and dropped on success.
    async fn negotiate(
        &mut self,
        frame_rx: &mut UnboundedReceiver<WireFrame>,
    ) -> Result<(), DisconnectReason> {
        match self.side {
            LinkSide::Server => {
                self.send(WireFrame::Hello {
                    id: self.config.our.clone(),
                    capabilities: HashSet::new(),
                })?;
                self.state = PeerState::WaitingForSelect;
            }
            LinkSide::Client => {
                self.state = PeerState::WaitingForHello;
                self.latency_clock = Some(Instant::now());
            }
        }
        let deadline = time::sleep(self.config.negotiation_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else {
                        return Err(DisconnectReason::TransportError);
                    };
                    if self.handle_negotiation_frame(frame).await? {
                        return Ok(());
                    }
                    deadline
                        .as_mut()
                        .reset(time::Instant::now() + self.config.negotiation_timeout);
                }
                _ = &mut deadline => {
                    print_debug(&self.print_tx, "peer: negotiation timed out");
                    return Err(DisconnectReason::NegotiationFailed);
                }
            }
        }
    }

    /// One negotiation step. Returns true when the peer became Active.
    /// Any frame not expected in the current state aborts the link.
    async fn handle_negotiation_frame(
        &mut self,
        frame: WireFrame,
    ) -> Result<bool, DisconnectReason> {
        match (self.state, frame) {
            (PeerState::WaitingForHello, WireFrame::Hello { id, .. }) => {
                if id == self.config.our {
                    print_debug(&self.print_tx, "peer: rejecting link to self");
                    return Err(DisconnectReason::NegotiationFailed);
                }
                self.remote_id = id;
                if let Some(clock) = self.latency_clock.take() {
                    self.latency.record(elapsed_ms(clock));
                }
                self.send(WireFrame::Select {
                    id: self.config.our.clone(),
                    capabilities: HashSet::new(),
                })?;
                self.latency_clock = Some(Instant::now());
                self.state = PeerState::WaitingForSelectAck;
                Ok(false)
            }
            (PeerState::WaitingForSelect, WireFrame::Select { id, .. }) => {
                if id == self.config.our {
                    print_debug(&self.print_tx, "peer: rejecting link to self");
                    return Err(DisconnectReason::NegotiationFailed);
                }
                // capability intersection is currently a no-op; the sets
                // ride the wire for forward compatibility
                self.remote_id = id;
                self.send(WireFrame::Ok)?;
                self.state = PeerState::WaitingForAuth;
                Ok(false)
            }
            (PeerState::WaitingForSelectAck, WireFrame::Ok) => {
                if let Some(clock) = self.latency_clock.take() {
                    self.latency.record(elapsed_ms(clock));
                }
                self.provider_queue = self
                    .config
                    .registry
                    .providers()
                    .iter()
                    .cloned()
                    .collect();
                self.state = PeerState::WaitingForAuthAck;
                self.advance_client_auth().await?;
                Ok(false)
            }
            (PeerState::WaitingForSelectAck, WireFrame::Reject) => {
                Err(DisconnectReason::NegotiationFailed)
            }
            (PeerState::WaitingForAuth, WireFrame::Auth { method, data }) => {
                let flow = self
                    .config
                    .registry
                    .get_provider(&method)
                    .and_then(|p| p.create_server_flow(&self.auth_context()));
                let Some(mut flow) = flow else {
                    print_debug(
                        &self.print_tx,
                        &format!("peer: no server flow for auth method {method}"),
                    );
                    self.send(WireFrame::Reject)?;
                    return Ok(false);
                };
                let reply = flow.receive_initial(&data).await;
                self.server_flow = Some(flow);
                self.handle_server_reply(reply).await?;
                Ok(false)
            }
            (PeerState::WaitingForAuthData, WireFrame::AuthData { data }) => {
                let Some(flow) = self.server_flow.as_mut() else {
                    return Err(DisconnectReason::NegotiationFailed);
                };
                let reply = flow.receive_data(&data).await;
                self.handle_server_reply(reply).await?;
                Ok(false)
            }
            (PeerState::WaitingForAuthAck, WireFrame::AuthData { data }) => {
                let Some(flow) = self.client_flow.as_mut() else {
                    return Err(DisconnectReason::NegotiationFailed);
                };
                match flow.receive_data(&data).await {
                    Ok(ClientAuthReply::Data(data)) => {
                        self.send(WireFrame::AuthData { data })?;
                    }
                    Ok(ClientAuthReply::Reject) | Err(_) => {
                        self.advance_client_auth().await?;
                    }
                }
                Ok(false)
            }
            (PeerState::WaitingForAuthAck, WireFrame::Ok) => {
                self.client_flow = None;
                self.state = PeerState::Active;
                Ok(true)
            }
            (PeerState::WaitingForAuthAck, WireFrame::Reject) => {
                self.advance_client_auth().await?;
                Ok(false)
            }
            (PeerState::WaitingForBegin, WireFrame::Begin) => {
                self.state = PeerState::Active;
                Ok(true)
            }
            (_, WireFrame::Bye) => Err(DisconnectReason::Manual),
            (state, frame) => {
                print_debug(
                    &self.print_tx,
                    &format!("peer: unexpected {frame:?} in {state:?}"),
                );
                Err(DisconnectReason::NegotiationFailed)
            }
        }
    }

    fn auth_context(&self) -> AuthContext {
        AuthContext {
            local_public_security: self.security.local_public_security.clone(),
            remote_public_security: self.security.remote_public_security.clone(),
        }
    }

    /// Act on a server-side auth flow reply.
    async fn handle_server_reply(
        &mut self,
        reply: anyhow::Result<ServerAuthReply>,
    ) -> Result<(), DisconnectReason> {
        match reply {
            Ok(ServerAuthReply::Ok) => {
                if let Some(mut flow) = self.server_flow.take() {
                    flow.destroy().await;
                }
                self.send(WireFrame::Ok)?;
                self.state = PeerState::WaitingForBegin;
                Ok(())
            }
            Ok(ServerAuthReply::Reject) | Err(_) => {
                if let Some(mut flow) = self.server_flow.take() {
                    flow.destroy().await;
                }
                self.send(WireFrame::Reject)?;
                self.state = PeerState::WaitingForAuth;
                Ok(())
            }
            Ok(ServerAuthReply::Data(data)) => {
                if data.is_empty() {
                    // a server flow must never answer with empty data
                    if let Some(mut flow) = self.server_flow.take() {
                        flow.destroy().await;
                    }
                    return Err(DisconnectReason::NegotiationFailed);
                }
                self.send(WireFrame::AuthData { data })?;
                self.state = PeerState::WaitingForAuthData;
                Ok(())
            }
        }
    }

    /// Rotate to the next configured provider that can act as a client and
    /// open an attempt with it. Exhausting the queue aborts the link.
    async fn advance_client_auth(&mut self) -> Result<(), DisconnectReason> {
        self.client_flow = None;
        let ctx = self.auth_context();
        while let Some(provider) = self.provider_queue.pop_front() {
            let Some(mut flow) = provider.create_client_flow(&ctx) else {
                continue;
            };
            match flow.initial_message().await {
                Ok(data) => {
                    self.send(WireFrame::Auth {
                        method: provider.id().to_string(),
                        data,
                    })?;
                    self.client_flow = Some(flow);
                    return Ok(());
                }
                Err(e) => {
                    print_debug(
                        &self.print_tx,
                        &format!("peer: auth provider {} failed to open: {e}", provider.id()),
                    );
                }
            }
        }
        Err(DisconnectReason::AuthReject)
    }

    /// Post-negotiation loop: pings on a period, failure checks on another,
    /// routing and data frames forwarded to the orchestrator. Exiting the
    /// loop drops both timers on every path.
    async fn active_loop(
        &mut self,
        frame_rx: &mut UnboundedReceiver<WireFrame>,
        out_rx: &mut UnboundedReceiver<WireFrame>,
    ) -> DisconnectReason {
        let mut ping = time::interval(self.config.ping_interval);
        let mut check = time::interval(self.config.ping_check_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // open the silence window so a peer that never pings eventually fails
        self.detector.heartbeat();
        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else {
                        return DisconnectReason::TransportError;
                    };
                    match frame {
                        WireFrame::Ping => {
                            self.detector.heartbeat();
                            if self.send(WireFrame::Pong).is_err() {
                                print_debug(&self.print_tx, "peer: failed to send Pong");
                            }
                        }
                        WireFrame::Pong => {
                            if let Some(clock) = self.latency_clock.take() {
                                self.latency.record(elapsed_ms(clock));
                                if let Ok(latency) = self.latency.average() {
                                    let _ = self.events.send(PeerEvent::Latency {
                                        conn: self.conn,
                                        remote: self.remote_id.clone(),
                                        latency,
                                    });
                                }
                            }
                        }
                        WireFrame::Bye => return DisconnectReason::Manual,
                        WireFrame::NodeSummary { .. }
                        | WireFrame::NodeRequest { .. }
                        | WireFrame::NodeDetails { .. }
                        | WireFrame::Data { .. }
                        | WireFrame::DataAck { .. }
                        | WireFrame::DataReject { .. } => {
                            let _ = self.events.send(PeerEvent::Frame {
                                conn: self.conn,
                                remote: self.remote_id.clone(),
                                frame,
                            });
                        }
                        other => {
                            print_debug(
                                &self.print_tx,
                                &format!("peer: unexpected {other:?} while active"),
                            );
                            return DisconnectReason::NegotiationFailed;
                        }
                    }
                }
                out = out_rx.recv() => {
                    match out {
                        Some(frame) => {
                            // active-phase send failures are not fatal; the
                            // transport will report its own disconnect
                            if self.send(frame).is_err() {
                                print_debug(&self.print_tx, "peer: send failed on active link");
                            }
                        }
                        None => {
                            // the orchestrator dropped us: say goodbye, close
                            let _ = self.send(WireFrame::Bye);
                            return DisconnectReason::Manual;
                        }
                    }
                }
                _ = ping.tick() => {
                    self.latency_clock = Some(Instant::now());
                    if self.send(WireFrame::Ping).is_err() {
                        print_debug(&self.print_tx, "peer: failed to send Ping");
                    }
                }
                _ = check.tick() => {
                    if self.detector.check_failure() {
                        return DisconnectReason::PingTimeout;
                    }
                }
            }
        }
    }

    fn send(&self, frame: WireFrame) -> Result<(), DisconnectReason> {
        self.wire_tx
            .send(frame)
            .map_err(|_| DisconnectReason::TransportError)
    }
}
