use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use weft::auth::{AnonymousAuth, AuthContext, AuthProvider, ClientAuthFlow, ClientAuthReply};
use weft::mock;
use weft::types::SummaryEntry;
use weft::utils::print_channel;
use weft::{
    DeliveryError, LinkSide, Network, NetworkEvent, NetworkEventReceiver, NetworkOptions, NodeId,
    TransportLink, WireFrame,
};

const WAIT: Duration = Duration::from_secs(10);

fn options(id: NodeId) -> NetworkOptions {
    NetworkOptions {
        id: Some(id),
        ..NetworkOptions::default()
    }
}

fn spawn(opts: NetworkOptions) -> (Network, NetworkEventReceiver) {
    let (print_tx, _print_rx) = print_channel();
    Network::spawn(opts, print_tx)
}

/// Wire two nodes together over an in-memory link.
fn connect(client: &Network, server: &Network) {
    let (client_link, server_link) = mock::link_pair();
    client.attach(client_link, LinkSide::Client);
    server.attach(server_link, LinkSide::Server);
}

async fn wait_for(
    events: &mut NetworkEventReceiver,
    mut pred: impl FnMut(&NetworkEvent) -> bool,
) -> NetworkEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_available(events: &mut NetworkEventReceiver, node: &NodeId) {
    wait_for(events, |ev| {
        matches!(ev, NetworkEvent::NodeAvailable { id } if id == node)
    })
    .await;
}

/// Wait until every listed node has been announced available, in any order.
async fn wait_available_all(events: &mut NetworkEventReceiver, nodes: &[&NodeId]) {
    let mut seen: HashSet<NodeId> = HashSet::new();
    while !nodes.iter().all(|n| seen.contains(*n)) {
        if let NetworkEvent::NodeAvailable { id } =
            wait_for(events, |ev| matches!(ev, NetworkEvent::NodeAvailable { .. })).await
        {
            seen.insert(id);
        }
    }
}

/// Receive the next frame, transparently answering keepalives.
async fn next_frame(link: &mut TransportLink) -> WireFrame {
    timeout(WAIT, async {
        loop {
            let frame = link.frame_rx.recv().await.expect("link closed");
            match frame {
                WireFrame::Ping => {
                    link.frame_tx.send(WireFrame::Pong).unwrap();
                }
                WireFrame::Pong => {}
                other => return other,
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

/// Like [`next_frame`], also discarding gossip frames.
async fn next_non_gossip(link: &mut TransportLink) -> WireFrame {
    loop {
        match next_frame(link).await {
            WireFrame::NodeSummary { .. }
            | WireFrame::NodeRequest { .. }
            | WireFrame::NodeDetails { .. } => continue,
            other => return other,
        }
    }
}

/// Hand-drive the server side of a negotiation against a real client peer,
/// accepting whatever auth method the client opens with.
async fn fake_server_handshake(link: &mut TransportLink, fake_id: &NodeId) {
    link.frame_tx
        .send(WireFrame::Hello {
            id: fake_id.clone(),
            capabilities: HashSet::new(),
        })
        .unwrap();
    match next_frame(link).await {
        WireFrame::Select { .. } => {}
        other => panic!("expected Select, got {other:?}"),
    }
    link.frame_tx.send(WireFrame::Ok).unwrap();
    match next_frame(link).await {
        WireFrame::Auth { .. } => {}
        other => panic!("expected Auth, got {other:?}"),
    }
    link.frame_tx.send(WireFrame::Ok).unwrap();
    match next_frame(link).await {
        WireFrame::Begin => {}
        other => panic!("expected Begin, got {other:?}"),
    }
}

#[tokio::test]
async fn two_node_direct_exchange() {
    let a_id = NodeId::from_bytes(*b"aa");
    let b_id = NodeId::from_bytes(*b"bb");
    let mut opts_a = options(a_id.clone());
    let mut opts_b = options(b_id.clone());
    // fast pings so both sides collect latency samples during the test
    opts_a.ping_interval = Duration::from_millis(100);
    opts_b.ping_interval = Duration::from_millis(100);
    let (a, mut a_events) = spawn(opts_a);
    let (b, mut b_events) = spawn(opts_b);
    connect(&a, &b);

    wait_available(&mut a_events, &b_id).await;
    wait_available(&mut b_events, &a_id).await;

    a.send(&b_id, "hi", vec![0x01, 0x02]).await.unwrap();
    let delivered = wait_for(&mut b_events, |ev| {
        matches!(ev, NetworkEvent::Message { .. })
    })
    .await;
    assert_eq!(
        delivered,
        NetworkEvent::Message {
            source: a_id,
            kind: "hi".into(),
            payload: vec![0x01, 0x02],
        }
    );

    // a couple of ping round trips in, both sides report a positive latency
    tokio::time::sleep(Duration::from_millis(300)).await;
    for network in [&a, &b] {
        let diag = network.diagnostics().await.unwrap();
        let (_, rest) = diag.split_once("latency ").expect("peer line in diagnostics");
        let (ms, _) = rest.split_once("ms").expect("latency in diagnostics");
        assert!(ms.parse::<u64>().unwrap() >= 1);
    }
}

#[tokio::test]
async fn three_node_line_forwards_with_recorded_path() {
    let a_id = NodeId::from_bytes(*b"aa");
    let b_id = NodeId::from_bytes(*b"bb");
    let c_id = NodeId::from_bytes(*b"cc");
    let (a, mut a_events) = spawn(options(a_id.clone()));
    let (b, mut b_events) = spawn(options(b_id.clone()));
    connect(&a, &b);
    wait_available(&mut b_events, &a_id).await;

    // node c is played by hand so the test can observe the wire
    let (b_side, mut c_link) = mock::link_pair();
    b.attach(b_side, LinkSide::Client);
    fake_server_handshake(&mut c_link, &c_id).await;

    // gossip converges: a learns that c hangs off b
    wait_available(&mut a_events, &c_id).await;

    let a_for_send = a_id.clone();
    let send_task = tokio::spawn(async move {
        let result = a.send(&c_id, "t", vec![0xff]).await;
        (a, result)
    });

    let (id, source, path) = loop {
        match next_non_gossip(&mut c_link).await {
            WireFrame::Data {
                source,
                id,
                kind,
                path,
                payload,
                ..
            } => {
                assert_eq!(kind, "t");
                assert_eq!(payload, vec![0xff]);
                break (id, source, path);
            }
            other => panic!("expected Data at c, got {other:?}"),
        }
    };
    assert_eq!(source, a_for_send);
    // the path records every hop the payload took: a, then b
    assert_eq!(path, vec![a_for_send, b_id]);

    // acknowledge back along the path; the sender's future resolves
    c_link
        .frame_tx
        .send(WireFrame::DataAck {
            id,
            target: source,
            path,
        })
        .unwrap();
    let (_a, result) = send_task.await.unwrap();
    assert_eq!(result, Ok(()));
}

#[tokio::test]
async fn injected_loop_is_rejected() {
    let n_id = NodeId::from_bytes(*b"nn");
    let fake_id = NodeId::from_bytes(*b"ff");
    let (n, _n_events) = spawn(options(n_id.clone()));
    let (n_side, mut link) = mock::link_pair();
    n.attach(n_side, LinkSide::Client);
    fake_server_handshake(&mut link, &fake_id).await;

    let distant = NodeId::from_bytes(*b"zz");
    let source = NodeId::from_bytes(*b"xx");
    link.frame_tx
        .send(WireFrame::Data {
            source: source.clone(),
            target: distant,
            id: 5,
            kind: "t".into(),
            path: vec![source.clone(), n_id, NodeId::from_bytes(*b"yy")],
            payload: vec![],
        })
        .unwrap();
    match next_non_gossip(&mut link).await {
        WireFrame::DataReject { id, target, code, .. } => {
            assert_eq!(id, 5);
            assert_eq!(target, source);
            assert_eq!(code, weft::types::RejectCode::Loop);
        }
        other => panic!("expected loop reject, got {other:?}"),
    }
}

/// A method the servers in these tests do not support: rotation fodder.
struct UnsupportedAuth;

impl AuthProvider for UnsupportedAuth {
    fn id(&self) -> &str {
        "p1"
    }

    fn create_client_flow(&self, _ctx: &AuthContext) -> Option<Box<dyn ClientAuthFlow>> {
        Some(Box::new(UnsupportedClientFlow))
    }
}

struct UnsupportedClientFlow;

#[async_trait]
impl ClientAuthFlow for UnsupportedClientFlow {
    async fn initial_message(&mut self) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn receive_data(&mut self, _data: &[u8]) -> anyhow::Result<ClientAuthReply> {
        Ok(ClientAuthReply::Reject)
    }
}

#[tokio::test]
async fn client_rotates_to_second_auth_provider() {
    let a_id = NodeId::from_bytes(*b"aa");
    let b_id = NodeId::from_bytes(*b"bb");
    let mut opts_a = options(a_id.clone());
    opts_a.providers = vec![Arc::new(UnsupportedAuth), Arc::new(AnonymousAuth)];
    let (a, mut a_events) = spawn(opts_a);
    let (b, mut b_events) = spawn(options(b_id.clone()));
    connect(&a, &b);

    // the first Auth (p1) gets Rejected, the second (anonymous) goes through
    wait_available(&mut a_events, &b_id).await;
    wait_available(&mut b_events, &a_id).await;
}

#[tokio::test]
async fn diamond_reroutes_around_lost_node() {
    let a_id = NodeId::from_bytes(*b"aa");
    let b_id = NodeId::from_bytes(*b"bb");
    let c_id = NodeId::from_bytes(*b"cc");
    let d_id = NodeId::from_bytes(*b"dd");
    let (a, mut a_events) = spawn(options(a_id.clone()));
    let (b, _b_events) = spawn(options(b_id.clone()));
    let (c, _c_events) = spawn(options(c_id.clone()));
    let (d, _d_events) = spawn(options(d_id.clone()));
    connect(&a, &b);
    connect(&a, &c);
    connect(&b, &d);
    connect(&c, &d);

    wait_available_all(&mut a_events, &[&b_id, &c_id, &d_id]).await;

    b.shutdown().await;
    wait_for(&mut a_events, |ev| {
        matches!(ev, NetworkEvent::NodeUnavailable { id } if *id == b_id)
    })
    .await;

    // d never went away: the c leg carries the traffic now
    a.send(&d_id, "t", vec![7]).await.unwrap();
    while let Ok(event) = a_events.try_recv() {
        assert!(
            !matches!(&event, NetworkEvent::NodeUnavailable { id } if *id == d_id),
            "d should have stayed reachable through c"
        );
    }

    a.shutdown().await;
    c.shutdown().await;
    d.shutdown().await;
}

#[tokio::test]
async fn send_without_route_rejects() {
    let (a, _a_events) = spawn(options(NodeId::from_bytes(*b"aa")));
    let nowhere = NodeId::from_bytes(*b"zz");
    assert_eq!(
        a.send(&nowhere, "t", vec![]).await,
        Err(DeliveryError::NoRoute)
    );
}

#[tokio::test]
async fn unacked_send_times_out_with_timed_out() {
    let n_id = NodeId::from_bytes(*b"nn");
    let fake_id = NodeId::from_bytes(*b"ff");
    let mut opts = options(n_id.clone());
    opts.request_timeout = Duration::from_millis(300);
    let (n, _n_events) = spawn(opts);
    let (n_side, mut link) = mock::link_pair();
    n.attach(n_side, LinkSide::Client);
    fake_server_handshake(&mut link, &fake_id).await;

    // the fake peer swallows the message and never acks
    let start = std::time::Instant::now();
    let result = n.send(&fake_id, "t", vec![1]).await;
    let elapsed = start.elapsed();
    assert_eq!(result, Err(DeliveryError::Timeout));
    assert_eq!(result.unwrap_err().to_string(), "Timed out");
    assert!(elapsed >= Duration::from_millis(250));
    assert!(elapsed < Duration::from_millis(1000));
}

#[tokio::test]
async fn endpoint_consumes_gossip_but_never_broadcasts() {
    let e_id = NodeId::from_bytes(*b"ee");
    let fake_id = NodeId::from_bytes(*b"ff");
    let far_id = NodeId::from_bytes(*b"gg");
    let mut opts = options(e_id.clone());
    opts.endpoint = true;
    let (endpoint, mut e_events) = spawn(opts);
    let (e_side, mut link) = mock::link_pair();
    endpoint.attach(e_side, LinkSide::Client);
    fake_server_handshake(&mut link, &fake_id).await;

    // feed the endpoint a summary; it pulls details like anyone else
    link.frame_tx
        .send(WireFrame::NodeSummary {
            own_version: 1,
            nodes: vec![SummaryEntry {
                id: far_id.clone(),
                version: 1,
            }],
        })
        .unwrap();
    match next_frame(&mut link).await {
        WireFrame::NodeRequest { nodes } => assert!(nodes.contains(&far_id)),
        other => panic!("expected NodeRequest from endpoint, got {other:?}"),
    }
    link.frame_tx
        .send(WireFrame::NodeDetails {
            nodes: vec![
                weft::types::DetailsEntry {
                    id: fake_id.clone(),
                    version: 1,
                    neighbors: vec![
                        weft::types::Neighbor {
                            id: e_id.clone(),
                            latency: 1,
                        },
                        weft::types::Neighbor {
                            id: far_id.clone(),
                            latency: 5,
                        },
                    ],
                },
                weft::types::DetailsEntry {
                    id: far_id.clone(),
                    version: 1,
                    neighbors: vec![weft::types::Neighbor {
                        id: fake_id.clone(),
                        latency: 5,
                    }],
                },
            ],
        })
        .unwrap();
    // the endpoint's own routing works off the consumed gossip
    wait_available(&mut e_events, &far_id).await;

    // but no summary ever leaves it, no matter how much changes
    let quiet = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            match link.frame_rx.recv().await {
                Some(WireFrame::NodeSummary { .. }) => return false,
                Some(WireFrame::Ping) => {
                    link.frame_tx.send(WireFrame::Pong).ok();
                }
                Some(_) => {}
                None => return true,
            }
        }
    })
    .await;
    assert!(
        matches!(quiet, Err(_) | Ok(true)),
        "endpoint must not broadcast summaries"
    );
}
