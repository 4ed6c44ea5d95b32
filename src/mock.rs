use crate::types::{LinkSecurity, TransportLink, WireFrame};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// In-memory transport: the degenerate machine-local link. Each direction
/// still round-trips every frame through the MessagePack codec, so tests
/// exercise the same encode/decode path a socket transport would.
pub fn link_pair() -> (TransportLink, TransportLink) {
    link_pair_with_security(LinkSecurity::default(), LinkSecurity::default())
}

/// Link pair with channel-binding material, for exercising auth providers
/// that bind to the transport channel.
pub fn link_pair_with_security(
    a_security: LinkSecurity,
    b_security: LinkSecurity,
) -> (TransportLink, TransportLink) {
    let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
    let (a_in_tx, a_in_rx) = mpsc::unbounded_channel();
    let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
    let (b_in_tx, b_in_rx) = mpsc::unbounded_channel();
    tokio::spawn(pump(a_out_rx, b_in_tx));
    tokio::spawn(pump(b_out_rx, a_in_tx));
    (
        TransportLink {
            frame_tx: a_out_tx,
            frame_rx: a_in_rx,
            security: a_security,
        },
        TransportLink {
            frame_tx: b_out_tx,
            frame_rx: b_in_rx,
            security: b_security,
        },
    )
}

async fn pump(mut rx: UnboundedReceiver<WireFrame>, tx: UnboundedSender<WireFrame>) {
    while let Some(frame) = rx.recv().await {
        let Ok(bytes) = rmp_serde::to_vec(&frame) else {
            break;
        };
        let Ok(frame) = rmp_serde::from_slice::<WireFrame>(&bytes) else {
            break;
        };
        if tx.send(frame).is_err() {
            break;
        }
    }
}
