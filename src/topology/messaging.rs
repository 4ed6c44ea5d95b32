use crate::topology::Topology;
use crate::types::{DeliveryError, NetworkEvent, NodeId, RejectCode, WireFrame};
use crate::utils::print_debug;
use tokio::sync::oneshot;

impl Topology {
    /// Application send: source-route toward the target's first hop. The
    /// completion resolves on the ack, or rejects on a reject frame or the
    /// request timeout.
    pub(super) fn send_data(
        &mut self,
        target: NodeId,
        kind: String,
        payload: Vec<u8>,
        done: oneshot::Sender<Result<(), DeliveryError>>,
    ) {
        let our = self.nodes.our_id().clone();
        if target == our {
            // loopback: no wire involved
            let _ = self.event_tx.send(NetworkEvent::Message {
                source: our,
                kind,
                payload,
            });
            let _ = done.send(Ok(()));
            return;
        }
        let Some(hop) = self.routing.next_hop(&target).cloned() else {
            let _ = done.send(Err(DeliveryError::NoRoute));
            return;
        };
        let Some(peer) = self.peers.get(&hop) else {
            let _ = done.send(Err(DeliveryError::NoRoute));
            return;
        };
        let id = self.pending.prepare_request_with(done);
        let frame = WireFrame::Data {
            source: our.clone(),
            target,
            id,
            kind,
            path: vec![our],
            payload,
        };
        if peer.frame_tx.send(frame).is_err() {
            self.pending.register_error(id, DeliveryError::NoRoute);
        }
    }

    /// A Data frame arrived from `from`. Deliver, reject, or forward.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_data(
        &mut self,
        from: NodeId,
        source: NodeId,
        target: NodeId,
        id: u32,
        kind: String,
        mut path: Vec<NodeId>,
        payload: Vec<u8>,
    ) {
        let our = self.nodes.our_id().clone();
        if target == our {
            self.send_back(
                &from,
                WireFrame::DataAck {
                    id,
                    target: source.clone(),
                    path,
                },
            );
            let _ = self.event_tx.send(NetworkEvent::Message {
                source,
                kind,
                payload,
            });
            return;
        }
        if self.endpoint {
            // endpoints are leaves: they never carry traffic for others
            self.send_back(
                &from,
                WireFrame::DataReject {
                    id,
                    target: source,
                    path,
                    code: RejectCode::Rejected,
                },
            );
            return;
        }
        if path.contains(&our) {
            self.send_back(
                &from,
                WireFrame::DataReject {
                    id,
                    target: source,
                    path,
                    code: RejectCode::Loop,
                },
            );
            return;
        }
        let hop = self.routing.next_hop(&target).cloned();
        let forwarded = match hop.as_ref().and_then(|hop| self.peers.get(hop)) {
            Some(peer) => {
                path.push(our);
                peer.frame_tx
                    .send(WireFrame::Data {
                        source: source.clone(),
                        target,
                        id,
                        kind,
                        path: path.clone(),
                        payload,
                    })
                    .is_ok()
            }
            None => false,
        };
        if !forwarded {
            // strip our own hop again for the reverse path
            if path.last() == Some(self.nodes.our_id()) {
                path.pop();
            }
            self.send_back(
                &from,
                WireFrame::DataReject {
                    id,
                    target: source,
                    path,
                    code: RejectCode::NoRoute,
                },
            );
        }
    }

    /// Acks walk the recorded path backwards until they reach the origin.
    pub(super) fn handle_ack(&mut self, id: u32, target: NodeId, path: Vec<NodeId>) {
        if target == *self.nodes.our_id() {
            self.pending.register_reply(id);
            return;
        }
        self.route_reverse(WireFrame::DataAck { id, target, path });
    }

    pub(super) fn handle_reject(
        &mut self,
        id: u32,
        target: NodeId,
        path: Vec<NodeId>,
        code: RejectCode,
    ) {
        if target == *self.nodes.our_id() {
            self.pending.register_error(id, code.into());
            return;
        }
        self.route_reverse(WireFrame::DataReject {
            id,
            target,
            path,
            code,
        });
    }

    /// Send a frame to a direct peer, with a debug note when the link is
    /// already gone. Losing a reply is fine: the origin's timeout covers it.
    fn send_back(&self, to: &NodeId, frame: WireFrame) {
        match self.peers.get(to) {
            Some(peer) => {
                if peer.frame_tx.send(frame).is_err() {
                    print_debug(&self.print_tx, &format!("messaging: lost link to {to}"));
                }
            }
            None => {
                print_debug(
                    &self.print_tx,
                    &format!("messaging: no link to {to} for reply"),
                );
            }
        }
    }

    /// Forward a reply frame one step along the recorded path, reversed:
    /// our predecessor in the path is the next hop home.
    fn route_reverse(&self, frame: WireFrame) {
        let path = match &frame {
            WireFrame::DataAck { path, .. } | WireFrame::DataReject { path, .. } => path,
            _ => return,
        };
        let our = self.nodes.our_id();
        let Some(pos) = path.iter().position(|id| id == our) else {
            print_debug(&self.print_tx, "messaging: reply path does not include us");
            return;
        };
        if pos == 0 {
            print_debug(&self.print_tx, "messaging: reply path ends at us unexpectedly");
            return;
        }
        let prev = path[pos - 1].clone();
        self.send_back(&prev, frame);
    }
}
