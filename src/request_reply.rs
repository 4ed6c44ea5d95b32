use crate::types::DeliveryError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

struct PendingRequest {
    done: oneshot::Sender<Result<(), DeliveryError>>,
    timer: tokio::task::JoinHandle<()>,
}

/// Table of in-flight application sends, keyed by the wire request id.
///
/// Ids are session-local and monotonic with wrap-around; an id is never
/// handed out again while still outstanding. Each pending entry resolves
/// exactly once: first reply, first error, or the timeout, whichever lands
/// first. Late or duplicate resolutions are no-ops.
#[derive(Clone)]
pub struct RequestReplyHelper {
    inner: Arc<Inner>,
}

struct Inner {
    next_id: AtomicU32,
    pending: DashMap<u32, PendingRequest>,
    timeout: Duration,
}

impl RequestReplyHelper {
    pub fn new(timeout: Duration) -> Self {
        RequestReplyHelper {
            inner: Arc::new(Inner {
                next_id: AtomicU32::new(0),
                pending: DashMap::new(),
                timeout,
            }),
        }
    }

    /// Allocate the next request id and arm its timeout. The returned
    /// receiver resolves when the matching reply, error, or timeout lands.
    pub fn prepare_request(&self) -> (u32, oneshot::Receiver<Result<(), DeliveryError>>) {
        let (done_tx, done_rx) = oneshot::channel();
        (self.prepare_request_with(done_tx), done_rx)
    }

    /// Like [`Self::prepare_request`], resolving a caller-supplied channel.
    pub fn prepare_request_with(&self, done: oneshot::Sender<Result<(), DeliveryError>>) -> u32 {
        let id = loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            if !self.inner.pending.contains_key(&id) {
                break id;
            }
        };
        let timer = {
            let helper = self.clone();
            let timeout = self.inner.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                helper.register_error(id, DeliveryError::Timeout);
            })
        };
        self.inner.pending.insert(id, PendingRequest { done, timer });
        id
    }

    /// Resolve a pending request. Unknown ids (already timed out, already
    /// resolved) are ignored.
    pub fn register_reply(&self, id: u32) {
        self.release(id, Ok(()));
    }

    /// Reject a pending request. Unknown ids are ignored.
    pub fn register_error(&self, id: u32, error: DeliveryError) {
        self.release(id, Err(error));
    }

    fn release(&self, id: u32, result: Result<(), DeliveryError>) {
        let Some((_, entry)) = self.inner.pending.remove(&id) else {
            return;
        };
        entry.timer.abort();
        let _ = entry.done.send(result);
    }

    pub fn outstanding(&self) -> usize {
        self.inner.pending.len()
    }
}
