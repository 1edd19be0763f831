//! Table of pending requests awaiting a matching response frame.

use bytes::Bytes;
use dashmap::DashMap;
use http::{Method, Response};
use tokio::sync::oneshot;

use crate::error::TunnelError;
use crate::protocol::ReqId;

/// A request waiting for its response frame.
///
/// The stored method drives response parsing (a HEAD response carries no
/// body). The sink is consumed on delivery, so a response is delivered at
/// most once.
pub struct Pending {
    pub method: Method,
    pub tx: oneshot::Sender<Result<Response<Bytes>, TunnelError>>,
}

/// Mapping from request id to pending entry.
///
/// No two entries share an id; `pop` removes and returns atomically;
/// `discard` is idempotent.
#[derive(Default)]
pub struct WaitQueue {
    items: DashMap<ReqId, Pending>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, id: ReqId, pending: Pending) {
        let previous = self.items.insert(id, pending);
        debug_assert!(previous.is_none(), "duplicate pending request id {id}");
    }

    pub fn pop(&self, id: ReqId) -> Option<Pending> {
        self.items.remove(&id).map(|(_, pending)| pending)
    }

    pub fn discard(&self, id: ReqId) {
        self.items.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn pending() -> (Pending, oneshot::Receiver<Result<Response<Bytes>, TunnelError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Pending {
                method: Method::GET,
                tx,
            },
            rx,
        )
    }

    #[test]
    fn test_pop_removes_entry() {
        let queue = WaitQueue::new();
        let (entry, _rx) = pending();
        queue.push(1, entry);

        assert!(queue.pop(1).is_some());
        assert!(queue.pop(1).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_discard_is_idempotent() {
        let queue = WaitQueue::new();
        let (entry, _rx) = pending();
        queue.push(7, entry);

        queue.discard(7);
        queue.discard(7);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_delivery_reaches_waiter() {
        let queue = WaitQueue::new();
        let (entry, rx) = pending();
        queue.push(3, entry);

        let entry = queue.pop(3).unwrap();
        let resp = Response::builder()
            .status(StatusCode::OK)
            .body(Bytes::from_static(b"done"))
            .unwrap();
        entry.tx.send(Ok(resp)).ok();

        let delivered = rx.await.unwrap().unwrap();
        assert_eq!(delivered.body().as_ref(), b"done");
    }
}
