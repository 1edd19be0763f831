//! Tunnel server: accepts control connections and forwards requests to the
//! currently attached client.
//!
//! # Responsibilities
//! - Accept a WebSocket upgrade and attach it as the control connection
//! - Hand submitted requests to the connection's writer loop
//! - Correlate response frames with pending requests via the wait queue
//! - Fail all pending and future submissions on shutdown

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response as AxumResponse;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::{Request, Response};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{is_temporary_error, TunnelError};
use crate::lifecycle::WorkGroup;
use crate::protocol::{self, ReqId, DEFAULT_MAX_FRAME_BYTES, REQ_ID_LEN};
use crate::tunnel::wait_queue::{Pending, WaitQueue};

/// A request handed to a control connection's writer loop.
struct QueuedRequest {
    id: ReqId,
    request: Request<Bytes>,
}

type SharedRequestRx = Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedRequest>>>;

/// Tunnel server handle; cheap to clone.
///
/// All clones share the wait queue, the request channel, and the stop
/// signal, so any attached control connection serves requests submitted
/// through any handle.
#[derive(Clone)]
pub struct TunnelServer {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    wait_queue: Arc<WaitQueue>,
    request_tx: mpsc::Sender<QueuedRequest>,
    request_rx: SharedRequestRx,
    stop: CancellationToken,
    next_id: AtomicU64,
    max_frame_bytes: usize,
}

impl Default for TunnelServer {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelServer {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Create a server with a custom frame ceiling, applied as the
    /// WebSocket max-message-size of attached control connections.
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        let (request_tx, request_rx) = mpsc::channel(1);
        Self {
            shared: Arc::new(ServerShared {
                wait_queue: Arc::new(WaitQueue::new()),
                request_tx,
                request_rx: Arc::new(tokio::sync::Mutex::new(request_rx)),
                stop: CancellationToken::new(),
                next_id: AtomicU64::new(1),
                max_frame_bytes,
            }),
        }
    }

    /// Submit a request through the tunnel and wait for its response.
    ///
    /// The future is cancel-safe: dropping it (for example from inside
    /// `tokio::time::timeout`) removes the pending entry, and a response
    /// arriving later for the abandoned id is discarded. After
    /// [`shutdown`](Self::shutdown) every call fails with
    /// [`TunnelError::ServerStopped`].
    pub async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>, TunnelError> {
        let shared = &self.shared;

        if shared.stop.is_cancelled() {
            return Err(TunnelError::ServerStopped);
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, method = %req.method(), uri = %req.uri(), "request received");

        let (tx, rx) = oneshot::channel();
        shared.wait_queue.push(
            id,
            Pending {
                method: req.method().clone(),
                tx,
            },
        );
        // Removes the entry when this future returns or is dropped;
        // removal after delivery is a no-op.
        let _guard = QueueGuard {
            queue: shared.wait_queue.as_ref(),
            id,
        };

        tokio::select! {
            sent = shared.request_tx.send(QueuedRequest { id, request: req }) => {
                if sent.is_err() {
                    return Err(TunnelError::ServerStopped);
                }
                tracing::trace!(id, "request queued");
            }
            _ = shared.stop.cancelled() => return Err(TunnelError::ServerStopped),
        }

        tokio::select! {
            outcome = rx => match outcome {
                Ok(result) => result,
                Err(_) => Err(TunnelError::ResponseChannelClosed),
            },
            _ = shared.stop.cancelled() => Err(TunnelError::ServerStopped),
        }
    }

    /// Upgrade an inbound control request and attach the socket as the
    /// active control connection.
    pub fn handle_upgrade(&self, ws: WebSocketUpgrade) -> AxumResponse {
        tracing::info!("control connection received");
        let server = self.clone();
        ws.max_message_size(self.shared.max_frame_bytes)
            .max_frame_size(self.shared.max_frame_bytes)
            .on_upgrade(move |socket| server.attach(socket))
    }

    /// Run a freshly upgraded control connection until it tears down.
    ///
    /// A previously attached connection is not evicted: all connections
    /// contend for the shared request channel and whichever is alive picks
    /// up the next request.
    pub async fn attach(self, socket: WebSocket) {
        tracing::debug!("control connection successfully upgraded");

        let (sink, stream) = socket.split();
        let group = WorkGroup::new();
        let conn = Arc::new(ControlConn {
            wait_queue: self.shared.wait_queue.clone(),
            request_tx: self.shared.request_tx.clone(),
            request_rx: self.shared.request_rx.clone(),
            group: group.clone(),
        });

        group.go("in control reader loop", conn.clone().read_loop(stream));
        group.go("in control writer loop", conn.clone().write_loop(sink));

        let closing = group.closing();
        tokio::select! {
            _ = self.shared.stop.cancelled() => group.close(None),
            _ = closing.cancelled() => {}
        }

        match group.wait().await {
            Some(err) => tracing::warn!(error = %err, "control connection terminated"),
            None => tracing::info!("control connection closed"),
        }
    }

    /// Initiate server shutdown; does not wait for it to finish.
    pub fn shutdown(&self) {
        tracing::info!("initiating tunnel server shutdown");
        self.shared.stop.cancel();
    }

    /// Whether shutdown has been initiated.
    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.wait_queue.len()
    }
}

struct QueueGuard<'a> {
    queue: &'a WaitQueue,
    id: ReqId,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.queue.discard(self.id);
    }
}

/// State of one attached control connection.
struct ControlConn {
    wait_queue: Arc<WaitQueue>,
    request_tx: mpsc::Sender<QueuedRequest>,
    request_rx: SharedRequestRx,
    group: WorkGroup,
}

impl ControlConn {
    /// Read response frames and deliver them to their pending entries.
    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WebSocket>) -> Result<(), TunnelError> {
        let closing = self.group.closing();
        loop {
            let message = tokio::select! {
                _ = closing.cancelled() => {
                    tracing::trace!("connection closing, terminating reader loop");
                    return Ok(());
                }
                message = stream.next() => message,
            };

            let message = match message {
                None => {
                    tracing::debug!("control connection stream ended");
                    self.group.close(None);
                    return Ok(());
                }
                Some(Err(err)) => {
                    if is_temporary_error(&err) {
                        tracing::debug!(error = %err, "temporary error reading control connection");
                        continue;
                    }
                    return Err(TunnelError::transport(err));
                }
                Some(Ok(message)) => message,
            };

            match message {
                Message::Binary(data) => self.deliver_response(&data),
                Message::Close(frame) => {
                    match frame {
                        Some(frame) => tracing::info!(
                            code = frame.code,
                            reason = %frame.reason,
                            "control connection closed by client"
                        ),
                        None => tracing::info!("control connection closed by client"),
                    }
                    self.group.close(None);
                    return Ok(());
                }
                other => tracing::trace!(message = ?other, "ignoring message"),
            }
        }
    }

    /// Parse one response frame and signal the matching pending request.
    ///
    /// An id without a pending entry means the caller cancelled or the
    /// frame is stale; it is dropped without ceremony.
    fn deliver_response(&self, frame: &[u8]) {
        let id = match protocol::peek_req_id(frame) {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(error = %err, "failed to read request id from frame");
                return;
            }
        };

        let Some(pending) = self.wait_queue.pop(id) else {
            tracing::debug!(id, "no pending entry for request id");
            return;
        };

        let outcome = crate::protocol::http1::parse_response(&frame[REQ_ID_LEN..], &pending.method);
        if pending.tx.send(outcome).is_err() {
            tracing::trace!(id, "caller gone before response delivery");
        }
    }

    /// Transmit queued requests on the control connection.
    async fn write_loop(
        self: Arc<Self>,
        mut sink: SplitSink<WebSocket, Message>,
    ) -> Result<(), TunnelError> {
        let closing = self.group.closing();
        let result = loop {
            let queued = tokio::select! {
                _ = closing.cancelled() => {
                    tracing::trace!("connection closing, terminating writer loop");
                    break Ok(());
                }
                queued = async { self.request_rx.lock().await.recv().await } => match queued {
                    Some(queued) => queued,
                    // The server owns a sender for the connection's whole lifetime.
                    None => break Err(TunnelError::Transport("request channel closed".into())),
                },
            };

            tracing::trace!(id = queued.id, "processing request");
            let frame = protocol::encode_request(queued.id, &queued.request);
            if let Err(err) = sink.send(Message::Binary(frame)).await {
                self.requeue(queued);
                if is_temporary_error(&err) {
                    tracing::debug!(error = %err, "temporary error writing request frame");
                    continue;
                }
                break Err(TunnelError::transport(err));
            }
        };

        let close = Message::Close(Some(CloseFrame {
            code: close_code::AWAY,
            reason: "tunnel server terminating".into(),
        }));
        if let Err(err) = sink.send(close).await {
            tracing::debug!(error = %err, "failed to send close frame");
        }

        result
    }

    /// Put a request back on the channel after a failed write.
    ///
    /// Runs from a fresh task: the writer loop is the sole consumer of the
    /// channel and would deadlock sending into it.
    fn requeue(self: &Arc<Self>, queued: QueuedRequest) {
        let tx = self.request_tx.clone();
        let closing = self.group.closing();
        let queued_id = queued.id;
        self.group.go("while requeuing request", async move {
            tokio::select! {
                _ = closing.cancelled() => {
                    tracing::debug!(id = queued_id, "connection closing, bailing on requeue");
                }
                sent = tx.send(queued) => {
                    if sent.is_ok() {
                        tracing::debug!("request requeued");
                    }
                }
            }
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_round_trip_after_shutdown_fails() {
        let server = TunnelServer::new();
        server.shutdown();

        let req = Request::builder().uri("/x").body(Bytes::new()).unwrap();
        let err = server.round_trip(req).await.unwrap_err();
        assert!(matches!(err, TunnelError::ServerStopped));
        assert_eq!(server.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiting_round_trip() {
        let server = TunnelServer::new();

        let submitted = {
            let server = server.clone();
            tokio::spawn(async move {
                let req = Request::builder().uri("/x").body(Bytes::new()).unwrap();
                server.round_trip(req).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();

        let err = submitted.await.unwrap().unwrap_err();
        assert!(matches!(err, TunnelError::ServerStopped));
    }

    #[tokio::test]
    async fn test_abandoned_round_trip_drops_pending_entry() {
        let server = TunnelServer::new();

        let req = Request::builder().uri("/x").body(Bytes::new()).unwrap();
        let outcome = tokio::time::timeout(Duration::from_millis(100), server.round_trip(req)).await;
        assert!(outcome.is_err());
        assert_eq!(server.pending_requests(), 0);
    }
}
