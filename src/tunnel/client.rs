//! Tunnel client: dials the control endpoint and services received
//! requests with a user-supplied executor.
//!
//! # Responsibilities
//! - Dial the server's control endpoint (ws:// or wss://)
//! - Dispatch each received request to the executor on its own task
//! - Convert executor failures into proxied 503 responses
//! - Send idle-heartbeat pings when configured

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::{Request, Response, StatusCode};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    connect_async_tls_with_config, connect_async_with_config, Connector, MaybeTlsStream,
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{is_temporary_error, TunnelError};
use crate::lifecycle::WorkGroup;
use crate::protocol::{self, ReqId, DEFAULT_MAX_FRAME_BYTES};
use crate::tunnel::RoundTripper;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for a tunnel client run.
pub struct ClientConfig {
    server_url: Url,
    round_tripper: Arc<dyn RoundTripper>,
    connector: Option<Connector>,
    ping_interval: Option<Duration>,
    max_frame_bytes: usize,
}

impl ClientConfig {
    pub fn new(server_url: Url, round_tripper: Arc<dyn RoundTripper>) -> Self {
        Self {
            server_url,
            round_tripper,
            connector: None,
            ping_interval: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Inject a TLS connector for wss:// endpoints (e.g. a custom root
    /// certificate store).
    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Send a WebSocket ping after the connection has been idle this long.
    /// `None` disables pings.
    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval.filter(|i| !i.is_zero());
        self
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }
}

/// Dial the control endpoint and run the client until `ctx` is cancelled
/// or the connection fails.
///
/// Returns `Ok(())` on cancellation and the terminal error otherwise.
pub async fn run_client(ctx: CancellationToken, cfg: ClientConfig) -> Result<(), TunnelError> {
    let ClientConfig {
        server_url,
        round_tripper,
        connector,
        ping_interval,
        max_frame_bytes,
    } = cfg;

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(max_frame_bytes);
    ws_config.max_frame_size = Some(max_frame_bytes);

    let connect = async {
        match connector {
            Some(connector) => {
                connect_async_tls_with_config(
                    server_url.as_str(),
                    Some(ws_config),
                    false,
                    Some(connector),
                )
                .await
            }
            None => connect_async_with_config(server_url.as_str(), Some(ws_config), false).await,
        }
    };
    let (socket, _response) = tokio::select! {
        _ = ctx.cancelled() => return Ok(()),
        connected = connect => connected.map_err(TunnelError::transport)?,
    };
    tracing::info!(server = %server_url, "control connection established");

    let (sink, stream) = socket.split();
    let group = WorkGroup::new();
    let (response_tx, response_rx) = mpsc::channel(1);
    let activity = Arc::new(Mutex::new(Instant::now()));

    let client = Arc::new(Client {
        round_tripper,
        response_tx,
        group: group.clone(),
        activity,
        ping_interval,
    });

    group.go("in writer loop", client.clone().write_loop(sink, response_rx));
    group.go("in reader loop", client.clone().read_loop(stream));

    let closing = group.closing();
    tokio::select! {
        _ = ctx.cancelled() => group.close(None),
        _ = closing.cancelled() => {}
    }

    match group.wait().await {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// A response ready to be written back on the control connection.
struct ResponseItem {
    id: ReqId,
    response: Response<Bytes>,
}

struct Client {
    round_tripper: Arc<dyn RoundTripper>,
    response_tx: mpsc::Sender<ResponseItem>,
    group: WorkGroup,
    activity: Arc<Mutex<Instant>>,
    ping_interval: Option<Duration>,
}

impl Client {
    /// Read request frames and hand each to a dispatcher task.
    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WsStream>) -> Result<(), TunnelError> {
        let closing = self.group.closing();
        loop {
            let message = tokio::select! {
                _ = closing.cancelled() => {
                    tracing::trace!("client closing, terminating reader loop");
                    return Ok(());
                }
                message = stream.next() => message,
            };

            let message = match message {
                None => {
                    if self.group.is_open() {
                        return Err(TunnelError::Transport(
                            "control connection ended unexpectedly".into(),
                        ));
                    }
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

            self.touch();
            match message {
                Message::Binary(data) => match protocol::decode_request(&data) {
                    Ok((id, request)) => self.dispatch(id, request),
                    Err(err) => {
                        tracing::error!(error = %err, "failed to parse request frame");
                        continue;
                    }
                },
                Message::Close(frame) => {
                    let (code, reason) = match &frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                        None => (u16::from(CloseCode::Status), String::new()),
                    };
                    tracing::info!(code, reason = %reason, "control connection closed by server");
                    if self.group.is_open() {
                        return Err(TunnelError::ConnectionClosed { code, reason });
                    }
                    return Ok(());
                }
                Message::Pong(data) => {
                    tracing::debug!(payload = data.len(), "received pong");
                }
                other => tracing::trace!(message = ?other, "ignoring message"),
            }
        }
    }

    /// Run the executor for one received request on its own task.
    ///
    /// Executor failures become 503 responses delivered through the normal
    /// response path: target-side trouble must not kill the tunnel. A
    /// closing client drops the in-flight executor future.
    fn dispatch(self: &Arc<Self>, id: ReqId, request: Request<Bytes>) {
        let client = self.clone();
        let closing = self.group.closing();
        self.group.go("while handling request", async move {
            tracing::debug!(id, method = %request.method(), uri = %request.uri(), "handling request");

            let response = tokio::select! {
                _ = closing.cancelled() => {
                    tracing::info!(id, "client closing, bailing on request");
                    return Ok(());
                }
                result = client.round_tripper.round_trip(request) => match result {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::error!(id, error = %err, "round trip failed");
                        let mut response = Response::new(Bytes::from(err.to_string()));
                        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                        response
                    }
                },
            };

            tokio::select! {
                _ = closing.cancelled() => {
                    tracing::info!(id, "client closing, bailing on response");
                }
                _ = client.response_tx.send(ResponseItem { id, response }) => {}
            }
            Ok(())
        });
    }

    /// Write response frames and idle-heartbeat pings.
    async fn write_loop(
        self: Arc<Self>,
        mut sink: SplitSink<WsStream, Message>,
        mut response_rx: mpsc::Receiver<ResponseItem>,
    ) -> Result<(), TunnelError> {
        let closing = self.group.closing();
        let result = loop {
            tokio::select! {
                _ = closing.cancelled() => {
                    tracing::trace!("client closing, terminating writer loop");
                    break Ok(());
                }
                item = response_rx.recv() => {
                    let Some(item) = item else {
                        break Err(TunnelError::ResponseChannelClosed);
                    };
                    tracing::trace!(id = item.id, status = %item.response.status(), "writing response");
                    let frame = protocol::encode_response(item.id, &item.response);
                    match sink.send(Message::Binary(frame)).await {
                        Ok(()) => self.touch(),
                        Err(err) => {
                            self.requeue(item);
                            if is_temporary_error(&err) {
                                tracing::debug!(error = %err, "temporary error writing response frame");
                                continue;
                            }
                            break Err(TunnelError::transport(err));
                        }
                    }
                }
                _ = self.ping_due() => {
                    tracing::trace!("sending ping");
                    match sink.send(Message::Ping(Bytes::new())).await {
                        Ok(()) => self.touch(),
                        Err(err) => {
                            if is_temporary_error(&err) {
                                tracing::debug!(error = %err, "temporary error sending ping");
                                continue;
                            }
                            break Err(TunnelError::transport(err));
                        }
                    }
                }
            }
        };

        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "tunnel client terminating".into(),
        }));
        if let Err(err) = sink.send(close).await {
            tracing::debug!(error = %err, "failed to send close frame");
        }

        result
    }

    /// Put a response back on the channel after a failed write.
    ///
    /// Runs from a fresh task: the writer loop is the sole consumer of the
    /// channel and would deadlock sending into it.
    fn requeue(self: &Arc<Self>, item: ResponseItem) {
        let tx = self.response_tx.clone();
        let closing = self.group.closing();
        let item_id = item.id;
        self.group.go("while requeuing response", async move {
            tokio::select! {
                _ = closing.cancelled() => {
                    tracing::debug!(id = item_id, "client closing, bailing on requeue");
                }
                sent = tx.send(item) => {
                    if sent.is_ok() {
                        tracing::debug!("response requeued");
                    }
                }
            }
            Ok(())
        });
    }

    /// Record read/write activity; pings only fire after a full idle
    /// interval.
    fn touch(&self) {
        *self.activity.lock().expect("activity clock lock poisoned") = Instant::now();
    }

    /// Resolve once the connection has been idle for the ping interval;
    /// pend forever when pings are disabled.
    async fn ping_due(&self) {
        let Some(interval) = self.ping_interval else {
            return std::future::pending().await;
        };
        loop {
            let deadline = self.last_activity() + interval;
            tokio::time::sleep_until(deadline).await;
            if self.last_activity().elapsed() >= interval {
                return;
            }
        }
    }

    fn last_activity(&self) -> Instant {
        *self.activity.lock().expect("activity clock lock poisoned")
    }
}
