//! Shared utilities for the tunnel integration tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{Request, Response};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::Connector;
use tokio_util::sync::CancellationToken;
use url::Url;

use reverse_tunnel::error::{BoxError, TunnelError};
use reverse_tunnel::http::control_router;
use reverse_tunnel::net;
use reverse_tunnel::{run_client, ClientConfig, RoundTripper, RoundTripperFn, TunnelServer};

/// Tracks how many executor calls are in flight, with observed extremes.
pub struct ConcurrencyCounter {
    inner: Mutex<CounterState>,
}

struct CounterState {
    count: i64,
    min: i64,
    max: i64,
}

impl Default for ConcurrencyCounter {
    fn default() -> Self {
        Self {
            inner: Mutex::new(CounterState {
                count: 0,
                min: i64::MAX,
                max: i64::MIN,
            }),
        }
    }
}

impl ConcurrencyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        let mut state = self.inner.lock().unwrap();
        state.count += 1;
        Self::update(&mut state);
    }

    pub fn dec(&self) {
        let mut state = self.inner.lock().unwrap();
        state.count -= 1;
        Self::update(&mut state);
    }

    pub fn count(&self) -> i64 {
        self.inner.lock().unwrap().count
    }

    pub fn max(&self) -> i64 {
        self.inner.lock().unwrap().max
    }

    pub fn min(&self) -> i64 {
        self.inner.lock().unwrap().min
    }

    fn update(state: &mut CounterState) {
        state.max = state.max.max(state.count);
        state.min = state.min.min(state.count);
    }
}

/// Serve the control router on an ephemeral port.
pub async fn start_control_server(server: TunnelServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, control_router(server)).await.unwrap();
    });
    addr
}

/// Serve the control router over TLS on an ephemeral port.
///
/// Returns the address and a connector trusting the generated CA.
pub async fn start_tls_control_server(server: TunnelServer) -> (SocketAddr, Connector) {
    let (tls_config, ca) = net::tls::self_signed_config().unwrap();
    let connector = net::tls::client_connector(&ca).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(net::serve_tls(
        listener,
        control_router(server),
        tls_config,
        64,
        CancellationToken::new(),
    ));
    (addr, connector)
}

/// Run a tunnel client against a plain control endpoint.
pub fn spawn_client(
    addr: SocketAddr,
    round_tripper: Arc<dyn RoundTripper>,
) -> (CancellationToken, JoinHandle<Result<(), TunnelError>>) {
    let url = Url::parse(&format!("ws://{addr}")).unwrap();
    let token = CancellationToken::new();
    let handle = tokio::spawn(run_client(
        token.clone(),
        ClientConfig::new(url, round_tripper),
    ));
    (token, handle)
}

/// Executor echoing the request path as the response body.
pub fn path_echo() -> Arc<dyn RoundTripper> {
    Arc::new(RoundTripperFn(|req: Request<Bytes>| async move {
        Ok::<_, BoxError>(Response::new(Bytes::from(req.uri().path().to_string())))
    }))
}

/// Executor returning a fixed body for every request.
pub fn static_resp(body: Bytes) -> Arc<dyn RoundTripper> {
    Arc::new(RoundTripperFn(move |_req: Request<Bytes>| {
        let body = body.clone();
        async move { Ok::<_, BoxError>(Response::new(body)) }
    }))
}
