//! Axum routers for the control plane and the front door.

use std::time::Duration;

use axum::{
    body::Body,
    extract::{State, WebSocketUpgrade},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use http_body_util::BodyExt;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::tunnel::server::TunnelServer;

/// Router for the control listener: upgrades any path to a WebSocket and
/// attaches it as the control connection.
pub fn control_router(server: TunnelServer) -> Router {
    Router::new()
        .route("/", any(control_handler))
        .route("/{*path}", any(control_handler))
        .with_state(server)
        .layer(TraceLayer::new_for_http())
}

/// Router for the request listener (front door): every request goes
/// through the tunnel.
pub fn request_router(server: TunnelServer, request_timeout: Duration) -> Router {
    Router::new()
        .route("/", any(request_handler))
        .route("/{*path}", any(request_handler))
        .with_state(server)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
}

async fn control_handler(State(server): State<TunnelServer>, ws: WebSocketUpgrade) -> Response {
    server.handle_upgrade(ws)
}

/// Submit the inbound request through the tunnel and copy the response
/// back out. Tunnel-level failures surface as 500 with the error text;
/// target-level failures arrive as regular proxied responses (e.g. 503).
async fn request_handler(State(server): State<TunnelServer>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };
    let request = Request::from_parts(parts, body);

    match server.round_trip(request).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, Body::from(body))
        }
        Err(err) => {
            tracing::error!(error = %err, "tunnel round trip failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}
