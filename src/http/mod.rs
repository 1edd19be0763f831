//! HTTP surface of the tunnel.
//!
//! # Data Flow
//! ```text
//! control listener
//!     → server.rs control_router (WebSocket upgrade on any path)
//!     → TunnelServer::attach
//!
//! request listener (front door)
//!     → server.rs request_router (collect body, round_trip, copy response)
//!
//! tunnel client side
//!     → forward.rs ForwardingRoundTripper (rewrite URI, hit the target)
//! ```

pub mod forward;
pub mod server;

pub use forward::ForwardingRoundTripper;
pub use server::{control_router, request_router};
