//! Reverse HTTP tunnel over a multiplexed WebSocket.
//!
//! A publicly reachable tunnel server accepts HTTP requests and forwards
//! them over a single long-lived WebSocket control connection to a tunnel
//! client running behind NAT. The client re-executes each request against a
//! private target and returns the response on the same connection. Frames
//! are correlated by a per-request identifier, so many requests can be in
//! flight at once.
//!
//! ```text
//!                 public side                        private side
//!
//!  HTTP request ─▶ front door ─▶ TunnelServer ══ WebSocket ═▶ tunnel client
//!                                 wait queue                   dispatcher
//!  HTTP response ◀ front door ◀─ TunnelServer ◀══ frames ══ RoundTripper ─▶ target
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod tunnel;

pub use config::schema::TunnelConfig;
pub use error::TunnelError;
pub use tunnel::client::{run_client, ClientConfig};
pub use tunnel::server::TunnelServer;
pub use tunnel::{RoundTripper, RoundTripperFn};
