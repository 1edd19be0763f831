//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, plain or TLS serve)
//!     → tls.rs (rustls config loading, self-signed minting, dialer TLS)
//!     → Hand off to the HTTP routers
//! ```

pub mod listener;
pub mod tls;

pub use listener::{serve, serve_tls};
