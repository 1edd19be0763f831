//! Tunnel core: request/response multiplexing over a control connection.
//!
//! # Data Flow
//! ```text
//! front door ─▶ TunnelServer::round_trip ─▶ request channel ─▶ writer loop
//!     ─▶ frame ─▶ client reader loop ─▶ dispatcher ─▶ RoundTripper ─▶ target
//!     ─▶ response channel ─▶ client writer loop ─▶ frame
//!     ─▶ server reader loop ─▶ wait queue ─▶ round_trip returns
//! ```

pub mod client;
pub mod server;
pub mod wait_queue;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};

use crate::error::BoxError;

/// Executes a tunneled request on the client side.
///
/// Usually forwards to a private target server; tests plug in closures.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>, BoxError>;
}

/// Adapter turning an async closure into a [`RoundTripper`].
pub struct RoundTripperFn<F>(pub F);

#[async_trait]
impl<F, Fut> RoundTripper for RoundTripperFn<F>
where
    F: Fn(Request<Bytes>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Response<Bytes>, BoxError>> + Send,
{
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>, BoxError> {
        (self.0)(req).await
    }
}
