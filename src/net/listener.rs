//! Listener serve loops for the control and request endpoints.

use std::sync::Arc;

use axum::{body::Body, extract::Request, Router};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Serve a router on a plain TCP listener until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "HTTP server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!(address = %addr, "HTTP server stopped");
    Ok(())
}

/// Serve a router over TLS until `shutdown` fires.
///
/// Drives a rustls handshake per connection and hands the stream to hyper
/// with upgrade support, so WebSocket control connections work over wss://.
/// `max_connections` bounds concurrent connections via a semaphore; when
/// the limit is reached the accept loop waits for a slot.
pub async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls_config: Arc<rustls::ServerConfig>,
    max_connections: usize,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    let acceptor = TlsAcceptor::from(tls_config);
    let connection_limit = Arc::new(Semaphore::new(max_connections));
    tracing::info!(address = %addr, max_connections, "HTTPS server starting");

    loop {
        // Acquire a slot before accepting (backpressure).
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = connection_limit.clone().acquire_owned() => {
                permit.expect("Semaphore closed unexpectedly")
            }
        };

        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };

        tracing::debug!(
            peer_addr = %peer_addr,
            available_permits = connection_limit.available_permits(),
            "Connection accepted"
        );

        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            // Holds the connection slot until this task returns.
            let _permit = permit;

            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::debug!(peer_addr = %peer_addr, error = %err, "TLS handshake failed");
                    return;
                }
            };

            let service = hyper::service::service_fn(move |request: Request<Incoming>| {
                router.clone().oneshot(request.map(Body::new))
            });

            if let Err(err) = ConnectionBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(peer_addr = %peer_addr, error = %err, "connection error");
            }
        });
    }

    tracing::info!(address = %addr, "HTTPS server stopped");
    Ok(())
}
