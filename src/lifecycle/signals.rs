//! OS signal handling.

use tokio_util::sync::CancellationToken;

/// Wait for a shutdown signal (Ctrl+C).
pub async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received");
}

/// Spawn a task that cancels `token` on the first shutdown signal.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });
}
