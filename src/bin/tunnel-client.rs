//! NAT-side tunnel client.
//!
//! Dials the tunnel server's control endpoint and re-executes every
//! received request against a private HTTP target.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http::uri::Authority;
use tokio_util::sync::CancellationToken;
use url::Url;

use reverse_tunnel::http::ForwardingRoundTripper;
use reverse_tunnel::lifecycle::signals::cancel_on_signal;
use reverse_tunnel::net::tls::connector_from_ca_file;
use reverse_tunnel::observability::init_logging;
use reverse_tunnel::{run_client, ClientConfig};

#[derive(Parser)]
#[command(name = "tunnel-client")]
#[command(about = "NAT-side client of the reverse HTTP tunnel", long_about = None)]
struct Args {
    /// Control endpoint of the tunnel server (ws:// or wss://)
    #[arg(long, default_value = "ws://localhost:10080")]
    server_url: String,

    /// Authority of the private target to forward requests to
    #[arg(long, default_value = "localhost:8000")]
    target: String,

    /// PEM file with roots to trust for wss:// endpoints
    #[arg(long)]
    ca_file: Option<PathBuf>,

    /// Idle interval between WebSocket pings in seconds; 0 disables pings
    #[arg(long, default_value_t = 0)]
    ping_interval_secs: u64,

    /// Default tracing filter when RUST_LOG is not set
    #[arg(long, default_value = "reverse_tunnel=info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(&args.log_filter);

    let server_url = Url::parse(&args.server_url)?;
    let target: Authority = args.target.parse()?;

    tracing::info!(server = %server_url, target = %target, "tunnel client starting");

    let round_tripper = Arc::new(ForwardingRoundTripper::new(target));
    let mut config = ClientConfig::new(server_url, round_tripper);
    if args.ping_interval_secs > 0 {
        config = config.with_ping_interval(Some(Duration::from_secs(args.ping_interval_secs)));
    }
    if let Some(ca_file) = &args.ca_file {
        config = config.with_connector(connector_from_ca_file(ca_file)?);
    }

    let root = CancellationToken::new();
    cancel_on_signal(root.clone());

    run_client(root, config).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
