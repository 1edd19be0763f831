//! Public endpoint of the reverse HTTP tunnel.
//!
//! Runs two listeners: the control server that tunnel clients dial over
//! WebSocket, and the request server (front door) whose traffic is pushed
//! through the tunnel.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use reverse_tunnel::config::loader::load_config;
use reverse_tunnel::config::schema::{TlsConfig, TunnelConfig};
use reverse_tunnel::config::validation::validate_config;
use reverse_tunnel::http::{control_router, request_router};
use reverse_tunnel::lifecycle::signals::cancel_on_signal;
use reverse_tunnel::net;
use reverse_tunnel::observability::init_logging;
use reverse_tunnel::TunnelServer;

#[derive(Parser)]
#[command(name = "tunnel-server")]
#[command(about = "Public endpoint of the reverse HTTP tunnel", long_about = None)]
struct Args {
    /// Control server bind address (tunnel clients connect here)
    #[arg(long, default_value = "0.0.0.0:10080")]
    ctrl_srv_addr: String,

    /// Generate a self-signed TLS certificate for the control server
    #[arg(long)]
    ctrl_srv_self_signed: bool,

    /// Path of the control server TLS certificate file
    #[arg(long)]
    ctrl_srv_cert: Option<PathBuf>,

    /// Path of the control server TLS private key file
    #[arg(long)]
    ctrl_srv_key: Option<PathBuf>,

    /// Request server bind address (public HTTP traffic)
    #[arg(long, default_value = "0.0.0.0:10081")]
    req_srv_addr: String,

    /// Path of the request server TLS certificate file
    #[arg(long)]
    req_srv_cert: Option<PathBuf>,

    /// Path of the request server TLS private key file
    #[arg(long)]
    req_srv_key: Option<PathBuf>,

    /// Per-request timeout on the front door in seconds
    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,

    /// Load settings from a TOML file instead of the flags above
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = resolve_config(&args)?;

    init_logging(&config.observability.log_filter);
    tracing::info!(
        control_address = %config.control.bind_address,
        request_address = %config.request.bind_address,
        "tunnel server starting"
    );

    let server = TunnelServer::with_max_frame_bytes(config.limits.max_frame_bytes);
    let root = CancellationToken::new();
    cancel_on_signal(root.clone());

    let mut tasks = JoinSet::new();

    // Control listener: WebSocket upgrades from tunnel clients.
    let control_listener = TcpListener::bind(&config.control.bind_address).await?;
    let control = control_router(server.clone());
    if config.control.self_signed {
        let (tls_config, _ca) = net::tls::self_signed_config()?;
        tasks.spawn(net::serve_tls(
            control_listener,
            control,
            tls_config,
            config.control.max_connections,
            root.child_token(),
        ));
    } else if let Some(tls) = &config.control.tls {
        let tls_config = net::tls::server_config_from_files(
            std::path::Path::new(&tls.cert_path),
            std::path::Path::new(&tls.key_path),
        )?;
        tasks.spawn(net::serve_tls(
            control_listener,
            control,
            tls_config,
            config.control.max_connections,
            root.child_token(),
        ));
    } else {
        tasks.spawn(net::serve(control_listener, control, root.child_token()));
    }

    // Request listener: the public front door.
    let request_listener = TcpListener::bind(&config.request.bind_address).await?;
    let request = request_router(
        server.clone(),
        Duration::from_secs(config.request.request_timeout_secs),
    );
    if let Some(tls) = &config.request.tls {
        let tls_config = net::tls::server_config_from_files(
            std::path::Path::new(&tls.cert_path),
            std::path::Path::new(&tls.key_path),
        )?;
        tasks.spawn(net::serve_tls(
            request_listener,
            request,
            tls_config,
            config.request.max_connections,
            root.child_token(),
        ));
    } else {
        tasks.spawn(net::serve(request_listener, request, root.child_token()));
    }

    tokio::select! {
        _ = root.cancelled() => {}
        Some(finished) = tasks.join_next() => {
            if let Ok(Err(err)) = finished {
                tracing::error!(error = %err, "listener failed");
            }
        }
    }

    server.shutdown();
    root.cancel();
    while let Some(finished) = tasks.join_next().await {
        if let Ok(Err(err)) = finished {
            tracing::error!(error = %err, "listener failed during shutdown");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn resolve_config(args: &Args) -> Result<TunnelConfig, Box<dyn std::error::Error>> {
    if let Some(path) = &args.config {
        return Ok(load_config(path)?);
    }

    let mut config = TunnelConfig::default();
    config.control.bind_address = args.ctrl_srv_addr.clone();
    config.control.self_signed = args.ctrl_srv_self_signed;
    config.control.tls = tls_from_flags(&args.ctrl_srv_cert, &args.ctrl_srv_key, "ctrl-srv")?;
    config.request.bind_address = args.req_srv_addr.clone();
    config.request.tls = tls_from_flags(&args.req_srv_cert, &args.req_srv_key, "req-srv")?;
    config.request.request_timeout_secs = args.request_timeout_secs;

    validate_config(&config).map_err(|errors| {
        errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    })?;
    Ok(config)
}

fn tls_from_flags(
    cert: &Option<PathBuf>,
    key: &Option<PathBuf>,
    prefix: &str,
) -> Result<Option<TlsConfig>, Box<dyn std::error::Error>> {
    match (cert, key) {
        (Some(cert), Some(key)) => Ok(Some(TlsConfig {
            cert_path: cert.display().to_string(),
            key_path: key.display().to_string(),
        })),
        (None, None) => Ok(None),
        (Some(_), None) => {
            Err(format!("if --{prefix}-cert is specified --{prefix}-key must be specified too").into())
        }
        (None, Some(_)) => {
            Err(format!("if --{prefix}-key is specified --{prefix}-cert must be specified too").into())
        }
    }
}
