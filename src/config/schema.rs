//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_MAX_FRAME_BYTES;

/// Root configuration for the tunnel binaries.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TunnelConfig {
    /// Control-plane listener (WebSocket upgrades from tunnel clients).
    pub control: ControlListenerConfig,

    /// Request listener (the public front door).
    pub request: RequestListenerConfig,

    /// Tunnel client settings.
    pub client: ClientTunnelConfig,

    /// Frame and buffering limits.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Control-plane listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlListenerConfig {
    /// Bind address (e.g. "0.0.0.0:10080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Generate a throwaway self-signed certificate instead of loading
    /// one from disk. Mutually exclusive with `tls`.
    pub self_signed: bool,

    /// Maximum concurrent connections on the TLS path (backpressure).
    pub max_connections: usize,
}

impl Default for ControlListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:10080".to_string(),
            tls: None,
            self_signed: false,
            max_connections: 10_000,
        }
    }
}

/// Front-door listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestListenerConfig {
    /// Bind address (e.g. "0.0.0.0:80").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Per-request timeout on the front door in seconds.
    pub request_timeout_secs: u64,

    /// Maximum concurrent connections on the TLS path (backpressure).
    pub max_connections: usize,
}

impl Default for RequestListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:10081".to_string(),
            tls: None,
            request_timeout_secs: 30,
            max_connections: 10_000,
        }
    }
}

/// TLS material for a listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Tunnel client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientTunnelConfig {
    /// Control endpoint of the tunnel server (ws:// or wss://).
    pub server_url: String,

    /// Authority of the private target (e.g. "localhost:8000").
    pub target_address: String,

    /// PEM file with roots to trust for wss:// endpoints.
    pub ca_file: Option<String>,

    /// Idle interval between WebSocket pings in seconds; 0 disables pings.
    pub ping_interval_secs: u64,
}

impl Default for ClientTunnelConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:10080".to_string(),
            target_address: "localhost:8000".to_string(),
            ca_file: None,
            ping_interval_secs: 0,
        }
    }
}

/// Frame and buffering limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Ceiling for a single tunnel frame in bytes.
    pub max_frame_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default tracing filter when RUST_LOG is not set.
    pub log_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "reverse_tunnel=info,tower_http=info".to_string(),
        }
    }
}
