//! Configuration validation logic.

use std::net::SocketAddr;

use crate::config::schema::TunnelConfig;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a TunnelConfig for semantic correctness.
pub fn validate_config(config: &TunnelConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // 1. Bind addresses must parse
    if config.control.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError(format!(
            "control.bind_address '{}' is not a socket address",
            config.control.bind_address
        )));
    }
    if config.request.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError(format!(
            "request.bind_address '{}' is not a socket address",
            config.request.bind_address
        )));
    }

    // 2. Self-signed and file-based TLS are mutually exclusive
    if config.control.self_signed && config.control.tls.is_some() {
        errors.push(ValidationError(
            "control.self_signed and control.tls cannot both be set".to_string(),
        ));
    }

    // 3. The client must dial a WebSocket URL
    match url::Url::parse(&config.client.server_url) {
        Ok(url) if url.scheme() == "ws" || url.scheme() == "wss" => {}
        Ok(url) => errors.push(ValidationError(format!(
            "client.server_url scheme '{}' is not ws or wss",
            url.scheme()
        ))),
        Err(err) => errors.push(ValidationError(format!(
            "client.server_url '{}' is not a URL: {err}",
            config.client.server_url
        ))),
    }

    // 4. Frame ceiling must leave room for the request-id prefix
    if config.limits.max_frame_bytes <= crate::protocol::REQ_ID_LEN {
        errors.push(ValidationError(format!(
            "limits.max_frame_bytes must be greater than {}",
            crate::protocol::REQ_ID_LEN
        )));
    }

    // 5. Connection limits
    if config.control.max_connections == 0 {
        errors.push(ValidationError(
            "control.max_connections must be > 0".to_string(),
        ));
    }
    if config.request.max_connections == 0 {
        errors.push(ValidationError(
            "request.max_connections must be > 0".to_string(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&TunnelConfig::default()).is_ok());
    }

    #[test]
    fn test_bad_bind_address() {
        let mut config = TunnelConfig::default();
        config.control.bind_address = "not-an-address".into();

        let errs = validate_config(&config).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].0.contains("control.bind_address"));
    }

    #[test]
    fn test_bad_server_url_scheme() {
        let mut config = TunnelConfig::default();
        config.client.server_url = "http://localhost:10080".into();

        let errs = validate_config(&config).unwrap_err();
        assert!(errs[0].0.contains("is not ws or wss"));
    }

    #[test]
    fn test_zero_max_connections() {
        let mut config = TunnelConfig::default();
        config.control.max_connections = 0;

        let errs = validate_config(&config).unwrap_err();
        assert!(errs[0].0.contains("control.max_connections"));
    }

    #[test]
    fn test_conflicting_tls_settings() {
        let mut config = TunnelConfig::default();
        config.control.self_signed = true;
        config.control.tls = Some(crate::config::schema::TlsConfig {
            cert_path: "cert.pem".into(),
            key_path: "key.pem".into(),
        });

        let errs = validate_config(&config).unwrap_err();
        assert!(errs[0].0.contains("cannot both be set"));
    }
}
