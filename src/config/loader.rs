//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::TunnelConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<TunnelConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    let config: TunnelConfig = toml::from_str(&content).map_err(ConfigError::Parse)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses() {
        let config: TunnelConfig = toml::from_str(
            r#"
            [control]
            bind_address = "127.0.0.1:9000"

            [client]
            server_url = "wss://tunnel.example.com:9000"
            target_address = "localhost:3000"
            "#,
        )
        .unwrap();

        assert_eq!(config.control.bind_address, "127.0.0.1:9000");
        assert_eq!(config.client.target_address, "localhost:3000");
        // Untouched sections fall back to defaults.
        assert_eq!(config.request.request_timeout_secs, 30);
    }
}
