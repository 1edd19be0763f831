//! TLS configuration for the control listener and the client dialer.
//!
//! # Responsibilities
//! - Load certificates and private keys from PEM files
//! - Mint a self-signed localhost certificate when asked
//! - Build the rustls connector the client uses for wss:// endpoints

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use tokio_tungstenite::Connector;

/// Errors from TLS material loading or generation.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read TLS material: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("certificate generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("no certificates found in {0}")]
    NoCertificates(String),
}

/// Load a rustls server config from PEM certificate and key files.
pub fn server_config_from_files(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<ServerConfig>, TlsError> {
    install_crypto_provider();

    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_reader).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.display().to_string()));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.display().to_string()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Mint a throwaway CA plus a localhost server certificate signed by it.
///
/// Returns the server config and the CA certificate in DER form so a
/// client can trust it.
pub fn self_signed_config() -> Result<(Arc<ServerConfig>, CertificateDer<'static>), TlsError> {
    install_crypto_provider();

    let ca_key = rcgen::KeyPair::generate()?;
    let mut ca_params = rcgen::CertificateParams::new(Vec::new())?;
    ca_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "reverse-tunnel CA");
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::KeyCertSign,
    ];
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let server_key = rcgen::KeyPair::generate()?;
    let mut server_params =
        rcgen::CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])?;
    server_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key)?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server_key.serialize_der()));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![server_cert.der().clone()], key)?;

    Ok((Arc::new(config), ca_cert.der().clone()))
}

/// Build the client-side connector trusting exactly one CA certificate.
pub fn client_connector(ca: &CertificateDer<'static>) -> Result<Connector, TlsError> {
    install_crypto_provider();

    let mut roots = RootCertStore::empty();
    roots.add(ca.clone())?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(config)))
}

/// Build the client-side connector from a PEM file of trusted roots.
pub fn connector_from_ca_file(ca_path: &Path) -> Result<Connector, TlsError> {
    install_crypto_provider();

    let mut reader = BufReader::new(File::open(ca_path)?);
    let mut roots = RootCertStore::empty();
    let mut found = false;
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert?)?;
        found = true;
    }
    if !found {
        return Err(TlsError::NoCertificates(ca_path.display().to_string()));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(config)))
}

fn install_crypto_provider() {
    // Idempotent; the error just means a provider is already installed.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_material_builds_both_sides() {
        let (_server_config, ca) = self_signed_config().unwrap();
        assert!(!ca.as_ref().is_empty());
        client_connector(&ca).unwrap();
    }
}
