/// TLS client configuration for SIP signalling
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Cannot read CA bundle {0}: {1}")]
    CaBundle(PathBuf, String),

    #[error("Invalid CA certificate: {0}")]
    InvalidCertificate(String),

    #[error("Invalid TLS configuration: {0}")]
    Config(String),
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to CA certificate bundle for verification (PEM format)
    pub ca_bundle_path: Option<PathBuf>,

    /// Name checked against the server certificate instead of the account host
    pub server_name: Option<String>,

    /// Seconds allowed for TCP connect plus handshake
    pub handshake_timeout: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_bundle_path: None,
            server_name: None,
            handshake_timeout: 10,
        }
    }
}

impl TlsConfig {
    /// Set CA bundle path
    pub fn with_ca_bundle(mut self, ca_path: PathBuf) -> Self {
        self.ca_bundle_path = Some(ca_path);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), TlsError> {
        if let Some(path) = &self.ca_bundle_path {
            if !path.exists() {
                return Err(TlsError::CaBundle(path.clone(), "file not found".to_string()));
            }
        }
        if self.handshake_timeout == 0 {
            return Err(TlsError::Config("handshake_timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Name to verify the peer certificate against
    pub fn server_name_for(&self, host: &str) -> String {
        self.server_name.clone().unwrap_or_else(|| host.to_string())
    }

    /// Build the rustls client configuration. Peers are always verified;
    /// without a CA bundle no server certificate is trusted.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
        let mut root_store = RootCertStore::empty();

        match &self.ca_bundle_path {
            Some(path) => {
                let file = File::open(path)
                    .map_err(|e| TlsError::CaBundle(path.clone(), e.to_string()))?;
                let certs = rustls_pemfile::certs(&mut BufReader::new(file))
                    .collect::<Result<Vec<CertificateDer<'static>>, _>>()
                    .map_err(|e| TlsError::CaBundle(path.clone(), e.to_string()))?;
                for cert in certs {
                    root_store
                        .add(cert)
                        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
                }
                info!("Loaded {} CA certificates from {}", root_store.len(), path.display());
            }
            None => warn!("No CA bundle configured, TLS servers cannot be verified"),
        }

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TlsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server_name_for("sip.example.com"), "sip.example.com");
        assert!(config.client_config().is_ok());
    }

    #[test]
    fn test_missing_bundle() {
        let config = TlsConfig::default().with_ca_bundle(PathBuf::from("/nonexistent/ca.pem"));
        assert!(matches!(config.validate(), Err(TlsError::CaBundle(_, _))));
        assert!(config.client_config().is_err());
    }

    #[test]
    fn test_server_name_override() {
        let config = TlsConfig {
            server_name: Some("proxy.example.net".to_string()),
            ..Default::default()
        };
        assert_eq!(config.server_name_for("10.0.0.1"), "proxy.example.net");
    }
}
