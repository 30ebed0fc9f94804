//! TLS material for STARTTLS
//!
//! The server treats the rustls configuration as opaque: it only needs an
//! acceptor to run the handshake. Material is either loaded from PEM files
//! or generated self-signed for development and tests.

use crate::error::{Result, SmtpdError};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// TLS configuration for SMTP
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Wrap an externally built rustls configuration
    pub fn new(server_config: Arc<ServerConfig>) -> Self {
        Self { server_config }
    }

    /// Create TLS config from certificate and key files
    ///
    /// # Examples
    /// ```no_run
    /// use smtpd_rs::security::TlsConfig;
    ///
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let tls_config = TlsConfig::from_pem_files(
    ///     "/etc/mail/cert.pem",
    ///     "/etc/mail/key.pem"
    /// )?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("Loading TLS certificate from {:?}", cert_path.as_ref());

        let cert_file = File::open(cert_path.as_ref()).map_err(|e| {
            SmtpdError::Tls(format!("Failed to open certificate file: {}", e))
        })?;
        let certs = certs(&mut BufReader::new(cert_file))
            .map_err(|e| SmtpdError::Tls(format!("Failed to read certificates: {}", e)))?;

        if certs.is_empty() {
            return Err(SmtpdError::Tls("No certificates found in file".to_string()));
        }

        debug!("Loaded {} certificate(s)", certs.len());

        let mut keys = Self::read_keys(key_path.as_ref(), pkcs8_private_keys)?;
        if keys.is_empty() {
            warn!("No PKCS#8 key found, trying RSA format");
            keys = Self::read_keys(key_path.as_ref(), rsa_private_keys)?;
        }

        if keys.is_empty() {
            return Err(SmtpdError::Tls("No private key found in file".to_string()));
        }

        Self::from_der(certs, keys.remove(0))
    }

    /// Generate a self-signed certificate for `hostname`
    ///
    /// **WARNING**: Only use for development! Clients cannot verify it.
    pub fn self_signed(hostname: &str) -> Result<Self> {
        info!("Generating self-signed certificate for {}", hostname);

        let cert = rcgen::generate_simple_self_signed(vec![hostname.to_string()])
            .map_err(|e| SmtpdError::Tls(format!("Failed to generate certificate: {}", e)))?;
        let cert_der = cert
            .serialize_der()
            .map_err(|e| SmtpdError::Tls(format!("Failed to serialize certificate: {}", e)))?;

        Self::from_der(vec![cert_der], cert.serialize_private_key_der())
    }

    fn from_der(cert_chain: Vec<Vec<u8>>, private_key: Vec<u8>) -> Result<Self> {
        // rustls 0.21 API
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                cert_chain.into_iter().map(rustls::Certificate).collect(),
                rustls::PrivateKey(private_key),
            )
            .map_err(|e| SmtpdError::Tls(format!("Failed to create TLS config: {}", e)))?;

        Ok(Self::new(Arc::new(config)))
    }

    fn read_keys(
        path: &Path,
        parse: fn(&mut dyn std::io::BufRead) -> std::io::Result<Vec<Vec<u8>>>,
    ) -> Result<Vec<Vec<u8>>> {
        let key_file = File::open(path)
            .map_err(|e| SmtpdError::Tls(format!("Failed to open key file: {}", e)))?;

        parse(&mut BufReader::new(key_file))
            .map_err(|e| SmtpdError::Tls(format!("Failed to read private keys: {}", e)))
    }

    /// Get the rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    /// Create a TLS acceptor for STARTTLS
    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}
