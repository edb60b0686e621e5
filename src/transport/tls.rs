//! TLS stream construction.
//!
//! The connection pump is generic over the byte stream; this module builds
//! the TLS-wrapped streams that flow through it. Servers load a PEM
//! certificate chain and PKCS8 key into a `TlsAcceptor`; clients build a
//! `TlsConnector` trusting either an explicit root certificate (useful for
//! self-signed deployments and tests) or the platform's native roots.
//!
//! Certificate policy ends here: once the handshake succeeds, the resulting
//! stream pumps exactly like a plain socket.

use crate::error::{ProtocolError, Result};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Server-side TLS material: certificate chain and private key paths.
pub struct TlsServerConfig {
    cert_path: String,
    key_path: String,
}

impl TlsServerConfig {
    pub fn new<P: AsRef<Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_string_lossy().to_string(),
            key_path: key_path.as_ref().to_string_lossy().to_string(),
        }
    }

    /// Loads the certificate chain and key and builds the acceptor.
    ///
    /// # Errors
    /// [`ProtocolError::TlsError`] for unreadable or unparseable PEM files,
    /// an empty certificate chain, or a key rustls refuses.
    pub fn load(&self) -> Result<TlsAcceptor> {
        let cert_chain = load_certs(&self.cert_path)?;
        if cert_chain.is_empty() {
            return Err(ProtocolError::TlsError(format!(
                "no certificates found in {}",
                self.cert_path
            )));
        }
        let key = load_key(&self.key_path)?;

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| ProtocolError::TlsError(format!("invalid certificate/key: {e}")))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Client-side TLS material: the name to verify the server against and the
/// roots to trust.
pub struct TlsClientConfig {
    server_name: String,
    root_ca_path: Option<String>,
}

impl TlsClientConfig {
    /// `server_name` is the DNS name the server's certificate must carry;
    /// it is independent of the address the connection dials.
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            root_ca_path: None,
        }
    }

    /// Trusts the certificates in this PEM file instead of the platform's
    /// native roots.
    pub fn with_root_ca<S: Into<String>>(mut self, path: S) -> Self {
        self.root_ca_path = Some(path.into());
        self
    }

    /// Builds the connector from the configured roots.
    pub fn load(&self) -> Result<TlsConnector> {
        let mut root_store = RootCertStore::empty();
        match &self.root_ca_path {
            Some(path) => {
                for cert in load_certs(path)? {
                    root_store.add(&cert).map_err(|e| {
                        ProtocolError::TlsError(format!("failed to add root certificate: {e}"))
                    })?;
                }
            }
            None => {
                let native = rustls_native_certs::load_native_certs().map_err(|e| {
                    ProtocolError::TlsError(format!("failed to load native roots: {e}"))
                })?;
                for cert in native {
                    root_store.add(&Certificate(cert.0)).map_err(|e| {
                        ProtocolError::TlsError(format!("failed to add native root: {e}"))
                    })?;
                }
            }
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        Ok(TlsConnector::from(Arc::new(config)))
    }

    /// The configured name as a rustls `ServerName`.
    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str()).map_err(|_| {
            ProtocolError::TlsError(format!("invalid server name: {}", self.server_name))
        })
    }
}

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let file = File::open(path)
        .map_err(|e| ProtocolError::TlsError(format!("failed to open {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let raw = certs(&mut reader)
        .map_err(|_| ProtocolError::TlsError(format!("failed to parse certificates in {path}")))?;
    Ok(raw.into_iter().map(Certificate).collect())
}

fn load_key(path: &str) -> Result<PrivateKey> {
    let file = File::open(path)
        .map_err(|e| ProtocolError::TlsError(format!("failed to open {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let mut keys = pkcs8_private_keys(&mut reader)
        .map_err(|_| ProtocolError::TlsError(format!("failed to parse private key in {path}")))?;
    if keys.is_empty() {
        return Err(ProtocolError::TlsError(format!(
            "no PKCS8 private key found in {path}"
        )));
    }
    Ok(PrivateKey(keys.remove(0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_certificate_file_is_a_tls_error() {
        let config = TlsServerConfig::new("/definitely/absent.pem", "/definitely/absent.key");
        assert!(matches!(config.load(), Err(ProtocolError::TlsError(_))));
    }

    #[test]
    fn missing_root_ca_file_is_a_tls_error() {
        let config = TlsClientConfig::new("localhost").with_root_ca("/definitely/absent.pem");
        assert!(matches!(config.load(), Err(ProtocolError::TlsError(_))));
    }

    #[test]
    fn server_name_must_be_a_valid_dns_name() {
        assert!(TlsClientConfig::new("localhost").server_name().is_ok());
        assert!(matches!(
            TlsClientConfig::new("not a hostname").server_name(),
            Err(ProtocolError::TlsError(_))
        ));
    }
}
