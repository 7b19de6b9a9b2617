//! TLS for the worker protocol.
//!
//! The server presents a certificate chain loaded from PEM files. When a CA is
//! configured, workers must present a certificate signed by it (mTLS). Workers
//! verify the server against the same CA.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsConfig;

/// Error type for TLS configuration issues.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("Certificate path not configured")]
    MissingCert,

    #[error("Private key path not configured")]
    MissingKey,

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("Certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("No certificates in {0}")]
    NoCertificates(PathBuf),

    #[error("No private key in {0}")]
    NoPrivateKey(PathBuf),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),

    #[error("Client verifier rejected: {0}")]
    Verifier(#[from] VerifierBuilderError),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

async fn read_existing(path: &Path, missing: fn(PathBuf) -> TlsError) -> Result<Vec<u8>, TlsError> {
    if !path.exists() {
        return Err(missing(path.to_path_buf()));
    }
    Ok(fs::read(path).await?)
}

async fn load_certs(
    path: &Path,
    missing: fn(PathBuf) -> TlsError,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read_existing(path, missing).await?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

async fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_existing(path, TlsError::KeyNotFound).await?;
    rustls_pemfile::private_key(&mut BufReader::new(pem.as_slice()))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

async fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path, TlsError::CaCertNotFound).await? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Server-side TLS materials loaded from the paths in [`TlsConfig`].
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_roots: Option<RootCertStore>,
}

impl TlsIdentity {
    /// Load the certificate chain, key, and the optional client CA.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate or key is not configured, or if any
    /// configured file is missing or holds no usable PEM data.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let cert_path = config.cert_path.as_ref().ok_or(TlsError::MissingCert)?;
        let key_path = config.key_path.as_ref().ok_or(TlsError::MissingKey)?;

        let client_roots = match &config.ca_cert_path {
            Some(ca_path) => Some(load_roots(ca_path).await?),
            None => None,
        };
        let certs = load_certs(cert_path, TlsError::CertNotFound).await?;
        let key = load_key(key_path).await?;

        Ok(Self {
            certs,
            key,
            client_roots,
        })
    }

    pub fn requires_client_auth(&self) -> bool {
        self.client_roots.is_some()
    }

    /// Build the acceptor the worker server wraps connections with.
    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        let provider = provider();
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let config = match &self.client_roots {
            Some(roots) => {
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(roots.clone()), provider)
                        .build()?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(self.certs.clone(), self.key.clone_key())?
            }
            None => builder
                .with_no_client_auth()
                .with_single_cert(self.certs.clone(), self.key.clone_key())?,
        };
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Worker-side connector: trusts the configured CA and presents the worker's
/// own certificate when one is configured.
pub async fn connector(config: &TlsConfig) -> Result<TlsConnector, TlsError> {
    let ca_path = config.ca_cert_path.as_ref().ok_or(TlsError::MissingCaCert)?;
    let roots = load_roots(ca_path).await?;
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots);

    let client = match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path, TlsError::CertNotFound).await?;
            let key = load_key(key_path).await?;
            builder.with_client_auth_cert(certs, key)?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(client)))
}

pub fn server_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(name.to_string()).map_err(|_| TlsError::InvalidServerName(name.to_string()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn load_requires_cert_and_key() {
        let config = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(matches!(
            TlsIdentity::load(&config).await,
            Err(TlsError::MissingCert)
        ));

        let config = TlsConfig {
            enabled: true,
            cert_path: Some(PathBuf::from("/nonexistent/server.crt")),
            ..Default::default()
        };
        assert!(matches!(
            TlsIdentity::load(&config).await,
            Err(TlsError::MissingKey)
        ));
    }

    #[tokio::test]
    async fn load_nonexistent_files() {
        let config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            cert_path: Some(PathBuf::from("/nonexistent/server.crt")),
            key_path: Some(PathBuf::from("/nonexistent/server.key")),
            allow_insecure: false,
        };
        assert!(matches!(
            TlsIdentity::load(&config).await,
            Err(TlsError::CaCertNotFound(_))
        ));

        let config = TlsConfig {
            ca_cert_path: None,
            ..config
        };
        assert!(matches!(
            TlsIdentity::load(&config).await,
            Err(TlsError::CertNotFound(_))
        ));
    }

    #[tokio::test]
    async fn files_without_pem_blocks_are_rejected() {
        let mut junk = tempfile::NamedTempFile::new().unwrap();
        writeln!(junk, "not a certificate").unwrap();

        let config = TlsConfig {
            enabled: true,
            cert_path: Some(junk.path().to_path_buf()),
            key_path: Some(junk.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(
            TlsIdentity::load(&config).await,
            Err(TlsError::NoCertificates(_))
        ));
    }

    #[tokio::test]
    async fn connector_needs_a_ca() {
        assert!(matches!(
            connector(&TlsConfig::default()).await,
            Err(TlsError::MissingCaCert)
        ));
    }

    #[test]
    fn server_names() {
        assert!(server_name("looper.internal").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("").is_err());
    }
}
