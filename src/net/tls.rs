//! TLS configuration and certificate loading.
//!
//! The runtime only needs one thing from the certificate collaborator: the
//! server configuration to use for the next handshake. Providers are asked
//! once per accepted connection, so rotating the returned configuration is
//! transparent to connections already established.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum_server::tls_rustls::RustlsConfig;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::net::listener::BoxedIo;

/// Supplies TLS server configuration; may be called concurrently and may
/// return a different configuration between calls.
pub trait CertificateProvider: Send + Sync + 'static {
    fn server_config(&self) -> Arc<ServerConfig>;
}

impl CertificateProvider for RustlsConfig {
    fn server_config(&self) -> Arc<ServerConfig> {
        self.get_inner()
    }
}

/// Provider with explicit rotation.
#[derive(Debug)]
pub struct ReloadableTls {
    config: ArcSwap<ServerConfig>,
}

impl ReloadableTls {
    pub fn new(initial: Arc<ServerConfig>) -> Self {
        Self {
            config: ArcSwap::new(initial),
        }
    }

    /// Replace the configuration used for subsequent handshakes.
    pub fn replace(&self, next: Arc<ServerConfig>) -> Arc<ServerConfig> {
        self.config.swap(next)
    }
}

impl CertificateProvider for ReloadableTls {
    fn server_config(&self) -> Arc<ServerConfig> {
        self.config.load_full()
    }
}

/// Load TLS configuration from certificate and key files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, std::io::Error> {
    // Basic validation
    if !cert_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }

    RustlsConfig::from_pem_file(cert_path, key_path).await
}

/// Generate a self-signed certificate valid for `hosts`.
pub fn self_signed(hosts: Vec<String>) -> Result<Arc<ServerConfig>, std::io::Error> {
    let hosts = if hosts.is_empty() {
        vec!["localhost".to_string()]
    } else {
        hosts
    };

    let certified = rcgen::generate_simple_self_signed(hosts).map_err(std::io::Error::other)?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![certified.cert.der().clone()], key)
        .map_err(std::io::Error::other)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Perform the server side of a TLS handshake with the provider's current
/// configuration.
pub async fn accept(provider: &dyn CertificateProvider, io: BoxedIo) -> Result<BoxedIo, std::io::Error> {
    let acceptor = TlsAcceptor::from(provider.server_config());
    let stream = acceptor.accept(io).await?;
    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_negotiates_h2() {
        let config = self_signed(vec!["127.0.0.1".into()]).unwrap();
        assert_eq!(config.alpn_protocols[0], b"h2".to_vec());
    }

    #[test]
    fn reloadable_swaps_config() {
        let first = self_signed(vec![]).unwrap();
        let second = self_signed(vec!["example.test".into()]).unwrap();
        let provider = ReloadableTls::new(first.clone());
        assert!(Arc::ptr_eq(&provider.server_config(), &first));

        let previous = provider.replace(second.clone());
        assert!(Arc::ptr_eq(&previous, &first));
        assert!(Arc::ptr_eq(&provider.server_config(), &second));
    }

    #[tokio::test]
    async fn missing_files_are_reported() {
        let err = load_tls_config(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
