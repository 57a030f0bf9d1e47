/// TLS acceptor for the SSL listener.
///
/// Certificate and key come from `SSL_CERT`/`SSL_KEY`. Missing or invalid
/// material is a startup failure; the proxy never serves a listener with a
/// certificate it could not load.
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::error::ProxyError;

/// Load PEM material and build a ready-to-use TLS acceptor.
pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ProxyError> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| ProxyError::Tls(format!("cannot read {}: {e}", cert_path.display())))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| ProxyError::Tls(format!("cannot read {}: {e}", key_path.display())))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| ProxyError::Tls(format!("bad certificate in {}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ProxyError::Tls(format!("bad key in {}: {e}", key_path.display())))?
        .ok_or_else(|| {
            ProxyError::Tls(format!("no private key found in {}", key_path.display()))
        })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;

    info!("TLS certificate loaded from {}", cert_path.display());
    Ok(TlsAcceptor::from(Arc::new(config)))
}
