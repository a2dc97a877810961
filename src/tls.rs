// Transport encryption shared by the HTTP and gRPC listeners
// One acceptor wraps both; ALPN advertises h2 first so gRPC clients negotiate HTTP/2

use crate::config::TlsMaterial;
use crate::error::ServerError;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::crypto::ring;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn build_acceptor(material: &TlsMaterial) -> Result<TlsAcceptor, ServerError> {
    let provider = Arc::new(ring::default_provider());

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::Tls(format!("Unsupported protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(material.cert_chain.clone(), material.key.clone_key())
        .map_err(|e| ServerError::Tls(format!("Invalid certificate/key pair: {}", e)))?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}
