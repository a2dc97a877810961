// Shared helpers for integration tests: a minimal HTTP(S) client and a log buffer

#![allow(dead_code)]

use bytes::Bytes;
use http::{Request, StatusCode, header};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, crypto::ring};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const CA_PEM: &[u8] = include_bytes!("../fixtures/ca.crt");
pub const CERT_PEM: &[u8] = include_bytes!("../fixtures/localhost.crt");
pub const KEY_PEM: &[u8] = include_bytes!("../fixtures/localhost.key");
pub const OTHER_KEY_PEM: &[u8] = include_bytes!("../fixtures/other.key");

pub fn fixture(name: &str) -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Plain HTTP/1.1 GET, returning status and body text.
pub async fn get(addr: SocketAddr, path: &str) -> Result<(StatusCode, String), BoxError> {
    let stream = TcpStream::connect(addr).await?;
    send(stream, path).await
}

/// HTTPS GET trusting only the certificates in `roots_pem`.
pub async fn get_tls(
    addr: SocketAddr,
    path: &str,
    roots_pem: &[u8],
) -> Result<(StatusCode, String), BoxError> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &*roots_pem) {
        roots.add(cert?)?;
    }

    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let stream = TcpStream::connect(addr).await?;
    let domain = ServerName::try_from("localhost")?.to_owned();
    let tls = connector.connect(domain, stream).await?;
    send(tls, path).await
}

async fn send<I>(io: I, path: &str) -> Result<(StatusCode, String), BoxError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request = Request::builder()
        .uri(path)
        .header(header::HOST, "localhost")
        .body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await?;

    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}

/// In-memory sink for a `tracing_subscriber::fmt` writer.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn dispatch(&self) -> tracing::Dispatch {
        let buffer = self.clone();
        tracing::Dispatch::new(
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_ansi(false)
                .with_writer(move || buffer.clone())
                .finish(),
        )
    }

    pub fn json_dispatch(&self) -> tracing::Dispatch {
        let buffer = self.clone();
        tracing::Dispatch::new(
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_writer(move || buffer.clone())
                .finish(),
        )
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
