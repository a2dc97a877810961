// Server configuration built from ordered options
// Options are applied in the order given, then validated exactly once

use crate::error::ServerError;
use crate::logger;
use crate::settings::{LogFormat, LogLevel};
use prometheus::Registry;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::Dispatch;

pub const DEFAULT_HOSTNAME: &str = "localhost";
pub const DEFAULT_HTTP_PORT: i32 = 9000;
pub const DEFAULT_GRPC_PORT: i32 = 9001;
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a PEM document comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum PemSource {
    File(PathBuf),
    Inline(Vec<u8>),
}

impl PemSource {
    fn read(&self, what: &str) -> Result<Vec<u8>, ServerError> {
        match self {
            PemSource::File(path) => std::fs::read(path).map_err(|e| {
                ServerError::config(format!("Failed to read TLS {} {:?}: {}", what, path, e))
            }),
            PemSource::Inline(bytes) => Ok(bytes.clone()),
        }
    }
}

impl From<PathBuf> for PemSource {
    fn from(path: PathBuf) -> Self {
        PemSource::File(path)
    }
}

impl From<&str> for PemSource {
    fn from(path: &str) -> Self {
        PemSource::File(PathBuf::from(path))
    }
}

pub enum ServerOption {
    Hostname(String),
    HttpPort(i32),
    GrpcPort(i32),
    TlsCertificate(PemSource),
    TlsPrivateKey(PemSource),
    MetricsRegistry(Registry),
    Logger(Dispatch),
    CloseTimeout(Duration),
    Version(String),
    GrpcHealthService,
}

impl fmt::Debug for ServerOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerOption::Hostname(host) => f.debug_tuple("Hostname").field(host).finish(),
            ServerOption::HttpPort(port) => f.debug_tuple("HttpPort").field(port).finish(),
            ServerOption::GrpcPort(port) => f.debug_tuple("GrpcPort").field(port).finish(),
            ServerOption::TlsCertificate(_) => f.write_str("TlsCertificate(..)"),
            ServerOption::TlsPrivateKey(_) => f.write_str("TlsPrivateKey(..)"),
            ServerOption::MetricsRegistry(_) => f.write_str("MetricsRegistry(..)"),
            ServerOption::Logger(_) => f.write_str("Logger(..)"),
            ServerOption::CloseTimeout(d) => f.debug_tuple("CloseTimeout").field(d).finish(),
            ServerOption::Version(v) => f.debug_tuple("Version").field(v).finish(),
            ServerOption::GrpcHealthService => f.write_str("GrpcHealthService"),
        }
    }
}

pub fn with_hostname(hostname: impl Into<String>) -> ServerOption {
    ServerOption::Hostname(hostname.into())
}

pub fn with_http_port(port: i32) -> ServerOption {
    ServerOption::HttpPort(port)
}

pub fn with_grpc_port(port: i32) -> ServerOption {
    ServerOption::GrpcPort(port)
}

pub fn with_tls_certificate(cert: impl Into<PemSource>) -> ServerOption {
    ServerOption::TlsCertificate(cert.into())
}

pub fn with_tls_private_key(key: impl Into<PemSource>) -> ServerOption {
    ServerOption::TlsPrivateKey(key.into())
}

/// Certificate chain and key file paths, both required.
pub fn with_tls(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> [ServerOption; 2] {
    [
        ServerOption::TlsCertificate(PemSource::File(cert.into())),
        ServerOption::TlsPrivateKey(PemSource::File(key.into())),
    ]
}

pub fn with_tls_pem(cert: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> [ServerOption; 2] {
    [
        ServerOption::TlsCertificate(PemSource::Inline(cert.into())),
        ServerOption::TlsPrivateKey(PemSource::Inline(key.into())),
    ]
}

pub fn with_metrics_registry(registry: Registry) -> ServerOption {
    ServerOption::MetricsRegistry(registry)
}

pub fn with_logger(logger: impl Into<Dispatch>) -> ServerOption {
    ServerOption::Logger(logger.into())
}

pub fn with_close_timeout(timeout: Duration) -> ServerOption {
    ServerOption::CloseTimeout(timeout)
}

pub fn with_version(version: impl Into<String>) -> ServerOption {
    ServerOption::Version(version.into())
}

pub fn with_grpc_health_service() -> ServerOption {
    ServerOption::GrpcHealthService
}

/// Parsed certificate chain and private key.
pub struct TlsMaterial {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsMaterial {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, ServerError> {
        let cert_chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::config(format!("Failed to parse TLS certificate: {}", e)))?;
        if cert_chain.is_empty() {
            return Err(ServerError::config(
                "TLS certificate PEM contains no certificates",
            ));
        }

        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| ServerError::config(format!("Failed to parse TLS private key: {}", e)))?
            .ok_or_else(|| ServerError::config("TLS private key PEM contains no private key"))?;

        Ok(TlsMaterial { cert_chain, key })
    }
}

impl Clone for TlsMaterial {
    fn clone(&self) -> Self {
        TlsMaterial {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("certificates", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

/// Resolved, validated configuration. Immutable once built.
#[derive(Clone)]
pub struct ServerConfig {
    pub name: String,
    pub hostname: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub tls: Option<TlsMaterial>,
    pub registry: Registry,
    pub registry_is_default: bool,
    pub logger: Dispatch,
    pub close_timeout: Duration,
    pub version: Option<String>,
    pub grpc_health_service: bool,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("name", &self.name)
            .field("hostname", &self.hostname)
            .field("http_port", &self.http_port)
            .field("grpc_port", &self.grpc_port)
            .field("tls", &self.tls.is_some())
            .field("registry_is_default", &self.registry_is_default)
            .field("close_timeout", &self.close_timeout)
            .field("version", &self.version)
            .field("grpc_health_service", &self.grpc_health_service)
            .finish_non_exhaustive()
    }
}

// Working value the options mutate before validation
struct PendingConfig {
    hostname: String,
    http_port: i32,
    grpc_port: i32,
    tls_cert: Option<PemSource>,
    tls_key: Option<PemSource>,
    registry: Option<Registry>,
    logger: Option<Dispatch>,
    close_timeout: Duration,
    version: Option<String>,
    grpc_health_service: bool,
}

impl Default for PendingConfig {
    fn default() -> Self {
        PendingConfig {
            hostname: DEFAULT_HOSTNAME.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            grpc_port: DEFAULT_GRPC_PORT,
            tls_cert: None,
            tls_key: None,
            registry: None,
            logger: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            version: None,
            grpc_health_service: false,
        }
    }
}

impl PendingConfig {
    fn apply(&mut self, option: ServerOption) {
        match option {
            ServerOption::Hostname(host) => self.hostname = host,
            ServerOption::HttpPort(port) => self.http_port = port,
            ServerOption::GrpcPort(port) => self.grpc_port = port,
            ServerOption::TlsCertificate(cert) => self.tls_cert = Some(cert),
            ServerOption::TlsPrivateKey(key) => self.tls_key = Some(key),
            ServerOption::MetricsRegistry(registry) => self.registry = Some(registry),
            ServerOption::Logger(logger) => self.logger = Some(logger),
            ServerOption::CloseTimeout(timeout) => self.close_timeout = timeout,
            ServerOption::Version(version) => self.version = Some(version),
            ServerOption::GrpcHealthService => self.grpc_health_service = true,
        }
    }

    fn validate(self, name: String) -> Result<ServerConfig, ServerError> {
        if name.trim().is_empty() {
            return Err(ServerError::config("server name must not be empty"));
        }

        if self.hostname.trim().is_empty() {
            return Err(ServerError::config("hostname must not be empty"));
        }

        let http_port = validate_port("http_port", self.http_port)?;
        let grpc_port = validate_port("grpc_port", self.grpc_port)?;

        if http_port != 0 && http_port == grpc_port {
            return Err(ServerError::config(format!(
                "http_port ({}) and grpc_port ({}) cannot be the same",
                http_port, grpc_port
            )));
        }

        let tls = match (self.tls_cert, self.tls_key) {
            (Some(cert), Some(key)) => {
                let cert_pem = cert.read("certificate")?;
                let key_pem = key.read("private key")?;
                Some(TlsMaterial::from_pem(&cert_pem, &key_pem)?)
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(ServerError::config(
                    "TLS certificate supplied without a private key",
                ));
            }
            (None, Some(_)) => {
                return Err(ServerError::config(
                    "TLS private key supplied without a certificate",
                ));
            }
        };

        let (registry, registry_is_default) = match self.registry {
            Some(registry) => (registry, false),
            None => (default_registry(), true),
        };

        // Never inherit the caller's dispatcher; an unset logger is info-level JSON on stdout
        let logger = self
            .logger
            .unwrap_or_else(|| logger::build(LogLevel::default(), LogFormat::default()));

        Ok(ServerConfig {
            name,
            hostname: self.hostname,
            http_port,
            grpc_port,
            tls,
            registry,
            registry_is_default,
            logger,
            close_timeout: self.close_timeout,
            version: self.version,
            grpc_health_service: self.grpc_health_service,
        })
    }
}

fn validate_port(field: &str, port: i32) -> Result<u16, ServerError> {
    u16::try_from(port).map_err(|_| {
        ServerError::config(format!(
            "{} must be between 0 and 65535, got {}",
            field, port
        ))
    })
}

fn default_registry() -> Registry {
    let registry = Registry::new();

    #[cfg(target_os = "linux")]
    {
        let collector = prometheus::process_collector::ProcessCollector::for_self();
        if let Err(e) = registry.register(Box::new(collector)) {
            tracing::warn!(error = %e, "Failed to register process collector");
        }
    }

    registry
}

impl ServerConfig {
    pub fn build<I>(name: impl Into<String>, options: I) -> Result<Self, ServerError>
    where
        I: IntoIterator<Item = ServerOption>,
    {
        let mut pending = PendingConfig::default();
        for option in options {
            pending.apply(option);
        }
        pending.validate(name.into())
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::build("svc", []).unwrap();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.grpc_port, 9001);
        assert!(config.tls.is_none());
        assert!(config.registry_is_default);
        assert_eq!(config.close_timeout, DEFAULT_CLOSE_TIMEOUT);
        assert!(!config.grpc_health_service);
    }

    #[test]
    fn test_default_logger_ignores_current_dispatcher() {
        // A silent dispatcher in scope must not leak into the built config
        let config = tracing::dispatcher::with_default(&logger::disabled(), || {
            ServerConfig::build("svc", []).unwrap()
        });
        assert!(!config.logger.is::<tracing::subscriber::NoSubscriber>());

        let config = ServerConfig::build("svc", [with_logger(logger::disabled())]).unwrap();
        assert!(config.logger.is::<tracing::subscriber::NoSubscriber>());
    }

    #[test]
    fn test_options_apply_in_order() {
        let config = ServerConfig::build(
            "svc",
            [with_http_port(1000), with_grpc_port(2000), with_http_port(3000)],
        )
        .unwrap();
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.grpc_port, 2000);
    }

    #[test]
    fn test_negative_port_rejected() {
        let err = ServerConfig::build("svc", [with_grpc_port(-1)]).unwrap_err();
        assert!(matches!(err, ServerError::Configuration(_)));
        assert!(err.to_string().contains("grpc_port"));
    }

    #[test]
    fn test_out_of_range_port_rejected() {
        let err = ServerConfig::build("svc", [with_http_port(70_000)]).unwrap_err();
        assert!(err.to_string().contains("http_port"));
    }

    #[test]
    fn test_ephemeral_ports_may_coincide() {
        let config =
            ServerConfig::build("svc", [with_http_port(0), with_grpc_port(0)]).unwrap();
        assert_eq!(config.http_port, 0);
        assert_eq!(config.grpc_port, 0);
    }

    #[test]
    fn test_port_conflict_rejected() {
        let err = ServerConfig::build("svc", [with_http_port(7000), with_grpc_port(7000)])
            .unwrap_err();
        assert!(err.to_string().contains("cannot be the same"));
    }

    #[test]
    fn test_certificate_without_key_rejected() {
        let err = ServerConfig::build(
            "svc",
            [with_tls_certificate(PemSource::Inline(b"cert".to_vec()))],
        )
        .unwrap_err();
        assert!(err.to_string().contains("without a private key"));
    }

    #[test]
    fn test_key_without_certificate_rejected() {
        let err = ServerConfig::build(
            "svc",
            [with_tls_private_key(PemSource::Inline(b"key".to_vec()))],
        )
        .unwrap_err();
        assert!(err.to_string().contains("without a certificate"));
    }

    #[test]
    fn test_unparseable_pem_rejected() {
        let err = ServerConfig::build("svc", with_tls_pem("not a pem", "also not a pem"))
            .unwrap_err();
        assert!(matches!(err, ServerError::Configuration(_)));
    }

    #[test]
    fn test_missing_tls_file_rejected() {
        let err = ServerConfig::build(
            "svc",
            with_tls("/nonexistent/cert.pem", "/nonexistent/key.pem"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Failed to read TLS certificate"));
    }

    #[test]
    fn test_custom_registry_is_shared() {
        let registry = Registry::new();
        let counter = prometheus::IntCounter::new("custom_total", "custom").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();

        let config = ServerConfig::build("svc", [with_metrics_registry(registry)]).unwrap();
        assert!(!config.registry_is_default);
        counter.inc();

        let exposition = crate::metrics::render(&config.registry).unwrap();
        assert!(exposition.contains("custom_total 1"));
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(ServerConfig::build("  ", []).is_err());
    }
}
