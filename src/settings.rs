// Settings for the demo binary
// Precedence: CLI > config file > environment > defaults

use crate::config::{
    ServerOption, with_close_timeout, with_grpc_health_service, with_grpc_port, with_hostname,
    with_http_port, with_tls_certificate, with_tls_private_key, with_version,
};
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "BASESERVER_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,

    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    #[serde(default)]
    pub tls_key: Option<PathBuf>,

    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub grpc_health: bool,

    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_name() -> String {
    "baseserver".to_string()
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_http_port() -> u16 {
    9000
}

fn default_grpc_port() -> u16 {
    9001
}

fn default_close_timeout() -> u64 {
    5000
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            name: default_name(),
            hostname: default_hostname(),
            http_port: default_http_port(),
            grpc_port: default_grpc_port(),
            tls_cert: None,
            tls_key: None,
            close_timeout_ms: default_close_timeout(),
            version: None,
            grpc_health: false,
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Default, Parser)]
#[command(name = "baseserver")]
#[command(about = "HTTP + gRPC service bootstrap demo", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Service name reported in logs and metrics
    #[arg(long)]
    pub name: Option<String>,

    /// Host to bind both listeners on
    #[arg(long)]
    pub hostname: Option<String>,

    /// HTTP port (0 picks a free port)
    #[arg(long)]
    pub http_port: Option<u16>,

    /// gRPC port (0 picks a free port)
    #[arg(long)]
    pub grpc_port: Option<u16>,

    /// PEM certificate chain; enables TLS on both listeners
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching --tls-cert
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Drain deadline for shutdown in milliseconds
    #[arg(long)]
    pub close_timeout: Option<u64>,

    /// Version exported in server_build_info
    #[arg(long)]
    pub version: Option<String>,

    /// Serve grpc.health.v1.Health on the gRPC listener
    #[arg(long)]
    pub grpc_health: bool,

    /// Log level
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Log format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
}

impl Settings {
    /// Checks what only the settings layer knows about. Everything that maps onto a
    /// server option is validated once, when the server config is built.
    pub fn validate(&self) -> Result<()> {
        if self.close_timeout_ms == 0 {
            anyhow::bail!("close_timeout_ms must be greater than 0");
        }

        Ok(())
    }

    pub fn load() -> Result<Self> {
        Self::load_with(CliArgs::parse(), |key| std::env::var(key).ok())
    }

    /// Same as [`Settings::load`] with the CLI and environment supplied by the caller.
    pub fn load_with<F>(cli_args: CliArgs, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        // Environment only applies when no config file is given
        if cli_args.config.is_none() {
            settings = Self::load_from_env(settings, env)?;
        }

        if let Some(config_path) = &cli_args.config {
            settings = Self::load_from_file(config_path)?;
        }

        settings = Self::apply_cli_overrides(settings, cli_args);

        settings
            .validate()
            .context("Configuration validation failed")?;

        Ok(settings)
    }

    fn load_from_env<F>(mut settings: Settings, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| env(&format!("{}{}", ENV_PREFIX, name));

        if let Some(name) = var("NAME") {
            settings.name = name;
        }

        if let Some(hostname) = var("HOSTNAME") {
            settings.hostname = hostname;
        }

        if let Some(port) = var("HTTP_PORT") {
            settings.http_port = port.parse().context("Invalid BASESERVER_HTTP_PORT")?;
        }

        if let Some(port) = var("GRPC_PORT") {
            settings.grpc_port = port.parse().context("Invalid BASESERVER_GRPC_PORT")?;
        }

        if let Some(cert) = var("TLS_CERT") {
            settings.tls_cert = Some(PathBuf::from(cert));
        }

        if let Some(key) = var("TLS_KEY") {
            settings.tls_key = Some(PathBuf::from(key));
        }

        if let Some(timeout) = var("CLOSE_TIMEOUT") {
            settings.close_timeout_ms = timeout
                .parse()
                .context("Invalid BASESERVER_CLOSE_TIMEOUT")?;
        }

        if let Some(version) = var("VERSION") {
            settings.version = Some(version);
        }

        if let Some(enabled) = var("GRPC_HEALTH") {
            settings.grpc_health = match enabled.to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => anyhow::bail!("Invalid BASESERVER_GRPC_HEALTH: {}", enabled),
            };
        }

        if let Some(level) = var("LOG_LEVEL") {
            settings.log_level = match level.to_lowercase().as_str() {
                "trace" => LogLevel::Trace,
                "debug" => LogLevel::Debug,
                "info" => LogLevel::Info,
                "warn" => LogLevel::Warn,
                "error" => LogLevel::Error,
                _ => anyhow::bail!("Invalid log level: {}", level),
            };
        }

        if let Some(format) = var("LOG_FORMAT") {
            settings.log_format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                _ => anyhow::bail!("Invalid log format: {}", format),
            };
        }

        Ok(settings)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(settings)
    }

    fn apply_cli_overrides(mut settings: Settings, cli: CliArgs) -> Self {
        if let Some(name) = cli.name {
            settings.name = name;
        }

        if let Some(hostname) = cli.hostname {
            settings.hostname = hostname;
        }

        if let Some(port) = cli.http_port {
            settings.http_port = port;
        }

        if let Some(port) = cli.grpc_port {
            settings.grpc_port = port;
        }

        if let Some(cert) = cli.tls_cert {
            settings.tls_cert = Some(cert);
        }

        if let Some(key) = cli.tls_key {
            settings.tls_key = Some(key);
        }

        if let Some(timeout) = cli.close_timeout {
            settings.close_timeout_ms = timeout;
        }

        if let Some(version) = cli.version {
            settings.version = Some(version);
        }

        if cli.grpc_health {
            settings.grpc_health = true;
        }

        if let Some(level) = cli.log_level {
            settings.log_level = level;
        }

        if let Some(format) = cli.log_format {
            settings.log_format = format;
        }

        settings
    }

    /// Server options equivalent to these settings. The logger is left to the caller.
    pub fn to_options(&self) -> Vec<ServerOption> {
        let mut options = vec![
            with_hostname(self.hostname.clone()),
            with_http_port(i32::from(self.http_port)),
            with_grpc_port(i32::from(self.grpc_port)),
            with_close_timeout(Duration::from_millis(self.close_timeout_ms)),
        ];

        // Passed through one by one so a lone half of the pair is rejected by the server config
        if let Some(cert) = &self.tls_cert {
            options.push(with_tls_certificate(cert.clone()));
        }
        if let Some(key) = &self.tls_key {
            options.push(with_tls_private_key(key.clone()));
        }

        if let Some(version) = &self.version {
            options.push(with_version(version.clone()));
        }

        if self.grpc_health {
            options.push(with_grpc_health_service());
        }

        options
    }
}
