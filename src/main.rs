// Demo binary: one service answering HTTP and gRPC until SIGINT/SIGTERM
// Wires settings, logger and the server together

use anyhow::{Context, Result};
use baseserver::config::with_logger;
use baseserver::logger;
use baseserver::router::text_response;
use baseserver::server::Server;
use baseserver::settings::Settings;
use http::{Request, StatusCode};
use hyper::body::Incoming;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;

    let dispatch = logger::build(settings.log_level, settings.log_format);
    tracing::dispatcher::set_global_default(dispatch.clone())
        .context("Failed to initialize logger")?;

    tracing::info!(
        name = %settings.name,
        http = %format!("{}:{}", settings.hostname, settings.http_port),
        grpc = %format!("{}:{}", settings.hostname, settings.grpc_port),
        tls = settings.tls_cert.is_some(),
        log_level = ?settings.log_level,
        log_format = ?settings.log_format,
        "Service bootstrap starting"
    );

    let mut options = settings.to_options();
    options.push(with_logger(dispatch));

    let server =
        Server::new(settings.name.clone(), options).context("Failed to configure server")?;

    let greeting = format!("hello from {}\n", settings.name);
    server
        .handle("/", move |_req: Request<Incoming>| {
            let greeting = greeting.clone();
            async move { text_response(StatusCode::OK, greeting) }
        })
        .context("Failed to register HTTP routes")?;

    let report = server.listen_and_serve().await.context("Server error")?;

    if report.is_truncated() {
        tracing::warn!(http = ?report.http, grpc = ?report.grpc, "Shutdown cut off in-flight requests");
    }

    Ok(())
}
