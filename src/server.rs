// Lifecycle controller: one server, two listeners, one start/close contract
// Initialized -> Starting -> Running -> Closing -> Closed

use crate::config::{ServerConfig, ServerOption};
use crate::error::ServerError;
use crate::health::{self, LIVE_PATH, READY_PATH};
use crate::lifecycle::{LifecycleState, Listener, ServerStatus};
use crate::listener::ListenerSet;
use crate::metrics::{self, METRICS_PATH, ServerMetrics};
use crate::profiling::{self, PROFILING_PATH};
use crate::router::{Handler, HttpResponse, RouteTable, text_response};
use crate::serve::{self, DrainOutcome, ServeContext};
use http::{Request, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::service::TowerToHyperService;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tonic::service::RoutesBuilder;
use tonic_health::ServingStatus;
use tonic_health::server::HealthReporter;
use tracing::instrument::WithSubscriber;

// Extra time granted to a serving loop to abort its connections after the deadline
const LOOP_EXIT_GRACE: Duration = Duration::from_secs(1);

const UNMATCHED_ROUTE: &str = "unmatched";

/// How each listener finished draining during close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub http: DrainOutcome,
    pub grpc: DrainOutcome,
}

impl ShutdownReport {
    fn not_running() -> Self {
        ShutdownReport {
            http: DrainOutcome::NotRunning,
            grpc: DrainOutcome::NotRunning,
        }
    }

    /// True when the deadline cut off in-flight work on either listener.
    pub fn is_truncated(&self) -> bool {
        self.http.is_truncated() || self.grpc.is_truncated()
    }
}

#[derive(Debug, Clone, Copy)]
struct BoundAddresses {
    http: SocketAddr,
    grpc: SocketAddr,
}

struct Running {
    shutdown: watch::Sender<Option<Instant>>,
    http: JoinHandle<DrainOutcome>,
    grpc: JoinHandle<DrainOutcome>,
    health_reporter: Option<HealthReporter>,
}

pub struct Server {
    config: ServerConfig,
    status: Arc<ServerStatus>,
    metrics: Arc<ServerMetrics>,
    routes: Mutex<RouteTable>,
    grpc_routes: Mutex<Option<RoutesBuilder>>,
    addresses: Mutex<Option<BoundAddresses>>,
    // Held across start/close so transitions never interleave
    lifecycle: tokio::sync::Mutex<Option<Running>>,
}

impl Server {
    pub fn new<I>(name: impl Into<String>, options: I) -> Result<Self, ServerError>
    where
        I: IntoIterator<Item = ServerOption>,
    {
        Server::from_config(ServerConfig::build(name, options)?)
    }

    pub fn from_config(config: ServerConfig) -> Result<Self, ServerError> {
        let metrics = Arc::new(ServerMetrics::new(&config)?);

        tracing::dispatcher::with_default(&config.logger, || {
            tracing::debug!(
                name = %config.name,
                hostname = %config.hostname,
                http_port = config.http_port,
                grpc_port = config.grpc_port,
                tls = config.tls_enabled(),
                "Server configured"
            );
        });

        Ok(Server {
            config,
            status: Arc::new(ServerStatus::default()),
            metrics,
            routes: Mutex::new(RouteTable::new()),
            grpc_routes: Mutex::new(Some(RoutesBuilder::default())),
            addresses: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.status.state()
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }

    pub fn status(&self) -> Arc<ServerStatus> {
        Arc::clone(&self.status)
    }

    /// Registers an HTTP handler. Patterns ending in `/` match the whole subtree.
    pub fn handle<H: Handler>(&self, pattern: &str, handler: H) -> Result<(), ServerError> {
        if is_reserved(pattern) {
            return Err(ServerError::config(format!(
                "route pattern {:?} is reserved by the server",
                pattern
            )));
        }

        // Checked under the route lock: start() flips the state before taking it
        let mut routes = self.routes.lock();
        self.ensure_initialized("register routes on")?;
        routes.insert(pattern, handler)
    }

    /// Gives the caller the gRPC registrar to add services to.
    pub fn register_grpc<F>(&self, register: F) -> Result<(), ServerError>
    where
        F: FnOnce(&mut RoutesBuilder),
    {
        let mut grpc_routes = self.grpc_routes.lock();
        self.ensure_initialized("register gRPC services on")?;
        register(grpc_routes.get_or_insert_with(RoutesBuilder::default));
        Ok(())
    }

    fn ensure_initialized(&self, operation: &'static str) -> Result<(), ServerError> {
        match self.status.state() {
            LifecycleState::Initialized => Ok(()),
            state => Err(ServerError::InvalidState { operation, state }),
        }
    }

    /// `http://host:port` (or `https://`), available once started.
    pub fn http_address(&self) -> Option<String> {
        let scheme = if self.config.tls_enabled() { "https" } else { "http" };
        self.addresses.lock().map(|bound| {
            format!("{}://{}:{}", scheme, self.config.hostname, bound.http.port())
        })
    }

    /// `host:port` of the gRPC listener, available once started.
    pub fn grpc_address(&self) -> Option<String> {
        self.addresses
            .lock()
            .map(|bound| format!("{}:{}", self.config.hostname, bound.grpc.port()))
    }

    pub fn http_socket_addr(&self) -> Option<SocketAddr> {
        self.addresses.lock().map(|bound| bound.http)
    }

    pub fn grpc_socket_addr(&self) -> Option<SocketAddr> {
        self.addresses.lock().map(|bound| bound.grpc)
    }

    /// Binds both listeners and starts serving. Returns once both loops are
    /// running; on failure nothing is left bound and the server may be retried.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.start_inner()
            .with_subscriber(self.config.logger.clone())
            .await
    }

    async fn start_inner(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;

        let state = self.status.state();
        if state != LifecycleState::Initialized {
            return Err(ServerError::InvalidState {
                operation: "start",
                state,
            });
        }
        self.transition(LifecycleState::Starting);

        match self.launch().await {
            Ok(running) => {
                *lifecycle = Some(running);
                self.transition(LifecycleState::Running);
                tracing::info!(
                    name = %self.config.name,
                    http = ?self.http_address(),
                    grpc = ?self.grpc_address(),
                    "Server running"
                );
                Ok(())
            }
            Err(e) => {
                self.transition(LifecycleState::Initialized);
                tracing::error!(name = %self.config.name, error = %e, "Server failed to start");
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Running, ServerError> {
        let listeners = ListenerSet::bind(&self.config).await?;
        let http_routes = Arc::new(self.mount_http_routes()?);

        // Nothing below can fail, so the registrar may be consumed
        let mut grpc_routes = self.grpc_routes.lock().take().unwrap_or_default();
        let health_reporter = if self.config.grpc_health_service {
            let (reporter, service) = tonic_health::server::health_reporter();
            grpc_routes.add_service(service);
            Some(reporter)
        } else {
            None
        };
        let grpc_service = TowerToHyperService::new(grpc_routes.routes().prepare());

        self.metrics.register(&self.config.registry);
        *self.addresses.lock() = Some(BoundAddresses {
            http: listeners.http_addr,
            grpc: listeners.grpc_addr,
        });

        let metrics = Arc::clone(&self.metrics);
        let http_service = service_fn(move |request: Request<Incoming>| {
            let routes = Arc::clone(&http_routes);
            let metrics = Arc::clone(&metrics);
            async move { Ok::<_, Infallible>(dispatch(&routes, &metrics, request).await) }
        });

        let (shutdown, shutdown_rx) = watch::channel(None);
        let logger = &self.config.logger;

        let http_ctx = self.serve_context(Listener::Http, listeners.tls.clone());
        let http = tokio::spawn(
            serve::serve(listeners.http, http_service, http_ctx, shutdown_rx.clone())
                .with_subscriber(logger.clone()),
        );

        let grpc_ctx = self.serve_context(Listener::Grpc, listeners.tls);
        let grpc = tokio::spawn(
            serve::serve(listeners.grpc, grpc_service, grpc_ctx, shutdown_rx)
                .with_subscriber(logger.clone()),
        );

        if let Some(reporter) = &health_reporter {
            reporter
                .set_service_status("", ServingStatus::Serving)
                .await;
        }
        self.status.set_mounted(true);

        Ok(Running {
            shutdown,
            http,
            grpc,
            health_reporter,
        })
    }

    fn mount_http_routes(&self) -> Result<RouteTable, ServerError> {
        // Caller routes are copied so a failed start leaves them registered
        let mut routes = self.routes.lock().clone();
        health::mount(&mut routes, Arc::clone(&self.status))?;
        metrics::mount(&mut routes, self.config.registry.clone())?;
        profiling::mount(&mut routes)?;

        tracing::debug!(routes = routes.len(), "HTTP routes mounted");
        Ok(routes)
    }

    fn serve_context(&self, listener: Listener, tls: Option<TlsAcceptor>) -> ServeContext {
        ServeContext::new(
            listener,
            tls,
            Arc::clone(&self.status),
            Arc::clone(&self.metrics),
            self.config.logger.clone(),
        )
    }

    /// Stops both listeners, draining for at most the configured close timeout.
    /// Safe to call repeatedly and concurrently; only the first call does work.
    pub async fn close(&self) -> Result<ShutdownReport, ServerError> {
        self.shutdown(self.config.close_timeout).await
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<ShutdownReport, ServerError> {
        self.shutdown_inner(timeout)
            .with_subscriber(self.config.logger.clone())
            .await
    }

    async fn shutdown_inner(&self, timeout: Duration) -> Result<ShutdownReport, ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;

        let running = match (self.status.state(), lifecycle.take()) {
            (LifecycleState::Running, Some(running)) => running,
            (LifecycleState::Initialized, _) => {
                self.transition(LifecycleState::Closed);
                tracing::info!(name = %self.config.name, "Server closed before start");
                return Ok(ShutdownReport::not_running());
            }
            (state, _) => {
                tracing::debug!(state = %state, "Close requested, nothing running");
                return Ok(ShutdownReport::not_running());
            }
        };

        self.transition(LifecycleState::Closing);
        tracing::info!(name = %self.config.name, timeout = ?timeout, "Server closing");

        if let Some(reporter) = &running.health_reporter {
            reporter
                .set_service_status("", ServingStatus::NotServing)
                .await;
        }

        let deadline = Instant::now() + timeout;
        running.shutdown.send_replace(Some(deadline));

        let (http, grpc) = tokio::join!(
            join_loop(Listener::Http, running.http, deadline),
            join_loop(Listener::Grpc, running.grpc, deadline),
        );

        self.status.set_mounted(false);
        self.metrics.unregister(&self.config.registry);
        self.transition(LifecycleState::Closed);

        let mut failures = Vec::new();
        let report = ShutdownReport {
            http: http.unwrap_or_else(|e| {
                failures.push(e);
                DrainOutcome::NotRunning
            }),
            grpc: grpc.unwrap_or_else(|e| {
                failures.push(e);
                DrainOutcome::NotRunning
            }),
        };

        if !failures.is_empty() {
            tracing::error!(errors = ?failures, "Server closed with errors");
            return Err(ServerError::Shutdown(failures));
        }

        tracing::info!(
            name = %self.config.name,
            http = ?report.http,
            grpc = ?report.grpc,
            "Server closed"
        );
        Ok(report)
    }

    /// Starts the server, waits for SIGINT/SIGTERM, then closes it.
    pub async fn listen_and_serve(&self) -> Result<ShutdownReport, ServerError> {
        self.start().await?;
        wait_for_termination()
            .with_subscriber(self.config.logger.clone())
            .await;
        self.close().await
    }

    fn transition(&self, next: LifecycleState) {
        let current = self.status.state();
        debug_assert!(
            current.can_transition_to(next),
            "illegal lifecycle transition {} -> {}",
            current,
            next
        );
        tracing::debug!(from = %current, to = %next, "Lifecycle transition");
        self.status.set_state(next);
    }
}

fn is_reserved(pattern: &str) -> bool {
    pattern == READY_PATH
        || pattern == LIVE_PATH
        || pattern == METRICS_PATH
        || pattern.starts_with(PROFILING_PATH)
        || pattern == PROFILING_PATH.trim_end_matches('/')
}

async fn dispatch(
    routes: &RouteTable,
    metrics: &ServerMetrics,
    request: Request<Incoming>,
) -> HttpResponse {
    let started = std::time::Instant::now();
    let path = request.uri().path().to_string();

    let (route, response) = match routes.lookup(&path) {
        Some((pattern, handler)) => (pattern, handler.call(request).await),
        None => (
            UNMATCHED_ROUTE,
            text_response(StatusCode::NOT_FOUND, "404 page not found\n"),
        ),
    };

    tracing::debug!(path = %path, route, status = %response.status(), "HTTP request served");
    metrics.observe_request(route, response.status(), started.elapsed());
    response
}

async fn join_loop(
    listener: Listener,
    mut handle: JoinHandle<DrainOutcome>,
    deadline: Instant,
) -> Result<DrainOutcome, String> {
    match tokio::time::timeout_at(deadline + LOOP_EXIT_GRACE, &mut handle).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(format!("{} serving loop failed: {}", listener, e)),
        Err(_) => {
            handle.abort();
            Err(format!("{} serving loop did not stop in time", listener))
        }
    }
}

async fn wait_for_termination() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
