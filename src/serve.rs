// Accept loop shared by the HTTP and gRPC listeners
// Each connection runs in its own task; shutdown stops accepting, then drains until the deadline

use crate::lifecycle::{LifecycleState, Listener, ServerStatus};
use crate::metrics::ServerMetrics;
use crate::tls::HANDSHAKE_TIMEOUT;
use http::{Request, Response};
use hyper::body::{Body, Incoming};
use hyper::service::Service;
use hyper::rt::Executor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument, Span};
use uuid::Uuid;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Carries the drain deadline once close has been requested.
pub type ShutdownReceiver = watch::Receiver<Option<Instant>>;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The loop was never started (or already closed).
    NotRunning,
    /// Every in-flight connection finished before the deadline.
    Drained,
    /// The deadline passed; remaining connections were terminated.
    Truncated { aborted: usize },
}

impl DrainOutcome {
    pub fn is_truncated(&self) -> bool {
        matches!(self, DrainOutcome::Truncated { .. })
    }
}

pub struct ServeContext {
    listener: Listener,
    tls: Option<TlsAcceptor>,
    metrics: Arc<ServerMetrics>,
    logger: Dispatch,
    _serving: ServingGuard,
}

impl ServeContext {
    /// Marks `listener` as serving until the context is dropped, so readiness
    /// holds from the moment the loop is handed to the runtime.
    pub fn new(
        listener: Listener,
        tls: Option<TlsAcceptor>,
        status: Arc<ServerStatus>,
        metrics: Arc<ServerMetrics>,
        logger: Dispatch,
    ) -> Self {
        ServeContext {
            listener,
            tls,
            metrics,
            logger,
            _serving: ServingGuard::new(listener, status),
        }
    }
}

// Marks the loop as serving for as long as it lives, including during unwinding
struct ServingGuard {
    listener: Listener,
    status: Arc<ServerStatus>,
}

impl ServingGuard {
    fn new(listener: Listener, status: Arc<ServerStatus>) -> Self {
        status.serving_flag(listener).store(true, Ordering::Release);
        ServingGuard { listener, status }
    }
}

impl Drop for ServingGuard {
    fn drop(&mut self) {
        self.status
            .serving_flag(self.listener)
            .store(false, Ordering::Release);

        if self.status.state() == LifecycleState::Running {
            tracing::error!(
                listener = %self.listener,
                "Serving loop terminated while server is running"
            );
        }
    }
}

pub async fn serve<S, B>(
    socket: TcpListener,
    service: S,
    ctx: ServeContext,
    mut shutdown: ShutdownReceiver,
) -> DrainOutcome
where
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let connection_shutdown = shutdown.clone();
    let mut connections = JoinSet::new();

    tracing::info!(
        listener = %ctx.listener,
        address = ?socket.local_addr().ok(),
        tls = ctx.tls.is_some(),
        "Serving loop started"
    );

    let deadline = loop {
        tokio::select! {
            accepted = socket.accept() => match accepted {
                Ok((stream, peer)) => {
                    let span = tracing::info_span!(
                        "connection",
                        listener = %ctx.listener,
                        peer = %peer,
                        conn_id = %Uuid::new_v4(),
                    );
                    tracing::debug!(parent: &span, "Connection accepted");

                    let task = handle_connection(
                        stream,
                        service.clone(),
                        ctx.tls.clone(),
                        ctx.listener,
                        Arc::clone(&ctx.metrics),
                        ctx.logger.clone(),
                        connection_shutdown.clone(),
                    );
                    connections.spawn(task.instrument(span).with_subscriber(ctx.logger.clone()));
                }
                Err(e) => {
                    tracing::error!(listener = %ctx.listener, error = %e, "Failed to accept connection");
                    // Keep accepting; a short pause avoids spinning on fd exhaustion
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                log_connection_exit(ctx.listener, joined);
            }
            deadline = wait_for_shutdown(&mut shutdown) => break deadline,
        }
    };

    // Releases the OS socket: no new connections from here on
    drop(socket);
    drain(ctx.listener, connections, deadline).await
}

async fn handle_connection<S, B>(
    stream: TcpStream,
    service: S,
    tls: Option<TlsAcceptor>,
    listener: Listener,
    metrics: Arc<ServerMetrics>,
    logger: Dispatch,
    shutdown: ShutdownReceiver,
) where
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let _open = metrics.connection_opened(listener);
    let executor = StreamExecutor {
        span: Span::current(),
        logger,
    };

    match tls {
        None => serve_connection(stream, service, executor, shutdown).await,
        Some(acceptor) => {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => {
                    serve_connection(tls_stream, service, executor, shutdown).await
                }
                Ok(Err(e)) => {
                    metrics.tls_handshake_failed(listener);
                    tracing::warn!(error = %e, "TLS handshake failed");
                }
                Err(_) => {
                    metrics.tls_handshake_failed(listener);
                    tracing::warn!(timeout = ?HANDSHAKE_TIMEOUT, "TLS handshake timed out");
                }
            }
        }
    }

    tracing::debug!("Connection closed");
}

async fn serve_connection<I, S, B>(
    io: I,
    service: S,
    executor: StreamExecutor,
    mut shutdown: ShutdownReceiver,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Service<Request<Incoming>, Response = Response<B>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let builder = auto::Builder::new(executor);
    let connection = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    let mut draining = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "Connection ended with error");
                }
                break;
            }
            _ = wait_for_shutdown(&mut shutdown), if !draining => {
                // Finish in-flight requests, refuse new ones on this connection
                draining = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

// Spawns HTTP/2 stream tasks inside the connection's span and log sink
#[derive(Clone)]
struct StreamExecutor {
    span: Span,
    logger: Dispatch,
}

impl<F> Executor<F> for StreamExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, future: F) {
        tokio::spawn(
            future
                .instrument(self.span.clone())
                .with_subscriber(self.logger.clone()),
        );
    }
}

async fn wait_for_shutdown(shutdown: &mut ShutdownReceiver) -> Instant {
    match shutdown.wait_for(Option::is_some).await {
        Ok(deadline) => (*deadline).unwrap_or_else(Instant::now),
        // Sender gone without a deadline: stop right away
        Err(_) => Instant::now(),
    }
}

async fn drain(listener: Listener, mut connections: JoinSet<()>, deadline: Instant) -> DrainOutcome {
    tracing::info!(
        listener = %listener,
        in_flight = connections.len(),
        "Stopped accepting, draining connections"
    );

    let drained = tokio::time::timeout_at(deadline, async {
        while let Some(joined) = connections.join_next().await {
            log_connection_exit(listener, joined);
        }
    })
    .await;

    match drained {
        Ok(()) => {
            tracing::info!(listener = %listener, "All connections drained");
            DrainOutcome::Drained
        }
        Err(_) => {
            let aborted = connections.len();
            connections.abort_all();
            while connections.join_next().await.is_some() {}

            tracing::warn!(
                listener = %listener,
                aborted,
                "Drain deadline exceeded, terminated remaining connections"
            );
            DrainOutcome::Truncated { aborted }
        }
    }
}

fn log_connection_exit(listener: Listener, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(listener = %listener, error = %e, "Connection task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_shutdown_returns_deadline() {
        let (tx, mut rx) = watch::channel(None);
        let deadline = Instant::now() + Duration::from_secs(3);
        tx.send_replace(Some(deadline));
        assert_eq!(wait_for_shutdown(&mut rx).await, deadline);
    }

    #[tokio::test]
    async fn test_dropped_sender_means_immediate_shutdown() {
        let (tx, mut rx) = watch::channel::<Option<Instant>>(None);
        drop(tx);
        let before = Instant::now();
        assert!(wait_for_shutdown(&mut rx).await >= before);
    }

    #[tokio::test]
    async fn test_drain_aborts_after_deadline() {
        let mut connections = JoinSet::new();
        connections.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        connections.spawn(async {});

        let started = Instant::now();
        let outcome = drain(
            Listener::Http,
            connections,
            Instant::now() + Duration::from_millis(50),
        )
        .await;

        assert_eq!(outcome, DrainOutcome::Truncated { aborted: 1 });
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_drain_with_finished_connections() {
        let mut connections = JoinSet::new();
        connections.spawn(async {});
        let outcome = drain(
            Listener::Grpc,
            connections,
            Instant::now() + Duration::from_secs(1),
        )
        .await;
        assert_eq!(outcome, DrainOutcome::Drained);
    }
}
