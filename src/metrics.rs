// Prometheus metrics: /metrics exposition and the server's own collectors
// The configured registry may be shared with the caller; it is never reset

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::lifecycle::Listener;
use crate::router::{HttpResponse, RouteTable, text_response};
use http::{HeaderValue, Request, StatusCode, header};
use hyper::body::Incoming;
use parking_lot::Mutex;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

pub const METRICS_PATH: &str = "/metrics";

pub fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

pub fn exposition(registry: &Registry) -> HttpResponse {
    match render(registry) {
        Ok(body) => {
            let mut response = text_response(StatusCode::OK, body);
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            );
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {}\n", e),
            )
        }
    }
}

pub fn mount(routes: &mut RouteTable, registry: Registry) -> Result<(), ServerError> {
    routes.insert(METRICS_PATH, move |_req: Request<Incoming>| {
        let registry = registry.clone();
        async move { exposition(&registry) }
    })
}

/// Collectors describing the server itself.
pub struct ServerMetrics {
    http_requests: IntCounterVec,
    http_duration: HistogramVec,
    connections_accepted: IntCounterVec,
    open_connections: IntGaugeVec,
    tls_failures: IntCounterVec,
    build_info: IntGauge,
    registered: Mutex<Vec<Box<dyn Collector>>>,
}

impl ServerMetrics {
    pub fn new(config: &ServerConfig) -> Result<Self, ServerError> {
        let metric_error = |e: prometheus::Error| ServerError::config(format!("metrics: {}", e));

        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "HTTP requests served, by route and status code"),
            &["handler", "code"],
        )
        .map_err(metric_error)?;

        let http_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency, by route",
            ),
            &["handler"],
        )
        .map_err(metric_error)?;

        let connections_accepted = IntCounterVec::new(
            Opts::new(
                "server_connections_accepted_total",
                "Connections accepted, by listener",
            ),
            &["listener"],
        )
        .map_err(metric_error)?;

        let open_connections = IntGaugeVec::new(
            Opts::new("server_open_connections", "Connections currently open, by listener"),
            &["listener"],
        )
        .map_err(metric_error)?;

        let tls_failures = IntCounterVec::new(
            Opts::new(
                "server_tls_handshake_failures_total",
                "Failed TLS handshakes, by listener",
            ),
            &["listener"],
        )
        .map_err(metric_error)?;

        let build_info = IntGauge::with_opts(
            Opts::new("server_build_info", "Build information of the running service")
                .const_label("service", config.name.clone())
                .const_label(
                    "version",
                    config.version.clone().unwrap_or_else(|| "unknown".to_string()),
                ),
        )
        .map_err(metric_error)?;
        build_info.set(1);

        Ok(ServerMetrics {
            http_requests,
            http_duration,
            connections_accepted,
            open_connections,
            tls_failures,
            build_info,
            registered: Mutex::new(Vec::new()),
        })
    }

    fn collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.http_requests.clone()),
            Box::new(self.http_duration.clone()),
            Box::new(self.connections_accepted.clone()),
            Box::new(self.open_connections.clone()),
            Box::new(self.tls_failures.clone()),
            Box::new(self.build_info.clone()),
        ]
    }

    /// Adds the server collectors to `registry`. Collectors the registry
    /// already holds are left alone and not tracked for removal.
    pub fn register(&self, registry: &Registry) {
        let mut registered = self.registered.lock();
        for (index, collector) in self.collectors().into_iter().enumerate() {
            let name = collector
                .desc()
                .first()
                .map(|d| d.fq_name.clone())
                .unwrap_or_default();

            match registry.register(collector) {
                Ok(()) => registered.push(self.collectors().swap_remove(index)),
                Err(prometheus::Error::AlreadyReg) => {
                    tracing::warn!(metric = %name, "Metric already registered, skipping");
                }
                Err(e) => {
                    tracing::warn!(metric = %name, error = %e, "Failed to register metric");
                }
            }
        }
    }

    /// Removes exactly the collectors `register` added.
    pub fn unregister(&self, registry: &Registry) {
        for collector in self.registered.lock().drain(..) {
            if let Err(e) = registry.unregister(collector) {
                tracing::debug!(error = %e, "Failed to unregister metric");
            }
        }
    }

    pub fn observe_request(&self, handler: &str, code: StatusCode, elapsed: Duration) {
        self.http_requests
            .with_label_values(&[handler, code.as_str()])
            .inc();
        self.http_duration
            .with_label_values(&[handler])
            .observe(elapsed.as_secs_f64());
    }

    pub fn connection_opened(&self, listener: Listener) -> ConnectionGuard {
        self.connections_accepted
            .with_label_values(&[listener.as_str()])
            .inc();
        let gauge = self.open_connections.with_label_values(&[listener.as_str()]);
        gauge.inc();
        ConnectionGuard { gauge }
    }

    pub fn tls_handshake_failed(&self, listener: Listener) {
        self.tls_failures
            .with_label_values(&[listener.as_str()])
            .inc();
    }
}

/// Decrements the open-connection gauge when the connection task ends.
pub struct ConnectionGuard {
    gauge: IntGauge,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{with_metrics_registry, with_version};

    fn config_with(registry: &Registry) -> ServerConfig {
        ServerConfig::build(
            "metrics_test",
            [with_metrics_registry(registry.clone()), with_version("1.2.3")],
        )
        .unwrap()
    }

    #[test]
    fn test_exposition_is_text_format() {
        let registry = Registry::new();
        let counter = prometheus::IntCounter::new("jobs_total", "jobs").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc_by(3);

        let response = exposition(&registry);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            prometheus::TEXT_FORMAT
        );
        assert!(render(&registry).unwrap().contains("jobs_total 3"));
    }

    #[test]
    fn test_register_and_unregister_round_trip() {
        let registry = Registry::new();
        let config = config_with(&registry);
        let metrics = ServerMetrics::new(&config).unwrap();

        metrics.register(&registry);
        metrics.observe_request("/ready", StatusCode::OK, Duration::from_millis(3));
        let rendered = render(&registry).unwrap();
        assert!(rendered.contains(r#"http_requests_total{code="200",handler="/ready"} 1"#));
        assert!(rendered.contains(r#"server_build_info{service="metrics_test",version="1.2.3"} 1"#));

        metrics.unregister(&registry);
        assert!(render(&registry).unwrap().is_empty());
    }

    #[test]
    fn test_shared_registry_tolerates_second_server() {
        let registry = Registry::new();
        let first = ServerMetrics::new(&config_with(&registry)).unwrap();
        let second = ServerMetrics::new(&config_with(&registry)).unwrap();

        first.register(&registry);
        second.register(&registry);
        // Second server skipped every collector, so removing it leaves the first intact
        second.unregister(&registry);
        first.observe_request("/live", StatusCode::OK, Duration::from_millis(1));
        assert!(render(&registry).unwrap().contains("http_requests_total"));

        first.unregister(&registry);
    }

    #[test]
    fn test_connection_guard_tracks_open_connections() {
        let registry = Registry::new();
        let metrics = ServerMetrics::new(&config_with(&registry)).unwrap();
        metrics.register(&registry);

        let guard = metrics.connection_opened(Listener::Http);
        assert!(
            render(&registry)
                .unwrap()
                .contains(r#"server_open_connections{listener="http"} 1"#)
        );
        drop(guard);
        assert!(
            render(&registry)
                .unwrap()
                .contains(r#"server_open_connections{listener="http"} 0"#)
        );
    }
}
