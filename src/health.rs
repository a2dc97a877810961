// Readiness and liveness probes
// /ready reflects the lifecycle; /live only proves the process still answers

use crate::error::ServerError;
use crate::lifecycle::ServerStatus;
use crate::router::{HttpResponse, RouteTable, text_response};
use http::{Request, StatusCode};
use hyper::body::Incoming;
use std::sync::Arc;

pub const READY_PATH: &str = "/ready";
pub const LIVE_PATH: &str = "/live";

pub fn readiness(status: &ServerStatus) -> HttpResponse {
    if status.is_ready() {
        text_response(StatusCode::OK, "ready\n")
    } else {
        tracing::debug!(state = %status.state(), "Readiness probe failed");
        text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("not ready ({})\n", status.state()),
        )
    }
}

pub fn liveness() -> HttpResponse {
    text_response(StatusCode::OK, "live\n")
}

pub fn mount(routes: &mut RouteTable, status: Arc<ServerStatus>) -> Result<(), ServerError> {
    routes.insert(READY_PATH, move |_req: Request<Incoming>| {
        let status = Arc::clone(&status);
        async move { readiness(&status) }
    })?;
    routes.insert(LIVE_PATH, |_req: Request<Incoming>| async { liveness() })?;
    Ok(())
}
