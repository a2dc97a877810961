// Diagnostic routes under /debug/pprof/
// Process and runtime introspection served as plain text, CPU profiles as pprof protobuf

use crate::error::ServerError;
use crate::router::{HttpResponse, RouteTable, text_response};
use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode, header};
use http_body_util::Full;
use hyper::body::Incoming;
use std::fmt::Write;
use std::time::Duration;

pub const PROFILING_PATH: &str = "/debug/pprof/";
pub const PROFILING_ROOT: &str = "/debug/pprof";

const CPU_PROFILE: &str = "profile";
const DEFAULT_CPU_SECONDS: u64 = 30;
#[cfg_attr(not(unix), allow(dead_code))]
const CPU_SAMPLE_FREQUENCY: i32 = 100;

const PROFILES: &[(&str, &str)] = &[
    ("cmdline", "command line of the running process"),
    ("profile", "CPU profile, ?seconds=N (default 30), ?format=flamegraph for SVG"),
    ("runtime", "async runtime workers, live tasks and queue depth"),
    ("threads", "stack-less dump of every OS thread with its state"),
    ("heap", "memory summary of the process (not a heap profile)"),
];

pub fn mount(routes: &mut RouteTable) -> Result<(), ServerError> {
    routes.insert(PROFILING_ROOT, |_req: Request<Incoming>| async {
        let mut response = text_response(StatusCode::MOVED_PERMANENTLY, "");
        response
            .headers_mut()
            .insert(header::LOCATION, HeaderValue::from_static(PROFILING_PATH));
        response
    })?;

    routes.insert(PROFILING_PATH, |req: Request<Incoming>| async move {
        let profile = req
            .uri()
            .path()
            .strip_prefix(PROFILING_PATH)
            .unwrap_or_default();

        if profile == CPU_PROFILE {
            return cpu_profile(CpuRequest::from_query(req.uri().query())).await;
        }
        serve_profile(profile)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CpuFormat {
    Protobuf,
    Flamegraph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuRequest {
    duration: Duration,
    format: CpuFormat,
}

impl CpuRequest {
    // Missing, zero or unparsable seconds fall back to the default
    fn from_query(query: Option<&str>) -> Self {
        let mut seconds = DEFAULT_CPU_SECONDS;
        let mut format = CpuFormat::Protobuf;

        for pair in query.unwrap_or_default().split('&') {
            match pair.split_once('=') {
                Some(("seconds", value)) => {
                    seconds = value
                        .parse()
                        .ok()
                        .filter(|s| *s > 0)
                        .unwrap_or(DEFAULT_CPU_SECONDS);
                }
                Some(("format", "flamegraph")) => format = CpuFormat::Flamegraph,
                _ => {}
            }
        }

        CpuRequest {
            duration: Duration::from_secs(seconds),
            format,
        }
    }
}

#[cfg(unix)]
async fn cpu_profile(request: CpuRequest) -> HttpResponse {
    tracing::info!(duration = ?request.duration, format = ?request.format, "CPU profile requested");

    // The sampler sleeps for the whole window, so it gets its own blocking thread
    match tokio::task::spawn_blocking(move || sample_cpu(request)).await {
        Ok(Ok((content_type, body))) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            response
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "CPU profile failed");
            text_response(StatusCode::SERVICE_UNAVAILABLE, format!("{}\n", e))
        }
        Err(e) => {
            tracing::error!(error = %e, "CPU profiler task failed");
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("CPU profiler task failed: {}\n", e),
            )
        }
    }
}

#[cfg(unix)]
fn sample_cpu(request: CpuRequest) -> Result<(&'static str, Vec<u8>), String> {
    use pprof::protos::Message;

    let guard = pprof::ProfilerGuardBuilder::default()
        .frequency(CPU_SAMPLE_FREQUENCY)
        .build()
        .map_err(|e| format!("failed to start CPU profiler: {}", e))?;

    std::thread::sleep(request.duration);

    let report = guard
        .report()
        .build()
        .map_err(|e| format!("failed to build CPU profile: {}", e))?;

    let mut body = Vec::new();
    match request.format {
        CpuFormat::Flamegraph => {
            report
                .flamegraph(&mut body)
                .map_err(|e| format!("failed to render flamegraph: {}", e))?;
            Ok(("image/svg+xml", body))
        }
        CpuFormat::Protobuf => {
            let profile = report
                .pprof()
                .map_err(|e| format!("failed to convert CPU profile: {}", e))?;
            profile
                .encode(&mut body)
                .map_err(|e| format!("failed to encode CPU profile: {}", e))?;
            Ok(("application/octet-stream", body))
        }
    }
}

#[cfg(not(unix))]
async fn cpu_profile(_request: CpuRequest) -> HttpResponse {
    text_response(StatusCode::NOT_IMPLEMENTED, "CPU profiling requires a unix target\n")
}

pub fn serve_profile(profile: &str) -> HttpResponse {
    match profile {
        "" => index(),
        CPU_PROFILE => text_response(
            StatusCode::BAD_REQUEST,
            "CPU profiles are served over HTTP only\n",
        ),
        "cmdline" => cmdline(),
        "runtime" => runtime(),
        "threads" => threads(),
        "heap" => heap(),
        other => text_response(
            StatusCode::NOT_FOUND,
            format!("unknown profile {:?}\n", other),
        ),
    }
}

fn index() -> HttpResponse {
    let mut body = String::from("Profiles:\n");
    for (name, description) in PROFILES {
        let _ = writeln!(body, "  {}{:<10} {}", PROFILING_PATH, name, description);
    }
    text_response(StatusCode::OK, body)
}

fn cmdline() -> HttpResponse {
    let args: Vec<String> = std::env::args().collect();
    text_response(StatusCode::OK, args.join("\x00"))
}

fn runtime() -> HttpResponse {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return text_response(StatusCode::SERVICE_UNAVAILABLE, "no async runtime\n");
    };
    let metrics = handle.metrics();

    let mut body = String::new();
    let _ = writeln!(body, "runtime_flavor: {:?}", handle.runtime_flavor());
    let _ = writeln!(body, "workers: {}", metrics.num_workers());
    let _ = writeln!(body, "alive_tasks: {}", metrics.num_alive_tasks());
    let _ = writeln!(body, "global_queue_depth: {}", metrics.global_queue_depth());
    text_response(StatusCode::OK, body)
}

#[cfg(target_os = "linux")]
fn threads() -> HttpResponse {
    let entries = match std::fs::read_dir("/proc/self/task") {
        Ok(entries) => entries,
        Err(e) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to list threads: {}\n", e),
            );
        }
    };

    let mut threads: Vec<(u64, String, String)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let tid = entry.file_name().to_string_lossy().parse::<u64>().ok()?;
            let status = std::fs::read_to_string(entry.path().join("status")).ok()?;
            Some((
                tid,
                status_field(&status, "Name").unwrap_or("?").to_string(),
                status_field(&status, "State").unwrap_or("?").to_string(),
            ))
        })
        .collect();
    threads.sort_by_key(|(tid, _, _)| *tid);

    let mut body = format!("threads: {}\n", threads.len());
    for (tid, name, state) in threads {
        let _ = writeln!(body, "{:>8} {:<24} {}", tid, name, state);
    }
    text_response(StatusCode::OK, body)
}

#[cfg(target_os = "linux")]
fn heap() -> HttpResponse {
    let status = match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => status,
        Err(e) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to read process status: {}\n", e),
            );
        }
    };

    let mut body = String::new();
    for field in ["VmPeak", "VmSize", "VmHWM", "VmRSS", "RssAnon", "VmData", "VmStk"] {
        if let Some(value) = status_field(&status, field) {
            let _ = writeln!(body, "{}: {}", field, value);
        }
    }
    text_response(StatusCode::OK, body)
}

#[cfg(not(target_os = "linux"))]
fn threads() -> HttpResponse {
    text_response(StatusCode::NOT_IMPLEMENTED, "thread dump requires procfs\n")
}

#[cfg(not(target_os = "linux"))]
fn heap() -> HttpResponse {
    text_response(StatusCode::NOT_IMPLEMENTED, "memory summary requires procfs\n")
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn status_field<'a>(status: &'a str, field: &str) -> Option<&'a str> {
    status.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key == field).then(|| value.trim())
    })
}
