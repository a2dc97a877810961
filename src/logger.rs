// Structured logging using tracing
// Builds a Dispatch that is handed to the server instead of installed globally

use crate::settings::{LogFormat, LogLevel};
use tracing::Dispatch;
use tracing_subscriber::EnvFilter;

/// Build a log sink for the given level and format. `RUST_LOG` wins over `level`.
pub fn build(level: LogLevel, format: LogFormat) -> Dispatch {
    let level = match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => Dispatch::new(
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .finish(),
        ),
        LogFormat::Pretty => Dispatch::new(
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .finish(),
        ),
    }
}

/// A sink that drops everything, for tests and embedders that want silence.
pub fn disabled() -> Dispatch {
    Dispatch::none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_json_dispatch() {
        let dispatch = build(LogLevel::Info, LogFormat::Json);
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!(test = true, "json logger active");
        });
    }

    #[test]
    fn test_disabled_dispatch_has_no_subscriber() {
        assert!(disabled().is::<tracing::subscriber::NoSubscriber>());
    }
}
