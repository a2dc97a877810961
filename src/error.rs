// Error taxonomy for the server bootstrap
// Configuration and bind/TLS errors abort start(); shutdown errors come from close()

use crate::lifecycle::LifecycleState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Failed to bind {listener} listener on {address}: {source}")]
    Bind {
        listener: &'static str,
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Shutdown failed: {}", .0.join("; "))]
    Shutdown(Vec<String>),

    #[error("Cannot {operation} server in state {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },
}

impl ServerError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        ServerError::Configuration(message.into())
    }

    pub fn is_bind(&self) -> bool {
        matches!(self, ServerError::Bind { .. })
    }
}
