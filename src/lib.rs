// Library exports for baseserver
// One process serving HTTP and gRPC under a single lifecycle

pub mod config;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod listener;
pub mod logger;
pub mod metrics;
pub mod profiling;
pub mod router;
pub mod serve;
pub mod server;
pub mod settings;
pub mod testing;
pub mod tls;

pub use config::{ServerConfig, ServerOption};
pub use error::ServerError;
pub use lifecycle::LifecycleState;
pub use serve::DrainOutcome;
pub use server::{Server, ShutdownReport};
