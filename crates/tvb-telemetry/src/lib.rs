//! Prometheus metrics and structured logging for the bot fleet.
//!
//! Shared by the token cache coordinator and every webhook notifier:
//! - Structured logging with tracing (JSON in production)
//! - Prometheus counters and gauges for cache and delivery health

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
