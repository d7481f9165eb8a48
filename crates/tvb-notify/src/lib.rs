//! Resilient webhook notifications for the bot fleet.
//!
//! One `Notifier` per bot reports activity to the dashboard webhook:
//! - Batching with a size trigger and a debounce flush
//! - Retries with growing per-attempt timeouts
//! - Circuit breaker that skips non-critical traffic while the endpoint is down
//! - Background heartbeat on an adaptive interval

pub mod adaptive;
pub mod breaker;
pub mod config;
pub mod error;
pub mod notifier;
pub mod payload;
pub mod transport;

pub use adaptive::AdaptiveInterval;
pub use breaker::{BreakerState, CircuitBreaker};
pub use config::{HeartbeatConfig, NotifierConfig, WebhookTarget};
pub use error::{TransportError, TransportResult};
pub use notifier::{Notifier, NotifierStats};
pub use payload::build_payload;
pub use transport::{BoxFuture, DeliveryOutcome, ReqwestTransport, WebhookTransport};

#[cfg(any(test, feature = "test-utils"))]
pub use transport::{MockTransport, RecordedPost};
