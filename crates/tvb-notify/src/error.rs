//! Webhook transport error types.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request failed: {0}")]
    Request(String),
}

pub type TransportResult<T> = Result<T, TransportError>;
