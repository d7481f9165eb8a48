//! Error types for tvb-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid token state code: {0}")]
    InvalidTokenState(u8),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
