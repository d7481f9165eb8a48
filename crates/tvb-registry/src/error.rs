//! Token source error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("ABI decode error: {0}")]
    Decode(String),

    #[error("Token {address} unavailable: {reason}")]
    Token { address: String, reason: String },

    #[error(transparent)]
    Core(#[from] tvb_core::CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SourceResult<T> = Result<T, SourceError>;
