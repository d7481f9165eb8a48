//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Token source error: {0}")]
    Source(#[from] tvb_registry::SourceError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] tvb_telemetry::TelemetryError),

    #[error("Bot worker failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
