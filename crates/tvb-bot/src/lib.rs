//! Transparent volume bot fleet.
//!
//! Composition root that runs every configured bot against:
//! - One shared token cache coordinator
//! - One resilient webhook notifier per bot

pub mod app;
pub mod config;
pub mod error;

pub use app::Application;
pub use config::{AppConfig, BotConfig};
pub use error::{AppError, AppResult};
