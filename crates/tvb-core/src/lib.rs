//! Core domain types for the Transparent Volume Bot fleet.
//!
//! This crate provides the types shared by the coordination layer:
//! - `TokenRecord`, `TokenState`: Factory token snapshots served by the cache
//! - `NotificationEvent`, `NotificationAction`: Outbound webhook events
//! - `BotIdentity`: Per-bot webhook identity block

pub mod error;
pub mod notification;
pub mod token;

pub use error::{CoreError, Result};
pub use notification::{BotIdentity, NotificationAction, NotificationEvent, Priority};
pub use token::{normalize_address, ConsumerId, TokenMetadata, TokenRecord, TokenState};
