//! Factory token types.
//!
//! A `TokenRecord` is the coordinator's view of one token created by the
//! factory contract. Consumers only ever receive clones.

use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a cache consumer (one per bot).
pub type ConsumerId = String;

/// Trading state reported by the factory's `getTokenState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    NotCreated,
    Trading,
    GoalReached,
    Halted,
    Resumed,
}

impl TokenState {
    /// Whether the token currently accepts buy/sell operations.
    pub fn is_tradeable(&self) -> bool {
        matches!(self, Self::Trading | Self::Resumed)
    }

    /// Numeric code as stored on-chain.
    pub fn code(&self) -> u8 {
        match self {
            Self::NotCreated => 0,
            Self::Trading => 1,
            Self::GoalReached => 2,
            Self::Halted => 3,
            Self::Resumed => 4,
        }
    }
}

impl TryFrom<u8> for TokenState {
    type Error = CoreError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::NotCreated),
            1 => Ok(Self::Trading),
            2 => Ok(Self::GoalReached),
            3 => Ok(Self::Halted),
            4 => Ok(Self::Resumed),
            other => Err(CoreError::InvalidTokenState(other)),
        }
    }
}

impl std::fmt::Display for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotCreated => write!(f, "NOT_CREATED"),
            Self::Trading => write!(f, "TRADING"),
            Self::GoalReached => write!(f, "GOAL_REACHED"),
            Self::Halted => write!(f, "HALTED"),
            Self::Resumed => write!(f, "RESUMED"),
        }
    }
}

/// ERC-20 name/symbol pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub name: String,
    pub symbol: String,
}

/// Snapshot of a single factory token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Address as returned by the factory (checksum casing preserved).
    pub address: String,
    pub name: String,
    pub symbol: String,
    pub state: TokenState,
    pub last_updated: DateTime<Utc>,
}

impl TokenRecord {
    /// Create a record stamped with the current time.
    pub fn new(address: impl Into<String>, metadata: TokenMetadata, state: TokenState) -> Self {
        Self {
            address: address.into(),
            name: metadata.name,
            symbol: metadata.symbol,
            state,
            last_updated: Utc::now(),
        }
    }

    /// Lower-cased address used as the cache key.
    pub fn key(&self) -> String {
        normalize_address(&self.address)
    }

    pub fn is_tradeable(&self) -> bool {
        self.state.is_tradeable()
    }

    pub fn metadata(&self) -> TokenMetadata {
        TokenMetadata {
            name: self.name.clone(),
            symbol: self.symbol.clone(),
        }
    }
}

/// Normalize an address for case-insensitive comparison.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}
