//! Outbound notification types.
//!
//! Events are produced by the bot loop and consumed by the webhook
//! notifier. Priority decides both flush ordering inside a batch and
//! whether an event skips the batch buffer altogether.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event priority. Higher sorts first when a batch is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const CRITICAL: Priority = Priority(100);
    pub const TRADE: Priority = Priority(50);
    pub const STATUS: Priority = Priority(20);
    pub const ROUTINE: Priority = Priority(10);
    pub const HEARTBEAT: Priority = Priority(5);
}

/// Action reported to the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    Startup,
    Shutdown,
    Error,
    InsufficientFunds,
    Buy,
    Sell,
    CreateToken,
    ForcedSell,
    TradeFailure,
    BalanceAlert,
    TokenRefresh,
    NoTokens,
    CycleStart,
    CycleComplete,
    Hold,
    Heartbeat,
}

impl NotificationAction {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Error => "error",
            Self::InsufficientFunds => "insufficient_funds",
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::CreateToken => "create_token",
            Self::ForcedSell => "forced_sell",
            Self::TradeFailure => "trade_failure",
            Self::BalanceAlert => "balance_alert",
            Self::TokenRefresh => "token_refresh",
            Self::NoTokens => "no_tokens",
            Self::CycleStart => "cycle_start",
            Self::CycleComplete => "cycle_complete",
            Self::Hold => "hold",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Default priority for this action.
    pub fn priority(&self) -> Priority {
        match self {
            Self::Startup | Self::Shutdown | Self::Error | Self::InsufficientFunds => {
                Priority::CRITICAL
            }
            Self::Buy | Self::Sell | Self::CreateToken | Self::ForcedSell => Priority::TRADE,
            Self::TradeFailure | Self::BalanceAlert | Self::TokenRefresh | Self::NoTokens => {
                Priority::STATUS
            }
            Self::CycleStart | Self::CycleComplete | Self::Hold => Priority::ROUTINE,
            Self::Heartbeat => Priority::HEARTBEAT,
        }
    }

    /// Dispatched immediately instead of going through the batch buffer.
    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            Self::Startup | Self::Shutdown | Self::Error | Self::InsufficientFunds
        )
    }

    /// Delivered even while the circuit breaker is open.
    pub fn bypasses_breaker(&self) -> bool {
        matches!(self, Self::Startup | Self::Shutdown | Self::Error)
    }

    /// Fallback `details.message` when the caller did not provide one.
    pub fn default_message(&self, display_name: &str) -> String {
        match self {
            Self::Startup => format!("{display_name} is initializing trading systems"),
            Self::Shutdown => format!("{display_name} is going offline"),
            Self::Heartbeat => format!("{display_name} is active and monitoring markets"),
            Self::Error => "Encountered a minor hiccup.".to_string(),
            Self::InsufficientFunds => "Insufficient AVAX for trading operations".to_string(),
            Self::ForcedSell => "Forced to sell due to low AVAX balance".to_string(),
            Self::BalanceAlert => "Balance threshold reached".to_string(),
            Self::Buy => "Making a purchase!".to_string(),
            Self::Sell => "Time to take some profits!".to_string(),
            Self::CreateToken => "Creating something new!".to_string(),
            Self::Hold => "Staying put with this position for now.".to_string(),
            other => format!("System: {}", title_case(other.as_str())),
        }
    }
}

impl std::fmt::Display for NotificationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn title_case(snake: &str) -> String {
    snake
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// A single event queued for webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub action: NotificationAction,
    pub details: Map<String, Value>,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

impl NotificationEvent {
    /// Create an event with the action's default priority and no details.
    pub fn new(action: NotificationAction) -> Self {
        Self {
            action,
            details: Map::new(),
            priority: action.priority(),
            enqueued_at: Utc::now(),
        }
    }

    /// Add a detail field.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Set `details.message`.
    pub fn with_message(self, message: impl Into<String>) -> Self {
        self.with_detail("message", message.into())
    }

    /// Override the default priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Identity block sent with every webhook payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotIdentity {
    pub bot_name: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub wallet_address: Option<String>,
}
