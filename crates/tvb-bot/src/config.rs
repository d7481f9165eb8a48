//! Application configuration.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tvb_core::BotIdentity;
use tvb_notify::{HeartbeatConfig, NotifierConfig, WebhookTarget};
use tvb_registry::CoordinatorConfig;

use crate::error::{AppError, AppResult};

/// Placeholder left in shared config files for values that belong in the environment.
const ENV_PLACEHOLDER: &str = "SET_IN_ENV_LOCAL";

/// Token cache coordinator section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSection {
    /// Cache lifetime (seconds). Default: 1800.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Bound on waiting for the leader's refresh (seconds). Default: 60.
    #[serde(default = "default_leader_wait_timeout_secs")]
    pub leader_wait_timeout_secs: u64,
}

fn default_refresh_interval_secs() -> u64 {
    1800
}

fn default_leader_wait_timeout_secs() -> u64 {
    60
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            leader_wait_timeout_secs: default_leader_wait_timeout_secs(),
        }
    }
}

impl From<&CoordinatorSection> for CoordinatorConfig {
    fn from(section: &CoordinatorSection) -> Self {
        Self {
            refresh_interval: Duration::from_secs(section.refresh_interval_secs),
            leader_wait_timeout: Duration::from_secs(section.leader_wait_timeout_secs),
        }
    }
}

/// Adaptive heartbeat section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default: 10.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Default: 60.
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    /// Default: 120.
    #[serde(default = "default_base_interval_secs")]
    pub base_interval_secs: u64,
    /// Default: 300.
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
    /// Default: 15.
    #[serde(default = "default_step_secs")]
    pub step_secs: u64,
    /// Idle time below which the bot counts as active. Default: 300.
    #[serde(default = "default_active_window_secs")]
    pub active_window_secs: u64,
    /// Idle time above which the bot counts as idle. Default: 900.
    #[serde(default = "default_idle_window_secs")]
    pub idle_window_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_check_interval_secs() -> u64 {
    10
}

fn default_min_interval_secs() -> u64 {
    60
}

fn default_base_interval_secs() -> u64 {
    120
}

fn default_max_interval_secs() -> u64 {
    300
}

fn default_step_secs() -> u64 {
    15
}

fn default_active_window_secs() -> u64 {
    300
}

fn default_idle_window_secs() -> u64 {
    900
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_check_interval_secs(),
            min_interval_secs: default_min_interval_secs(),
            base_interval_secs: default_base_interval_secs(),
            max_interval_secs: default_max_interval_secs(),
            step_secs: default_step_secs(),
            active_window_secs: default_active_window_secs(),
            idle_window_secs: default_idle_window_secs(),
        }
    }
}

impl From<&HeartbeatSection> for HeartbeatConfig {
    fn from(section: &HeartbeatSection) -> Self {
        Self {
            enabled: section.enabled,
            check_interval: Duration::from_secs(section.check_interval_secs),
            min_interval: Duration::from_secs(section.min_interval_secs),
            base_interval: Duration::from_secs(section.base_interval_secs),
            max_interval: Duration::from_secs(section.max_interval_secs),
            step: Duration::from_secs(section.step_secs),
            active_window: Duration::from_secs(section.active_window_secs),
            idle_window: Duration::from_secs(section.idle_window_secs),
        }
    }
}

/// Webhook notifier section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierSection {
    /// Default: 5.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Default: 5000.
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
    /// Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Default: 10000.
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,
    /// Default: 2000.
    #[serde(default = "default_timeout_step_ms")]
    pub timeout_step_ms: u64,
    /// Default: 1000.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Default: 3.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Default: 30.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
}

fn default_max_batch_size() -> usize {
    5
}

fn default_quiet_period_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_timeout_ms() -> u64 {
    10_000
}

fn default_timeout_step_ms() -> u64 {
    2_000
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_backoff_secs() -> u64 {
    30
}

impl Default for NotifierSection {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            quiet_period_ms: default_quiet_period_ms(),
            max_attempts: default_max_attempts(),
            base_timeout_ms: default_base_timeout_ms(),
            timeout_step_ms: default_timeout_step_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            failure_threshold: default_failure_threshold(),
            backoff_secs: default_backoff_secs(),
            heartbeat: HeartbeatSection::default(),
        }
    }
}

impl From<&NotifierSection> for NotifierConfig {
    fn from(section: &NotifierSection) -> Self {
        Self {
            max_batch_size: section.max_batch_size.max(1),
            quiet_period: Duration::from_millis(section.quiet_period_ms),
            max_attempts: section.max_attempts.max(1),
            base_timeout: Duration::from_millis(section.base_timeout_ms),
            timeout_step: Duration::from_millis(section.timeout_step_ms),
            retry_delay: Duration::from_millis(section.retry_delay_ms),
            failure_threshold: section.failure_threshold.max(1),
            backoff: Duration::from_secs(section.backoff_secs),
            heartbeat: HeartbeatConfig::from(&section.heartbeat),
        }
    }
}

/// One bot of the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Unique bot name; also the coordinator consumer id.
    pub name: String,
    /// Name shown on the dashboard. Default: `name`.
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

impl BotConfig {
    pub fn identity(&self) -> BotIdentity {
        BotIdentity {
            bot_name: self.name.clone(),
            display_name: self
                .display_name
                .clone()
                .unwrap_or_else(|| self.name.clone()),
            avatar_url: self.avatar_url.clone(),
            bio: self.bio.clone(),
            wallet_address: self.wallet_address.clone(),
        }
    }

    /// Webhook endpoint, `None` when URL or secret is missing.
    pub fn webhook_target(&self) -> Option<WebhookTarget> {
        WebhookTarget::from_parts(
            usable(self.webhook_url.as_deref()),
            usable(self.webhook_secret.as_deref()),
        )
    }

    /// Prefix of this bot's environment overrides (`BOT_<NAME>_`).
    fn env_prefix(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("BOT_{name}_")
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// JSON-RPC endpoint of the chain.
    pub rpc_url: String,
    /// Token factory contract address.
    pub factory_address: String,
    /// Seconds between bot cycles. Default: 60.
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    /// Seconds between fleet stats log lines. Default: 300.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub notifier: NotifierSection,
    #[serde(default)]
    pub bots: Vec<BotConfig>,
}

fn default_cycle_interval_secs() -> u64 {
    60
}

fn default_stats_interval_secs() -> u64 {
    300
}

impl AppConfig {
    /// Load from a specific file and apply environment overrides.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse without environment overrides or validation.
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        toml::from_str(content).map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))
    }

    /// Override secrets and endpoints from the environment.
    ///
    /// Bot-specific keys win over shared keys, which win over the file:
    /// `BOT_<NAME>_WEBHOOK_SECRET`, `WEBHOOK_SECRET`, `BOT_SECRET` for the
    /// secret; `BOT_<NAME>_WEBHOOK_URL`, `WEBHOOK_URL` for the URL;
    /// `RPC_URL` and `FACTORY_ADDRESS` for the chain.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = first_usable(&lookup, &["RPC_URL".to_string()]) {
            self.rpc_url = url;
        }
        if let Some(address) = first_usable(&lookup, &["FACTORY_ADDRESS".to_string()]) {
            self.factory_address = address;
        }

        for bot in &mut self.bots {
            let prefix = bot.env_prefix();
            let secret_keys = [
                format!("{prefix}WEBHOOK_SECRET"),
                "WEBHOOK_SECRET".to_string(),
                "BOT_SECRET".to_string(),
            ];
            if let Some(secret) = first_usable(&lookup, &secret_keys) {
                bot.webhook_secret = Some(secret);
            }

            let url_keys = [format!("{prefix}WEBHOOK_URL"), "WEBHOOK_URL".to_string()];
            if let Some(url) = first_usable(&lookup, &url_keys) {
                bot.webhook_url = Some(url);
            }
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.rpc_url.trim().is_empty() {
            return Err(AppError::Config("rpc_url is empty".to_string()));
        }
        if self.factory_address.trim().is_empty() {
            return Err(AppError::Config("factory_address is empty".to_string()));
        }
        if self.cycle_interval_secs == 0 {
            return Err(AppError::Config(
                "cycle_interval_secs must be positive".to_string(),
            ));
        }
        if self.bots.is_empty() {
            return Err(AppError::Config("no [[bots]] configured".to_string()));
        }

        let mut seen = HashSet::new();
        for bot in &self.bots {
            if bot.name.trim().is_empty() {
                return Err(AppError::Config("bot with empty name".to_string()));
            }
            if !seen.insert(bot.name.as_str()) {
                return Err(AppError::Config(format!("duplicate bot name: {}", bot.name)));
            }
        }

        let hb = &self.notifier.heartbeat;
        if hb.check_interval_secs == 0 {
            return Err(AppError::Config(
                "notifier.heartbeat.check_interval_secs must be positive".to_string(),
            ));
        }
        if hb.step_secs == 0 {
            return Err(AppError::Config(
                "notifier.heartbeat.step_secs must be positive".to_string(),
            ));
        }
        if hb.min_interval_secs > hb.max_interval_secs {
            return Err(AppError::Config(
                "notifier.heartbeat.min_interval_secs exceeds max_interval_secs".to_string(),
            ));
        }
        Ok(())
    }

    /// Keep only the named bots. An empty selection keeps every bot.
    pub fn retain_bots(&mut self, names: &[String]) -> AppResult<()> {
        if names.is_empty() {
            return Ok(());
        }
        for name in names {
            if !self.bots.iter().any(|b| &b.name == name) {
                return Err(AppError::Config(format!("unknown bot: {name}")));
            }
        }
        self.bots.retain(|b| names.contains(&b.name));
        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

/// First usable value among `keys`, in order.
fn first_usable(lookup: &impl Fn(&str) -> Option<String>, keys: &[String]) -> Option<String> {
    keys.iter()
        .filter_map(|key| lookup(key))
        .find_map(|value| usable(Some(value.as_str())).map(str::to_string))
}

/// A config value that is present, non-empty and not the env placeholder.
fn usable(value: Option<&str>) -> Option<&str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != ENV_PLACEHOLDER)
}
