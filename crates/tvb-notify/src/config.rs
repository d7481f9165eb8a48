//! Notifier configuration.

use std::time::Duration;

/// Adaptive heartbeat configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Run the background heartbeat task.
    pub enabled: bool,
    /// How often the heartbeat task wakes up.
    pub check_interval: Duration,
    pub min_interval: Duration,
    pub base_interval: Duration,
    pub max_interval: Duration,
    /// Amount the interval moves per adjustment.
    pub step: Duration,
    /// Idle time below which the bot counts as active.
    pub active_window: Duration,
    /// Idle time above which the bot counts as idle.
    pub idle_window: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(10),
            min_interval: Duration::from_secs(60),
            base_interval: Duration::from_secs(120),
            max_interval: Duration::from_secs(300),
            step: Duration::from_secs(15),
            active_window: Duration::from_secs(5 * 60),
            idle_window: Duration::from_secs(15 * 60),
        }
    }
}

/// Delivery, batching and circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Buffered events that trigger an immediate batch flush.
    pub max_batch_size: usize,
    /// Quiet time after the last enqueue before the buffer is flushed.
    pub quiet_period: Duration,
    pub max_attempts: u32,
    /// Timeout of the first attempt.
    pub base_timeout: Duration,
    /// Added to the timeout on every retry.
    pub timeout_step: Duration,
    pub retry_delay: Duration,
    /// Consecutive failed deliveries that open the breaker.
    pub failure_threshold: u32,
    /// How long an open breaker skips non-critical traffic.
    pub backoff: Duration,
    pub heartbeat: HeartbeatConfig,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 5,
            quiet_period: Duration::from_secs(5),
            max_attempts: 3,
            base_timeout: Duration::from_secs(10),
            timeout_step: Duration::from_secs(2),
            retry_delay: Duration::from_secs(1),
            failure_threshold: 3,
            backoff: Duration::from_secs(30),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl NotifierConfig {
    /// Timeout for the zero-based `attempt`.
    pub fn attempt_timeout(&self, attempt: u32) -> Duration {
        self.base_timeout + self.timeout_step * attempt
    }
}

/// Webhook endpoint of one bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTarget {
    pub url: String,
    pub secret: String,
}

impl WebhookTarget {
    /// Build a target; `None` unless both URL and secret are present and non-empty.
    pub fn from_parts(url: Option<&str>, secret: Option<&str>) -> Option<Self> {
        let url = url.map(str::trim).filter(|u| !u.is_empty())?;
        let secret = secret.map(str::trim).filter(|s| !s.is_empty())?;
        Some(Self {
            url: url.to_string(),
            secret: secret.to_string(),
        })
    }
}
