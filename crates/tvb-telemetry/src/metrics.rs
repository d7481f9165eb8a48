//! Prometheus metrics for the bot fleet.
//!
//! Covers:
//! - Token cache coordination (hits, refreshes, coordination misses)
//! - Webhook delivery outcomes per bot
//! - Circuit breaker and adaptive heartbeat state per bot
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means a
//! duplicate metric name, which is a programming error surfaced on first use.

use crate::error::TelemetryResult;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_counter, register_int_gauge,
    CounterVec, Encoder, GaugeVec, IntCounter, IntGauge, TextEncoder,
};

/// Token list requests answered from the fresh cache.
pub static TOKEN_CACHE_HITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tvb_token_cache_hits_total",
        "Token list requests served from the fresh cache"
    )
    .unwrap()
});

/// Completed token list refreshes by outcome.
/// Labels: outcome (ok/error/discarded), path (leader/fallback)
pub static TOKEN_REFRESH_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tvb_token_refresh_total",
        "Token list refreshes against the factory",
        &["outcome", "path"]
    )
    .unwrap()
});

/// Waits on the leader that timed out and fell back to an own fetch.
pub static COORDINATION_MISS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tvb_coordination_miss_total",
        "Leader waits that timed out and fetched independently"
    )
    .unwrap()
});

/// Tradeable tokens in the current snapshot.
pub static TRADEABLE_TOKENS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "tvb_tradeable_tokens",
        "Tradeable tokens in the current cache snapshot"
    )
    .unwrap()
});

/// Webhook deliveries by bot and outcome.
/// Labels: bot, outcome (success/failed/skipped)
pub static WEBHOOK_DELIVERIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tvb_webhook_deliveries_total",
        "Webhook deliveries by outcome",
        &["bot", "outcome"]
    )
    .unwrap()
});

/// Circuit breaker state per bot (1 = open).
pub static WEBHOOK_BREAKER_OPEN: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "tvb_webhook_breaker_open",
        "Webhook circuit breaker state (1=open)",
        &["bot"]
    )
    .unwrap()
});

/// Current adaptive heartbeat interval per bot.
pub static HEARTBEAT_INTERVAL_SECONDS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "tvb_heartbeat_interval_seconds",
        "Current adaptive heartbeat interval",
        &["bot"]
    )
    .unwrap()
});

/// Metrics facade.
pub struct Metrics;

impl Metrics {
    /// Record a cache hit.
    pub fn token_cache_hit() {
        TOKEN_CACHE_HITS_TOTAL.inc();
    }

    /// Record a finished refresh.
    pub fn token_refresh(outcome: &str, path: &str) {
        TOKEN_REFRESH_TOTAL
            .with_label_values(&[outcome, path])
            .inc();
    }

    /// Record a leader wait timeout.
    pub fn coordination_miss() {
        COORDINATION_MISS_TOTAL.inc();
    }

    /// Set the tradeable token count.
    pub fn tradeable_tokens(count: usize) {
        TRADEABLE_TOKENS.set(count as i64);
    }

    /// Record a webhook delivery outcome.
    pub fn webhook_delivery(bot: &str, outcome: &str) {
        WEBHOOK_DELIVERIES_TOTAL
            .with_label_values(&[bot, outcome])
            .inc();
    }

    /// Set the breaker state for a bot.
    pub fn breaker_open(bot: &str, is_open: bool) {
        WEBHOOK_BREAKER_OPEN
            .with_label_values(&[bot])
            .set(if is_open { 1.0 } else { 0.0 });
    }

    /// Set the adaptive heartbeat interval for a bot.
    pub fn heartbeat_interval(bot: &str, secs: f64) {
        HEARTBEAT_INTERVAL_SECONDS.with_label_values(&[bot]).set(secs);
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode_text() -> TelemetryResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&prometheus::gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
