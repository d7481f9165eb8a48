//! Per-bot resilient webhook notifier.
//!
//! Each bot owns one `Notifier`. Non-critical events are buffered and
//! flushed as one payload when the buffer fills up or after a quiet period;
//! critical events flush the buffer together with themselves right away.
//! Deliveries are retried with a growing timeout and feed a circuit
//! breaker. A background task sends heartbeats on an adaptive interval.
//!
//! The notifier is a cheap handle around shared state; clones talk to the
//! same buffer, breaker and background tasks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tvb_core::{BotIdentity, NotificationAction, NotificationEvent};
use tvb_telemetry::Metrics;

use crate::adaptive::AdaptiveInterval;
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::{NotifierConfig, WebhookTarget};
use crate::error::TransportError;
use crate::payload::{build_payload, order_batch};
use crate::transport::{DeliveryOutcome, WebhookTransport};

/// Floor for the heartbeat check period; a zero period cannot tick.
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Point-in-time view of a notifier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NotifierStats {
    /// Deliveries attempted (one per flushed batch or heartbeat).
    pub total_sent: u64,
    pub successful: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    /// Requests not made: events folded into a batch, events dropped while
    /// the breaker was open and heartbeats skipped.
    pub requests_saved: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_successful: u64,
    pub current_adaptive_interval: Duration,
    /// Attempts beyond the first.
    pub retries_used: u64,
    /// Non-empty batches handed to delivery.
    pub batches_flushed: u64,
    /// Successes that ended a failure streak.
    pub connection_recoveries: u64,
    pub breaker_state: Option<BreakerState>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// What a delivery carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryKind {
    Batch,
    Heartbeat,
}

struct NotifierState {
    buffer: Vec<NotificationEvent>,
    breaker: CircuitBreaker,
    heartbeat: AdaptiveInterval,
    last_heartbeat_at: Instant,
    started_at: Instant,
    /// Last critical send; drives the idle time of the heartbeat.
    last_activity_at: Option<Instant>,
    heartbeat_details: Map<String, Value>,
    stats: NotifierStats,
    shutting_down: bool,
}

struct Inner {
    identity: BotIdentity,
    target: Option<WebhookTarget>,
    config: NotifierConfig,
    transport: Arc<dyn WebhookTransport>,
    state: Mutex<NotifierState>,
    /// Wakes the debounce loop on every enqueue.
    enqueued: Notify,
    /// Full batches handed off by `send`.
    batch_tx: mpsc::UnboundedSender<Vec<NotificationEvent>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Resilient webhook notifier handle.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<Inner>,
}

impl Notifier {
    /// Create a notifier and spawn its background tasks.
    ///
    /// A notifier without a target is disabled: no tasks are spawned and
    /// every send returns `false`. Must be called inside a Tokio runtime.
    pub fn start(
        identity: BotIdentity,
        target: Option<WebhookTarget>,
        config: NotifierConfig,
        transport: Arc<dyn WebhookTransport>,
    ) -> Self {
        let now = Instant::now();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let state = NotifierState {
            buffer: Vec::with_capacity(config.max_batch_size),
            breaker: CircuitBreaker::new(config.failure_threshold, config.backoff),
            heartbeat: AdaptiveInterval::new(&config.heartbeat),
            last_heartbeat_at: now,
            started_at: now,
            last_activity_at: None,
            heartbeat_details: Map::new(),
            stats: NotifierStats::default(),
            shutting_down: false,
        };

        let inner = Arc::new(Inner {
            identity,
            target,
            config,
            transport,
            state: Mutex::new(state),
            enqueued: Notify::new(),
            batch_tx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        if inner.target.is_none() {
            warn!(
                bot = %inner.identity.bot_name,
                "Webhook URL or secret missing, notifications disabled"
            );
            return Self { inner };
        }

        let mut tasks = vec![tokio::spawn(run_dispatcher(
            inner.clone(),
            batch_rx,
            inner.shutdown_tx.subscribe(),
        ))];
        if inner.config.heartbeat.enabled {
            tasks.push(tokio::spawn(run_heartbeat(
                inner.clone(),
                inner.shutdown_tx.subscribe(),
            )));
        }
        *inner.tasks.lock() = tasks;

        info!(
            bot = %inner.identity.bot_name,
            max_batch_size = inner.config.max_batch_size,
            heartbeat = inner.config.heartbeat.enabled,
            "Webhook notifier started"
        );
        Self { inner }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.target.is_some()
    }

    pub fn identity(&self) -> &BotIdentity {
        &self.inner.identity
    }

    /// Send an event.
    ///
    /// Critical actions flush the buffer together with the event and return
    /// the delivery result. Other actions are buffered and return `true`,
    /// or `false` when dropped because the breaker is open. Every send
    /// returns `false` once `shutdown` has started.
    pub async fn send(&self, event: NotificationEvent) -> bool {
        if self.inner.target.is_none() {
            return false;
        }

        if event.action.is_immediate() {
            let batch = {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return false;
                }
                state.last_activity_at = Some(Instant::now());
                let interval = state.heartbeat.record_activity();
                Metrics::heartbeat_interval(&self.inner.identity.bot_name, interval.as_secs_f64());
                let mut batch = std::mem::take(&mut state.buffer);
                batch.push(event);
                batch
            };
            return self.inner.deliver_batch(batch).await;
        }

        let full_batch = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return false;
            }
            if !state.breaker.allows(Instant::now()) {
                state.stats.requests_saved += 1;
                Metrics::webhook_delivery(&self.inner.identity.bot_name, "skipped");
                debug!(
                    bot = %self.inner.identity.bot_name,
                    action = %event.action,
                    "Circuit breaker open, dropping notification"
                );
                return false;
            }
            state.buffer.push(event);
            if state.buffer.len() >= self.inner.config.max_batch_size {
                Some(std::mem::take(&mut state.buffer))
            } else {
                None
            }
        };

        if let Some(batch) = full_batch {
            if let Err(mpsc::error::SendError(batch)) = self.inner.batch_tx.send(batch) {
                // Dispatcher gone; put the events back for an explicit flush.
                self.inner.state.lock().buffer.extend(batch);
            }
        }
        self.inner.enqueued.notify_one();
        true
    }

    /// Deliver everything buffered now.
    ///
    /// Returns `true` when the buffer was empty or the delivery succeeded.
    pub async fn flush(&self) -> bool {
        if self.inner.target.is_none() {
            return false;
        }
        let batch = std::mem::take(&mut self.inner.state.lock().buffer);
        if batch.is_empty() {
            return true;
        }
        self.inner.deliver_batch(batch).await
    }

    /// Extra fields attached to every heartbeat.
    pub fn set_heartbeat_details(&self, details: Map<String, Value>) {
        self.inner.state.lock().heartbeat_details = details;
    }

    /// Drain the buffer and stop the background tasks.
    pub async fn shutdown(&self) {
        self.inner.state.lock().shutting_down = true;
        self.flush().await;
        let _ = self.inner.shutdown_tx.send(true);

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(bot = %self.inner.identity.bot_name, error = %e, "Notifier task failed");
            }
        }
        debug!(bot = %self.inner.identity.bot_name, "Webhook notifier stopped");
    }

    pub fn stats(&self) -> NotifierStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.consecutive_failures = state.breaker.consecutive_failures();
        stats.current_adaptive_interval = state.heartbeat.current();
        stats.breaker_state = Some(state.breaker.state(Instant::now()));
        stats
    }
}

impl Inner {
    fn bot(&self) -> &str {
        &self.identity.bot_name
    }

    fn take_buffer(&self) -> Vec<NotificationEvent> {
        std::mem::take(&mut self.state.lock().buffer)
    }

    /// Order a batch, gate it on the breaker and deliver it as one payload.
    async fn deliver_batch(&self, mut batch: Vec<NotificationEvent>) -> bool {
        let Some(target) = &self.target else {
            return false;
        };

        order_batch(&mut batch);
        let Some((primary, rest)) = batch.split_first() else {
            return true;
        };

        {
            let mut state = self.state.lock();
            if !primary.action.bypasses_breaker() && !state.breaker.allows(Instant::now()) {
                state.stats.requests_saved += 1;
                Metrics::webhook_delivery(self.bot(), "skipped");
                debug!(
                    bot = self.bot(),
                    action = %primary.action,
                    events = batch.len(),
                    "Circuit breaker open, skipping batch"
                );
                return false;
            }
            state.stats.batches_flushed += 1;
            state.stats.requests_saved += rest.len() as u64;
        }

        let payload = build_payload(&self.identity, primary, rest, &target.secret, Utc::now());
        debug!(
            bot = self.bot(),
            action = %primary.action,
            batched = rest.len(),
            "Flushing notification batch"
        );
        self.deliver(target, &payload, DeliveryKind::Batch).await
    }

    /// Post a payload with retries and record the outcome.
    async fn deliver(&self, target: &WebhookTarget, payload: &Value, kind: DeliveryKind) -> bool {
        let action = payload["action"].as_str().unwrap_or_default().to_string();
        let attempts = self.config.max_attempts.max(1);
        let mut delivered = false;

        for attempt in 0..attempts {
            if attempt > 0 {
                self.state.lock().stats.retries_used += 1;
                sleep(self.config.retry_delay).await;
            }

            let attempt_timeout = self.config.attempt_timeout(attempt);
            let result = timeout(
                attempt_timeout,
                self.transport.post(&target.url, payload, attempt_timeout),
            )
            .await
            .unwrap_or(Err(TransportError::Timeout(attempt_timeout)));

            match DeliveryOutcome::classify(&result) {
                DeliveryOutcome::Delivered => {
                    delivered = true;
                    break;
                }
                DeliveryOutcome::Rejected(status) => {
                    warn!(
                        bot = self.bot(),
                        action = %action,
                        status,
                        "Webhook rejected, not retrying"
                    );
                    break;
                }
                DeliveryOutcome::Retryable(reason) => {
                    let is_last = attempt + 1 == attempts;
                    if kind == DeliveryKind::Heartbeat && !is_last {
                        debug!(bot = self.bot(), attempt = attempt + 1, %reason, "Heartbeat attempt failed");
                    } else {
                        warn!(
                            bot = self.bot(),
                            action = %action,
                            attempt = attempt + 1,
                            max_attempts = attempts,
                            %reason,
                            "Webhook attempt failed"
                        );
                    }
                }
            }
        }

        self.record_outcome(delivered, kind);
        delivered
    }

    fn record_outcome(&self, delivered: bool, kind: DeliveryKind) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.stats.total_sent += 1;

        if kind == DeliveryKind::Heartbeat {
            state.stats.heartbeats_sent += 1;
            state.last_heartbeat_at = now;
        }

        if delivered {
            state.stats.successful += 1;
            state.stats.last_success_at = Some(Utc::now());
            let was_open = state.breaker.state(now) != BreakerState::Closed;
            let streak = state.breaker.record_success();
            if streak > 0 {
                state.stats.connection_recoveries += 1;
                info!(
                    bot = self.bot(),
                    failures = streak,
                    "Webhook connection recovered"
                );
            }
            if was_open {
                Metrics::breaker_open(self.bot(), false);
                info!(bot = self.bot(), "Circuit breaker closed");
            }
            if kind == DeliveryKind::Heartbeat {
                state.stats.heartbeats_successful += 1;
                let interval = state.heartbeat.record_success();
                Metrics::heartbeat_interval(self.bot(), interval.as_secs_f64());
                debug!(
                    bot = self.bot(),
                    next_interval_secs = interval.as_secs(),
                    "Heartbeat delivered"
                );
            }
            Metrics::webhook_delivery(self.bot(), "success");
        } else {
            state.stats.failed += 1;
            if state.breaker.record_failure(now) {
                Metrics::breaker_open(self.bot(), true);
                warn!(
                    bot = self.bot(),
                    consecutive_failures = state.breaker.consecutive_failures(),
                    backoff_secs = self.config.backoff.as_secs(),
                    "Circuit breaker open, skipping non-critical webhooks"
                );
            }
            if kind == DeliveryKind::Heartbeat {
                let interval = state.heartbeat.record_failure();
                Metrics::heartbeat_interval(self.bot(), interval.as_secs_f64());
                warn!(
                    bot = self.bot(),
                    next_interval_secs = interval.as_secs(),
                    "Heartbeat failed"
                );
            }
            Metrics::webhook_delivery(self.bot(), "failed");
        }
    }

    // ====================================================================
    // Heartbeat
    // ====================================================================

    /// One heartbeat check. Sends when the current interval has elapsed.
    async fn heartbeat_tick(&self) {
        let Some(target) = &self.target else {
            return;
        };

        let event = {
            let now = Instant::now();
            let mut state = self.state.lock();
            let since = state.last_activity_at.unwrap_or(state.started_at);
            let idle = now.saturating_duration_since(since);
            let activity_seen = state.last_activity_at.is_some();
            let interval = state.heartbeat.recompute(idle, activity_seen);
            Metrics::heartbeat_interval(self.bot(), interval.as_secs_f64());

            if now.saturating_duration_since(state.last_heartbeat_at) < interval {
                return;
            }

            if !state.breaker.allows(now) {
                state.stats.requests_saved += 1;
                state.last_heartbeat_at = now;
                debug!(bot = self.bot(), "Circuit breaker open, skipping heartbeat");
                return;
            }

            self.heartbeat_event(&state, interval)
        };

        let payload = build_payload(&self.identity, &event, &[], &target.secret, Utc::now());
        self.deliver(target, &payload, DeliveryKind::Heartbeat).await;
    }

    fn heartbeat_event(&self, state: &NotifierState, interval: Duration) -> NotificationEvent {
        let mut event = NotificationEvent::new(NotificationAction::Heartbeat)
            .with_detail("status", "active")
            .with_detail(
                "connectionHealth",
                json!({
                    "consecutiveFailures": state.breaker.consecutive_failures(),
                    "lastSuccess": state.stats.last_success_at.map(|t| t.to_rfc3339()),
                    "retriesUsed": state.stats.retries_used,
                    "recoveries": state.stats.connection_recoveries,
                }),
            )
            .with_detail("heartbeatInterval", interval.as_secs());
        for (key, value) in &state.heartbeat_details {
            event.details.insert(key.clone(), value.clone());
        }
        event
    }
}

/// Background dispatcher: delivers full batches and debounces the rest.
async fn run_dispatcher(
    inner: Arc<Inner>,
    mut batch_rx: mpsc::UnboundedReceiver<Vec<NotificationEvent>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            Some(batch) = batch_rx.recv() => {
                inner.deliver_batch(batch).await;
            }
            _ = inner.enqueued.notified() => {
                // Restart the quiet period on every enqueue.
                loop {
                    tokio::select! {
                        _ = sleep(inner.config.quiet_period) => {
                            let batch = inner.take_buffer();
                            if !batch.is_empty() {
                                inner.deliver_batch(batch).await;
                            }
                            break;
                        }
                        _ = inner.enqueued.notified() => {}
                        Some(batch) = batch_rx.recv() => {
                            inner.deliver_batch(batch).await;
                        }
                        _ = shutdown_rx.changed() => return,
                    }
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    debug!(bot = inner.bot(), "Notification dispatcher stopped");
}

/// Background heartbeat loop.
async fn run_heartbeat(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
    let period = inner.config.heartbeat.check_interval.max(MIN_CHECK_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => inner.heartbeat_tick().await,
            _ = shutdown_rx.changed() => break,
        }
    }
    debug!(bot = inner.bot(), "Heartbeat task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn identity() -> BotIdentity {
        BotIdentity {
            bot_name: "billy".to_string(),
            display_name: "Bullish Billy".to_string(),
            ..Default::default()
        }
    }

    fn target() -> Option<WebhookTarget> {
        WebhookTarget::from_parts(Some("http://dashboard/webhook"), Some("s3cret"))
    }

    fn quiet_config() -> NotifierConfig {
        let mut config = NotifierConfig::default();
        config.heartbeat.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_disabled_without_target() {
        let transport = Arc::new(MockTransport::new());
        let notifier = Notifier::start(identity(), None, quiet_config(), transport.clone());

        assert!(!notifier.is_enabled());
        assert!(
            !notifier
                .send(NotificationEvent::new(NotificationAction::Startup))
                .await
        );
        assert!(!notifier.send(NotificationEvent::new(NotificationAction::Buy)).await);
        assert_eq!(transport.post_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_send_flushes_buffer() {
        let transport = Arc::new(MockTransport::new());
        let notifier = Notifier::start(identity(), target(), quiet_config(), transport.clone());

        assert!(notifier.send(NotificationEvent::new(NotificationAction::Hold)).await);
        assert!(notifier.send(NotificationEvent::new(NotificationAction::Buy)).await);
        assert!(
            notifier
                .send(NotificationEvent::new(NotificationAction::Startup))
                .await
        );

        let posts = transport.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].url, "http://dashboard/webhook");
        assert_eq!(posts[0].body["action"], "startup");
        assert_eq!(posts[0].body["details"]["batchedUpdates"], 2);
        assert_eq!(
            posts[0].body["details"]["batchedActions"],
            json!(["buy", "hold"])
        );
        notifier.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(Ok(502));
        let notifier = Notifier::start(identity(), target(), quiet_config(), transport.clone());

        assert!(
            notifier
                .send(NotificationEvent::new(NotificationAction::Error))
                .await
        );

        let posts = transport.posts();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].timeout, Duration::from_secs(10));
        assert_eq!(posts[1].timeout, Duration::from_secs(12));

        let stats = notifier.stats();
        assert_eq!(stats.retries_used, 1);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.total_sent, 1);
        assert!(stats.last_success_at.is_some());
        notifier.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        let transport = Arc::new(MockTransport::with_status(404));
        let notifier = Notifier::start(identity(), target(), quiet_config(), transport.clone());

        assert!(
            !notifier
                .send(NotificationEvent::new(NotificationAction::Shutdown))
                .await
        );
        assert_eq!(transport.post_count(), 1);

        let stats = notifier.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.consecutive_failures, 1);
        notifier.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transport_times_out() {
        let transport = Arc::new(MockTransport::new());
        transport.set_latency(Duration::from_secs(60));
        let notifier = Notifier::start(identity(), target(), quiet_config(), transport.clone());

        let started = Instant::now();
        assert!(
            !notifier
                .send(NotificationEvent::new(NotificationAction::Error))
                .await
        );
        // 10 + 12 + 14 seconds of attempts plus two retry delays
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(38) && elapsed < Duration::from_secs(39));
        assert_eq!(transport.post_count(), 3);
        notifier.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_flush() {
        let transport = Arc::new(MockTransport::new());
        let notifier = Notifier::start(identity(), target(), quiet_config(), transport.clone());

        assert!(notifier.flush().await);
        assert_eq!(transport.post_count(), 0);

        notifier
            .send(NotificationEvent::new(NotificationAction::CycleComplete))
            .await;
        assert!(notifier.flush().await);
        assert_eq!(transport.post_count(), 1);
        assert_eq!(
            transport.posts()[0].body["details"]["message"],
            "System: Cycle Complete"
        );
        assert_eq!(notifier.stats().batches_flushed, 1);
        notifier.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_buffer() {
        let transport = Arc::new(MockTransport::new());
        let notifier = Notifier::start(identity(), target(), quiet_config(), transport.clone());

        notifier
            .send(NotificationEvent::new(NotificationAction::Sell))
            .await;
        notifier.shutdown().await;

        assert_eq!(transport.bodies_for("sell").len(), 1);
        assert!(!notifier.send(NotificationEvent::new(NotificationAction::Buy)).await);
        assert!(
            !notifier
                .send(NotificationEvent::new(NotificationAction::Error))
                .await
        );
        assert_eq!(transport.post_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_check_interval_still_ticks() {
        let transport = Arc::new(MockTransport::new());
        let mut config = NotifierConfig::default();
        config.heartbeat.check_interval = Duration::ZERO;
        let notifier = Notifier::start(identity(), target(), config, transport.clone());

        sleep(Duration::from_secs(125)).await;
        assert_eq!(notifier.stats().heartbeats_sent, 1);
        assert_eq!(transport.bodies_for("heartbeat").len(), 1);
        notifier.shutdown().await;
    }
}
