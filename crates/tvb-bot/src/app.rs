//! Fleet orchestration.
//!
//! Builds the shared components once and runs one worker per bot:
//! - One token cache coordinator shared by every bot
//! - One webhook notifier per bot
//! - Periodic fleet statistics

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tvb_core::{NotificationAction, NotificationEvent};
use tvb_notify::{Notifier, NotifierConfig, ReqwestTransport, WebhookTransport};
use tvb_registry::{
    CoordinatorConfig, CoordinatorStats, FactoryRpcSource, TokenCacheCoordinator, TokenSource,
};
use tvb_telemetry::Metrics;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};

/// Consumer id used by `dry_run`.
const DRY_RUN_CONSUMER: &str = "dry-run";

/// Main application.
pub struct Application {
    config: AppConfig,
    coordinator: Arc<TokenCacheCoordinator>,
    source: Arc<dyn TokenSource>,
    transport: Arc<dyn WebhookTransport>,
    force_refresh: bool,
}

impl Application {
    /// Create the application with the JSON-RPC factory reader and HTTP webhooks.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let source = FactoryRpcSource::new(config.rpc_url.clone(), &config.factory_address)?;
        info!(
            rpc_url = %config.rpc_url,
            factory = %source.identity(),
            "Token source configured"
        );
        Ok(Self::with_parts(
            config,
            Arc::new(source),
            Arc::new(ReqwestTransport::new()),
        ))
    }

    /// Create the application from explicit seams.
    pub fn with_parts(
        config: AppConfig,
        source: Arc<dyn TokenSource>,
        transport: Arc<dyn WebhookTransport>,
    ) -> Self {
        let coordinator = Arc::new(TokenCacheCoordinator::new(CoordinatorConfig::from(
            &config.coordinator,
        )));
        Self {
            config,
            coordinator,
            source,
            transport,
            force_refresh: false,
        }
    }

    /// Mark the token cache stale before the first cycle.
    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<TokenCacheCoordinator> {
        &self.coordinator
    }

    /// Load the token list once and return the coordinator stats.
    pub async fn dry_run(&self) -> CoordinatorStats {
        self.coordinator
            .register(DRY_RUN_CONSUMER, self.source.clone());
        let tokens = self
            .coordinator
            .get_tokens(DRY_RUN_CONSUMER, self.force_refresh)
            .await;
        let stats = self.coordinator.stats();
        self.coordinator.unregister(DRY_RUN_CONSUMER);

        info!(
            tradeable = tokens.len(),
            total = stats.total_tokens,
            error = ?stats.last_refresh_error,
            "Dry run token load complete"
        );
        stats
    }

    /// Run until Ctrl-C.
    pub async fn run(&self) -> AppResult<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutdown signal received");
        })
        .await
    }

    /// Run every bot until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        if self.force_refresh {
            self.coordinator.force_refresh();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let notifier_config = NotifierConfig::from(&self.config.notifier);

        let workers: Vec<(String, JoinHandle<()>)> = self
            .config
            .bots
            .iter()
            .map(|bot| {
                let notifier = Notifier::start(
                    bot.identity(),
                    bot.webhook_target(),
                    notifier_config.clone(),
                    self.transport.clone(),
                );
                let worker = BotWorker {
                    name: bot.name.clone(),
                    coordinator: self.coordinator.clone(),
                    source: self.source.clone(),
                    notifier,
                    cycle_interval: self.config.cycle_interval(),
                    cycles: 0,
                };
                (bot.name.clone(), tokio::spawn(worker.run(shutdown_rx.clone())))
            })
            .collect();

        info!(
            bots = workers.len(),
            cycle_interval_secs = self.config.cycle_interval_secs,
            "Bot fleet started"
        );

        let mut stats_interval = tokio::time::interval(self.config.stats_interval());
        stats_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        stats_interval.tick().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = stats_interval.tick() => log_fleet_stats(&self.coordinator.stats()),
            }
        }

        info!("Stopping bot fleet");
        let _ = shutdown_tx.send(true);

        let mut failed = Vec::new();
        for (name, handle) in workers {
            if let Err(e) = handle.await {
                error!(bot = %name, error = %e, "Bot worker panicked");
                failed.push(name);
            }
        }

        self.coordinator.clear_consumers();
        log_fleet_stats(&self.coordinator.stats());
        match Metrics::encode_text() {
            Ok(text) => debug!(metrics = %text, "Final metrics"),
            Err(e) => warn!(error = %e, "Failed to encode metrics"),
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(AppError::Worker(format!(
                "workers failed: {}",
                failed.join(", ")
            )))
        }
    }
}

fn log_fleet_stats(stats: &CoordinatorStats) {
    info!(
        tradeable = stats.tradeable_count,
        total = stats.total_tokens,
        consumers = stats.registered_consumers,
        leader = ?stats.leader_id,
        cache_hits = stats.cache_hits,
        queries_saved = stats.queries_saved,
        refreshes = stats.refresh_count,
        misses = stats.coordination_misses,
        next_refresh_secs = stats.next_refresh_in.map(|d| d.as_secs()),
        "Token cache stats"
    );
}

// ============================================================================
// Bot worker
// ============================================================================

/// One bot: reads the shared token cache each cycle and reports to its webhook.
struct BotWorker {
    name: String,
    coordinator: Arc<TokenCacheCoordinator>,
    source: Arc<dyn TokenSource>,
    notifier: Notifier,
    cycle_interval: Duration,
    cycles: u64,
}

impl BotWorker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.coordinator.register(self.name.clone(), self.source.clone());
        let is_leader = self.coordinator.is_leader(&self.name);
        info!(bot = %self.name, is_leader, "Bot started");

        self.notifier
            .send(
                NotificationEvent::new(NotificationAction::Startup)
                    .with_detail("version", env!("CARGO_PKG_VERSION"))
                    .with_detail("isLeader", is_leader)
                    .with_detail("cycleIntervalSecs", self.cycle_interval.as_secs()),
            )
            .await;

        let mut ticker = tokio::time::interval(self.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.run_cycle().await,
            }
        }

        self.stop().await;
    }

    async fn run_cycle(&mut self) {
        self.cycles += 1;
        let cycle = self.cycles;

        self.notifier
            .send(NotificationEvent::new(NotificationAction::CycleStart).with_detail("cycle", cycle))
            .await;

        let tokens = self.coordinator.get_tokens(&self.name, false).await;
        let is_leader = self.coordinator.is_leader(&self.name);

        let event = if tokens.is_empty() {
            NotificationEvent::new(NotificationAction::NoTokens)
        } else {
            NotificationEvent::new(NotificationAction::TokenRefresh)
                .with_detail("tradeableTokens", tokens.len())
                .with_detail("isLeader", is_leader)
        };
        self.notifier.send(event).await;

        let mut details = Map::new();
        details.insert("tradeableTokens".to_string(), json!(tokens.len()));
        details.insert("cycles".to_string(), json!(cycle));
        details.insert("isLeader".to_string(), json!(is_leader));
        self.notifier.set_heartbeat_details(details);

        self.notifier
            .send(
                NotificationEvent::new(NotificationAction::CycleComplete)
                    .with_detail("cycle", cycle)
                    .with_detail("tradeableTokens", tokens.len()),
            )
            .await;

        debug!(bot = %self.name, cycle, tradeable = tokens.len(), is_leader, "Cycle complete");
    }

    async fn stop(self) {
        self.notifier
            .send(
                NotificationEvent::new(NotificationAction::Shutdown)
                    .with_detail("cycles", self.cycles),
            )
            .await;
        self.notifier.shutdown().await;
        self.coordinator.unregister(&self.name);

        let stats = self.notifier.stats();
        info!(
            bot = %self.name,
            cycles = self.cycles,
            sent = stats.total_sent,
            successful = stats.successful,
            failed = stats.failed,
            "Bot stopped"
        );
    }
}
