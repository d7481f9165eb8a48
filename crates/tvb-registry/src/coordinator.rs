//! Shared token cache with single-flight refresh.
//!
//! One coordinator is shared by every bot in the process. The first
//! registered consumer is the leader and performs refreshes on behalf of
//! everyone; other consumers wait for the leader's result on a `watch`
//! channel, bounded by `leader_wait_timeout`, and fall back to an
//! independent load when the wait times out.
//!
//! All mutable state lives behind a single mutex that is never held
//! across an await point.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use tvb_core::{normalize_address, ConsumerId, TokenMetadata, TokenRecord};
use tvb_telemetry::Metrics;

use crate::error::SourceResult;
use crate::source::TokenSource;

/// Default cache lifetime.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Default bound on waiting for the leader's refresh.
pub const DEFAULT_LEADER_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Cache lifetime after a successful refresh.
    pub refresh_interval: Duration,
    /// How long a non-leader waits before loading on its own.
    pub leader_wait_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            leader_wait_timeout: DEFAULT_LEADER_WAIT_TIMEOUT,
        }
    }
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub total_tokens: usize,
    pub tradeable_count: usize,
    pub registered_consumers: usize,
    pub leader_id: Option<ConsumerId>,
    pub cache_hits: u64,
    /// Cache hits plus waiters served by someone else's refresh.
    pub queries_saved: u64,
    pub refresh_count: u64,
    pub coordination_misses: u64,
    /// Time until the cache goes stale; `None` when it already is.
    pub next_refresh_in: Option<Duration>,
    pub last_refresh_error: Option<String>,
    pub load_in_flight: bool,
}

#[derive(Debug, Clone)]
struct ConsumerEntry {
    registered_at: DateTime<Utc>,
    source_identity: String,
}

/// Which path produced a refresh.
#[derive(Debug, Clone, Copy)]
enum RefreshPath {
    Leader,
    Fallback,
}

impl RefreshPath {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Default)]
struct CacheState {
    /// Keyed by normalized address.
    tokens: HashMap<String, TokenRecord>,
    tradeable: Vec<TokenRecord>,
    last_refresh: Option<Instant>,
    /// Ordered so leadership handoff is deterministic.
    consumers: BTreeMap<ConsumerId, ConsumerEntry>,
    leader: Option<ConsumerId>,
    source: Option<Arc<dyn TokenSource>>,
    source_identity: Option<String>,
    /// Bumped on every identity change; loads started under an older epoch are discarded.
    source_epoch: u64,
    load_in_flight: bool,
    cache_hits: u64,
    queries_saved: u64,
    refresh_count: u64,
    coordination_misses: u64,
    last_refresh_error: Option<String>,
}

impl CacheState {
    fn is_fresh(&self, interval: Duration) -> bool {
        self.last_refresh
            .is_some_and(|at| at.elapsed() < interval)
    }

    fn may_lead(&self, consumer_id: &str) -> bool {
        match &self.leader {
            Some(leader) => leader == consumer_id,
            None => true,
        }
    }

    fn known_metadata(&self) -> HashMap<String, TokenMetadata> {
        self.tokens
            .iter()
            .map(|(key, record)| (key.clone(), record.metadata()))
            .collect()
    }

    fn invalidate(&mut self) {
        self.tokens.clear();
        self.tradeable.clear();
        self.last_refresh = None;
    }
}

/// Work captured under the lock by `get_tokens`.
enum Plan {
    Serve(Vec<TokenRecord>),
    Lead(LoadTicket),
    Wait(watch::Receiver<u64>),
}

/// Everything a load needs, captured under the lock.
struct LoadTicket {
    source: Arc<dyn TokenSource>,
    epoch: u64,
    known: HashMap<String, TokenMetadata>,
}

/// Clears the in-flight flag and wakes waiters when the leader's load ends,
/// including when the leader's future is dropped mid-load.
struct LoadGuard<'a> {
    coordinator: &'a TokenCacheCoordinator,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.state.lock().load_in_flight = false;
        self.coordinator.notify_load_done();
    }
}

/// Process-wide token cache shared by every bot.
pub struct TokenCacheCoordinator {
    config: CoordinatorConfig,
    state: Mutex<CacheState>,
    /// Generation counter bumped after every finished load.
    load_done: watch::Sender<u64>,
}

impl TokenCacheCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (load_done, _) = watch::channel(0);
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            load_done,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ====================================================================
    // Consumer registry
    // ====================================================================

    /// Register a consumer and its token source.
    ///
    /// The first registrant (or the first one after every consumer left)
    /// becomes leader. A source whose identity differs from the canonical
    /// one invalidates the cache and becomes canonical; leadership is not
    /// reassigned.
    pub fn register(&self, consumer_id: impl Into<ConsumerId>, source: Arc<dyn TokenSource>) {
        let consumer_id = consumer_id.into();
        let identity = source.identity();
        let mut state = self.state.lock();

        let canonical = state.source_identity.clone();
        match canonical.as_deref() {
            None => {
                state.source = Some(source);
                state.source_identity = Some(identity.clone());
            }
            Some(canonical) if canonical != identity => {
                warn!(
                    consumer = %consumer_id,
                    previous = %canonical,
                    source = %identity,
                    "Token source changed, invalidating cache"
                );
                state.invalidate();
                state.source_epoch += 1;
                state.source = Some(source);
                state.source_identity = Some(identity.clone());
            }
            Some(_) => {}
        }

        state.consumers.insert(
            consumer_id.clone(),
            ConsumerEntry {
                registered_at: Utc::now(),
                source_identity: identity,
            },
        );

        if state.leader.is_none() {
            info!(consumer = %consumer_id, "Consumer elected token cache leader");
            state.leader = Some(consumer_id.clone());
        }

        debug!(
            consumer = %consumer_id,
            consumers = state.consumers.len(),
            leader = ?state.leader,
            "Consumer registered"
        );
    }

    /// Remove a consumer. A departing leader hands off to the smallest remaining id.
    pub fn unregister(&self, consumer_id: &str) {
        let mut state = self.state.lock();
        let Some(entry) = state.consumers.remove(consumer_id) else {
            debug!(consumer = consumer_id, "Unregister of unknown consumer ignored");
            return;
        };

        if state.leader.as_deref() == Some(consumer_id) {
            state.leader = state.consumers.keys().next().cloned();
            match &state.leader {
                Some(next) => info!(
                    previous = consumer_id,
                    leader = %next,
                    "Token cache leadership handed off"
                ),
                None => info!(previous = consumer_id, "Last consumer left, no leader"),
            }
        }

        debug!(
            consumer = consumer_id,
            registered_for_secs = (Utc::now() - entry.registered_at).num_seconds(),
            source = %entry.source_identity,
            "Consumer unregistered"
        );
    }

    /// Drop every consumer. Cached tokens and the canonical source are kept.
    pub fn clear_consumers(&self) {
        let mut state = self.state.lock();
        let count = state.consumers.len();
        state.consumers.clear();
        state.leader = None;
        info!(count, "Cleared token cache consumers");
    }

    pub fn is_leader(&self, consumer_id: &str) -> bool {
        self.state.lock().leader.as_deref() == Some(consumer_id)
    }

    // ====================================================================
    // Cache access
    // ====================================================================

    /// Tradeable tokens, refreshed through the leader when stale.
    ///
    /// Never fails: source errors are recorded in `stats()` and the last
    /// known snapshot (possibly empty) is returned.
    pub async fn get_tokens(&self, consumer_id: &str, force_refresh: bool) -> Vec<TokenRecord> {
        let plan = {
            let mut state = self.state.lock();
            if !force_refresh && state.is_fresh(self.config.refresh_interval) {
                state.cache_hits += 1;
                state.queries_saved += 1;
                Metrics::token_cache_hit();
                Plan::Serve(state.tradeable.clone())
            } else if let Some(source) = state.source.clone() {
                if state.may_lead(consumer_id) && !state.load_in_flight {
                    state.load_in_flight = true;
                    Plan::Lead(LoadTicket {
                        source,
                        epoch: state.source_epoch,
                        known: state.known_metadata(),
                    })
                } else {
                    Plan::Wait(self.load_done.subscribe())
                }
            } else {
                debug!(consumer = consumer_id, "No token source registered");
                Plan::Serve(state.tradeable.clone())
            }
        };

        match plan {
            Plan::Serve(tokens) => tokens,
            Plan::Lead(ticket) => self.lead_refresh(consumer_id, ticket).await,
            Plan::Wait(rx) => self.wait_for_leader(consumer_id, rx).await,
        }
    }

    /// Mark the cache stale so the next `get_tokens` reloads.
    pub fn force_refresh(&self) {
        self.state.lock().last_refresh = None;
        info!("Token cache refresh forced");
    }

    /// Case-insensitive lookup of any cached token, tradeable or not.
    pub fn token(&self, address: &str) -> Option<TokenRecord> {
        self.state
            .lock()
            .tokens
            .get(&normalize_address(address))
            .cloned()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let state = self.state.lock();
        let next_refresh_in = state.last_refresh.and_then(|at| {
            let remaining = self.config.refresh_interval.saturating_sub(at.elapsed());
            (!remaining.is_zero()).then_some(remaining)
        });

        CoordinatorStats {
            total_tokens: state.tokens.len(),
            tradeable_count: state.tradeable.len(),
            registered_consumers: state.consumers.len(),
            leader_id: state.leader.clone(),
            cache_hits: state.cache_hits,
            queries_saved: state.queries_saved,
            refresh_count: state.refresh_count,
            coordination_misses: state.coordination_misses,
            next_refresh_in,
            last_refresh_error: state.last_refresh_error.clone(),
            load_in_flight: state.load_in_flight,
        }
    }

    // ====================================================================
    // Refresh paths
    // ====================================================================

    async fn lead_refresh(&self, consumer_id: &str, ticket: LoadTicket) -> Vec<TokenRecord> {
        let _guard = LoadGuard { coordinator: self };
        debug!(consumer = consumer_id, "Leader refreshing token cache");
        let result = fetch_tokens(ticket.source.as_ref(), &ticket.known).await;
        self.publish(result, ticket.epoch, RefreshPath::Leader)
    }

    async fn wait_for_leader(
        &self,
        consumer_id: &str,
        mut rx: watch::Receiver<u64>,
    ) -> Vec<TokenRecord> {
        debug!(consumer = consumer_id, "Waiting for leader token refresh");

        if timeout(self.config.leader_wait_timeout, rx.changed())
            .await
            .is_ok()
        {
            let mut state = self.state.lock();
            state.queries_saved += 1;
            return state.tradeable.clone();
        }

        let ticket = {
            let mut state = self.state.lock();
            state.coordination_misses += 1;
            state.source.clone().map(|source| LoadTicket {
                source,
                epoch: state.source_epoch,
                known: state.known_metadata(),
            })
        };
        Metrics::coordination_miss();
        warn!(
            consumer = consumer_id,
            timeout_secs = self.config.leader_wait_timeout.as_secs_f64(),
            "Leader refresh wait timed out, loading independently"
        );

        let Some(ticket) = ticket else {
            return self.state.lock().tradeable.clone();
        };
        let result = fetch_tokens(ticket.source.as_ref(), &ticket.known).await;
        let snapshot = self.publish(result, ticket.epoch, RefreshPath::Fallback);
        self.notify_load_done();
        snapshot
    }

    /// Store a finished load and return the resulting snapshot.
    ///
    /// Last write wins. Loads from an older source epoch are discarded and
    /// failed loads keep the stale cache.
    fn publish(
        &self,
        result: SourceResult<Vec<TokenRecord>>,
        epoch: u64,
        path: RefreshPath,
    ) -> Vec<TokenRecord> {
        let mut state = self.state.lock();

        if epoch != state.source_epoch {
            warn!(path = path.as_str(), "Discarding token load from replaced source");
            Metrics::token_refresh("discarded", path.as_str());
            return state.tradeable.clone();
        }

        match result {
            Ok(records) => {
                let mut tokens = HashMap::with_capacity(records.len());
                let mut tradeable = Vec::new();
                for record in records {
                    let key = record.key();
                    if tokens.contains_key(&key) {
                        continue;
                    }
                    if record.is_tradeable() {
                        tradeable.push(record.clone());
                    }
                    tokens.insert(key, record);
                }

                state.tokens = tokens;
                state.tradeable = tradeable;
                state.last_refresh = Some(Instant::now());
                state.refresh_count += 1;
                state.last_refresh_error = None;

                Metrics::token_refresh("ok", path.as_str());
                Metrics::tradeable_tokens(state.tradeable.len());
                info!(
                    path = path.as_str(),
                    total = state.tokens.len(),
                    tradeable = state.tradeable.len(),
                    refresh_count = state.refresh_count,
                    "Token cache refreshed"
                );
            }
            Err(e) => {
                Metrics::token_refresh("error", path.as_str());
                warn!(
                    path = path.as_str(),
                    error = %e,
                    cached = state.tradeable.len(),
                    "Token refresh failed, keeping cached tokens"
                );
                state.last_refresh_error = Some(e.to_string());
            }
        }

        state.tradeable.clone()
    }

    fn notify_load_done(&self) {
        self.load_done.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

/// Read every factory token.
///
/// Metadata already known from the previous snapshot is reused. A token
/// whose reads fail is skipped.
async fn fetch_tokens(
    source: &dyn TokenSource,
    known: &HashMap<String, TokenMetadata>,
) -> SourceResult<Vec<TokenRecord>> {
    let addresses = source.list_tokens().await?;
    let mut records = Vec::with_capacity(addresses.len());

    for address in addresses {
        let state = match source.token_state(&address).await {
            Ok(state) => state,
            Err(e) => {
                warn!(token = %address, error = %e, "Skipping token: state read failed");
                continue;
            }
        };

        let metadata = match known.get(&normalize_address(&address)) {
            Some(metadata) => metadata.clone(),
            None => match source.token_metadata(&address).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(token = %address, error = %e, "Skipping token: metadata read failed");
                    continue;
                }
            },
        };

        records.push(TokenRecord::new(address, metadata, state));
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockTokenSource;
    use tvb_core::TokenState;

    fn source() -> Arc<MockTokenSource> {
        Arc::new(
            MockTokenSource::new("0xfactory")
                .with_token("0xAAA", "AAA", TokenState::Trading)
                .with_token("0xBBB", "BBB", TokenState::Halted)
                .with_token("0xCCC", "CCC", TokenState::Resumed),
        )
    }

    fn coordinator() -> TokenCacheCoordinator {
        TokenCacheCoordinator::new(CoordinatorConfig::default())
    }

    #[test]
    fn test_first_registrant_is_leader() {
        let coord = coordinator();
        coord.register("alpha", source());
        coord.register("beta", source());

        assert!(coord.is_leader("alpha"));
        assert!(!coord.is_leader("beta"));
        assert_eq!(coord.stats().registered_consumers, 2);
    }

    #[test]
    fn test_leader_handoff_picks_smallest_id() {
        let coord = coordinator();
        coord.register("delta", source());
        coord.register("charlie", source());
        coord.register("bravo", source());

        coord.unregister("delta");
        assert_eq!(coord.stats().leader_id.as_deref(), Some("bravo"));

        coord.unregister("bravo");
        coord.unregister("charlie");
        assert_eq!(coord.stats().leader_id, None);

        coord.register("echo", source());
        assert!(coord.is_leader("echo"));
    }

    #[test]
    fn test_clear_consumers() {
        let coord = coordinator();
        coord.register("alpha", source());
        coord.register("beta", source());
        coord.clear_consumers();

        let stats = coord.stats();
        assert_eq!(stats.registered_consumers, 0);
        assert_eq!(stats.leader_id, None);
    }

    #[tokio::test]
    async fn test_leader_load_filters_tradeable() {
        let coord = coordinator();
        coord.register("alpha", source());

        let tokens = coord.get_tokens("alpha", false).await;
        let symbols: Vec<_> = tokens.iter().map(|t| t.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAA", "CCC"]);

        let stats = coord.stats();
        assert_eq!(stats.total_tokens, 3);
        assert_eq!(stats.tradeable_count, 2);
        assert_eq!(stats.refresh_count, 1);
        assert!(!stats.load_in_flight);
        assert!(stats.next_refresh_in.is_some());
    }

    #[tokio::test]
    async fn test_token_lookup_is_case_insensitive() {
        let coord = coordinator();
        coord.register("alpha", source());
        coord.get_tokens("alpha", false).await;

        let halted = coord.token("0xbbb").unwrap();
        assert_eq!(halted.state, TokenState::Halted);
        assert_eq!(halted.address, "0xBBB");
        assert!(coord.token("0xdead").is_none());
    }

    #[tokio::test]
    async fn test_failing_token_is_skipped() {
        let src = source();
        src.fail_address("0xAAA");
        let coord = coordinator();
        coord.register("alpha", src);

        let tokens = coord.get_tokens("alpha", false).await;
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].symbol, "CCC");
        assert_eq!(coord.stats().total_tokens, 2);
    }

    #[tokio::test]
    async fn test_source_error_keeps_stale_cache() {
        let src = source();
        let coord = coordinator();
        coord.register("alpha", src.clone());
        assert_eq!(coord.get_tokens("alpha", false).await.len(), 2);

        src.set_list_error(Some("rpc unavailable"));
        let tokens = coord.get_tokens("alpha", true).await;
        assert_eq!(tokens.len(), 2);

        let stats = coord.stats();
        assert!(stats.last_refresh_error.unwrap().contains("rpc unavailable"));
        assert_eq!(stats.refresh_count, 1);
    }

    #[tokio::test]
    async fn test_source_error_without_cache_returns_empty() {
        let src = source();
        src.set_list_error(Some("rpc unavailable"));
        let coord = coordinator();
        coord.register("alpha", src);

        assert!(coord.get_tokens("alpha", false).await.is_empty());
        assert!(coord.stats().last_refresh_error.is_some());
    }

    #[tokio::test]
    async fn test_refresh_reuses_known_metadata() {
        let src = source();
        let coord = coordinator();
        coord.register("alpha", src.clone());

        coord.get_tokens("alpha", false).await;
        assert_eq!(src.metadata_calls(), 3);

        coord.force_refresh();
        coord.get_tokens("alpha", false).await;
        assert_eq!(src.metadata_calls(), 3);
        assert_eq!(src.state_calls(), 6);
    }

    #[tokio::test]
    async fn test_no_source_returns_empty() {
        let coord = coordinator();
        assert!(coord.get_tokens("nobody", false).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_leader_releases_waiters() {
        let src = source();
        src.set_latency(Duration::from_secs(10));
        let coord = Arc::new(coordinator());
        coord.register("alpha", src.clone());
        coord.register("beta", src.clone());

        let leader = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.get_tokens("alpha", false).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(coord.stats().load_in_flight);

        let waiter = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.get_tokens("beta", false).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        let _ = leader.await;

        let tokens = waiter.await.unwrap();
        assert!(tokens.is_empty());

        let stats = coord.stats();
        assert!(!stats.load_in_flight);
        assert_eq!(stats.coordination_misses, 0);
        assert_eq!(src.list_calls(), 1);
    }
}
