// governor.rs — Clock / Rate-Limit Governor (spec §4.J).
//
// Token buckets already live with their consumer in `batching::RateLimiter` —
// splitting rate limiting into its own actor the way the teacher's
// `RegimeGovernor` is its own `Mutex`-guarded struct would just add a hop
// between the batching engine and the thing it rate-limits itself against.
// What's left under "governor" is the clock-driven housekeeping spec §4.J
// and §4.F (deferred orders) actually ask for: the copy-delay time-wheel, the
// periodic health/maintenance jobs, and process-wide structured shutdown.
// Grounded on the teacher's `main.rs` periodic `tokio::spawn` loops (latency
// reporter, stall monitor, drawdown monitor — each its own `sleep`-driven
// `loop {}`), collapsed here into one actor with one `tokio::select!` since
// the jobs share state (the time-wheel, the subscription manager) that would
// otherwise need to be `Arc`-cloned into three independent tasks.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

use crate::batching::OrderBatchingEngine;
use crate::metadata::MetadataCache;
use crate::risk::{Candidate, RiskContext, RiskOutcome, RiskPipeline};
use crate::subscription::SubscriptionManager;

const WHEEL_TICK: Duration = Duration::from_secs(1);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const MAINTENANCE_LOG_INTERVAL: Duration = Duration::from_secs(300);

/// Deferred-copy time-wheel plus the periodic jobs that keep streams healthy
/// and the process's shutdown orderly. Re-evaluates a deferred candidate
/// through the full `RiskFilter` chain when its delay elapses rather than
/// re-emitting the stale `Order` it would have produced at dispatch time
/// (spec §9 Open Question (a): book/margin state may have moved).
pub struct Governor {
    subscriptions: Arc<SubscriptionManager>,
    risk_pipeline: Arc<RiskPipeline>,
    risk_ctx: Arc<RiskContext>,
    metadata: Arc<MetadataCache>,
    batching: Arc<OrderBatchingEngine>,
    wheel: Mutex<BTreeMap<chrono::DateTime<chrono::Utc>, Vec<Candidate>>>,
}

impl Governor {
    pub fn new(
        subscriptions: Arc<SubscriptionManager>,
        risk_pipeline: Arc<RiskPipeline>,
        risk_ctx: Arc<RiskContext>,
        metadata: Arc<MetadataCache>,
        batching: Arc<OrderBatchingEngine>,
    ) -> Self {
        Self { subscriptions, risk_pipeline, risk_ctx, metadata, batching, wheel: Mutex::new(BTreeMap::new()) }
    }

    /// Enqueues a candidate the Risk & Filter Pipeline deferred until `fire_at`.
    pub async fn defer(&self, fire_at: chrono::DateTime<chrono::Utc>, candidate: Candidate) {
        self.wheel.lock().await.entry(fire_at).or_default().push(candidate);
    }

    pub async fn deferred_count(&self) -> usize {
        self.wheel.lock().await.values().map(|v| v.len()).sum()
    }

    /// Runs the wheel tick, health check, and maintenance log jobs until
    /// `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut wheel_tick = interval(WHEEL_TICK);
        let mut health_tick = interval(HEALTH_CHECK_INTERVAL);
        let mut maintenance_tick = interval(MAINTENANCE_LOG_INTERVAL);
        loop {
            tokio::select! {
                _ = wheel_tick.tick() => self.fire_due().await,
                _ = health_tick.tick() => self.check_stream_health().await,
                _ = maintenance_tick.tick() => self.log_maintenance().await,
                _ = shutdown.cancelled() => {
                    log::info!("[GOVERNOR] shutdown requested, firing remaining deferred candidates");
                    self.fire_due_force().await;
                    break;
                }
            }
        }
    }

    async fn fire_due(&self) {
        let now = chrono::Utc::now();
        let due: Vec<Candidate> = {
            let mut wheel = self.wheel.lock().await;
            let still_pending = wheel.split_off(&now);
            std::mem::replace(&mut *wheel, still_pending).into_values().flatten().collect()
        };
        self.resolve_due(due).await;
    }

    /// Fires every still-pending candidate regardless of `fire_at`, used only
    /// at shutdown so a deferred copy doesn't silently vanish on restart
    /// (spec §7: "at-most-once per leader fill", not zero-times).
    async fn fire_due_force(&self) {
        let due: Vec<Candidate> = {
            let mut wheel = self.wheel.lock().await;
            std::mem::take(&mut *wheel).into_values().flatten().collect()
        };
        self.resolve_due(due).await;
    }

    async fn resolve_due(&self, due: Vec<Candidate>) {
        if due.is_empty() {
            return;
        }
        let meta = self.metadata.snapshot().await;
        for candidate in due {
            let follower_id = candidate.follower.id;
            match self.risk_pipeline.evaluate(candidate, &meta, &self.risk_ctx).await {
                RiskOutcome::Emit(order) => self.batching.submit(order).await,
                RiskOutcome::Deferred { fire_at, candidate } => {
                    log::debug!("[GOVERNOR] follower={} deferred again until {}", follower_id, fire_at);
                    self.defer(fire_at, candidate).await;
                }
                RiskOutcome::Reject(reason) => {
                    log::info!("[GOVERNOR] follower={} deferred candidate rejected on re-check: {:?}", follower_id, reason);
                }
            }
        }
    }

    /// Restarts any leader stream the Subscription Manager reports unhealthy
    /// (spec §4.D: "reports health to a governor that restarts unhealthy
    /// streams").
    async fn check_stream_health(&self) {
        for (leader, healthy) in self.subscriptions.health_report() {
            if !healthy {
                log::warn!("[GOVERNOR] leader={} unhealthy, forcing reconnect", leader);
                self.subscriptions.force_reconnect(&leader);
            }
        }
    }

    async fn log_maintenance(&self) {
        let deferred = self.deferred_count().await;
        log::info!("[GOVERNOR] maintenance: {} deferred candidate(s) in wheel", deferred);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfigValues;
    use crate::gateway::{ExchangeClient, SimGateway, UserFill};
    use crate::metadata::MetadataCache;
    use crate::model::{Follower, MetadataSnapshot, RiskSettings};
    use crate::repository::{InMemoryRepository, Repository};

    fn follower() -> Follower {
        let now = chrono::Utc::now();
        Follower {
            id: uuid::Uuid::new_v4(),
            owner_user_id: "u1".to_string(),
            leader_address: "0xLEADER".to_string(),
            signing_wallet: "0xWALLET".to_string(),
            copy_percentage: 50.0,
            max_position_size: 100_000.0,
            stop_loss_pct: None,
            take_profit_pct: None,
            is_active: true,
            risk_settings: RiskSettings::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn deferred_candidate_in_the_past_fires_on_next_tick() {
        let gateway: Arc<dyn ExchangeClient> = Arc::new(SimGateway::new(MetadataSnapshot::default()));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let metadata = Arc::new(MetadataCache::new(gateway.clone(), Duration::from_secs(300)).await.unwrap());
        let risk_ctx = Arc::new(RiskContext::new(gateway.clone(), repo.clone(), RiskConfigValues::default()));
        let risk_pipeline = Arc::new(RiskPipeline::new());
        let signers = Arc::new(crate::batching::InMemorySignerRegistry::new());
        let nonces = Arc::new(crate::nonce::NonceVault::new());
        let (batching, _submitted_rx) =
            OrderBatchingEngine::new(gateway.clone(), metadata.clone(), nonces, signers, crate::batching::BatchingConfig::default());
        let batching = Arc::new(batching);
        let (subs, _rx) = SubscriptionManager::new(gateway, 10);
        let subs = Arc::new(subs);

        let governor = Governor::new(subs, risk_pipeline, risk_ctx, metadata, batching);
        let candidate = Candidate {
            follower: follower(),
            leader: "0xLEADER".to_string(),
            fill: UserFill { asset: "BTC".to_string(), is_buy: true, size: 0.1, price: 30_000.0, time_ms: 0, fill_hash: "h1".to_string() },
        };
        governor.defer(chrono::Utc::now() - chrono::Duration::seconds(1), candidate).await;
        assert_eq!(governor.deferred_count().await, 1);
        governor.fire_due().await;
        assert_eq!(governor.deferred_count().await, 0);
    }

    #[tokio::test]
    async fn future_deferred_candidate_stays_pending_on_tick() {
        let gateway: Arc<dyn ExchangeClient> = Arc::new(SimGateway::new(MetadataSnapshot::default()));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let metadata = Arc::new(MetadataCache::new(gateway.clone(), Duration::from_secs(300)).await.unwrap());
        let risk_ctx = Arc::new(RiskContext::new(gateway.clone(), repo.clone(), RiskConfigValues::default()));
        let risk_pipeline = Arc::new(RiskPipeline::new());
        let signers = Arc::new(crate::batching::InMemorySignerRegistry::new());
        let nonces = Arc::new(crate::nonce::NonceVault::new());
        let (batching, _submitted_rx) =
            OrderBatchingEngine::new(gateway.clone(), metadata.clone(), nonces, signers, crate::batching::BatchingConfig::default());
        let batching = Arc::new(batching);
        let (subs, _rx) = SubscriptionManager::new(gateway, 10);
        let subs = Arc::new(subs);

        let governor = Governor::new(subs, risk_pipeline, risk_ctx, metadata, batching);
        let candidate = Candidate {
            follower: follower(),
            leader: "0xLEADER".to_string(),
            fill: UserFill { asset: "BTC".to_string(), is_buy: true, size: 0.1, price: 30_000.0, time_ms: 0, fill_hash: "h2".to_string() },
        };
        governor.defer(chrono::Utc::now() + chrono::Duration::seconds(60), candidate).await;
        governor.fire_due().await;
        assert_eq!(governor.deferred_count().await, 1);
    }
}
