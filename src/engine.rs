// engine.rs — wires components A-J into one running relay and exposes the
// operator capability methods spec §6 names (`add_follower`, `remove_follower`,
// `add_permissionless_follower`, `get_discovered_traders`, `health`,
// `queue_status`). The HTTP/UI/auth layer that would call these is explicitly
// out of scope (spec §1); this is the boundary it calls across.
//
// Grounded on the teacher's `main.rs`: same shape (build shared state, spawn
// one task per long-running job, loop until shutdown) scaled from one
// quoting loop to ten components, and on its `MmExecutionEngine` for owning
// a handful of `Arc`-shared collaborators behind one facade type.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::batching::{BatchingConfig, InMemorySignerRegistry, OrderBatchingEngine, SignerRegistry};
use crate::config::{RelayConfig, SignerConfig};
use crate::dispatcher::{DispatcherConfig, LeaderTradeDispatcher};
use crate::discovery::{flatten_copy_filters, get_discovered_traders};
use crate::error::{RelayError, RelayResult};
use crate::gateway::ExchangeClient;
use crate::governor::Governor;
use crate::metadata::MetadataCache;
use crate::model::{Address, Follower, PermissionlessFollower, TraderDiscovery};
use crate::nonce::NonceVault;
use crate::reconcile::ReconciliationWorker;
use crate::repository::{FollowerCache, Repository};
use crate::risk::{RiskContext, RiskPipeline};
use crate::signing::{Signer, SigningDomain};

/// Snapshot the operator surface can poll for `health()` (spec §6).
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub leader_streams: HashMap<Address, bool>,
    pub deferred_candidates: usize,
    pub in_flight_orders: usize,
}

/// Snapshot for `queue_status()` — the depth of work still moving through
/// the pipeline, useful to an operator deciding whether to pause new follows.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub deferred_candidates: usize,
    pub in_flight_orders: usize,
}

/// Wires the Exchange Gateway, Signer & Nonce Vault, Metadata Cache,
/// Subscription Manager, Leader-Trade Dispatcher, Risk & Filter Pipeline,
/// Order Batching Engine, Reconciliation Worker, Repository, and Governor
/// into one running pipeline, and owns its structured shutdown.
pub struct RelayEngine {
    gateway: Arc<dyn ExchangeClient>,
    repository: Arc<dyn Repository>,
    metadata: Arc<MetadataCache>,
    subscriptions: Arc<crate::subscription::SubscriptionManager>,
    follower_cache: Arc<FollowerCache>,
    batching: Arc<OrderBatchingEngine>,
    reconcile: Arc<ReconciliationWorker>,
    governor: Arc<Governor>,
    signers: Arc<dyn SignerRegistry>,
    shutdown: CancellationToken,
    component_shutdown: tokio::sync::watch::Sender<bool>,
    config: RelayConfig,
}

impl RelayEngine {
    /// Assembles every component from config. The caller supplies the
    /// already-constructed `gateway`/`repository` trait objects (live or
    /// in-memory) so tests can wire a `SimGateway`/`InMemoryRepository`
    /// through the exact same path production uses.
    pub async fn new(
        config: RelayConfig,
        signer_config: SignerConfig,
        gateway: Arc<dyn ExchangeClient>,
        repository: Arc<dyn Repository>,
    ) -> RelayResult<Self> {
        let metadata = Arc::new(MetadataCache::new(gateway.clone(), config.metadata_refresh_interval).await?);
        let follower_cache = Arc::new(FollowerCache::new(repository.clone(), config.follower_cache_ttl));
        let nonces = Arc::new(NonceVault::new());

        // the configured signing key authorizes its own wallet address;
        // additional delegated wallets are registered the same way as
        // operators provision new follower wallets (out of scope here, spec
        // §1 — the HTTP/auth layer owns key provisioning).
        let primary_signer = Arc::new(Signer::new(&signer_config, SigningDomain::HyperliquidSignTransaction)?);
        let wallet = primary_signer.wallet_address().to_string();
        let in_memory_signers = InMemorySignerRegistry::new();
        in_memory_signers.insert(wallet, primary_signer);
        let signers: Arc<dyn SignerRegistry> = Arc::new(in_memory_signers);

        let batching_config = BatchingConfig {
            batch_window: config.batch_window,
            max_batch: config.batch_max_orders,
            wallet_rate_limit_per_min: config.wallet_rate_limit_per_min,
            global_rate_limit_per_min: config.global_rate_limit_per_min,
        };
        let (batching, submitted_rx) =
            OrderBatchingEngine::new(gateway.clone(), metadata.clone(), nonces, signers.clone(), batching_config);
        let batching = Arc::new(batching);

        let reconcile = Arc::new(ReconciliationWorker::new(gateway.clone(), repository.clone(), batching.clone()));

        let (subscriptions, fan_in_rx) = crate::subscription::SubscriptionManager::new(gateway.clone(), 1_000);
        let subscriptions = Arc::new(subscriptions);

        let risk_ctx = Arc::new(RiskContext::new(gateway.clone(), repository.clone(), config.risk.clone()));
        let risk_pipeline = Arc::new(RiskPipeline::new());

        let governor = Arc::new(Governor::new(
            subscriptions.clone(),
            risk_pipeline.clone(),
            risk_ctx.clone(),
            metadata.clone(),
            batching.clone(),
        ));

        let (candidate_tx, candidate_rx) = mpsc::channel(1_000);
        let dispatcher_config = DispatcherConfig { batch_size: config.dispatcher_batch_size, pacing_delay: config.dispatcher_pacing_delay };
        let dispatcher = Arc::new(LeaderTradeDispatcher::new(repository.clone(), follower_cache.clone(), dispatcher_config, candidate_tx));

        let (component_shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
        let shutdown = CancellationToken::new();

        {
            let dispatcher = dispatcher.clone();
            tokio::spawn(dispatcher.run(fan_in_rx));
        }
        {
            let risk_pipeline = risk_pipeline.clone();
            let risk_ctx = risk_ctx.clone();
            let metadata = metadata.clone();
            let batching = batching.clone();
            let governor = governor.clone();
            tokio::spawn(async move {
                Self::run_risk_stage(risk_pipeline, risk_ctx, metadata, batching, governor, candidate_rx).await;
            });
        }
        {
            let reconcile = reconcile.clone();
            tokio::spawn(reconcile.clone().track_submissions(submitted_rx));
            tokio::spawn(reconcile.run_poll_loop(shutdown_rx.clone()));
        }
        {
            let metadata = metadata.clone();
            tokio::spawn(metadata.run(shutdown_rx.clone()));
        }
        {
            let governor = governor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(governor.run(shutdown));
        }

        // Resume subscriptions for leaders that already had active followers
        // persisted before this process started (spec §4.D: a leader stays
        // subscribed for as long as it has ≥1 active follower, not only from
        // the moment `add_follower` happens to be called in this process).
        let active_followers = repository.list_active_followers().await?;
        let mut resumed_leaders = std::collections::HashSet::new();
        let mut resumed_wallets = std::collections::HashSet::new();
        for follower in &active_followers {
            if resumed_leaders.insert(follower.leader_address.clone()) {
                subscriptions.subscribe(follower.leader_address.clone());
            }
            if resumed_wallets.insert(follower.signing_wallet.clone()) {
                reconcile.ensure_tracking_wallet(follower.signing_wallet.clone()).await;
            }
        }
        if !active_followers.is_empty() {
            log::info!(
                "[ENGINE] resumed {} active follower(s) across {} leader(s)",
                active_followers.len(),
                resumed_leaders.len()
            );
        }

        Ok(Self {
            gateway,
            repository,
            metadata,
            subscriptions,
            follower_cache,
            batching,
            reconcile,
            governor,
            signers,
            shutdown,
            component_shutdown,
            config,
        })
    }

    /// Resolves each risk-approved or deferred candidate to the batching
    /// engine or the governor's time-wheel respectively (spec §4.F -> §4.G,
    /// §9 Open Question (a)).
    async fn run_risk_stage(
        risk_pipeline: Arc<RiskPipeline>,
        risk_ctx: Arc<RiskContext>,
        metadata: Arc<MetadataCache>,
        batching: Arc<OrderBatchingEngine>,
        governor: Arc<Governor>,
        mut candidate_rx: mpsc::Receiver<crate::risk::Candidate>,
    ) {
        while let Some(candidate) = candidate_rx.recv().await {
            let follower_id = candidate.follower.id;
            let meta = metadata.snapshot().await;
            match risk_pipeline.evaluate(candidate, &meta, &risk_ctx).await {
                crate::risk::RiskOutcome::Emit(order) => batching.submit(order).await,
                crate::risk::RiskOutcome::Deferred { fire_at, candidate } => {
                    governor.defer(fire_at, candidate).await;
                }
                crate::risk::RiskOutcome::Reject(reason) => {
                    log::debug!("[ENGINE] follower={} candidate rejected: {}", follower_id, reason);
                }
            }
        }
    }

    /// Registers a follower and, if this is the leader's first active
    /// follower, subscribes to the leader's fill stream.
    pub async fn add_follower(&self, follower: Follower) -> RelayResult<()> {
        follower.validate().map_err(RelayError::Input)?;
        self.repository.put_follower(&follower).await?;
        self.follower_cache.invalidate(&follower.leader_address).await;
        self.subscriptions.subscribe(follower.leader_address.clone());
        self.reconcile.ensure_tracking_wallet(follower.signing_wallet.clone()).await;
        Ok(())
    }

    /// Deactivates a follower; unsubscribes the leader if it has no other
    /// active followers left.
    pub async fn remove_follower(&self, id: uuid::Uuid, leader_address: &Address) -> RelayResult<()> {
        self.repository.delete_follower(id).await?;
        self.follower_cache.invalidate(leader_address).await;
        let remaining = self.follower_cache.followers_for(leader_address).await?;
        if remaining.is_empty() {
            self.subscriptions.unsubscribe(leader_address);
        }
        Ok(())
    }

    /// Registers a permissionless follow: the flattened `Follower` row is
    /// what the Risk & Filter Pipeline reads; the structured filters are
    /// retained only for operator-surface round-tripping (spec §1 secondary
    /// subsystem, treated uniformly with registered leaders once subscribed).
    pub async fn add_permissionless_follower(&self, target: PermissionlessFollower) -> RelayResult<()> {
        let flattened = flatten_copy_filters(&target);
        self.add_follower(flattened).await
    }

    pub async fn get_discovered_traders(&self, limit: usize) -> Vec<TraderDiscovery> {
        get_discovered_traders(&self.repository, limit).await
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            leader_streams: self.subscriptions.health_report(),
            deferred_candidates: self.governor.deferred_count().await,
            in_flight_orders: self.reconcile.in_flight_count().await,
        }
    }

    pub async fn queue_status(&self) -> QueueStatus {
        QueueStatus { deferred_candidates: self.governor.deferred_count().await, in_flight_orders: self.reconcile.in_flight_count().await }
    }

    /// Structured shutdown (spec §4.J): signal every watch-driven component
    /// loop to stop, fire the governor's deferred candidates rather than
    /// dropping them, and give in-flight HTTP up to `shutdown_grace` to drain
    /// before returning.
    pub async fn shutdown(&self) {
        log::info!("[ENGINE] shutdown: signalling components");
        let _ = self.component_shutdown.send(true);
        self.shutdown.cancel();
        tokio::time::sleep(std::time::Duration::from_secs(5).min(self.config.shutdown_grace)).await;
        log::info!("[ENGINE] shutdown: grace period elapsed");
    }

    pub fn gateway(&self) -> &Arc<dyn ExchangeClient> {
        &self.gateway
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    pub fn batching(&self) -> &Arc<OrderBatchingEngine> {
        &self.batching
    }

    pub fn signers(&self) -> &Arc<dyn SignerRegistry> {
        &self.signers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::gateway::SimGateway;
    use crate::model::{MetadataSnapshot, RiskSettings};
    use crate::repository::InMemoryRepository;

    fn signer_config() -> SignerConfig {
        SignerConfig { chain_id: 1337, private_key: "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".to_string() }
    }

    fn follower(leader: &str) -> Follower {
        let now = chrono::Utc::now();
        Follower {
            id: uuid::Uuid::new_v4(),
            owner_user_id: "u1".to_string(),
            leader_address: leader.to_string(),
            signing_wallet: "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80_WALLET".to_string(),
            copy_percentage: 25.0,
            max_position_size: 10_000.0,
            stop_loss_pct: None,
            take_profit_pct: None,
            is_active: true,
            risk_settings: RiskSettings::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn add_follower_subscribes_the_leader_stream() {
        let gateway: Arc<dyn ExchangeClient> = Arc::new(SimGateway::new(MetadataSnapshot::default()));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let engine = RelayEngine::new(RelayConfig::default(), signer_config(), gateway, repo).await.unwrap();

        engine.add_follower(follower("0xLEADER")).await.unwrap();
        let health = engine.health().await;
        assert!(health.leader_streams.contains_key("0xLEADER"));
    }

    #[tokio::test]
    async fn remove_last_follower_unsubscribes_leader() {
        let gateway: Arc<dyn ExchangeClient> = Arc::new(SimGateway::new(MetadataSnapshot::default()));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let engine = RelayEngine::new(RelayConfig::default(), signer_config(), gateway, repo).await.unwrap();

        let f = follower("0xLEADER");
        let id = f.id;
        engine.add_follower(f).await.unwrap();
        engine.remove_follower(id, &"0xLEADER".to_string()).await.unwrap();
        assert!(!engine.subscriptions.is_subscribed("0xLEADER"));
    }

    /// A leader with active followers persisted before the process started
    /// must be followed again on startup, not only from the next
    /// `add_follower` call (spec §4.D).
    #[tokio::test]
    async fn startup_resumes_subscriptions_for_persisted_active_followers() {
        let gateway: Arc<dyn ExchangeClient> = Arc::new(SimGateway::new(MetadataSnapshot::default()));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        repo.put_follower(&follower("0xLEADER")).await.unwrap();

        let engine = RelayEngine::new(RelayConfig::default(), signer_config(), gateway, repo).await.unwrap();

        assert!(engine.subscriptions.is_subscribed("0xLEADER"));
    }
}
