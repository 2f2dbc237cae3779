// reconcile.rs — Reconciliation Worker (spec §4.H).
//
// Grounded on the teacher's `execution.rs::reconcile_after_reconnect` /
// `check_global_drawdown_stop` polling idiom (periodic tokio::spawn loop
// reading exchange state back into local bookkeeping) and
// `market_maker.rs`'s `ShadowFill` correlation-by-key pattern, generalized
// from one account's fills to many followers' in-flight orders tracked by
// `(wallet, oid)` or `cloid`.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration};

use crate::batching::{OrderBatchingEngine, OrderState, SubmittedOrder};
use crate::gateway::{ExchangeClient, OrderStatus};
use crate::model::{Address, CopyTrade, OrderType, TradeRecord, TradeStatus};
use crate::repository::Repository;
use crate::risk::evaluate_stop_loss_take_profit;

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const MAX_POLL_ATTEMPTS: u32 = 30; // 30 * 10s = 5 minutes

#[derive(Debug, Clone)]
struct TrackedOrder {
    wallet: Address,
    oid: Option<u64>,
    state: OrderState,
    attempts: u32,
    follower_id: uuid::Uuid,
    leader_address: Address,
    asset: String,
    side: crate::model::Side,
    leader_fill_hash: Option<String>,
    original_size: f64,
    original_price: f64,
    leader_fill_time_ms: i64,
}

/// `cloid` when present, else `(wallet, oid)` — spec §4.H correlation rule.
fn correlation_key(wallet: &str, cloid: &Option<String>, oid: &Option<u64>) -> String {
    match cloid {
        Some(c) => format!("cloid:{}", c),
        None => format!("oid:{}:{}", wallet, oid.unwrap_or(0)),
    }
}

/// Streams/polls order and position state back from the exchange and keeps
/// local trade/position rows consistent with it. The primary path is driven
/// by `SubmittedOrder`s the Batching Engine reports as they're placed and by
/// each wallet's own user-event stream (fills/cancels arrive there in real
/// time); the secondary path is a bounded poll of `order_status` for
/// anything still outstanding.
pub struct ReconciliationWorker {
    gateway: Arc<dyn ExchangeClient>,
    repository: Arc<dyn Repository>,
    batching: Arc<OrderBatchingEngine>,
    in_flight: RwLock<HashMap<String, TrackedOrder>>,
    tracked_wallets: RwLock<std::collections::HashSet<Address>>,
}

impl ReconciliationWorker {
    pub fn new(gateway: Arc<dyn ExchangeClient>, repository: Arc<dyn Repository>, batching: Arc<OrderBatchingEngine>) -> Self {
        Self {
            gateway,
            repository,
            batching,
            in_flight: RwLock::new(HashMap::new()),
            tracked_wallets: RwLock::new(std::collections::HashSet::new()),
        }
    }

    /// Starts consuming `wallet`'s live user-event stream if it isn't being
    /// tracked already — the primary reconciliation path (spec §4.H).
    /// Idempotent so callers (follower add, startup resume) don't need to
    /// know whether another follower already shares the same signing wallet.
    pub async fn ensure_tracking_wallet(self: &Arc<Self>, wallet: Address) {
        {
            let tracked = self.tracked_wallets.read().await;
            if tracked.contains(&wallet) {
                return;
            }
        }
        let mut tracked = self.tracked_wallets.write().await;
        if !tracked.insert(wallet.clone()) {
            return;
        }
        drop(tracked);

        match self.gateway.stream_user(&wallet).await {
            Ok(rx) => {
                let worker = self.clone();
                tokio::spawn(worker.track_user_stream(wallet, rx));
            }
            Err(e) => {
                log::warn!("[RECONCILE] failed to open user stream for wallet={}: {}", wallet, e);
                self.tracked_wallets.write().await.remove(&wallet);
            }
        }
    }

    /// Consumes the Batching Engine's submission stream, registering anything
    /// still `Submitted`/`Resting` for polling and recomputing positions
    /// immediately for anything that arrived already terminal.
    pub async fn track_submissions(self: Arc<Self>, mut submitted_rx: mpsc::Receiver<SubmittedOrder>) {
        while let Some(order) = submitted_rx.recv().await {
            let key = correlation_key(&order.wallet, &order.cloid, &order.oid);
            if matches!(order.state, OrderState::Submitted | OrderState::Resting) {
                self.in_flight.write().await.insert(
                    key,
                    TrackedOrder {
                        wallet: order.wallet,
                        oid: order.oid,
                        state: order.state,
                        attempts: 0,
                        follower_id: order.follower_id,
                        leader_address: order.leader_address,
                        asset: order.asset,
                        side: order.side,
                        leader_fill_hash: order.leader_fill_hash,
                        original_size: order.original_size,
                        original_price: order.original_price,
                        leader_fill_time_ms: order.leader_fill_time_ms,
                    },
                );
            } else {
                self.in_flight.write().await.remove(&key);
                self.record_trade_fact(
                    &order.leader_address,
                    &order.asset,
                    order.follower_id,
                    order.side,
                    order.state,
                    order.leader_fill_hash,
                    order.original_size,
                    order.original_price,
                    order.leader_fill_time_ms,
                    order.executed_size,
                    order.executed_price,
                )
                .await;
                if matches!(order.state, OrderState::Filled | OrderState::PartialFilled) {
                    self.recompute_position(&order.wallet).await;
                }
            }
        }
    }

    /// Writes the follower-side `TradeRecord` and, when the order copied a
    /// specific leader fill, the linked `CopyTrade` row (spec §3). Only
    /// called once an order reaches a terminal state, since `put_copy_trade`
    /// is idempotent per `(follower_id, leader_fill_hash)` and a second call
    /// would be silently dropped.
    #[allow(clippy::too_many_arguments)]
    async fn record_trade_fact(
        &self,
        leader_address: &Address,
        asset: &str,
        follower_id: uuid::Uuid,
        side: crate::model::Side,
        state: OrderState,
        leader_fill_hash: Option<String>,
        original_size: f64,
        original_price: f64,
        leader_fill_time_ms: i64,
        executed_size: Option<f64>,
        executed_price: Option<f64>,
    ) {
        let status = match state {
            OrderState::Filled => TradeStatus::Filled,
            OrderState::PartialFilled => TradeStatus::Partial,
            OrderState::Rejected => TradeStatus::Rejected,
            OrderState::Cancelled | OrderState::Expired => TradeStatus::Cancelled,
            OrderState::Failed => TradeStatus::Failed,
            OrderState::Pending | OrderState::Submitted | OrderState::Resting => TradeStatus::Submitted,
        };
        let size = executed_size.unwrap_or(original_size);
        let price = executed_price.unwrap_or(original_price);
        let now = chrono::Utc::now();

        let trade = TradeRecord {
            id: uuid::Uuid::new_v4(),
            leader_address: leader_address.clone(),
            follower_id: Some(follower_id),
            asset: asset.to_string(),
            side,
            size,
            price,
            order_type: OrderType::Market,
            is_leader_trade: false,
            executed_at: now,
            exchange_tx_id: None,
            status,
            fill_hash: leader_fill_hash.clone().unwrap_or_else(|| format!("{}-{}", follower_id, now.timestamp_millis())),
        };
        if let Err(e) = self.repository.put_trade(&trade).await {
            log::error!("[RECONCILE] put_trade failed for follower={}: {}", follower_id, e);
        }

        if let Some(leader_fill_hash) = leader_fill_hash {
            let slippage_pct = if original_price > 0.0 { ((price - original_price) / original_price) * 100.0 } else { 0.0 };
            let execution_delay_ms = (now.timestamp_millis() - leader_fill_time_ms).max(0) as u64;
            let copy_trade = CopyTrade {
                id: uuid::Uuid::new_v4(),
                follower_id,
                leader_fill_hash,
                original_size,
                original_price,
                executed_size,
                executed_price,
                slippage_pct: executed_price.map(|_| slippage_pct),
                execution_delay_ms,
                status,
                error_message: None,
                created_at: now,
            };
            if let Err(e) = self.repository.put_copy_trade(&copy_trade).await {
                log::error!("[RECONCILE] put_copy_trade failed for follower={}: {}", follower_id, e);
            }
        }
    }

    /// Consumes a wallet's live user-event stream for real-time fill/cancel
    /// notifications — the primary reconciliation path (spec §4.H).
    pub async fn track_user_stream(self: Arc<Self>, wallet: Address, mut rx: mpsc::Receiver<crate::gateway::StreamEnvelope<crate::gateway::UserEvent>>) {
        while let Some(env) = rx.recv().await {
            if env.is_snapshot {
                continue;
            }
            match env.payload {
                crate::gateway::UserEvent::Fill(fill) => {
                    log::info!("[RECONCILE] wallet={} live fill asset={} size={}", wallet, fill.asset, fill.size);
                    self.recompute_position(&wallet).await;
                }
                crate::gateway::UserEvent::NonUserCancel { asset, oid } => {
                    let key = correlation_key(&wallet, &None, &Some(oid));
                    self.in_flight.write().await.remove(&key);
                    log::info!("[RECONCILE] wallet={} asset={} order {} cancelled by exchange", wallet, asset, oid);
                }
                crate::gateway::UserEvent::Liquidation { asset } => {
                    log::error!("[RECONCILE] wallet={} liquidation event on {}", wallet, asset);
                    self.recompute_position(&wallet).await;
                }
                _ => {}
            }
        }
    }

    /// Secondary poll path: every 10s, checks every order still
    /// `Submitted`/`Resting`, up to 30 attempts before giving up.
    pub async fn run_poll_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn poll_once(&self) {
        let pending: Vec<(String, u64, TrackedOrder)> = {
            let inflight = self.in_flight.read().await;
            inflight.iter().filter_map(|(key, tracked)| tracked.oid.map(|oid| (key.clone(), oid, tracked.clone()))).collect()
        };
        for (key, oid, tracked) in pending {
            let wallet = tracked.wallet.clone();
            match self.gateway.get_order_status(&wallet, oid).await {
                Ok(OrderStatus::Filled { sz, avg_px }) => {
                    log::info!("[RECONCILE] wallet={} oid={} filled sz={} avg_px={}", wallet, oid, sz, avg_px);
                    self.in_flight.write().await.remove(&key);
                    self.record_trade_fact(
                        &tracked.leader_address,
                        &tracked.asset,
                        tracked.follower_id,
                        tracked.side,
                        OrderState::Filled,
                        tracked.leader_fill_hash,
                        tracked.original_size,
                        tracked.original_price,
                        tracked.leader_fill_time_ms,
                        Some(sz),
                        Some(avg_px),
                    )
                    .await;
                    self.recompute_position(&wallet).await;
                }
                Ok(OrderStatus::Resting { .. }) => {
                    self.bump_attempts_or_timeout(&key).await;
                }
                Ok(OrderStatus::Error { msg }) => {
                    // recoverable rejection reasons (e.g. tickRejected) are
                    // surfaced to the operator, not retried automatically.
                    log::warn!("[RECONCILE] wallet={} oid={} order error, surfaced to operator: {}", wallet, oid, msg);
                    self.in_flight.write().await.remove(&key);
                    self.record_trade_fact(
                        &tracked.leader_address,
                        &tracked.asset,
                        tracked.follower_id,
                        tracked.side,
                        OrderState::Rejected,
                        tracked.leader_fill_hash,
                        tracked.original_size,
                        tracked.original_price,
                        tracked.leader_fill_time_ms,
                        None,
                        None,
                    )
                    .await;
                }
                Err(e) => {
                    log::warn!("[RECONCILE] poll failed wallet={} oid={}: {}", wallet, oid, e);
                    self.bump_attempts_or_timeout(&key).await;
                }
            }
        }
    }

    async fn bump_attempts_or_timeout(&self, key: &str) {
        let timed_out = {
            let mut inflight = self.in_flight.write().await;
            if let Some(tracked) = inflight.get_mut(key) {
                tracked.attempts += 1;
                if tracked.attempts >= MAX_POLL_ATTEMPTS {
                    log::error!("[RECONCILE] order {} timed out after {} attempts, marking Failed(Timeout)", key, tracked.attempts);
                    inflight.remove(key)
                } else {
                    None
                }
            } else {
                None
            }
        };
        if let Some(tracked) = timed_out {
            self.record_trade_fact(
                &tracked.leader_address,
                &tracked.asset,
                tracked.follower_id,
                tracked.side,
                OrderState::Failed,
                tracked.leader_fill_hash,
                tracked.original_size,
                tracked.original_price,
                tracked.leader_fill_time_ms,
                None,
                None,
            )
            .await;
        }
    }

    /// Recomputes `wallet`'s positions via `get_user_state`, upserts them,
    /// then runs the stop-loss/take-profit loop (spec §4.F) against every
    /// follower copying through that wallet: each reconciliation tick is
    /// this method's single re-evaluation point for open copy positions.
    async fn recompute_position(&self, wallet: &str) {
        match self.gateway.get_user_state(wallet).await {
            Ok(state) => {
                for position in state.positions {
                    if let Err(e) = self.repository.upsert_position(&position).await {
                        log::error!("[RECONCILE] upsert_position failed for wallet={}: {}", wallet, e);
                        continue;
                    }
                    self.evaluate_stop_loss_take_profit_for(&position).await;
                }
            }
            Err(e) => log::warn!("[RECONCILE] get_user_state failed for wallet={}: {}", wallet, e),
        }
    }

    async fn evaluate_stop_loss_take_profit_for(&self, position: &crate::model::Position) {
        let followers = match self.repository.followers_by_signing_wallet(&position.owner_wallet).await {
            Ok(followers) => followers,
            Err(e) => {
                log::warn!("[RECONCILE] followers_by_signing_wallet failed for wallet={}: {}", position.owner_wallet, e);
                return;
            }
        };
        for follower in followers {
            if let Some(order) = evaluate_stop_loss_take_profit(position, &follower) {
                log::info!(
                    "[RECONCILE] follower={} wallet={} asset={} stop-loss/take-profit triggered, enqueuing reducing order",
                    follower.id,
                    position.owner_wallet,
                    position.asset,
                );
                self.batching.submit(order).await;
            }
        }
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batching::{BatchingConfig, InMemorySignerRegistry};
    use crate::gateway::{MarginSummary, SimGateway, UserState};
    use crate::metadata::MetadataCache;
    use crate::model::{Follower, MetadataSnapshot, Position, PositionSide, RiskSettings};
    use crate::repository::InMemoryRepository;

    /// A wired-but-inert batching engine for tests that don't care about the
    /// submitted batches themselves, only that `submit` was reachable.
    async fn test_batching(gateway: Arc<dyn ExchangeClient>) -> Arc<OrderBatchingEngine> {
        let metadata = Arc::new(MetadataCache::new(gateway.clone(), Duration::from_secs(300)).await.unwrap());
        let nonces = Arc::new(crate::nonce::NonceVault::new());
        let signers = Arc::new(InMemorySignerRegistry::new());
        let (batching, _submitted_rx) = OrderBatchingEngine::new(gateway, metadata, nonces, signers, BatchingConfig::default());
        Arc::new(batching)
    }

    /// Like `test_batching`, but with a registered signer and a short batch
    /// window so a test can observe the order actually reach the gateway.
    async fn test_batching_for_wallet(gateway: Arc<dyn ExchangeClient>, wallet: &str) -> Arc<OrderBatchingEngine> {
        let metadata = Arc::new(MetadataCache::new(gateway.clone(), Duration::from_secs(300)).await.unwrap());
        let nonces = Arc::new(crate::nonce::NonceVault::new());
        let signer_config = crate::config::SignerConfig {
            chain_id: 1337,
            private_key: "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".to_string(),
        };
        let signer = Arc::new(crate::signing::Signer::new(&signer_config, crate::signing::SigningDomain::LegacyAgent).unwrap());
        let signers = InMemorySignerRegistry::new();
        signers.insert(wallet.to_string(), signer);
        let config = BatchingConfig { batch_window: Duration::from_millis(10), ..BatchingConfig::default() };
        let (batching, _submitted_rx) = OrderBatchingEngine::new(gateway, metadata, nonces, Arc::new(signers), config);
        Arc::new(batching)
    }

    fn submitted(state: OrderState, oid: Option<u64>) -> SubmittedOrder {
        SubmittedOrder {
            wallet: "0xWALLET".to_string(),
            asset: "BTC".to_string(),
            cloid: None,
            oid,
            state,
            follower_id: uuid::Uuid::new_v4(),
            leader_address: "0xLEADER".to_string(),
            side: crate::model::Side::Buy,
            leader_fill_hash: Some("h1".to_string()),
            original_size: 0.1,
            original_price: 30_000.0,
            leader_fill_time_ms: 0,
            executed_size: None,
            executed_price: None,
        }
    }

    #[tokio::test]
    async fn track_submissions_recomputes_position_on_immediate_fill() {
        let mut gw = SimGateway::new(MetadataSnapshot::default());
        gw.user_states.insert(
            "0xWALLET".to_string(),
            UserState {
                positions: vec![Position {
                    owner_wallet: "0xWALLET".to_string(),
                    asset: "BTC".to_string(),
                    side: PositionSide::Long,
                    size: 0.1,
                    entry_price: 30_000.0,
                    mark_price: 30_000.0,
                    unrealized_pnl: 0.0,
                    margin_used: 300.0,
                    updated_at: chrono::Utc::now(),
                }],
                margin: MarginSummary { account_value: 10_000.0, total_margin_used: 300.0, total_notional_position: 3000.0 },
            },
        );
        let gateway: Arc<dyn ExchangeClient> = Arc::new(gw);
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let batching = test_batching(gateway.clone()).await;
        let worker = Arc::new(ReconciliationWorker::new(gateway, repo.clone(), batching));

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(worker.clone().track_submissions(rx));
        tx.send(SubmittedOrder { executed_size: Some(0.1), executed_price: Some(30_010.0), ..submitted(OrderState::Filled, None) })
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        let positions = repo.list_positions_by_owner(&"0xWALLET".to_string()).await.unwrap();
        assert_eq!(positions.len(), 1);
    }

    #[tokio::test]
    async fn resting_order_is_tracked_for_polling() {
        let gw: Arc<dyn ExchangeClient> = Arc::new(SimGateway::new(MetadataSnapshot::default()));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let batching = test_batching(gw.clone()).await;
        let worker = Arc::new(ReconciliationWorker::new(gw, repo, batching));

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(worker.clone().track_submissions(rx));
        tx.send(submitted(OrderState::Resting, Some(42))).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(worker.in_flight_count().await, 1);
    }

    #[tokio::test]
    async fn filled_submission_clears_in_flight_and_records_copy_trade() {
        let gw: Arc<dyn ExchangeClient> = Arc::new(SimGateway::new(MetadataSnapshot::default()));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let batching = test_batching(gw.clone()).await;
        let worker = Arc::new(ReconciliationWorker::new(gw, repo, batching));

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(worker.clone().track_submissions(rx));
        // resting first, so it enters in_flight, then a terminal fill arrives
        // (e.g. from the user stream) and must clear it and write the facts.
        tx.send(submitted(OrderState::Resting, Some(42))).await.unwrap();
        tx.send(SubmittedOrder { executed_size: Some(0.1), executed_price: Some(30_050.0), ..submitted(OrderState::Filled, Some(42)) })
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(worker.in_flight_count().await, 0);
    }

    fn sl_follower(wallet: &str) -> Follower {
        let now = chrono::Utc::now();
        Follower {
            id: uuid::Uuid::new_v4(),
            owner_user_id: "u1".to_string(),
            leader_address: "0xLEADER".to_string(),
            signing_wallet: wallet.to_string(),
            copy_percentage: 50.0,
            max_position_size: 100_000.0,
            stop_loss_pct: Some(10.0),
            take_profit_pct: None,
            is_active: true,
            risk_settings: RiskSettings::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Reconciliation must actually enqueue the stop-loss/take-profit order
    /// it computes, not merely compute it (spec §4.F's separate loop).
    #[tokio::test]
    async fn recompute_position_fires_stop_loss_through_batching() {
        let mut meta = MetadataSnapshot::default();
        meta.perps.push(crate::model::PerpMeta { index: 0, name: "BTC".into(), size_decimals: 3, max_leverage: 50, only_isolated: false, is_delisted: false });
        let mut gw = SimGateway::new(meta);
        gw.user_states.insert(
            "0xWALLET".to_string(),
            UserState {
                positions: vec![Position {
                    owner_wallet: "0xWALLET".to_string(),
                    asset: "BTC".to_string(),
                    side: PositionSide::Long,
                    size: 1.0,
                    entry_price: 100.0,
                    mark_price: 85.0,
                    unrealized_pnl: -15.0,
                    margin_used: 10.0,
                    updated_at: chrono::Utc::now(),
                }],
                margin: MarginSummary { account_value: 10_000.0, total_margin_used: 10.0, total_notional_position: 85.0 },
            },
        );
        let placed = gw.placed.clone();
        let gw: Arc<dyn ExchangeClient> = Arc::new(gw);

        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        repo.put_follower(&sl_follower("0xWALLET")).await.unwrap();
        let batching = test_batching_for_wallet(gw.clone(), "0xWALLET").await;
        let worker = Arc::new(ReconciliationWorker::new(gw.clone(), repo, batching));

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(worker.clone().track_submissions(rx));
        tx.send(SubmittedOrder { executed_size: Some(0.1), executed_price: Some(30_010.0), ..submitted(OrderState::Filled, None) })
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        // allow the wallet actor's batch window to flush.
        tokio::time::sleep(Duration::from_millis(60)).await;

        let placed = placed.lock().await;
        assert_eq!(placed.len(), 1, "expected exactly one reducing order submitted to the gateway");
        assert!(placed[0].0[0].reduce_only);
    }

    #[tokio::test]
    async fn ensure_tracking_wallet_is_idempotent() {
        let gw: Arc<dyn ExchangeClient> = Arc::new(SimGateway::new(MetadataSnapshot::default()));
        let batching = test_batching(gw.clone()).await;
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let worker = Arc::new(ReconciliationWorker::new(gw, repo, batching));

        worker.ensure_tracking_wallet("0xWALLET".to_string()).await;
        worker.ensure_tracking_wallet("0xWALLET".to_string()).await;

        assert_eq!(worker.tracked_wallets.read().await.len(), 1);
    }
}
