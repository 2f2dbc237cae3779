// batching.rs — Order Batching Engine (spec §4.G).
//
// Grounded on the teacher's `execution.rs::MmExecutionEngine`: a single
// owner task that aggregates intents and submits them as one exchange call,
// generalized here from "one MM engine, one submission loop" to "one actor
// per signing wallet" since this relay signs on behalf of many distinct
// follower wallets concurrently, each with its own nonce sequence and rate
// budget. The `tokio::spawn` background-task-per-unit-of-work shape mirrors
// the teacher's `main.rs` wiring.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};

use crate::error::RelayError;
use crate::gateway::{ExchangeClient, OrderIntent, OrderStatus};
use crate::metadata::MetadataCache;
use crate::model::Address;
use crate::nonce::NonceVault;
use crate::risk::{Order, Tif};
use crate::signing::Signer;

/// Resolves the `Signer` authorized to sign for a given delegated wallet.
/// Kept as a trait so the relay can back it with a key vault, an HSM, or (in
/// tests) a plain in-memory map without batching.rs knowing the difference.
pub trait SignerRegistry: Send + Sync {
    fn signer_for(&self, wallet: &Address) -> Option<Arc<Signer>>;
}

pub struct InMemorySignerRegistry {
    signers: DashMap<Address, Arc<Signer>>,
}

impl InMemorySignerRegistry {
    pub fn new() -> Self {
        Self { signers: DashMap::new() }
    }

    pub fn insert(&self, wallet: Address, signer: Arc<Signer>) {
        self.signers.insert(wallet, signer);
    }
}

impl Default for InMemorySignerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SignerRegistry for InMemorySignerRegistry {
    fn signer_for(&self, wallet: &Address) -> Option<Arc<Signer>> {
        self.signers.get(wallet).map(|e| e.value().clone())
    }
}

/// Simple token bucket: refills continuously at `rate_per_min`, capped at
/// `rate_per_min` tokens, consumed one-per-request. FIFO is provided by the
/// caller awaiting `acquire` on a `Mutex`-guarded bucket (spec §4.G: "waiters
/// are FIFO").
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_min: u32) -> Self {
        let capacity = rate_per_min as f64;
        Self { capacity, tokens: capacity, refill_per_sec: capacity / 60.0, last_refill: Instant::now() }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    wallet_buckets: DashMap<Address, Mutex<TokenBucket>>,
    global_bucket: Mutex<TokenBucket>,
    wallet_rate_limit_per_min: u32,
}

impl RateLimiter {
    pub fn new(wallet_rate_limit_per_min: u32, global_rate_limit_per_min: u32) -> Self {
        Self {
            wallet_buckets: DashMap::new(),
            global_bucket: Mutex::new(TokenBucket::new(global_rate_limit_per_min)),
            wallet_rate_limit_per_min,
        }
    }

    /// Blocks (briefly polling) until both the wallet and global buckets have
    /// a token available.
    pub async fn acquire(&self, wallet: &Address) {
        loop {
            let wallet_ok = {
                let entry = self
                    .wallet_buckets
                    .entry(wallet.clone())
                    .or_insert_with(|| Mutex::new(TokenBucket::new(self.wallet_rate_limit_per_min)));
                entry.lock().await.try_take()
            };
            let global_ok = self.global_bucket.lock().await.try_take();
            if wallet_ok && global_ok {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    Submitted,
    Resting,
    Filled,
    PartialFilled,
    Rejected,
    Cancelled,
    Failed,
    Expired,
}

/// A submitted order's bookkeeping row, handed to the Reconciliation Worker.
/// Carries enough of the originating candidate (spec §3 CopyTrade linkage)
/// that the worker can write the follower-side trade fact without a second
/// round trip back through the Risk Pipeline.
#[derive(Debug, Clone)]
pub struct SubmittedOrder {
    pub wallet: Address,
    pub asset: String,
    pub cloid: Option<String>,
    pub oid: Option<u64>,
    pub state: OrderState,
    pub follower_id: uuid::Uuid,
    pub leader_address: Address,
    pub side: crate::model::Side,
    pub leader_fill_hash: Option<String>,
    pub original_size: f64,
    pub original_price: f64,
    pub leader_fill_time_ms: i64,
    pub executed_size: Option<f64>,
    pub executed_price: Option<f64>,
}

pub struct BatchingConfig {
    pub batch_window: Duration,
    pub max_batch: usize,
    pub wallet_rate_limit_per_min: u32,
    pub global_rate_limit_per_min: u32,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self { batch_window: Duration::from_millis(100), max_batch: 50, wallet_rate_limit_per_min: 1_200, global_rate_limit_per_min: 2_000 }
    }
}

/// Routes risk-approved orders to one actor task per signing wallet.
pub struct OrderBatchingEngine {
    gateway: Arc<dyn ExchangeClient>,
    metadata: Arc<MetadataCache>,
    nonces: Arc<NonceVault>,
    signers: Arc<dyn SignerRegistry>,
    limiter: Arc<RateLimiter>,
    config: Arc<BatchingConfig>,
    wallet_channels: DashMap<Address, mpsc::Sender<Order>>,
    submitted_tx: mpsc::Sender<SubmittedOrder>,
}

impl OrderBatchingEngine {
    pub fn new(
        gateway: Arc<dyn ExchangeClient>,
        metadata: Arc<MetadataCache>,
        nonces: Arc<NonceVault>,
        signers: Arc<dyn SignerRegistry>,
        config: BatchingConfig,
    ) -> (Self, mpsc::Receiver<SubmittedOrder>) {
        let (submitted_tx, submitted_rx) = mpsc::channel(1_000);
        let limiter = Arc::new(RateLimiter::new(config.wallet_rate_limit_per_min, config.global_rate_limit_per_min));
        (
            Self {
                gateway,
                metadata,
                nonces,
                signers,
                limiter,
                config: Arc::new(config),
                wallet_channels: DashMap::new(),
                submitted_tx,
            },
            submitted_rx,
        )
    }

    /// Routes `order` to its wallet's actor, spawning the actor on first use.
    pub async fn submit(self: &Arc<Self>, order: Order) {
        let wallet = order.follower.signing_wallet.clone();
        let tx = {
            if let Some(existing) = self.wallet_channels.get(&wallet) {
                existing.clone()
            } else {
                let (tx, rx) = mpsc::channel(self.config.max_batch * 4);
                self.wallet_channels.insert(wallet.clone(), tx.clone());
                let engine = self.clone();
                let wallet_for_actor = wallet.clone();
                tokio::spawn(async move {
                    engine.run_wallet_actor(wallet_for_actor, rx).await;
                });
                tx
            }
        };
        if tx.send(order).await.is_err() {
            log::error!("[BATCHING] wallet actor channel closed, order dropped");
        }
    }

    async fn run_wallet_actor(self: Arc<Self>, wallet: Address, mut rx: mpsc::Receiver<Order>) {
        let mut buffer: VecDeque<Order> = VecDeque::new();
        loop {
            let deadline = tokio::time::sleep(self.config.batch_window);
            tokio::pin!(deadline);
            let mut got_any = false;
            loop {
                tokio::select! {
                    maybe_order = rx.recv(), if buffer.len() < self.config.max_batch => {
                        match maybe_order {
                            Some(order) => {
                                buffer.push_back(order);
                                got_any = true;
                                if buffer.len() >= self.config.max_batch {
                                    break;
                                }
                            }
                            None => {
                                if !buffer.is_empty() {
                                    self.flush(&wallet, &mut buffer).await;
                                }
                                return;
                            }
                        }
                    }
                    _ = &mut deadline => { break; }
                }
            }
            if got_any || !buffer.is_empty() {
                self.flush(&wallet, &mut buffer).await;
            }
        }
    }

    async fn flush(&self, wallet: &Address, buffer: &mut VecDeque<Order>) {
        if buffer.is_empty() {
            return;
        }
        let orders: Vec<Order> = buffer.drain(..).collect();
        let (alo, ioc): (Vec<Order>, Vec<Order>) = orders.into_iter().partition(|o| matches!(o.tif, Tif::Alo));

        // IOC/GTC batch submitted first, ALO after, to avoid accidental crossing.
        if !ioc.is_empty() {
            self.submit_batch(wallet, ioc, "na").await;
        }
        if !alo.is_empty() {
            self.submit_batch(wallet, alo, "alo").await;
        }
    }

    async fn submit_batch(&self, wallet: &Address, orders: Vec<Order>, grouping: &str) {
        let Some(signer) = self.signers.signer_for(wallet) else {
            log::error!("[BATCHING] no signer registered for wallet={}, dropping {} orders", wallet, orders.len());
            return;
        };

        let meta = self.metadata.snapshot().await;
        let mut intents = Vec::with_capacity(orders.len());
        let mut resolved_orders = Vec::with_capacity(orders.len());
        for mut order in orders {
            let Some(asset_id) = meta.raw_asset_index(&order.asset) else {
                log::warn!("[BATCHING] unresolvable asset={} for wallet={}, dropping order", order.asset, wallet);
                continue;
            };
            if let Some(tick_decimals) = meta.tick_decimals(&order.asset) {
                let factor = 10f64.powi(tick_decimals as i32);
                order.price = (order.price * factor).round() / factor;
            }
            intents.push(OrderIntent {
                asset: asset_id,
                is_buy: order.side.is_buy(),
                limit_px: order.price,
                sz: order.size,
                reduce_only: order.reduce_only,
                tif: order.tif.as_wire().to_string(),
                cloid: order.cloid.clone(),
            });
            resolved_orders.push(order);
        }
        let orders = resolved_orders;
        if intents.is_empty() {
            return;
        }

        self.limiter.acquire(wallet).await;
        let nonce = self.nonces.next_nonce(wallet).await;

        let result = self.gateway.place_orders(intents.clone(), &signer, nonce, grouping).await;
        match result {
            Ok(placed) => self.record_results(wallet, &orders, placed.statuses).await,
            Err(RelayError::AuthRejected(msg)) => {
                log::error!("[BATCHING] wallet={} auth rejected, bumping nonce floor: {}", wallet, msg);
                self.nonces.bump_to_now(wallet).await;
                self.mark_all_failed(wallet, &orders, &msg).await;
            }
            Err(RelayError::Transient(msg)) => {
                log::warn!("[BATCHING] wallet={} transient failure, retrying once: {}", wallet, msg);
                tokio::time::sleep(Duration::from_millis(250)).await;
                let retry_nonce = self.nonces.next_nonce(wallet).await;
                match self.gateway.place_orders(intents, &signer, retry_nonce, grouping).await {
                    Ok(placed) => self.record_results(wallet, &orders, placed.statuses).await,
                    Err(e) => {
                        log::error!("[BATCHING] wallet={} retry failed, marking batch failed: {}", wallet, e);
                        self.mark_all_failed(wallet, &orders, &e.to_string()).await;
                    }
                }
            }
            Err(e) => {
                log::error!("[BATCHING] wallet={} submission failed: {}", wallet, e);
                self.mark_all_failed(wallet, &orders, &e.to_string()).await;
            }
        }
    }

    async fn record_results(&self, wallet: &Address, orders: &[Order], statuses: Vec<OrderStatus>) {
        for (order, status) in orders.iter().zip(statuses.into_iter()) {
            let (state, oid, executed_size, executed_price) = match status {
                OrderStatus::Resting { oid } => (OrderState::Resting, Some(oid), None, None),
                OrderStatus::Filled { sz, avg_px } => (OrderState::Filled, None, Some(sz), Some(avg_px)),
                OrderStatus::Error { msg } => {
                    log::warn!("[BATCHING] wallet={} asset={} order error: {}", wallet, order.asset, msg);
                    (OrderState::Rejected, None, None, None)
                }
            };
            let submitted = SubmittedOrder {
                wallet: wallet.clone(),
                asset: order.asset.clone(),
                cloid: order.cloid.clone(),
                oid,
                state,
                follower_id: order.follower.id,
                leader_address: order.follower.leader_address.clone(),
                side: order.side,
                leader_fill_hash: order.leader_fill_hash.clone(),
                original_size: order.original_size,
                original_price: order.original_price,
                leader_fill_time_ms: order.leader_fill_time_ms,
                executed_size,
                executed_price,
            };
            if self.submitted_tx.send(submitted).await.is_err() {
                log::error!("[BATCHING] reconciliation channel closed, dropping submission record");
            }
        }
    }

    async fn mark_all_failed(&self, wallet: &Address, orders: &[Order], reason: &str) {
        for order in orders {
            log::error!("[BATCHING] wallet={} asset={} marked failed: {}", wallet, order.asset, reason);
            let submitted = SubmittedOrder {
                wallet: wallet.clone(),
                asset: order.asset.clone(),
                cloid: order.cloid.clone(),
                oid: None,
                state: OrderState::Failed,
                follower_id: order.follower.id,
                leader_address: order.follower.leader_address.clone(),
                side: order.side,
                leader_fill_hash: order.leader_fill_hash.clone(),
                original_size: order.original_size,
                original_price: order.original_price,
                leader_fill_time_ms: order.leader_fill_time_ms,
                executed_size: None,
                executed_price: None,
            };
            let _ = self.submitted_tx.send(submitted).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(60); // 1/sec
        for _ in 0..60 {
            assert!(bucket.try_take());
        }
        assert!(!bucket.try_take());
    }

    #[test]
    fn signer_registry_returns_none_for_unknown_wallet() {
        let registry = InMemorySignerRegistry::new();
        assert!(registry.signer_for(&"0xUNKNOWN".to_string()).is_none());
    }
}
