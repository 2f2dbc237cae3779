// dispatcher.rs — routes a leader fill to its active followers (spec §4.E).
//
// Grounded on other_examples' `copy_trading.rs` (hapticfish-RustRaptor):
// `replicate_to_followers`/`followers_for_leader` is the closest real-world
// analogue to this exact component in the retrieval pack (Redis-cached
// follower list over a Postgres source of truth, fan-out loop per fill).
// Generalized here to preserve per-(follower,leader) fill ordering and to
// shard the fan-out into paced batches (spec's "smooth outbound burst")
// instead of one synchronous loop.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::model::{Address, TradeRecord, TradeStatus};
use crate::repository::{FollowerCache, Repository};
use crate::risk::Candidate;
use crate::subscription::LeaderFill;

pub struct DispatcherConfig {
    pub batch_size: usize,
    pub pacing_delay: std::time::Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { batch_size: 32, pacing_delay: std::time::Duration::from_millis(5) }
    }
}

/// Resolves a leader fill to candidates for every active follower, preserving
/// fill order per `(follower, leader)` (spec §5 ordering guarantee, §8
/// invariant 2). Followers are sharded into paced batches so a leader with
/// thousands of followers doesn't emit one giant burst.
pub struct LeaderTradeDispatcher {
    repo: Arc<dyn Repository>,
    follower_cache: Arc<FollowerCache>,
    config: DispatcherConfig,
    candidate_tx: mpsc::Sender<Candidate>,
}

impl LeaderTradeDispatcher {
    pub fn new(
        repo: Arc<dyn Repository>,
        follower_cache: Arc<FollowerCache>,
        config: DispatcherConfig,
        candidate_tx: mpsc::Sender<Candidate>,
    ) -> Self {
        Self { repo, follower_cache, config, candidate_tx }
    }

    /// Runs until `in_rx` closes (governed by the Subscription Manager's
    /// fan-in channel lifetime).
    pub async fn run(self: Arc<Self>, mut in_rx: mpsc::Receiver<LeaderFill>) {
        while let Some(leader_fill) = in_rx.recv().await {
            if let Err(e) = self.dispatch(leader_fill).await {
                log::error!("[DISPATCHER] dispatch failed: {}", e);
            }
        }
    }

    async fn dispatch(&self, leader_fill: LeaderFill) -> crate::error::RelayResult<()> {
        let LeaderFill { leader, fill } = leader_fill;

        // Step 1: persist the leader fact idempotently, keyed by (leader, fill_hash).
        let record = TradeRecord {
            id: uuid::Uuid::new_v4(),
            leader_address: leader.clone(),
            follower_id: None,
            asset: fill.asset.clone(),
            side: if fill.is_buy { crate::model::Side::Buy } else { crate::model::Side::Sell },
            size: fill.size,
            price: fill.price,
            order_type: crate::model::OrderType::Market,
            is_leader_trade: true,
            executed_at: chrono::DateTime::from_timestamp_millis(fill.time_ms).unwrap_or_else(chrono::Utc::now),
            exchange_tx_id: None,
            status: TradeStatus::Filled,
            fill_hash: fill.fill_hash.clone(),
        };
        let newly_persisted = self.repo.put_trade(&record).await?;
        if !newly_persisted {
            log::debug!("[DISPATCHER] leader={} fill_hash={} already dispatched, skipping", leader, fill.fill_hash);
            return Ok(());
        }

        // Step 2: resolve active followers (short-TTL cached).
        let followers = self.follower_cache.followers_for(&leader).await?;
        if followers.is_empty() {
            return Ok(());
        }

        // Step 3/4: shard into batches of `batch_size`, pacing each batch so
        // the outbound candidate burst is smoothed. Within a shard, and across
        // shards, followers are processed in the order returned by the
        // repository, so a given (follower, leader)'s candidates across
        // multiple calls to `dispatch` preserve the leader's fill order
        // because this function only ever emits once per fill, sequentially.
        for shard in followers.chunks(self.config.batch_size) {
            for follower in shard {
                let candidate = Candidate { follower: follower.clone(), leader: leader.clone(), fill: fill.clone() };
                if self.candidate_tx.send(candidate).await.is_err() {
                    log::error!("[DISPATCHER] risk pipeline channel closed, dropping remaining candidates");
                    return Ok(());
                }
            }
            if self.config.pacing_delay > std::time::Duration::ZERO {
                tokio::time::sleep(self.config.pacing_delay).await;
            }
        }
        Ok(())
    }
}

/// Resolves followers for a permissionless-follow target the same way as a
/// registered leader: once subscribed, the dispatcher treats the address
/// uniformly (spec §1 "secondary subsystem ... treated uniformly once
/// subscribed").
pub fn leader_key(address: &Address) -> Address {
    address.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::UserFill;
    use crate::model::RiskSettings;
    use crate::repository::InMemoryRepository;

    fn follower(leader: &str) -> crate::model::Follower {
        let now = chrono::Utc::now();
        crate::model::Follower {
            id: uuid::Uuid::new_v4(),
            owner_user_id: "u1".to_string(),
            leader_address: leader.to_string(),
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
    async fn dispatch_emits_one_candidate_per_active_follower() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        repo.put_follower(&follower("0xLEADER")).await.unwrap();
        let cache = Arc::new(FollowerCache::new(repo.clone(), std::time::Duration::from_secs(2)));
        let (tx, mut rx) = mpsc::channel(10);
        let dispatcher = LeaderTradeDispatcher::new(repo, cache, DispatcherConfig::default(), tx);

        let fill = UserFill { asset: "BTC".to_string(), is_buy: true, size: 0.2, price: 30_000.0, time_ms: 0, fill_hash: "h1".to_string() };
        dispatcher.dispatch(LeaderFill { leader: "0xLEADER".to_string(), fill }).await.unwrap();

        let candidate = rx.recv().await.unwrap();
        assert_eq!(candidate.fill.fill_hash, "h1");
    }

    #[tokio::test]
    async fn dispatch_is_idempotent_per_leader_fill_hash() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        repo.put_follower(&follower("0xLEADER")).await.unwrap();
        let cache = Arc::new(FollowerCache::new(repo.clone(), std::time::Duration::from_secs(2)));
        let (tx, mut rx) = mpsc::channel(10);
        let dispatcher = LeaderTradeDispatcher::new(repo, cache, DispatcherConfig::default(), tx);

        let fill = UserFill { asset: "BTC".to_string(), is_buy: true, size: 0.2, price: 30_000.0, time_ms: 0, fill_hash: "h1".to_string() };
        dispatcher.dispatch(LeaderFill { leader: "0xLEADER".to_string(), fill: fill.clone() }).await.unwrap();
        dispatcher.dispatch(LeaderFill { leader: "0xLEADER".to_string(), fill }).await.unwrap();

        rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err(), "second dispatch of same fill_hash must not emit a second candidate");
    }
}
