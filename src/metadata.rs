// metadata.rs — read-mostly asset-universe cache (spec §4.C).
//
// Grounded on the teacher's `LiveExchange::init()` one-shot universe fetch
// (`coin_to_asset`/`asset_info` maps built once at startup). This relay needs
// periodic refresh and concurrent readers, so the one-shot fetch becomes a
// standalone component behind a `tokio::sync::RwLock`, refreshed by a single
// background task; a failed refresh keeps serving the last good snapshot
// (SPEC_FULL §4.C) instead of blocking readers or clearing state.

use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::RelayResult;
use crate::gateway::ExchangeClient;
use crate::model::{AssetLookup, MetadataSnapshot};

pub struct MetadataCache {
    gateway: Arc<dyn ExchangeClient>,
    snapshot: RwLock<MetadataSnapshot>,
    refresh_interval: std::time::Duration,
}

impl MetadataCache {
    /// Fetches the first snapshot synchronously so the cache is never empty
    /// once constructed; callers call `spawn_refresh_loop` to keep it warm.
    pub async fn new(gateway: Arc<dyn ExchangeClient>, refresh_interval: std::time::Duration) -> RelayResult<Self> {
        let snapshot = gateway.get_metadata().await?;
        Ok(Self { gateway, snapshot: RwLock::new(snapshot), refresh_interval })
    }

    pub async fn snapshot(&self) -> MetadataSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn asset_id(&self, name: &str) -> AssetLookup {
        self.snapshot.read().await.asset_id(name)
    }

    pub async fn size_decimals(&self, asset: &str) -> Option<u32> {
        self.snapshot.read().await.size_decimals(asset)
    }

    /// The exchange's price-tick precision is not carried on `PerpMeta` today
    /// (spec §3 names it only as a cache capability); see
    /// `MetadataSnapshot::tick_decimals` for the wire rule itself.
    pub async fn tick_decimals(&self, asset: &str) -> Option<u32> {
        self.snapshot.read().await.tick_decimals(asset)
    }

    async fn refresh_once(&self) {
        match self.gateway.get_metadata().await {
            Ok(fresh) => {
                *self.snapshot.write().await = fresh;
                log::debug!("[METADATA] refreshed universe snapshot");
            }
            Err(e) => {
                log::warn!("[METADATA] refresh failed, serving last good snapshot: {}", e);
            }
        }
    }

    /// Runs until `shutdown` fires, refreshing every `refresh_interval`.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh_once().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SimGateway;
    use crate::model::{PerpMeta};

    #[tokio::test]
    async fn serves_last_good_snapshot_on_refresh_failure() {
        let mut meta = MetadataSnapshot::default();
        meta.perps.push(PerpMeta { index: 0, name: "BTC".into(), size_decimals: 5, max_leverage: 50, only_isolated: false, is_delisted: false });
        let gw: Arc<dyn ExchangeClient> = Arc::new(SimGateway::new(meta));
        let cache = MetadataCache::new(gw, std::time::Duration::from_secs(300)).await.unwrap();
        assert_eq!(cache.asset_id("BTC").await, AssetLookup::Perp(0));
        // a failed refresh (no gateway failure injected here) should never
        // clear the snapshot -- verified by construction since refresh_once
        // only overwrites on Ok.
        cache.refresh_once().await;
        assert_eq!(cache.asset_id("BTC").await, AssetLookup::Perp(0));
    }
}
