// model.rs — shared entity types for the copy-trading data model (spec §3).
//
// Generalized from the teacher's `models.rs`/`exchange.rs` struct style
// (plain serde structs, no ORM macros) to the full set of entities a
// copy-trading relay needs: leaders, followers, trades, positions, and
// the metadata snapshot the risk pipeline reads asset facts from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 20-byte account identifier, always rendered as a 42-char `0x`-prefixed hex string.
pub type Address = String;

/// A source account whose fills are replicated to followers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leader {
    pub address: Address,
    pub display_name: Option<String>,
    pub follower_count: u32,
    pub volume_30d_usd: f64,
    pub max_drawdown_30d_pct: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Leader {
    pub fn new(address: Address) -> Self {
        let now = Utc::now();
        Self {
            address,
            display_name: None,
            follower_count: 0,
            volume_30d_usd: 0.0,
            max_drawdown_30d_pct: 0.0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Opaque per-follower risk knobs a follower can set beyond the typed fields below.
pub type RiskSettings = std::collections::HashMap<String, serde_json::Value>;

/// A registered subscriber to a leader's fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Follower {
    pub id: Uuid,
    pub owner_user_id: String,
    pub leader_address: Address,
    /// Delegated key authorized to sign actions for this follower's trading account.
    pub signing_wallet: Address,
    pub copy_percentage: f64,
    pub max_position_size: f64,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
    pub is_active: bool,
    pub risk_settings: RiskSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Follower {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0 < self.copy_percentage && self.copy_percentage <= 100.0) {
            return Err(format!(
                "copy_percentage must be in (0, 100], got {}",
                self.copy_percentage
            ));
        }
        if self.max_position_size <= 0.0 {
            return Err("max_position_size must be > 0".to_string());
        }
        if let Some(sl) = self.stop_loss_pct {
            if !(0.0 < sl && sl < 100.0) {
                return Err(format!("stop_loss_pct must be in (0, 100), got {}", sl));
            }
        }
        if let Some(tp) = self.take_profit_pct {
            if tp <= 0.0 {
                return Err(format!("take_profit_pct must be > 0, got {}", tp));
            }
        }
        Ok(())
    }
}

/// Per-minute-like UTC hour window, inclusive on both ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HourWindow {
    pub start_hour_utc: u8,
    pub end_hour_utc: u8,
}

impl HourWindow {
    pub fn contains(&self, hour_utc: u32) -> bool {
        let h = hour_utc as u8;
        if self.start_hour_utc <= self.end_hour_utc {
            h >= self.start_hour_utc && h <= self.end_hour_utc
        } else {
            // wraps past midnight, e.g. 22..=4
            h >= self.start_hour_utc || h <= self.end_hour_utc
        }
    }
}

/// Structured copy filters for a permissionless follower (spec §3 CopyFilters).
///
/// Invariant: if both whitelist and blacklist are non-empty, whitelist is
/// authoritative and blacklist is applied additionally on top of it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyFilters {
    pub min_notional: Option<f64>,
    pub max_notional: Option<f64>,
    pub only_during_hours: Option<HourWindow>,
    pub time_delay_seconds: u64,
    pub auto_discovery: bool,
}

/// A follower that subscribed to an address without that address's consent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionlessFollower {
    pub follower: Follower,
    pub asset_whitelist: Vec<String>,
    pub asset_blacklist: Vec<String>,
    pub min_trade_size: f64,
    pub copy_filters: CopyFilters,
}

impl PermissionlessFollower {
    pub fn asset_allowed(&self, asset: &str) -> bool {
        if !self.asset_whitelist.is_empty() && !self.asset_whitelist.iter().any(|a| a == asset) {
            return false;
        }
        if self.asset_blacklist.iter().any(|a| a == asset) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn is_buy(self) -> bool {
        matches!(self, Side::Buy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Submitted,
    Filled,
    Partial,
    Cancelled,
    Rejected,
    Failed,
}

/// Immutable fact: a leader fill or the copy fill it produced for a follower.
///
/// Leader rows have `follower = None` and `is_leader_trade = true`. Rows are
/// append-only: once persisted, a trade record is never mutated in place —
/// status transitions produce a new row or are tracked out-of-band by the
/// reconciliation worker against its own order bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub leader_address: Address,
    pub follower_id: Option<Uuid>,
    pub asset: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub order_type: OrderType,
    pub is_leader_trade: bool,
    pub executed_at: DateTime<Utc>,
    pub exchange_tx_id: Option<String>,
    pub status: TradeStatus,
    /// Exchange-assigned fill identifier, used for `(leader, fill_hash)` idempotency.
    pub fill_hash: String,
}

/// Links an original leader fill to the copy attempt it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyTrade {
    pub id: Uuid,
    pub follower_id: Uuid,
    pub leader_fill_hash: String,
    pub original_size: f64,
    pub original_price: f64,
    pub executed_size: Option<f64>,
    pub executed_price: Option<f64>,
    pub slippage_pct: Option<f64>,
    pub execution_delay_ms: u64,
    pub status: TradeStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

/// `(owner_wallet, asset)`-unique position row, mutated only by reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub owner_wallet: Address,
    pub asset: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub margin_used: f64,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn unrealized_pnl_pct(&self) -> f64 {
        if self.entry_price <= 0.0 || self.size <= 0.0 {
            return 0.0;
        }
        let notional = self.entry_price * self.size;
        if notional <= 0.0 {
            return 0.0;
        }
        (self.unrealized_pnl / notional) * 100.0
    }
}

/// One entry in the perp universe (spec §3 MetadataSnapshot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerpMeta {
    pub index: u32,
    pub name: String,
    pub size_decimals: u32,
    pub max_leverage: u32,
    pub only_isolated: bool,
    pub is_delisted: bool,
}

/// One entry in the spot pair universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotMeta {
    pub pair_index: u32,
    pub name: String,
    pub base_token: String,
    pub quote_token: String,
}

/// Resolved asset-id per the wire rule: perp = its index, spot = 10000 + pair index.
pub const SPOT_ASSET_ID_OFFSET: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetLookup {
    Perp(u32),
    Spot(u32),
    Unknown,
    Delisted,
    AtOiCap,
}

/// A point-in-time snapshot of the exchange's asset universes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub perps: Vec<PerpMeta>,
    pub spot: Vec<SpotMeta>,
    pub perps_at_oi_cap: std::collections::HashSet<u32>,
}

impl MetadataSnapshot {
    pub fn asset_id(&self, name: &str) -> AssetLookup {
        if let Some(p) = self.perps.iter().find(|p| p.name == name) {
            if p.is_delisted {
                return AssetLookup::Delisted;
            }
            if self.perps_at_oi_cap.contains(&p.index) {
                return AssetLookup::AtOiCap;
            }
            return AssetLookup::Perp(p.index);
        }
        if let Some(s) = self.spot.iter().find(|s| s.name == name) {
            return AssetLookup::Spot(SPOT_ASSET_ID_OFFSET + s.pair_index);
        }
        AssetLookup::Unknown
    }

    pub fn size_decimals(&self, asset: &str) -> Option<u32> {
        self.perps.iter().find(|p| p.name == asset).map(|p| p.size_decimals)
    }

    /// Hyperliquid's price-tick rule: 5 significant figures, minus whatever
    /// `size_decimals` already consumes.
    pub fn tick_decimals(&self, asset: &str) -> Option<u32> {
        let decimals = self.size_decimals(asset)?;
        Some((6u32).saturating_sub(decimals.min(6)))
    }

    pub fn perp_by_index(&self, index: u32) -> Option<&PerpMeta> {
        self.perps.iter().find(|p| p.index == index)
    }

    /// Raw wire asset-id, regardless of delisted/OI-cap status — for callers
    /// (e.g. the batching engine) that already cleared those checks upstream
    /// and just need the numeric id to address an order at.
    pub fn raw_asset_index(&self, name: &str) -> Option<u32> {
        if let Some(p) = self.perps.iter().find(|p| p.name == name) {
            return Some(p.index);
        }
        self.spot.iter().find(|s| s.name == name).map(|s| SPOT_ASSET_ID_OFFSET + s.pair_index)
    }
}

/// Rolling stats backing `top_traders`/`performance_by_leader`/discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderDiscovery {
    pub address: Address,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub volume_24h_usd: f64,
    pub volume_7d_usd: f64,
    pub win_rate_7d_pct: f64,
    pub tag: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_window_wraps_midnight() {
        let w = HourWindow { start_hour_utc: 22, end_hour_utc: 4 };
        assert!(w.contains(23));
        assert!(w.contains(0));
        assert!(w.contains(4));
        assert!(!w.contains(12));
    }

    #[test]
    fn asset_id_rule_perp_then_spot() {
        let mut meta = MetadataSnapshot::default();
        meta.perps.push(PerpMeta {
            index: 0,
            name: "BTC".into(),
            size_decimals: 5,
            max_leverage: 50,
            only_isolated: false,
            is_delisted: false,
        });
        meta.spot.push(SpotMeta {
            pair_index: 3,
            name: "PURR/USDC".into(),
            base_token: "PURR".into(),
            quote_token: "USDC".into(),
        });
        assert_eq!(meta.asset_id("BTC"), AssetLookup::Perp(0));
        assert_eq!(meta.asset_id("PURR/USDC"), AssetLookup::Spot(10_003));
        assert_eq!(meta.asset_id("NOPE"), AssetLookup::Unknown);
    }

    #[test]
    fn permissionless_whitelist_is_authoritative() {
        let follower = Follower {
            id: Uuid::new_v4(),
            owner_user_id: "u1".into(),
            leader_address: "0xLEADER".into(),
            signing_wallet: "0xWALLET".into(),
            copy_percentage: 50.0,
            max_position_size: 1000.0,
            stop_loss_pct: None,
            take_profit_pct: None,
            is_active: true,
            risk_settings: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let pf = PermissionlessFollower {
            follower,
            asset_whitelist: vec!["BTC".into()],
            asset_blacklist: vec!["BTC".into()],
            min_trade_size: 1.0,
            copy_filters: CopyFilters::default(),
        };
        // whitelist says BTC is allowed, blacklist additionally excludes it -> blocked.
        assert!(!pf.asset_allowed("BTC"));
        assert!(!pf.asset_allowed("ETH"));
    }
}
