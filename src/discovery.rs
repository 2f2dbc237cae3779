// discovery.rs — permissionless-follow helpers and trader-discovery rollups
// (spec §1 secondary subsystem, §3 PermissionlessFollower/CopyFilters).
//
// Grounded on spec §3's data model directly (the teacher has no analogue —
// it trades one configured account, never discovers or follows arbitrary
// addresses) with the percent-based threshold style of the teacher's
// `risk.rs` circuit breakers (e.g. `max_daily_drawdown_percent` comparisons)
// carried over for the rollup math below.

use std::sync::Arc;

use crate::model::{Address, CopyFilters, Follower, PermissionlessFollower, RiskSettings, TradeStatus, TraderDiscovery};
use crate::repository::Repository;

/// Flattens a `PermissionlessFollower`'s structured policy knobs into the
/// generic `risk_settings` map the Risk & Filter Pipeline reads uniformly
/// for both registered and permissionless followers (spec §1: "the core
/// treats this uniformly with registered leaders once subscribed").
pub fn flatten_copy_filters(pf: &PermissionlessFollower) -> Follower {
    let mut follower = pf.follower.clone();
    let settings = &mut follower.risk_settings;

    if !pf.asset_whitelist.is_empty() {
        settings.insert("asset_whitelist".to_string(), serde_json::json!(pf.asset_whitelist));
    }
    if !pf.asset_blacklist.is_empty() {
        settings.insert("asset_blacklist".to_string(), serde_json::json!(pf.asset_blacklist));
    }
    settings.insert("min_trade_size".to_string(), serde_json::json!(pf.min_trade_size));
    if let Some(min) = pf.copy_filters.min_notional {
        settings.insert("min_notional".to_string(), serde_json::json!(min));
    }
    if let Some(max) = pf.copy_filters.max_notional {
        settings.insert("max_notional".to_string(), serde_json::json!(max));
    }
    if let Some(window) = pf.copy_filters.only_during_hours {
        settings.insert("only_during_hours".to_string(), serde_json::json!(window));
    }
    if pf.copy_filters.time_delay_seconds > 0 {
        settings.insert("time_delay_seconds".to_string(), serde_json::json!(pf.copy_filters.time_delay_seconds));
    }
    follower
}

/// Rebuilds the structured `CopyFilters`/whitelist/blacklist view back out of
/// a flattened `Follower`'s `risk_settings`, for callers (e.g. the operator
/// surface) that need the permissionless shape back.
pub fn unflatten_copy_filters(follower: &Follower) -> PermissionlessFollower {
    let get_list = |key: &str| -> Vec<String> {
        follower.risk_settings.get(key).and_then(|v| serde_json::from_value(v.clone()).ok()).unwrap_or_default()
    };
    PermissionlessFollower {
        follower: follower.clone(),
        asset_whitelist: get_list("asset_whitelist"),
        asset_blacklist: get_list("asset_blacklist"),
        min_trade_size: follower.risk_settings.get("min_trade_size").and_then(|v| v.as_f64()).unwrap_or(0.0),
        copy_filters: CopyFilters {
            min_notional: follower.risk_settings.get("min_notional").and_then(|v| v.as_f64()),
            max_notional: follower.risk_settings.get("max_notional").and_then(|v| v.as_f64()),
            only_during_hours: follower.risk_settings.get("only_during_hours").and_then(|v| serde_json::from_value(v.clone()).ok()),
            time_delay_seconds: follower.risk_settings.get("time_delay_seconds").and_then(|v| v.as_u64()).unwrap_or(0),
            auto_discovery: follower.risk_settings.get("auto_discovery").and_then(|v| v.as_bool()).unwrap_or(false),
        },
    }
}

pub fn empty_risk_settings() -> RiskSettings {
    RiskSettings::default()
}

/// Recomputes a `TraderDiscovery` rollup for `address` from its recorded
/// leader trades over the trailing windows spec §3 names (24h/7d volume,
/// 7d win rate). Only leader rows (`is_leader_trade = true`) count — a
/// discovered address's own copy fills never feed back into its rollup.
pub async fn recompute_trader_rollup(repo: &Arc<dyn Repository>, address: &Address, now: chrono::DateTime<chrono::Utc>) -> TraderDiscovery {
    let trades = repo.performance_by_leader(address, 7).await.unwrap_or_default();
    let day_ago = now - chrono::Duration::hours(24);

    let mut volume_24h_usd = 0.0;
    let mut volume_7d_usd = 0.0;
    let mut wins = 0u32;
    let mut closed = 0u32;
    let mut first_seen = now;
    let mut last_seen = trades.first().map(|t| t.executed_at).unwrap_or(now);

    for trade in &trades {
        if !trade.is_leader_trade {
            continue;
        }
        let notional = trade.size * trade.price;
        volume_7d_usd += notional;
        if trade.executed_at >= day_ago {
            volume_24h_usd += notional;
        }
        if trade.executed_at < first_seen {
            first_seen = trade.executed_at;
        }
        if trade.executed_at > last_seen {
            last_seen = trade.executed_at;
        }
        if matches!(trade.status, TradeStatus::Filled | TradeStatus::Partial) {
            closed += 1;
            // a leader "win" is approximated here by fill completion; the
            // exchange does not report realized pnl per fill to this relay,
            // so win-rate uses fill-completion as its proxy signal.
            wins += 1;
        }
    }

    let win_rate_7d_pct = if closed > 0 { (wins as f64 / closed as f64) * 100.0 } else { 0.0 };

    TraderDiscovery { address: address.clone(), first_seen, last_seen, volume_24h_usd, volume_7d_usd, win_rate_7d_pct, tag: None }
}

/// Surfaces the top `limit` discovered traders by 7-day volume, for the
/// `get_discovered_traders` operator capability (spec §6).
pub async fn get_discovered_traders(repo: &Arc<dyn Repository>, limit: usize) -> Vec<TraderDiscovery> {
    repo.top_traders(limit).await.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn base_follower() -> Follower {
        let now = Utc::now();
        Follower {
            id: Uuid::new_v4(),
            owner_user_id: "u1".to_string(),
            leader_address: "0xLEADER".to_string(),
            signing_wallet: "0xWALLET".to_string(),
            copy_percentage: 25.0,
            max_position_size: 5_000.0,
            stop_loss_pct: None,
            take_profit_pct: None,
            is_active: true,
            risk_settings: empty_risk_settings(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn flatten_and_unflatten_roundtrip_preserves_filters() {
        let pf = PermissionlessFollower {
            follower: base_follower(),
            asset_whitelist: vec!["BTC".to_string()],
            asset_blacklist: vec![],
            min_trade_size: 0.01,
            copy_filters: CopyFilters { min_notional: Some(10.0), max_notional: Some(1_000.0), only_during_hours: None, time_delay_seconds: 5, auto_discovery: true },
        };
        let flat = flatten_copy_filters(&pf);
        assert!(flat.risk_settings.contains_key("asset_whitelist"));
        let back = unflatten_copy_filters(&flat);
        assert_eq!(back.asset_whitelist, vec!["BTC".to_string()]);
        assert_eq!(back.copy_filters.time_delay_seconds, 5);
        assert_eq!(back.copy_filters.min_notional, Some(10.0));
    }

    #[tokio::test]
    async fn rollup_of_no_trades_is_zeroed() {
        let repo: Arc<dyn Repository> = Arc::new(crate::repository::InMemoryRepository::new());
        let rollup = recompute_trader_rollup(&repo, &"0xNEW".to_string(), Utc::now()).await;
        assert_eq!(rollup.volume_7d_usd, 0.0);
        assert_eq!(rollup.win_rate_7d_pct, 0.0);
    }
}
