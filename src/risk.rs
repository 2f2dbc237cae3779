// risk.rs — per-candidate Risk & Filter Pipeline (spec §4.F) plus the
// teacher's account-level circuit breakers, kept as a separate global gate.
//
// The ordered-chain-of-checks idea is grounded on other_examples'
// `risk_manager.rs` (Zuytan-rustrade): a `Vec` of independently testable
// validators run in sequence against a mutable piece of trade state. The
// account-level halt/kill-switch machinery below (`RiskManager`,
// `RiskConfig`, `RiskState`) is the teacher's own and is kept verbatim in
// shape: this relay still wants a manual kill switch and a daily-drawdown
// halt sitting above the per-candidate chain, gating the whole pipeline
// before any candidate is even evaluated.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::RiskConfigValues;
use crate::error::{PolicyRejectionReason, RelayResult};
use crate::gateway::{ExchangeClient, UserFill};
use crate::model::{Address, AssetLookup, Follower, MetadataSnapshot, Position, Side};
use crate::repository::Repository;

// ─── Account-level circuit breakers (teacher's RiskManager, kept) ─────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_daily_drawdown_percent: f64, // e.g. 0.15 (15%)
    pub max_consecutive_losses: usize,   // e.g. 5
    pub trading_halt_duration_secs: i64, // e.g. 3600 (1 hour)
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_drawdown_percent: 0.10,
            max_consecutive_losses: 5,
            trading_halt_duration_secs: 3600,
        }
    }
}

pub struct RiskManager {
    config: RiskConfig,
    start_of_day_balance: f64,
    last_day_reset: DateTime<Utc>,
    consecutive_loss_count: usize,
    halt_until: Option<DateTime<Utc>>,
    is_kill_switch_active: bool,
}

impl RiskManager {
    pub fn new(config: RiskConfig, current_balance: f64) -> Self {
        Self {
            config,
            start_of_day_balance: current_balance,
            last_day_reset: Utc::now(),
            consecutive_loss_count: 0,
            halt_until: None,
            is_kill_switch_active: false,
        }
    }

    /// Check if trading is allowed based on current state
    pub fn can_trade(&self) -> Result<(), String> {
        if self.is_kill_switch_active {
            return Err("Kill switch is ACTIVE".to_string());
        }

        if let Some(halt_end) = self.halt_until {
            if Utc::now() < halt_end {
                return Err(format!("Trading halted until {}", halt_end));
            }
        }

        Ok(())
    }

    /// Update state with a closed trade result
    pub fn update_trade_result(&mut self, pnl: f64, current_balance: f64) {
        let now = Utc::now();
        if now.date_naive() > self.last_day_reset.date_naive() {
            self.start_of_day_balance = current_balance;
            self.last_day_reset = now;
        }

        if pnl < 0.0 {
            self.consecutive_loss_count += 1;
        } else {
            self.consecutive_loss_count = 0;
        }

        self.check_circuit_breakers(current_balance);
    }

    fn check_circuit_breakers(&mut self, current_balance: f64) {
        if self.consecutive_loss_count >= self.config.max_consecutive_losses {
            let halt_duration = ChronoDuration::seconds(self.config.trading_halt_duration_secs);
            self.halt_until = Some(Utc::now() + halt_duration);
            self.consecutive_loss_count = 0;
            log::warn!(
                "RISK: Halt triggered! {} consecutive losses. Pausing for {}s",
                self.config.max_consecutive_losses,
                self.config.trading_halt_duration_secs
            );
        }

        let drawdown = (self.start_of_day_balance - current_balance) / self.start_of_day_balance;
        if drawdown > self.config.max_daily_drawdown_percent {
            let tomorrow = Utc::now().date_naive().succ_opt().unwrap().and_hms_opt(0, 0, 0).unwrap().and_utc();
            self.halt_until = Some(tomorrow);
            log::error!(
                "RISK: CRITICAL! Daily drawdown {:.1}% exceeds limit {:.1}%. Halting until tomorrow.",
                drawdown * 100.0,
                self.config.max_daily_drawdown_percent * 100.0
            );
        }
    }

    pub fn set_kill_switch(&mut self, active: bool) {
        self.is_kill_switch_active = active;
        log::warn!("RISK: Kill switch set to {}", active);
    }

    pub fn clear_halt(&mut self) {
        self.halt_until = None;
        self.consecutive_loss_count = 0;
        log::info!("RISK: Trading halt manually cleared.");
    }

    pub fn get_state(&self) -> RiskState {
        RiskState {
            start_of_day_balance: self.start_of_day_balance,
            last_day_reset: self.last_day_reset,
            consecutive_loss_count: self.consecutive_loss_count,
            halt_until: self.halt_until,
            is_kill_switch_active: self.is_kill_switch_active,
        }
    }

    pub fn restore_state(&mut self, state: RiskState) {
        self.start_of_day_balance = state.start_of_day_balance;
        self.last_day_reset = state.last_day_reset;
        self.consecutive_loss_count = state.consecutive_loss_count;
        self.halt_until = state.halt_until;
        self.is_kill_switch_active = state.is_kill_switch_active;
        log::info!(
            "RISK: Restored state: StartBal=${:.2}, LossStreak={}",
            self.start_of_day_balance,
            self.consecutive_loss_count
        );
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub start_of_day_balance: f64,
    pub last_day_reset: DateTime<Utc>,
    pub consecutive_loss_count: usize,
    pub halt_until: Option<DateTime<Utc>>,
    pub is_kill_switch_active: bool,
}

// ─── Per-candidate Risk & Filter Pipeline (spec §4.F) ──────────────────────

/// A leader fill resolved to one active follower, awaiting risk evaluation.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub follower: Follower,
    pub leader: Address,
    pub fill: UserFill,
}

#[derive(Debug, Clone, Copy)]
pub enum Tif {
    Ioc,
    Gtc,
    Alo,
}

impl Tif {
    pub fn as_wire(self) -> &'static str {
        match self {
            Tif::Ioc => "Ioc",
            Tif::Gtc => "Gtc",
            Tif::Alo => "Alo",
        }
    }
}

/// The pipeline's successful output, ready for the Order Batching Engine.
#[derive(Debug, Clone)]
pub struct Order {
    pub follower: Follower,
    pub asset: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub reduce_only: bool,
    pub tif: Tif,
    pub cloid: Option<String>,
    /// Copy-trade linkage (spec §3 CopyTrade): `Some` when this order was
    /// produced by copying a specific leader fill, `None` for orders with no
    /// originating fill (e.g. stop-loss/take-profit reduction).
    pub leader_fill_hash: Option<String>,
    pub original_size: f64,
    pub original_price: f64,
    pub leader_fill_time_ms: i64,
}

/// The pipeline's overall verdict for a candidate.
#[derive(Debug, Clone)]
pub enum RiskOutcome {
    Emit(Order),
    /// `copy_filters.time_delay_seconds > 0`: caller enqueues into the
    /// governor's time-wheel keyed by `fire_at` and re-submits at that time.
    Deferred { fire_at: DateTime<Utc>, candidate: Candidate },
    Reject(PolicyRejectionReason),
}

/// Outcome of a single filter step.
enum StepVerdict {
    Continue,
    Reject(PolicyRejectionReason),
    Defer(DateTime<Utc>),
}

/// Size/notional/score threaded through the chain; each filter may shrink
/// `size` but never grow it.
struct FilterState {
    size: f64,
    notional: f64,
    risk_score: f64,
}

/// Shared read-only facts and mutable bookkeeping the filter chain needs.
pub struct RiskContext {
    pub gateway: Arc<dyn ExchangeClient>,
    pub repository: Arc<dyn Repository>,
    pub config: RiskConfigValues,
    /// Base per-asset risk weight, looked up by asset name; assets absent
    /// from the table use `default_asset_risk`.
    pub asset_risk_table: HashMap<String, f64>,
    pub default_asset_risk: f64,
    /// 24-entry hourly risk curve indexed by UTC hour.
    pub time_of_day_risk: [f64; 24],
    /// Rolling per-follower trade timestamps for the overtrading check.
    trade_log: DashMap<Uuid, VecDeque<i64>>,
}

impl RiskContext {
    pub fn new(gateway: Arc<dyn ExchangeClient>, repository: Arc<dyn Repository>, config: RiskConfigValues) -> Self {
        Self {
            gateway,
            repository,
            config,
            asset_risk_table: HashMap::new(),
            default_asset_risk: 0.1,
            time_of_day_risk: [0.05; 24],
            trade_log: DashMap::new(),
        }
    }

    fn record_trade(&self, follower_id: Uuid, now_ms: i64) {
        let mut log = self.trade_log.entry(follower_id).or_default();
        log.push_back(now_ms);
        while log.front().is_some_and(|t| now_ms - *t > 60_000) {
            log.pop_front();
        }
    }

    fn trade_rate_per_min(&self, follower_id: Uuid) -> f64 {
        self.trade_log.get(&follower_id).map(|q| q.len() as f64).unwrap_or(0.0)
    }
}

fn risk_settings_string_list(follower: &Follower, key: &str) -> Vec<String> {
    follower
        .risk_settings
        .get(key)
        .and_then(|v| serde_json::from_value::<Vec<String>>(v.clone()).ok())
        .unwrap_or_default()
}

fn round_down(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).floor() / factor
}

#[async_trait]
trait RiskFilter: Send + Sync {
    async fn check(&self, candidate: &Candidate, meta: &MetadataSnapshot, ctx: &RiskContext, state: &mut FilterState) -> RelayResult<StepVerdict>;
}

/// Step 1: active check.
struct ActiveCheck;
#[async_trait]
impl RiskFilter for ActiveCheck {
    async fn check(&self, candidate: &Candidate, _meta: &MetadataSnapshot, _ctx: &RiskContext, _state: &mut FilterState) -> RelayResult<StepVerdict> {
        if !candidate.follower.is_active {
            return Ok(StepVerdict::Reject(PolicyRejectionReason::Inactive));
        }
        Ok(StepVerdict::Continue)
    }
}

/// Step 2: asset universe + allow/deny-list policy.
struct AssetPolicyCheck;
#[async_trait]
impl RiskFilter for AssetPolicyCheck {
    async fn check(&self, candidate: &Candidate, meta: &MetadataSnapshot, _ctx: &RiskContext, _state: &mut FilterState) -> RelayResult<StepVerdict> {
        match meta.asset_id(&candidate.fill.asset) {
            AssetLookup::Unknown | AssetLookup::Delisted | AssetLookup::AtOiCap => {
                return Ok(StepVerdict::Reject(PolicyRejectionReason::UnknownOrDelistedAsset));
            }
            _ => {}
        }
        let whitelist = risk_settings_string_list(&candidate.follower, "asset_whitelist");
        let blacklist = risk_settings_string_list(&candidate.follower, "asset_blacklist");
        if !whitelist.is_empty() && !whitelist.iter().any(|a| a == &candidate.fill.asset) {
            return Ok(StepVerdict::Reject(PolicyRejectionReason::AssetBlocked));
        }
        if blacklist.iter().any(|a| a == &candidate.fill.asset) {
            return Ok(StepVerdict::Reject(PolicyRejectionReason::AssetBlocked));
        }
        Ok(StepVerdict::Continue)
    }
}

/// Step 3: time-window policy, read from `risk_settings.only_during_hours`.
struct TimeWindowCheck;
#[async_trait]
impl RiskFilter for TimeWindowCheck {
    async fn check(&self, candidate: &Candidate, _meta: &MetadataSnapshot, _ctx: &RiskContext, _state: &mut FilterState) -> RelayResult<StepVerdict> {
        if let Some(window_value) = candidate.follower.risk_settings.get("only_during_hours") {
            if let Ok(window) = serde_json::from_value::<crate::model::HourWindow>(window_value.clone()) {
                let hour = Utc::now().hour_utc();
                if !window.contains(hour) {
                    return Ok(StepVerdict::Reject(PolicyRejectionReason::TimeWindow));
                }
            }
        }
        Ok(StepVerdict::Continue)
    }
}

/// Step 4: base sizing, capped by account/leverage/spot-balance limits.
struct SizingCheck;
#[async_trait]
impl RiskFilter for SizingCheck {
    async fn check(&self, candidate: &Candidate, meta: &MetadataSnapshot, ctx: &RiskContext, state: &mut FilterState) -> RelayResult<StepVerdict> {
        let min_trade_size = candidate
            .follower
            .risk_settings
            .get("min_trade_size")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);

        let mut s = candidate.fill.size * (candidate.follower.copy_percentage / 100.0);
        if s < min_trade_size {
            return Ok(StepVerdict::Reject(PolicyRejectionReason::Dust));
        }

        let max_by_equity = candidate.follower.max_position_size / candidate.fill.price.max(f64::MIN_POSITIVE);
        s = s.min(max_by_equity);

        match meta.asset_id(&candidate.fill.asset) {
            AssetLookup::Perp(_) => {
                if let Ok(active) = ctx.gateway.get_active_asset_data(&candidate.follower.signing_wallet, &candidate.fill.asset).await {
                    s = s.min(active.max_trade_sz);
                }
            }
            AssetLookup::Spot(_) => {
                if let Ok(balances) = ctx.gateway.get_spot_balances(&candidate.follower.signing_wallet).await {
                    if let Some(balance) = balances.iter().find(|b| b.token == candidate.fill.asset) {
                        s = s.min(balance.available);
                    }
                }
            }
            _ => {}
        }

        if let Some(decimals) = meta.size_decimals(&candidate.fill.asset) {
            s = round_down(s, decimals);
        }

        if s < min_trade_size || s <= 0.0 {
            return Ok(StepVerdict::Reject(PolicyRejectionReason::Dust));
        }

        state.size = s;
        state.notional = s * candidate.fill.price;
        Ok(StepVerdict::Continue)
    }
}

/// Step 5: notional range filter.
struct NotionalFilterCheck;
#[async_trait]
impl RiskFilter for NotionalFilterCheck {
    async fn check(&self, candidate: &Candidate, _meta: &MetadataSnapshot, _ctx: &RiskContext, state: &mut FilterState) -> RelayResult<StepVerdict> {
        let min_notional = candidate.follower.risk_settings.get("min_notional").and_then(|v| v.as_f64());
        let max_notional = candidate.follower.risk_settings.get("max_notional").and_then(|v| v.as_f64());
        if let Some(min) = min_notional {
            if state.notional < min {
                return Ok(StepVerdict::Reject(PolicyRejectionReason::NotionalOutOfRange));
            }
        }
        if let Some(max) = max_notional {
            if state.notional > max {
                return Ok(StepVerdict::Reject(PolicyRejectionReason::NotionalOutOfRange));
            }
        }
        Ok(StepVerdict::Continue)
    }
}

/// Step 6: weighted risk score, reject above threshold, linearly shrink above half-threshold.
struct RiskScoreCheck;
#[async_trait]
impl RiskFilter for RiskScoreCheck {
    async fn check(&self, candidate: &Candidate, _meta: &MetadataSnapshot, ctx: &RiskContext, state: &mut FilterState) -> RelayResult<StepVerdict> {
        let asset_risk = ctx.asset_risk_table.get(&candidate.fill.asset).copied().unwrap_or(ctx.default_asset_risk);
        let hour = Utc::now().hour_utc() as usize;
        let time_risk = ctx.time_of_day_risk[hour % 24];

        let concentration = if candidate.follower.max_position_size > 0.0 {
            let existing = ctx
                .repository
                .list_positions_by_owner(&candidate.follower.signing_wallet)
                .await
                .unwrap_or_default()
                .into_iter()
                .find(|p| p.asset == candidate.fill.asset)
                .map(|p| p.size * p.entry_price)
                .unwrap_or(0.0);
            (existing / candidate.follower.max_position_size).min(1.0)
        } else {
            0.0
        };

        let trade_rate = ctx.trade_rate_per_min(candidate.follower.id);
        let overtrading = if trade_rate > ctx.config.overtrading_trades_per_min {
            ((trade_rate - ctx.config.overtrading_trades_per_min) / ctx.config.overtrading_trades_per_min).min(1.0)
        } else {
            0.0
        };

        let score = asset_risk + time_risk + concentration + overtrading;
        state.risk_score = score;

        if score > ctx.config.risk_score_reject_threshold {
            return Ok(StepVerdict::Reject(PolicyRejectionReason::RiskTooHigh));
        }
        if score > ctx.config.risk_score_shrink_threshold {
            let shrink = (1.0 - 0.5 * score).max(0.0);
            state.size *= shrink;
            state.notional = state.size * candidate.fill.price;
            if state.size <= 0.0 {
                return Ok(StepVerdict::Reject(PolicyRejectionReason::RiskTooHigh));
            }
        }
        Ok(StepVerdict::Continue)
    }
}

/// Step 7: top-of-book liquidity check.
struct LiquidityCheck;
#[async_trait]
impl RiskFilter for LiquidityCheck {
    async fn check(&self, candidate: &Candidate, _meta: &MetadataSnapshot, ctx: &RiskContext, state: &mut FilterState) -> RelayResult<StepVerdict> {
        let displayed = match ctx.gateway.get_l2_snapshot_depth(&candidate.fill.asset, candidate.fill.is_buy, state.size).await {
            Ok(d) => d,
            Err(_) => return Ok(StepVerdict::Reject(PolicyRejectionReason::InsufficientLiquidity)),
        };
        if displayed < state.size {
            return Ok(StepVerdict::Reject(PolicyRejectionReason::InsufficientLiquidity));
        }
        Ok(StepVerdict::Continue)
    }
}

/// Step 8: fee/margin sufficiency check.
struct FeesMarginCheck;
#[async_trait]
impl RiskFilter for FeesMarginCheck {
    async fn check(&self, candidate: &Candidate, _meta: &MetadataSnapshot, ctx: &RiskContext, state: &mut FilterState) -> RelayResult<StepVerdict> {
        let fees = ctx.gateway.get_user_fees(&candidate.follower.signing_wallet).await?;
        let fee = state.notional * fees.taker_rate;

        let user_state = ctx.gateway.get_user_state(&candidate.follower.signing_wallet).await?;
        let required_margin = state.notional / 10.0; // conservative 10x-leverage floor; exchange enforces exact margin
        if user_state.margin.account_value < fee + required_margin {
            return Ok(StepVerdict::Reject(PolicyRejectionReason::InsufficientMargin));
        }
        Ok(StepVerdict::Continue)
    }
}

/// Step 9: execution delay, deferring the candidate into the governor's time-wheel.
struct DelayCheck;
#[async_trait]
impl RiskFilter for DelayCheck {
    async fn check(&self, candidate: &Candidate, _meta: &MetadataSnapshot, _ctx: &RiskContext, _state: &mut FilterState) -> RelayResult<StepVerdict> {
        let delay_seconds = candidate
            .follower
            .risk_settings
            .get("time_delay_seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if delay_seconds == 0 {
            return Ok(StepVerdict::Continue);
        }
        let fill_time = DateTime::from_timestamp_millis(candidate.fill.time_ms).unwrap_or_else(Utc::now);
        let fire_at = fill_time + ChronoDuration::seconds(delay_seconds as i64);
        if fire_at > Utc::now() {
            return Ok(StepVerdict::Defer(fire_at));
        }
        Ok(StepVerdict::Continue)
    }
}

trait UtcHourExt {
    fn hour_utc(&self) -> u32;
}
impl UtcHourExt for DateTime<Utc> {
    fn hour_utc(&self) -> u32 {
        use chrono::Timelike;
        self.hour()
    }
}

/// The ordered 9-step chain from spec §4.F, built once at startup.
pub struct RiskPipeline {
    filters: Vec<Box<dyn RiskFilter>>,
}

impl RiskPipeline {
    pub fn new() -> Self {
        Self {
            filters: vec![
                Box::new(ActiveCheck),
                Box::new(AssetPolicyCheck),
                Box::new(TimeWindowCheck),
                Box::new(SizingCheck),
                Box::new(NotionalFilterCheck),
                Box::new(RiskScoreCheck),
                Box::new(LiquidityCheck),
                Box::new(FeesMarginCheck),
                Box::new(DelayCheck),
            ],
        }
    }

    pub async fn evaluate(&self, candidate: Candidate, meta: &MetadataSnapshot, ctx: &RiskContext) -> RiskOutcome {
        let mut state = FilterState { size: 0.0, notional: 0.0, risk_score: 0.0 };
        for filter in &self.filters {
            match filter.check(&candidate, meta, ctx, &mut state).await {
                Ok(StepVerdict::Continue) => continue,
                Ok(StepVerdict::Reject(reason)) => return RiskOutcome::Reject(reason),
                Ok(StepVerdict::Defer(fire_at)) => return RiskOutcome::Deferred { fire_at, candidate },
                Err(e) => {
                    log::warn!("[RISK] filter error for follower={}: {}", candidate.follower.id, e);
                    return RiskOutcome::Reject(PolicyRejectionReason::InsufficientLiquidity);
                }
            }
        }
        ctx.record_trade(candidate.follower.id, candidate.fill.time_ms);
        RiskOutcome::Emit(Order {
            asset: candidate.fill.asset.clone(),
            side: if candidate.fill.is_buy { Side::Buy } else { Side::Sell },
            size: state.size,
            price: candidate.fill.price,
            reduce_only: false,
            tif: Tif::Ioc,
            cloid: None,
            leader_fill_hash: Some(candidate.fill.fill_hash.clone()),
            original_size: candidate.fill.size,
            original_price: candidate.fill.price,
            leader_fill_time_ms: candidate.fill.time_ms,
            follower: candidate.follower,
        })
    }
}

impl Default for RiskPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Separate stop-loss/take-profit loop (spec §4.F, run each reconciliation
/// tick against every open copy position).
pub fn evaluate_stop_loss_take_profit(position: &Position, follower: &Follower) -> Option<Order> {
    let pnl_pct = position.unrealized_pnl_pct();
    let hit_stop = follower.stop_loss_pct.is_some_and(|sl| pnl_pct <= -sl);
    let hit_take_profit = follower.take_profit_pct.is_some_and(|tp| pnl_pct >= tp);
    if !hit_stop && !hit_take_profit {
        return None;
    }
    let side = match position.side {
        crate::model::PositionSide::Long => Side::Sell,
        crate::model::PositionSide::Short => Side::Buy,
    };
    Some(Order {
        follower: follower.clone(),
        asset: position.asset.clone(),
        side,
        size: position.size,
        price: position.mark_price,
        reduce_only: true,
        tif: Tif::Ioc,
        cloid: None,
        leader_fill_hash: None,
        original_size: position.size,
        original_price: position.entry_price,
        leader_fill_time_ms: position.updated_at.timestamp_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SimGateway;
    use crate::model::PerpMeta;
    use crate::repository::InMemoryRepository;

    fn follower() -> Follower {
        let now = Utc::now();
        Follower {
            id: Uuid::new_v4(),
            owner_user_id: "u1".to_string(),
            leader_address: "0xLEADER".to_string(),
            signing_wallet: "0xWALLET".to_string(),
            copy_percentage: 50.0,
            max_position_size: 100_000.0,
            stop_loss_pct: Some(10.0),
            take_profit_pct: Some(20.0),
            is_active: true,
            risk_settings: Default::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn meta_with_btc() -> MetadataSnapshot {
        let mut m = MetadataSnapshot::default();
        m.perps.push(PerpMeta { index: 0, name: "BTC".into(), size_decimals: 3, max_leverage: 50, only_isolated: false, is_delisted: false });
        m
    }

    #[tokio::test]
    async fn inactive_follower_is_rejected_first() {
        let mut f = follower();
        f.is_active = false;
        let candidate = Candidate { follower: f, leader: "0xLEADER".to_string(), fill: UserFill { asset: "BTC".to_string(), is_buy: true, size: 1.0, price: 100.0, time_ms: 0, fill_hash: "h".to_string() } };
        let gw: Arc<dyn ExchangeClient> = Arc::new(SimGateway::new(meta_with_btc()));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let ctx = RiskContext::new(gw, repo, RiskConfigValues::default());
        let pipeline = RiskPipeline::new();
        let outcome = pipeline.evaluate(candidate, &meta_with_btc(), &ctx).await;
        assert!(matches!(outcome, RiskOutcome::Reject(PolicyRejectionReason::Inactive)));
    }

    #[tokio::test]
    async fn unknown_asset_is_rejected() {
        let f = follower();
        let candidate = Candidate { follower: f, leader: "0xLEADER".to_string(), fill: UserFill { asset: "DOGE".to_string(), is_buy: true, size: 1.0, price: 0.1, time_ms: 0, fill_hash: "h".to_string() } };
        let gw: Arc<dyn ExchangeClient> = Arc::new(SimGateway::new(meta_with_btc()));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let ctx = RiskContext::new(gw, repo, RiskConfigValues::default());
        let pipeline = RiskPipeline::new();
        let outcome = pipeline.evaluate(candidate, &meta_with_btc(), &ctx).await;
        assert!(matches!(outcome, RiskOutcome::Reject(PolicyRejectionReason::UnknownOrDelistedAsset)));
    }

    #[tokio::test]
    async fn at_oi_cap_asset_is_rejected() {
        let f = follower();
        let mut meta = meta_with_btc();
        meta.perps_at_oi_cap.insert(0);
        let candidate = Candidate { follower: f, leader: "0xLEADER".to_string(), fill: UserFill { asset: "BTC".to_string(), is_buy: true, size: 1.0, price: 100.0, time_ms: 0, fill_hash: "h".to_string() } };
        let gw: Arc<dyn ExchangeClient> = Arc::new(SimGateway::new(meta.clone()));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let ctx = RiskContext::new(gw, repo, RiskConfigValues::default());
        let pipeline = RiskPipeline::new();
        let outcome = pipeline.evaluate(candidate, &meta, &ctx).await;
        assert!(matches!(outcome, RiskOutcome::Reject(PolicyRejectionReason::UnknownOrDelistedAsset)));
    }

    #[test]
    fn stop_loss_breach_emits_reducing_order() {
        let f = follower();
        let position = Position {
            owner_wallet: f.signing_wallet.clone(),
            asset: "BTC".to_string(),
            side: crate::model::PositionSide::Long,
            size: 1.0,
            entry_price: 100.0,
            mark_price: 85.0,
            unrealized_pnl: -15.0,
            margin_used: 10.0,
            updated_at: Utc::now(),
        };
        let order = evaluate_stop_loss_take_profit(&position, &f).expect("stop loss should fire");
        assert!(order.reduce_only);
        assert!(matches!(order.side, Side::Sell));
    }
}
