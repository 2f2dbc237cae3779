// gateway.rs — typed HTTP/WS client to the exchange (spec §4.A, §6).
//
// Generalized from the teacher's `exchange.rs` `ExchangeClient` trait and its
// `LiveExchange`/`SimExchange` pair: the teacher only needed balance/position/
// single-order calls for one market-making account. This relay needs the full
// read surface (metadata, book, user state, active-asset data, fills, fees)
// plus a batch order-placement call and the two streaming feeds spec §4.A
// names. `post_info`/`post_exchange` below are kept close to the teacher's
// originals — same 429/"rate limited" detection, same request/response log
// lines — since that plumbing is exchange-protocol detail, not MM-specific.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::config::GatewayConfig;
use crate::error::{RelayError, RelayResult};
use crate::model::{MetadataSnapshot, PerpMeta, Position, PositionSide, SpotMeta};
use crate::signing::{Signature, Signer};

// ─── Read-query result shapes ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: f64,
    pub size: f64,
    pub order_count: u32,
}

/// Top ≤20 levels per side, per spec §4.A `get_order_book`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

impl OrderBookSnapshot {
    /// Sum of displayed size on `side` up to `size`, for the liquidity check (spec §4.F step 7).
    pub fn liquidity_up_to(&self, is_buy: bool, size: f64) -> f64 {
        let levels = if is_buy { &self.asks } else { &self.bids };
        let mut remaining = size;
        let mut filled = 0.0;
        for level in levels {
            if remaining <= 0.0 {
                break;
            }
            let take = level.size.min(remaining);
            filled += take;
            remaining -= take;
        }
        filled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginSummary {
    pub account_value: f64,
    pub total_margin_used: f64,
    pub total_notional_position: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserState {
    pub positions: Vec<Position>,
    pub margin: MarginSummary,
}

/// Per-asset tradable-size/leverage facts, per spec §4.A `get_active_asset_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveAssetData {
    pub max_trade_sz: f64,
    pub available_leverage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFill {
    pub asset: String,
    pub is_buy: bool,
    pub size: f64,
    pub price: f64,
    pub time_ms: i64,
    pub fill_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFees {
    pub taker_rate: f64,
    pub maker_rate: f64,
}

/// Per-asset spot balance, for spot-side sizing (spec SPEC_FULL §4.A supplement).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotBalance {
    pub token: String,
    pub available: f64,
}

// ─── Order placement ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub asset: u32,
    pub is_buy: bool,
    pub limit_px: f64,
    pub sz: f64,
    pub reduce_only: bool,
    pub tif: String, // "Ioc" | "Gtc" | "Alo"
    pub cloid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum OrderStatus {
    Resting { oid: u64 },
    Filled { sz: f64, avg_px: f64 },
    Error { msg: String },
}

/// Result of a `place_orders` call: per-order statuses, positionally aligned
/// with the submitted batch (spec §4.A, testable property §8 invariant re:
/// per-order position index).
#[derive(Debug, Clone)]
pub struct PlaceOrdersResult {
    pub statuses: Vec<OrderStatus>,
}

// ─── Streaming ──────────────────────────────────────────────────────────────

/// One of the user-event-stream payloads (spec §3 data flow, §9 dynamic-JSON
/// note). `Unknown` protects the stream loop from exchange schema drift: it
/// is logged and dropped rather than tearing down the connection.
#[derive(Debug, Clone)]
pub enum UserEvent {
    Fill(UserFill),
    Funding { asset: String, usdc: f64 },
    Liquidation { asset: String },
    NonUserCancel { asset: String, oid: u64 },
    Unknown,
}

#[derive(Debug, Clone)]
pub struct PublicTrade {
    pub asset: String,
    pub is_buy: bool,
    pub price: f64,
    pub size: f64,
    pub time_ms: i64,
}

/// A streamed message, with the `is_snapshot` flag the Subscription Manager
/// uses to discard the first payload of a user stream (spec §4.D).
#[derive(Debug, Clone)]
pub struct StreamEnvelope<T> {
    pub payload: T,
    pub is_snapshot: bool,
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_metadata(&self) -> RelayResult<MetadataSnapshot>;
    async fn get_order_book(&self, asset: &str) -> RelayResult<OrderBookSnapshot>;
    async fn get_user_state(&self, address: &str) -> RelayResult<UserState>;
    async fn get_active_asset_data(&self, address: &str, asset: &str) -> RelayResult<ActiveAssetData>;
    async fn get_user_fills(&self, address: &str) -> RelayResult<Vec<UserFill>>;
    async fn get_user_fees(&self, address: &str) -> RelayResult<UserFees>;
    async fn get_spot_balances(&self, address: &str) -> RelayResult<Vec<SpotBalance>>;

    async fn place_orders(
        &self,
        orders: Vec<OrderIntent>,
        signer: &Signer,
        nonce: u64,
        grouping: &str,
    ) -> RelayResult<PlaceOrdersResult>;

    async fn cancel(&self, asset: u32, oid: u64, signer: &Signer, nonce: u64) -> RelayResult<()>;
    async fn cancel_by_cloid(&self, asset: u32, cloid: &str, signer: &Signer, nonce: u64) -> RelayResult<()>;

    /// Polls a single order's current status (spec §4.H secondary poll path).
    async fn get_order_status(&self, address: &str, oid: u64) -> RelayResult<OrderStatus>;

    /// Lazy user-event sequence; first message carries `is_snapshot: true`.
    async fn stream_user(&self, address: &str) -> RelayResult<mpsc::Receiver<StreamEnvelope<UserEvent>>>;
    /// Lazy public-trades sequence for `asset`.
    async fn stream_trades(&self, asset: &str) -> RelayResult<mpsc::Receiver<PublicTrade>>;

    /// Thin typed wrapper over `get_order_book` for the liquidity check
    /// (spec §4.F step 7), which only ever needs the depth figure, not the
    /// raw levels. Implementations get this for free from `get_order_book`.
    async fn get_l2_snapshot_depth(&self, asset: &str, is_buy: bool, size: f64) -> RelayResult<f64> {
        let book = self.get_order_book(asset).await?;
        Ok(book.liquidity_up_to(is_buy, size))
    }
}

// ─── Live gateway ───────────────────────────────────────────────────────────

pub struct LiveGateway {
    config: GatewayConfig,
    client: reqwest::Client,
}

impl LiveGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self { client: reqwest::Client::builder().timeout(config.http_timeout).build().unwrap_or_default(), config }
    }

    /// Retries `post_info` on `Transient` failures with exponential backoff
    /// (250ms, 500ms, 1s), capped at 3 attempts total, then surfaces the last
    /// error to the caller (spec §4.A — the caller decides whether that's
    /// fatal, this layer just bounds how long it spends retrying).
    async fn post_info_retried(&self, payload: serde_json::Value) -> RelayResult<serde_json::Value> {
        let mut delay = std::time::Duration::from_millis(250);
        for attempt in 1..=3 {
            match self.post_info(payload.clone()).await {
                Ok(data) => return Ok(data),
                Err(RelayError::Transient(msg)) if attempt < 3 => {
                    log::warn!("[GATEWAY] info call transient failure (attempt {}/3): {}", attempt, msg);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop always returns by attempt 3")
    }

    async fn post_info(&self, payload: serde_json::Value) -> RelayResult<serde_json::Value> {
        let resp = self
            .client
            .post(format!("{}/info", self.config.base_url))
            .json(&payload)
            .send()
            .await?;

        if resp.status().as_u16() == 429 {
            return Err(RelayError::Transient("rate limited (429)".to_string()));
        }
        let data: serde_json::Value = resp.json().await?;
        if let Some(err) = data["error"].as_str() {
            if err.contains("rate limited") {
                return Err(RelayError::Transient(err.to_string()));
            }
            return Err(RelayError::Protocol { code: -1, msg: err.to_string() });
        }
        Ok(data)
    }

    async fn post_exchange(&self, action: serde_json::Value, nonce: u64, signature: Signature) -> RelayResult<serde_json::Value> {
        let payload = serde_json::json!({
            "action": action,
            "nonce": nonce,
            "signature": signature,
            "vaultAddress": serde_json::Value::Null,
        });
        log::info!("EXCHANGE REQUEST: {}", serde_json::to_string(&payload).unwrap_or_default());

        let resp = self.client.post(format!("{}/exchange", self.config.base_url)).json(&payload).send().await?;
        if resp.status().as_u16() == 429 {
            return Err(RelayError::Transient("rate limited (429)".to_string()));
        }
        let status = resp.status();
        let text = resp.text().await?;
        log::info!("EXCHANGE RESPONSE ({}): {}", status, text);

        let data: serde_json::Value = serde_json::from_str(&text)?;
        if data["status"].as_str() == Some("err") {
            let msg = data["response"].as_str().unwrap_or("unknown error").to_string();
            if msg.contains("rate limited") || msg.contains("cumulative requests") {
                return Err(RelayError::Transient(msg));
            }
            if msg.to_lowercase().contains("nonce") {
                return Err(RelayError::NonceStale(msg));
            }
            if msg.to_lowercase().contains("signature") || msg.to_lowercase().contains("auth") {
                return Err(RelayError::AuthRejected(msg));
            }
            return Err(RelayError::Protocol { code: 0, msg });
        }
        Ok(data)
    }

    fn parse_metadata(meta: &serde_json::Value, spot_meta: &serde_json::Value, oi_caps: &serde_json::Value) -> MetadataSnapshot {
        let mut perps = Vec::new();
        if let Some(universe) = meta["universe"].as_array() {
            for (i, asset) in universe.iter().enumerate() {
                perps.push(PerpMeta {
                    index: i as u32,
                    name: asset["name"].as_str().unwrap_or_default().to_string(),
                    size_decimals: asset["szDecimals"].as_u64().unwrap_or(4) as u32,
                    max_leverage: asset["maxLeverage"].as_u64().unwrap_or(20) as u32,
                    only_isolated: asset["onlyIsolated"].as_bool().unwrap_or(false),
                    is_delisted: asset["isDelisted"].as_bool().unwrap_or(false),
                });
            }
        }
        let mut spot = Vec::new();
        if let Some(pairs) = spot_meta["universe"].as_array() {
            for (i, pair) in pairs.iter().enumerate() {
                let tokens = pair["tokens"].as_array();
                let base = tokens.and_then(|t| t.get(0)).and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let quote = tokens.and_then(|t| t.get(1)).and_then(|v| v.as_str()).unwrap_or_default().to_string();
                spot.push(SpotMeta {
                    pair_index: i as u32,
                    name: pair["name"].as_str().unwrap_or_default().to_string(),
                    base_token: base,
                    quote_token: quote,
                });
            }
        }
        let mut perps_at_oi_cap = std::collections::HashSet::new();
        if let Some(arr) = oi_caps.as_array() {
            for (i, capped) in arr.iter().enumerate() {
                if capped.as_bool().unwrap_or(false) {
                    perps_at_oi_cap.insert(i as u32);
                }
            }
        }
        MetadataSnapshot { perps, spot, perps_at_oi_cap }
    }

    fn parse_user_state(data: &serde_json::Value, address: &str) -> UserState {
        let mut positions = Vec::new();
        if let Some(list) = data["assetPositions"].as_array() {
            for p in list {
                let pos = &p["position"];
                let szi: f64 = pos["szi"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                if szi.abs() < 1e-9 {
                    continue;
                }
                let entry_price: f64 = pos["entryPx"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                // clearinghouseState carries notional, not markPx directly:
                // positionValue = |szi| * markPx. Fall back to entryPx if the
                // exchange omits positionValue (e.g. a brand-new position row).
                let position_value: f64 = pos["positionValue"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                let mark_price = if position_value > 0.0 { position_value / szi.abs() } else { entry_price };
                positions.push(Position {
                    owner_wallet: address.to_string(),
                    asset: pos["coin"].as_str().unwrap_or_default().to_string(),
                    side: if szi > 0.0 { PositionSide::Long } else { PositionSide::Short },
                    size: szi.abs(),
                    entry_price,
                    mark_price,
                    unrealized_pnl: pos["unrealizedPnl"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    margin_used: pos["marginUsed"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    updated_at: chrono::Utc::now(),
                });
            }
        }
        let margin = MarginSummary {
            account_value: data["marginSummary"]["accountValue"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            total_margin_used: data["marginSummary"]["totalMarginUsed"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            total_notional_position: data["marginSummary"]["totalNtlPos"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
        };
        UserState { positions, margin }
    }
}

#[async_trait]
impl ExchangeClient for LiveGateway {
    async fn get_metadata(&self) -> RelayResult<MetadataSnapshot> {
        let meta = self.post_info_retried(serde_json::json!({ "type": "meta" })).await?;
        let spot_meta = self.post_info_retried(serde_json::json!({ "type": "spotMeta" })).await.unwrap_or(serde_json::json!({}));
        let oi_caps = self.post_info_retried(serde_json::json!({ "type": "perpsAtOpenInterestCap" })).await.unwrap_or(serde_json::json!([]));
        Ok(Self::parse_metadata(&meta, &spot_meta, &oi_caps))
    }

    async fn get_order_book(&self, asset: &str) -> RelayResult<OrderBookSnapshot> {
        let data = self.post_info_retried(serde_json::json!({ "type": "l2Book", "coin": asset })).await?;
        let mut book = OrderBookSnapshot::default();
        if let Some(levels) = data["levels"].as_array() {
            let parse_side = |side: &serde_json::Value| -> Vec<OrderBookLevel> {
                side.as_array()
                    .map(|arr| {
                        arr.iter()
                            .take(20)
                            .map(|l| OrderBookLevel {
                                price: l["px"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                                size: l["sz"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                                order_count: l["n"].as_u64().unwrap_or(0) as u32,
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            };
            if let Some(bids) = levels.get(0) {
                book.bids = parse_side(bids);
            }
            if let Some(asks) = levels.get(1) {
                book.asks = parse_side(asks);
            }
        }
        Ok(book)
    }

    async fn get_user_state(&self, address: &str) -> RelayResult<UserState> {
        let data = self.post_info_retried(serde_json::json!({ "type": "clearinghouseState", "user": address })).await?;
        Ok(Self::parse_user_state(&data, address))
    }

    async fn get_active_asset_data(&self, address: &str, asset: &str) -> RelayResult<ActiveAssetData> {
        let data = self.post_info_retried(serde_json::json!({ "type": "activeAssetData", "user": address, "coin": asset })).await?;
        Ok(ActiveAssetData {
            max_trade_sz: data["maxTradeSzs"][0].as_f64().unwrap_or(f64::MAX),
            available_leverage: data["leverage"]["value"].as_f64().unwrap_or(1.0),
        })
    }

    async fn get_user_fills(&self, address: &str) -> RelayResult<Vec<UserFill>> {
        let data = self.post_info_retried(serde_json::json!({ "type": "userFills", "user": address })).await?;
        let mut fills = Vec::new();
        if let Some(arr) = data.as_array() {
            for f in arr {
                fills.push(UserFill {
                    asset: f["coin"].as_str().unwrap_or_default().to_string(),
                    is_buy: f["side"].as_str() == Some("B"),
                    size: f["sz"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    price: f["px"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    time_ms: f["time"].as_i64().unwrap_or(0),
                    fill_hash: f["hash"].as_str().unwrap_or_default().to_string(),
                });
            }
        }
        Ok(fills)
    }

    async fn get_user_fees(&self, address: &str) -> RelayResult<UserFees> {
        let data = self.post_info_retried(serde_json::json!({ "type": "userFees", "user": address })).await?;
        Ok(UserFees {
            taker_rate: data["userCrossRate"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.00035),
            maker_rate: data["userAddRate"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0001),
        })
    }

    async fn get_spot_balances(&self, address: &str) -> RelayResult<Vec<SpotBalance>> {
        let data = self.post_info_retried(serde_json::json!({ "type": "spotClearinghouseState", "user": address })).await?;
        let mut balances = Vec::new();
        if let Some(arr) = data["balances"].as_array() {
            for b in arr {
                balances.push(SpotBalance {
                    token: b["coin"].as_str().unwrap_or_default().to_string(),
                    available: b["total"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                });
            }
        }
        Ok(balances)
    }

    async fn place_orders(
        &self,
        orders: Vec<OrderIntent>,
        signer: &Signer,
        nonce: u64,
        grouping: &str,
    ) -> RelayResult<PlaceOrdersResult> {
        let wire_orders = orders
            .iter()
            .map(|o| crate::signing::OrderRequest {
                asset: o.asset,
                is_buy: o.is_buy,
                limit_px: crate::signing::float_to_wire(o.limit_px),
                sz: crate::signing::float_to_wire(o.sz),
                reduce_only: o.reduce_only,
                order_type: crate::signing::OrderTypeWire::Limit(crate::signing::LimitOrderWire { tif: o.tif.clone() }),
                cloid: o.cloid.clone(),
            })
            .collect();

        let (sig, action_json) = signer.sign_order_action(wire_orders, grouping, nonce).await?;
        let result = self.post_exchange(action_json, nonce, sig).await?;

        let mut statuses = Vec::with_capacity(orders.len());
        let wire_statuses = result["response"]["data"]["statuses"].as_array().cloned().unwrap_or_default();
        for (i, _) in orders.iter().enumerate() {
            let status = wire_statuses.get(i).cloned().unwrap_or(serde_json::Value::Null);
            if let Some(err) = status["error"].as_str() {
                statuses.push(OrderStatus::Error { msg: err.to_string() });
            } else if let Some(resting) = status["resting"].as_object() {
                let oid = resting["oid"].as_u64().unwrap_or(0);
                statuses.push(OrderStatus::Resting { oid });
            } else if let Some(filled) = status["filled"].as_object() {
                statuses.push(OrderStatus::Filled {
                    sz: filled["totalSz"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    avg_px: filled["avgPx"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                });
            } else {
                statuses.push(OrderStatus::Error { msg: "unrecognized order status shape".to_string() });
            }
        }
        Ok(PlaceOrdersResult { statuses })
    }

    async fn cancel(&self, asset: u32, oid: u64, signer: &Signer, nonce: u64) -> RelayResult<()> {
        let (sig, action_json) = signer.sign_cancel_action(asset, oid, nonce).await?;
        self.post_exchange(action_json, nonce, sig).await?;
        Ok(())
    }

    async fn cancel_by_cloid(&self, asset: u32, cloid: &str, signer: &Signer, nonce: u64) -> RelayResult<()> {
        let (sig, action_json) = signer.sign_cancel_by_cloid_action(asset, cloid, nonce).await?;
        self.post_exchange(action_json, nonce, sig).await?;
        Ok(())
    }

    async fn get_order_status(&self, address: &str, oid: u64) -> RelayResult<OrderStatus> {
        let data = self.post_info_retried(serde_json::json!({ "type": "orderStatus", "user": address, "oid": oid })).await?;
        let order = &data["order"];
        match order["status"].as_str().unwrap_or("unknown") {
            "filled" => Ok(OrderStatus::Filled {
                sz: order["order"]["sz"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                avg_px: order["order"]["limitPx"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            }),
            "open" | "triggered" => Ok(OrderStatus::Resting { oid }),
            other => Ok(OrderStatus::Error { msg: format!("order {} status: {}", oid, other) }),
        }
    }

    async fn stream_user(&self, address: &str) -> RelayResult<mpsc::Receiver<StreamEnvelope<UserEvent>>> {
        let (tx, rx) = mpsc::channel(1_000);
        let ws_url = self.config.ws_url.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            if let Err(e) = run_user_stream(ws_url, address, tx).await {
                log::error!("[GATEWAY] user stream ended: {}", e);
            }
        });
        Ok(rx)
    }

    async fn stream_trades(&self, asset: &str) -> RelayResult<mpsc::Receiver<PublicTrade>> {
        let (tx, rx) = mpsc::channel(1_000);
        let ws_url = self.config.ws_url.clone();
        let asset = asset.to_string();
        tokio::spawn(async move {
            if let Err(e) = run_trades_stream(ws_url, asset, tx).await {
                log::error!("[GATEWAY] trades stream ended: {}", e);
            }
        });
        Ok(rx)
    }
}

/// Single-shot WS connect + subscribe + forward loop for a user-event stream.
/// The Subscription Manager (D) owns reconnect/backoff on top of this; this
/// function is the thin per-attempt primitive, matching the separation the
/// teacher keeps between `ingestor::connect_and_listen`'s inner loop body and
/// its outer retry loop.
async fn run_user_stream(ws_url: String, address: String, tx: mpsc::Sender<StreamEnvelope<UserEvent>>) -> Result<(), RelayError> {
    let (ws_stream, _) = connect_async(Url::parse(&ws_url).map_err(|e| RelayError::Input(e.to_string()))?).await?;
    let (mut write, mut read) = ws_stream.split();
    let sub = serde_json::json!({ "method": "subscribe", "subscription": { "type": "userEvents", "user": address } });
    write.send(Message::Text(sub.to_string())).await?;

    let mut first = true;
    while let Some(msg) = read.next().await {
        let msg = msg?;
        if let Message::Text(text) = msg {
            let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) else {
                log::warn!("[GATEWAY] dropping malformed user-event frame");
                continue;
            };
            if parsed["channel"].as_str() != Some("user") {
                continue;
            }
            let is_snapshot = parsed["data"]["isSnapshot"].as_bool().unwrap_or(first);
            first = false;
            let event = parse_user_event(&parsed["data"]);
            if tx.send(StreamEnvelope { payload: event, is_snapshot }).await.is_err() {
                break; // receiver dropped
            }
        }
    }
    Ok(())
}

async fn run_trades_stream(ws_url: String, asset: String, tx: mpsc::Sender<PublicTrade>) -> Result<(), RelayError> {
    let (ws_stream, _) = connect_async(Url::parse(&ws_url).map_err(|e| RelayError::Input(e.to_string()))?).await?;
    let (mut write, mut read) = ws_stream.split();
    let sub = serde_json::json!({ "method": "subscribe", "subscription": { "type": "trades", "coin": asset } });
    write.send(Message::Text(sub.to_string())).await?;

    while let Some(msg) = read.next().await {
        let msg = msg?;
        if let Message::Text(text) = msg {
            let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) else { continue };
            if parsed["channel"].as_str() != Some("trades") {
                continue;
            }
            if let Some(arr) = parsed["data"].as_array() {
                for t in arr {
                    let trade = PublicTrade {
                        asset: t["coin"].as_str().unwrap_or_default().to_string(),
                        is_buy: t["side"].as_str() == Some("B"),
                        price: t["px"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                        size: t["sz"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                        time_ms: t["time"].as_i64().unwrap_or(0),
                    };
                    if tx.send(trade).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

fn parse_user_event(data: &serde_json::Value) -> UserEvent {
    if let Some(fills) = data["fills"].as_array() {
        if let Some(f) = fills.first() {
            return UserEvent::Fill(UserFill {
                asset: f["coin"].as_str().unwrap_or_default().to_string(),
                is_buy: f["side"].as_str() == Some("B"),
                size: f["sz"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                price: f["px"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                time_ms: f["time"].as_i64().unwrap_or(0),
                fill_hash: f["hash"].as_str().unwrap_or_default().to_string(),
            });
        }
    }
    if let Some(funding) = data["funding"].as_object() {
        return UserEvent::Funding {
            asset: funding.get("coin").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            usdc: funding.get("usdc").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
        };
    }
    if let Some(liq) = data["liquidation"].as_object() {
        return UserEvent::Liquidation { asset: liq.get("coin").and_then(|v| v.as_str()).unwrap_or_default().to_string() };
    }
    if let Some(cancel) = data["nonUserCancel"].as_array().and_then(|a| a.first()) {
        return UserEvent::NonUserCancel {
            asset: cancel["coin"].as_str().unwrap_or_default().to_string(),
            oid: cancel["oid"].as_u64().unwrap_or(0),
        };
    }
    UserEvent::Unknown
}

// ─── Sim gateway (in-memory, for tests) ────────────────────────────────────

/// An in-memory `ExchangeClient` used by tests throughout this crate,
/// matching the teacher's own `SimExchange` pattern: fixed metadata, a
/// configurable order book, and `place_orders` that always rests the order
/// unless pre-seeded with a different outcome.
pub struct SimGateway {
    pub metadata: MetadataSnapshot,
    pub books: HashMap<String, OrderBookSnapshot>,
    pub user_states: HashMap<String, UserState>,
    pub fees: UserFees,
    pub placed: Arc<tokio::sync::Mutex<Vec<(Vec<OrderIntent>, String)>>>,
}

impl SimGateway {
    pub fn new(metadata: MetadataSnapshot) -> Self {
        Self {
            metadata,
            books: HashMap::new(),
            user_states: HashMap::new(),
            fees: UserFees { taker_rate: 0.00035, maker_rate: 0.0001 },
            placed: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn with_book(mut self, asset: &str, book: OrderBookSnapshot) -> Self {
        self.books.insert(asset.to_string(), book);
        self
    }

    pub fn with_user_state(mut self, address: &str, state: UserState) -> Self {
        self.user_states.insert(address.to_string(), state);
        self
    }
}

#[async_trait]
impl ExchangeClient for SimGateway {
    async fn get_metadata(&self) -> RelayResult<MetadataSnapshot> {
        Ok(self.metadata.clone())
    }

    async fn get_order_book(&self, asset: &str) -> RelayResult<OrderBookSnapshot> {
        Ok(self.books.get(asset).cloned().unwrap_or_default())
    }

    async fn get_user_state(&self, address: &str) -> RelayResult<UserState> {
        Ok(self.user_states.get(address).cloned().unwrap_or(UserState {
            positions: Vec::new(),
            margin: MarginSummary { account_value: 1_000_000.0, total_margin_used: 0.0, total_notional_position: 0.0 },
        }))
    }

    async fn get_active_asset_data(&self, _address: &str, _asset: &str) -> RelayResult<ActiveAssetData> {
        Ok(ActiveAssetData { max_trade_sz: f64::MAX, available_leverage: 20.0 })
    }

    async fn get_user_fills(&self, _address: &str) -> RelayResult<Vec<UserFill>> {
        Ok(Vec::new())
    }

    async fn get_user_fees(&self, _address: &str) -> RelayResult<UserFees> {
        Ok(self.fees.clone())
    }

    async fn get_spot_balances(&self, _address: &str) -> RelayResult<Vec<SpotBalance>> {
        Ok(vec![SpotBalance { token: "USDC".to_string(), available: 1_000_000.0 }])
    }

    async fn place_orders(&self, orders: Vec<OrderIntent>, _signer: &Signer, _nonce: u64, grouping: &str) -> RelayResult<PlaceOrdersResult> {
        let statuses = orders.iter().map(|o| OrderStatus::Filled { sz: o.sz, avg_px: o.limit_px }).collect();
        self.placed.lock().await.push((orders, grouping.to_string()));
        Ok(PlaceOrdersResult { statuses })
    }

    async fn cancel(&self, _asset: u32, _oid: u64, _signer: &Signer, _nonce: u64) -> RelayResult<()> {
        Ok(())
    }

    async fn cancel_by_cloid(&self, _asset: u32, _cloid: &str, _signer: &Signer, _nonce: u64) -> RelayResult<()> {
        Ok(())
    }

    async fn get_order_status(&self, _address: &str, oid: u64) -> RelayResult<OrderStatus> {
        Ok(OrderStatus::Resting { oid })
    }

    async fn stream_user(&self, _address: &str) -> RelayResult<mpsc::Receiver<StreamEnvelope<UserEvent>>> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn stream_trades(&self, _asset: &str) -> RelayResult<mpsc::Receiver<PublicTrade>> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liquidity_up_to_sums_levels_until_size_met() {
        let book = OrderBookSnapshot {
            bids: vec![],
            asks: vec![
                OrderBookLevel { price: 100.0, size: 1.0, order_count: 1 },
                OrderBookLevel { price: 101.0, size: 2.0, order_count: 1 },
            ],
        };
        assert_eq!(book.liquidity_up_to(true, 2.5), 2.5);
        assert_eq!(book.liquidity_up_to(true, 10.0), 3.0);
    }

    #[test]
    fn parse_user_state_derives_mark_price_from_position_value() {
        let data = serde_json::json!({
            "assetPositions": [{
                "position": {
                    "coin": "BTC",
                    "szi": "1.5",
                    "entryPx": "100.0",
                    "positionValue": "150.0",
                    "unrealizedPnl": "0.0",
                    "marginUsed": "10.0",
                }
            }],
            "marginSummary": { "accountValue": "1000.0", "totalMarginUsed": "10.0", "totalNtlPos": "150.0" },
        });
        let state = LiveGateway::parse_user_state(&data, "0xWALLET");
        assert_eq!(state.positions.len(), 1);
        assert_eq!(state.positions[0].mark_price, 100.0);
    }

    #[test]
    fn parse_user_state_falls_back_to_entry_price_without_position_value() {
        let data = serde_json::json!({
            "assetPositions": [{
                "position": {
                    "coin": "BTC",
                    "szi": "-2.0",
                    "entryPx": "50.0",
                    "unrealizedPnl": "0.0",
                    "marginUsed": "5.0",
                }
            }],
            "marginSummary": { "accountValue": "1000.0", "totalMarginUsed": "5.0", "totalNtlPos": "100.0" },
        });
        let state = LiveGateway::parse_user_state(&data, "0xWALLET");
        assert_eq!(state.positions[0].mark_price, 50.0);
        assert!(matches!(state.positions[0].side, PositionSide::Short));
    }

    #[tokio::test]
    async fn sim_gateway_place_orders_fills_and_records() {
        let gw = SimGateway::new(MetadataSnapshot::default());
        let signer_config = crate::config::SignerConfig { chain_id: 1337, private_key: "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".to_string() };
        let signer = Signer::new(&signer_config, crate::signing::SigningDomain::LegacyAgent).unwrap();
        let orders = vec![OrderIntent { asset: 0, is_buy: true, limit_px: 30000.0, sz: 0.1, reduce_only: false, tif: "Ioc".to_string(), cloid: None }];
        let result = gw.place_orders(orders, &signer, 1, "na").await.unwrap();
        assert_eq!(result.statuses.len(), 1);
        assert!(matches!(result.statuses[0], OrderStatus::Filled { .. }));
        assert_eq!(gw.placed.lock().await.len(), 1);
    }
}
