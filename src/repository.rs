// repository.rs — durable store capability boundary (spec §4.I).
//
// The teacher has no database at all (only `persistence.rs`'s JSON-file
// engine-state snapshot); this component is grounded instead on the pack's
// copy-trading-specific example, `copy_trading.rs` (hapticfish-RustRaptor):
// its `CopyRelation` row shape, `ON CONFLICT ... DO NOTHING` uniqueness
// enforcement, and Redis-cache-over-Postgres read path are the closest real
// analogue in the whole retrieval pack to this exact component. `sqlx` with
// the `sqlite` feature backs the default implementation (chosen over
// Postgres because persistence dialect is explicitly out of scope/abstract
// and a self-contained crate should need no external service); an
// `InMemoryRepository` backs unit tests, matching the teacher's own
// `SimExchange`-as-test-double idiom.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};
use crate::model::{Address, CopyTrade, Follower, Position, TradeRecord, TraderDiscovery};

#[async_trait]
pub trait Repository: Send + Sync {
    async fn put_follower(&self, follower: &Follower) -> RelayResult<()>;
    async fn list_followers_by_leader(&self, leader: &Address) -> RelayResult<Vec<Follower>>;
    /// Every active follower, regardless of leader — used once at startup to
    /// resume following leaders whose subscriptions outlive a process
    /// restart (spec §4.D: a leader is subscribed whenever it has ≥1 active
    /// follower, not only at the moment `add_follower` is called).
    async fn list_active_followers(&self) -> RelayResult<Vec<Follower>>;
    /// Followers copying through a given signing wallet — used by the
    /// Reconciliation Worker to resolve which followers' stop-loss/take-
    /// profit settings apply to a position keyed by `(owner_wallet, asset)`.
    async fn followers_by_signing_wallet(&self, wallet: &Address) -> RelayResult<Vec<Follower>>;
    async fn update_follower(&self, follower: &Follower) -> RelayResult<()>;
    async fn delete_follower(&self, id: Uuid) -> RelayResult<()>;

    /// Append-only insert; idempotent on `(leader_address, fill_hash)` for
    /// leader rows and `(follower_id, fill_hash)` for copy rows, so a retried
    /// dispatch never double-inserts the same fact (spec §7 idempotency).
    async fn put_trade(&self, trade: &TradeRecord) -> RelayResult<bool>;
    async fn put_copy_trade(&self, copy_trade: &CopyTrade) -> RelayResult<()>;

    async fn upsert_position(&self, position: &Position) -> RelayResult<()>;
    async fn list_positions_by_owner(&self, owner_wallet: &Address) -> RelayResult<Vec<Position>>;

    async fn put_trader_discovery(&self, discovery: &TraderDiscovery) -> RelayResult<()>;
    async fn top_traders(&self, limit: usize) -> RelayResult<Vec<TraderDiscovery>>;
    async fn performance_by_leader(&self, address: &Address, days: u32) -> RelayResult<Vec<TradeRecord>>;
}

// ─── In-memory implementation (tests) ──────────────────────────────────────

#[derive(Default)]
struct MemState {
    followers: HashMap<Uuid, Follower>,
    trade_hashes: std::collections::HashSet<(Address, String)>,
    trades: Vec<TradeRecord>,
    copy_trades: Vec<CopyTrade>,
    positions: HashMap<(Address, String), Position>,
    discoveries: HashMap<Address, TraderDiscovery>,
}

pub struct InMemoryRepository {
    state: RwLock<MemState>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self { state: RwLock::new(MemState::default()) }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn put_follower(&self, follower: &Follower) -> RelayResult<()> {
        let mut state = self.state.write().await;
        if state.followers.values().any(|f| f.owner_user_id == follower.owner_user_id && f.leader_address == follower.leader_address && f.id != follower.id) {
            return Err(RelayError::Input(format!("follower already exists for (user={}, leader={})", follower.owner_user_id, follower.leader_address)));
        }
        state.followers.insert(follower.id, follower.clone());
        Ok(())
    }

    async fn list_followers_by_leader(&self, leader: &Address) -> RelayResult<Vec<Follower>> {
        let state = self.state.read().await;
        Ok(state.followers.values().filter(|f| &f.leader_address == leader && f.is_active).cloned().collect())
    }

    async fn followers_by_signing_wallet(&self, wallet: &Address) -> RelayResult<Vec<Follower>> {
        let state = self.state.read().await;
        Ok(state.followers.values().filter(|f| &f.signing_wallet == wallet && f.is_active).cloned().collect())
    }

    async fn list_active_followers(&self) -> RelayResult<Vec<Follower>> {
        let state = self.state.read().await;
        Ok(state.followers.values().filter(|f| f.is_active).cloned().collect())
    }

    async fn update_follower(&self, follower: &Follower) -> RelayResult<()> {
        let mut state = self.state.write().await;
        let existing = state.followers.get(&follower.id).ok_or_else(|| RelayError::Input("unknown follower".to_string()))?;
        if existing.updated_at > follower.updated_at {
            return Err(RelayError::Input("stale update (optimistic concurrency)".to_string()));
        }
        let mut updated = follower.clone();
        updated.updated_at = Utc::now();
        state.followers.insert(follower.id, updated);
        Ok(())
    }

    async fn delete_follower(&self, id: Uuid) -> RelayResult<()> {
        self.state.write().await.followers.remove(&id);
        Ok(())
    }

    async fn put_trade(&self, trade: &TradeRecord) -> RelayResult<bool> {
        let mut state = self.state.write().await;
        let key = (trade.leader_address.clone(), trade.fill_hash.clone());
        if state.trade_hashes.contains(&key) && trade.is_leader_trade {
            return Ok(false);
        }
        state.trade_hashes.insert(key);
        state.trades.push(trade.clone());
        Ok(true)
    }

    async fn put_copy_trade(&self, copy_trade: &CopyTrade) -> RelayResult<()> {
        let mut state = self.state.write().await;
        if state.copy_trades.iter().any(|c| c.follower_id == copy_trade.follower_id && c.leader_fill_hash == copy_trade.leader_fill_hash) {
            return Ok(()); // idempotent no-op
        }
        state.copy_trades.push(copy_trade.clone());
        Ok(())
    }

    async fn upsert_position(&self, position: &Position) -> RelayResult<()> {
        let mut state = self.state.write().await;
        state.positions.insert((position.owner_wallet.clone(), position.asset.clone()), position.clone());
        Ok(())
    }

    async fn list_positions_by_owner(&self, owner_wallet: &Address) -> RelayResult<Vec<Position>> {
        let state = self.state.read().await;
        Ok(state.positions.values().filter(|p| &p.owner_wallet == owner_wallet).cloned().collect())
    }

    async fn put_trader_discovery(&self, discovery: &TraderDiscovery) -> RelayResult<()> {
        self.state.write().await.discoveries.insert(discovery.address.clone(), discovery.clone());
        Ok(())
    }

    async fn top_traders(&self, limit: usize) -> RelayResult<Vec<TraderDiscovery>> {
        let state = self.state.read().await;
        let mut all: Vec<TraderDiscovery> = state.discoveries.values().cloned().collect();
        all.sort_by(|a, b| b.volume_7d_usd.partial_cmp(&a.volume_7d_usd).unwrap_or(std::cmp::Ordering::Equal));
        all.truncate(limit);
        Ok(all)
    }

    async fn performance_by_leader(&self, address: &Address, days: u32) -> RelayResult<Vec<TradeRecord>> {
        let state = self.state.read().await;
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        Ok(state
            .trades
            .iter()
            .filter(|t| &t.leader_address == address && t.is_leader_trade && t.executed_at >= cutoff)
            .cloned()
            .collect())
    }
}

// ─── SQLite-backed implementation (default durable backend) ───────────────

pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub async fn connect(path: &str) -> RelayResult<Self> {
        let url = format!("sqlite://{}?mode=rwc", path);
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&url).await?;
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> RelayResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS followers (
                id TEXT PRIMARY KEY,
                owner_user_id TEXT NOT NULL,
                leader_address TEXT NOT NULL,
                signing_wallet TEXT NOT NULL,
                copy_percentage REAL NOT NULL,
                max_position_size REAL NOT NULL,
                stop_loss_pct REAL,
                take_profit_pct REAL,
                is_active INTEGER NOT NULL,
                risk_settings TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(owner_user_id, leader_address)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                leader_address TEXT NOT NULL,
                follower_id TEXT,
                asset TEXT NOT NULL,
                side TEXT NOT NULL,
                size REAL NOT NULL,
                price REAL NOT NULL,
                order_type TEXT NOT NULL,
                is_leader_trade INTEGER NOT NULL,
                executed_at TEXT NOT NULL,
                exchange_tx_id TEXT,
                status TEXT NOT NULL,
                fill_hash TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        // SQLite treats every NULL in a UNIQUE index as distinct from every
        // other NULL, so a single `UNIQUE(leader_address, fill_hash,
        // follower_id)` index never catches two leader rows (follower_id =
        // NULL) for the same fill — both insert and idempotency silently
        // breaks. Leader rows and copy rows are disjoint by `follower_id IS
        // NULL`, so two partial indexes, one per case, close that hole.
        sqlx::query(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS trades_leader_fill_hash_idx
               ON trades(leader_address, fill_hash) WHERE follower_id IS NULL"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS trades_follower_fill_hash_idx
               ON trades(follower_id, fill_hash) WHERE follower_id IS NOT NULL"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS copy_trades (
                id TEXT PRIMARY KEY,
                follower_id TEXT NOT NULL,
                leader_fill_hash TEXT NOT NULL,
                original_size REAL NOT NULL,
                original_price REAL NOT NULL,
                executed_size REAL,
                executed_price REAL,
                slippage_pct REAL,
                execution_delay_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(follower_id, leader_fill_hash)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                owner_wallet TEXT NOT NULL,
                asset TEXT NOT NULL,
                side TEXT NOT NULL,
                size REAL NOT NULL,
                entry_price REAL NOT NULL,
                mark_price REAL NOT NULL,
                unrealized_pnl REAL NOT NULL,
                margin_used REAL NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (owner_wallet, asset)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trader_discoveries (
                address TEXT PRIMARY KEY,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                volume_24h_usd REAL NOT NULL,
                volume_7d_usd REAL NOT NULL,
                win_rate_7d_pct REAL NOT NULL,
                tag TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn put_follower(&self, follower: &Follower) -> RelayResult<()> {
        let risk_settings = serde_json::to_string(&follower.risk_settings)?;
        sqlx::query(
            r#"INSERT INTO followers
                (id, owner_user_id, leader_address, signing_wallet, copy_percentage, max_position_size,
                 stop_loss_pct, take_profit_pct, is_active, risk_settings, created_at, updated_at)
               VALUES (?,?,?,?,?,?,?,?,?,?,?,?)
               ON CONFLICT(owner_user_id, leader_address) DO NOTHING"#,
        )
        .bind(follower.id.to_string())
        .bind(&follower.owner_user_id)
        .bind(&follower.leader_address)
        .bind(&follower.signing_wallet)
        .bind(follower.copy_percentage)
        .bind(follower.max_position_size)
        .bind(follower.stop_loss_pct)
        .bind(follower.take_profit_pct)
        .bind(follower.is_active as i64)
        .bind(risk_settings)
        .bind(follower.created_at.to_rfc3339())
        .bind(follower.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_followers_by_leader(&self, leader: &Address) -> RelayResult<Vec<Follower>> {
        let rows = sqlx::query("SELECT * FROM followers WHERE leader_address = ? AND is_active = 1")
            .bind(leader)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_follower).collect()
    }

    async fn followers_by_signing_wallet(&self, wallet: &Address) -> RelayResult<Vec<Follower>> {
        let rows = sqlx::query("SELECT * FROM followers WHERE signing_wallet = ? AND is_active = 1")
            .bind(wallet)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_follower).collect()
    }

    async fn list_active_followers(&self) -> RelayResult<Vec<Follower>> {
        let rows = sqlx::query("SELECT * FROM followers WHERE is_active = 1").fetch_all(&self.pool).await?;
        rows.iter().map(row_to_follower).collect()
    }

    async fn update_follower(&self, follower: &Follower) -> RelayResult<()> {
        let risk_settings = serde_json::to_string(&follower.risk_settings)?;
        let result = sqlx::query(
            r#"UPDATE followers SET copy_percentage=?, max_position_size=?, stop_loss_pct=?, take_profit_pct=?,
                is_active=?, risk_settings=?, updated_at=? WHERE id=? AND updated_at <= ?"#,
        )
        .bind(follower.copy_percentage)
        .bind(follower.max_position_size)
        .bind(follower.stop_loss_pct)
        .bind(follower.take_profit_pct)
        .bind(follower.is_active as i64)
        .bind(risk_settings)
        .bind(Utc::now().to_rfc3339())
        .bind(follower.id.to_string())
        .bind(follower.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RelayError::Input("stale update (optimistic concurrency) or unknown follower".to_string()));
        }
        Ok(())
    }

    async fn delete_follower(&self, id: Uuid) -> RelayResult<()> {
        sqlx::query("DELETE FROM followers WHERE id = ?").bind(id.to_string()).execute(&self.pool).await?;
        Ok(())
    }

    async fn put_trade(&self, trade: &TradeRecord) -> RelayResult<bool> {
        // Two conflict targets, one per partial unique index: leader rows
        // (follower_id IS NULL) dedupe on (leader_address, fill_hash), copy
        // rows dedupe on (follower_id, fill_hash). A row only ever matches
        // one of the two, since they partition on follower_id being NULL.
        let result = sqlx::query(
            r#"INSERT INTO trades
                (id, leader_address, follower_id, asset, side, size, price, order_type, is_leader_trade,
                 executed_at, exchange_tx_id, status, fill_hash)
               VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)
               ON CONFLICT(leader_address, fill_hash) WHERE follower_id IS NULL DO NOTHING
               ON CONFLICT(follower_id, fill_hash) WHERE follower_id IS NOT NULL DO NOTHING"#,
        )
        .bind(trade.id.to_string())
        .bind(&trade.leader_address)
        .bind(trade.follower_id.map(|id| id.to_string()))
        .bind(&trade.asset)
        .bind(serde_json::to_string(&trade.side)?)
        .bind(trade.size)
        .bind(trade.price)
        .bind(serde_json::to_string(&trade.order_type)?)
        .bind(trade.is_leader_trade as i64)
        .bind(trade.executed_at.to_rfc3339())
        .bind(&trade.exchange_tx_id)
        .bind(serde_json::to_string(&trade.status)?)
        .bind(&trade.fill_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn put_copy_trade(&self, copy_trade: &CopyTrade) -> RelayResult<()> {
        sqlx::query(
            r#"INSERT INTO copy_trades
                (id, follower_id, leader_fill_hash, original_size, original_price, executed_size, executed_price,
                 slippage_pct, execution_delay_ms, status, error_message, created_at)
               VALUES (?,?,?,?,?,?,?,?,?,?,?,?)
               ON CONFLICT(follower_id, leader_fill_hash) DO NOTHING"#,
        )
        .bind(copy_trade.id.to_string())
        .bind(copy_trade.follower_id.to_string())
        .bind(&copy_trade.leader_fill_hash)
        .bind(copy_trade.original_size)
        .bind(copy_trade.original_price)
        .bind(copy_trade.executed_size)
        .bind(copy_trade.executed_price)
        .bind(copy_trade.slippage_pct)
        .bind(copy_trade.execution_delay_ms as i64)
        .bind(serde_json::to_string(&copy_trade.status)?)
        .bind(&copy_trade.error_message)
        .bind(copy_trade.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_position(&self, position: &Position) -> RelayResult<()> {
        sqlx::query(
            r#"INSERT INTO positions (owner_wallet, asset, side, size, entry_price, mark_price, unrealized_pnl, margin_used, updated_at)
               VALUES (?,?,?,?,?,?,?,?,?)
               ON CONFLICT(owner_wallet, asset) DO UPDATE SET
                 side=excluded.side, size=excluded.size, entry_price=excluded.entry_price,
                 mark_price=excluded.mark_price, unrealized_pnl=excluded.unrealized_pnl,
                 margin_used=excluded.margin_used, updated_at=excluded.updated_at"#,
        )
        .bind(&position.owner_wallet)
        .bind(&position.asset)
        .bind(serde_json::to_string(&position.side)?)
        .bind(position.size)
        .bind(position.entry_price)
        .bind(position.mark_price)
        .bind(position.unrealized_pnl)
        .bind(position.margin_used)
        .bind(position.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_positions_by_owner(&self, owner_wallet: &Address) -> RelayResult<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions WHERE owner_wallet = ?").bind(owner_wallet).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_position).collect()
    }

    async fn put_trader_discovery(&self, discovery: &TraderDiscovery) -> RelayResult<()> {
        sqlx::query(
            r#"INSERT INTO trader_discoveries (address, first_seen, last_seen, volume_24h_usd, volume_7d_usd, win_rate_7d_pct, tag)
               VALUES (?,?,?,?,?,?,?)
               ON CONFLICT(address) DO UPDATE SET
                 last_seen=excluded.last_seen, volume_24h_usd=excluded.volume_24h_usd,
                 volume_7d_usd=excluded.volume_7d_usd, win_rate_7d_pct=excluded.win_rate_7d_pct, tag=excluded.tag"#,
        )
        .bind(&discovery.address)
        .bind(discovery.first_seen.to_rfc3339())
        .bind(discovery.last_seen.to_rfc3339())
        .bind(discovery.volume_24h_usd)
        .bind(discovery.volume_7d_usd)
        .bind(discovery.win_rate_7d_pct)
        .bind(&discovery.tag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn top_traders(&self, limit: usize) -> RelayResult<Vec<TraderDiscovery>> {
        let rows = sqlx::query("SELECT * FROM trader_discoveries ORDER BY volume_7d_usd DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_discovery).collect()
    }

    async fn performance_by_leader(&self, address: &Address, days: u32) -> RelayResult<Vec<TradeRecord>> {
        let cutoff = (Utc::now() - chrono::Duration::days(days as i64)).to_rfc3339();
        let rows = sqlx::query("SELECT * FROM trades WHERE leader_address = ? AND is_leader_trade = 1 AND executed_at >= ?")
            .bind(address)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_trade).collect()
    }
}

fn row_to_follower(row: &sqlx::sqlite::SqliteRow) -> RelayResult<Follower> {
    let risk_settings_raw: String = row.try_get("risk_settings")?;
    Ok(Follower {
        id: Uuid::parse_str(row.try_get::<String, _>("id")?.as_str()).map_err(|e| RelayError::Fatal(e.to_string()))?,
        owner_user_id: row.try_get("owner_user_id")?,
        leader_address: row.try_get("leader_address")?,
        signing_wallet: row.try_get("signing_wallet")?,
        copy_percentage: row.try_get("copy_percentage")?,
        max_position_size: row.try_get("max_position_size")?,
        stop_loss_pct: row.try_get("stop_loss_pct")?,
        take_profit_pct: row.try_get("take_profit_pct")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        risk_settings: serde_json::from_str(&risk_settings_raw)?,
        created_at: parse_rfc3339(row.try_get("created_at")?)?,
        updated_at: parse_rfc3339(row.try_get("updated_at")?)?,
    })
}

fn row_to_position(row: &sqlx::sqlite::SqliteRow) -> RelayResult<Position> {
    Ok(Position {
        owner_wallet: row.try_get("owner_wallet")?,
        asset: row.try_get("asset")?,
        side: serde_json::from_str(&row.try_get::<String, _>("side")?)?,
        size: row.try_get("size")?,
        entry_price: row.try_get("entry_price")?,
        mark_price: row.try_get("mark_price")?,
        unrealized_pnl: row.try_get("unrealized_pnl")?,
        margin_used: row.try_get("margin_used")?,
        updated_at: parse_rfc3339(row.try_get("updated_at")?)?,
    })
}

fn row_to_discovery(row: &sqlx::sqlite::SqliteRow) -> RelayResult<TraderDiscovery> {
    Ok(TraderDiscovery {
        address: row.try_get("address")?,
        first_seen: parse_rfc3339(row.try_get("first_seen")?)?,
        last_seen: parse_rfc3339(row.try_get("last_seen")?)?,
        volume_24h_usd: row.try_get("volume_24h_usd")?,
        volume_7d_usd: row.try_get("volume_7d_usd")?,
        win_rate_7d_pct: row.try_get("win_rate_7d_pct")?,
        tag: row.try_get("tag")?,
    })
}

fn row_to_trade(row: &sqlx::sqlite::SqliteRow) -> RelayResult<TradeRecord> {
    let follower_id_raw: Option<String> = row.try_get("follower_id")?;
    Ok(TradeRecord {
        id: Uuid::parse_str(&row.try_get::<String, _>("id")?).map_err(|e| RelayError::Fatal(e.to_string()))?,
        leader_address: row.try_get("leader_address")?,
        follower_id: follower_id_raw.and_then(|s| Uuid::parse_str(&s).ok()),
        asset: row.try_get("asset")?,
        side: serde_json::from_str(&row.try_get::<String, _>("side")?)?,
        size: row.try_get("size")?,
        price: row.try_get("price")?,
        order_type: serde_json::from_str(&row.try_get::<String, _>("order_type")?)?,
        is_leader_trade: row.try_get::<i64, _>("is_leader_trade")? != 0,
        executed_at: parse_rfc3339(row.try_get("executed_at")?)?,
        exchange_tx_id: row.try_get("exchange_tx_id")?,
        status: serde_json::from_str(&row.try_get::<String, _>("status")?)?,
        fill_hash: row.try_get("fill_hash")?,
    })
}

fn parse_rfc3339(s: String) -> RelayResult<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)).map_err(|e| RelayError::Fatal(e.to_string()))
}

/// Short-TTL read-through cache over `list_followers_by_leader`, used by the
/// Dispatcher (spec §4.E: "cached with short TTL", fixed at 2s — DESIGN.md).
pub struct FollowerCache {
    repo: Arc<dyn Repository>,
    ttl: std::time::Duration,
    cache: RwLock<HashMap<Address, (std::time::Instant, Vec<Follower>)>>,
}

impl FollowerCache {
    pub fn new(repo: Arc<dyn Repository>, ttl: std::time::Duration) -> Self {
        Self { repo, ttl, cache: RwLock::new(HashMap::new()) }
    }

    pub async fn followers_for(&self, leader: &Address) -> RelayResult<Vec<Follower>> {
        {
            let cache = self.cache.read().await;
            if let Some((fetched_at, followers)) = cache.get(leader) {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(followers.clone());
                }
            }
        }
        let fresh = self.repo.list_followers_by_leader(leader).await?;
        self.cache.write().await.insert(leader.clone(), (std::time::Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    pub async fn invalidate(&self, leader: &Address) {
        self.cache.write().await.remove(leader);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RiskSettings};

    fn sample_follower(leader: &str) -> Follower {
        let now = Utc::now();
        Follower {
            id: Uuid::new_v4(),
            owner_user_id: "user-1".to_string(),
            leader_address: leader.to_string(),
            signing_wallet: "0xWALLET".to_string(),
            copy_percentage: 50.0,
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
    async fn in_memory_repo_enforces_follower_uniqueness() {
        let repo = InMemoryRepository::new();
        let f1 = sample_follower("0xLEADER");
        repo.put_follower(&f1).await.unwrap();
        let mut f2 = sample_follower("0xLEADER");
        f2.id = Uuid::new_v4();
        assert!(repo.put_follower(&f2).await.is_err());
    }

    #[tokio::test]
    async fn follower_cache_serves_ttl_window_then_refetches() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let f = sample_follower("0xLEADER");
        repo.put_follower(&f).await.unwrap();
        let cache = FollowerCache::new(repo.clone(), std::time::Duration::from_millis(20));
        let first = cache.followers_for(&"0xLEADER".to_string()).await.unwrap();
        assert_eq!(first.len(), 1);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        cache.invalidate(&"0xLEADER".to_string()).await;
        let second = cache.followers_for(&"0xLEADER".to_string()).await.unwrap();
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn put_trade_is_idempotent_on_leader_fill_hash() {
        let repo = InMemoryRepository::new();
        let trade = TradeRecord {
            id: Uuid::new_v4(),
            leader_address: "0xLEADER".to_string(),
            follower_id: None,
            asset: "BTC".to_string(),
            side: crate::model::Side::Buy,
            size: 1.0,
            price: 30_000.0,
            order_type: crate::model::OrderType::Limit,
            is_leader_trade: true,
            executed_at: Utc::now(),
            exchange_tx_id: None,
            status: crate::model::TradeStatus::Filled,
            fill_hash: "hash-1".to_string(),
        };
        assert!(repo.put_trade(&trade).await.unwrap());
        assert!(!repo.put_trade(&trade).await.unwrap());
    }

    fn sample_trade(leader: &str, follower_id: Option<Uuid>, fill_hash: &str) -> TradeRecord {
        TradeRecord {
            id: Uuid::new_v4(),
            leader_address: leader.to_string(),
            follower_id,
            asset: "BTC".to_string(),
            side: crate::model::Side::Buy,
            size: 1.0,
            price: 30_000.0,
            order_type: crate::model::OrderType::Limit,
            is_leader_trade: follower_id.is_none(),
            executed_at: Utc::now(),
            exchange_tx_id: None,
            status: crate::model::TradeStatus::Filled,
            fill_hash: fill_hash.to_string(),
        }
    }

    /// Regression test for the NULL-distinctness bug: SQLite treats every
    /// NULL in a UNIQUE index as distinct, so a naive
    /// `UNIQUE(leader_address, fill_hash, follower_id)` index never catches
    /// two leader rows (follower_id = NULL) for the same fill. The partial
    /// indexes must close that hole on the actual durable backend, not just
    /// `InMemoryRepository`.
    #[tokio::test]
    async fn sqlite_repo_put_trade_is_idempotent_for_leader_rows() {
        let path = std::env::temp_dir().join(format!("copy-relay-test-{}.db", Uuid::new_v4()));
        let repo = SqliteRepository::connect(path.to_str().unwrap()).await.unwrap();

        let trade = sample_trade("0xLEADER", None, "hash-1");
        assert!(repo.put_trade(&trade).await.unwrap());
        let mut retried = sample_trade("0xLEADER", None, "hash-1");
        retried.id = Uuid::new_v4();
        assert!(!repo.put_trade(&retried).await.unwrap());

        // a second, distinct leader fact still inserts.
        let other = sample_trade("0xLEADER", None, "hash-2");
        assert!(repo.put_trade(&other).await.unwrap());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn sqlite_repo_put_trade_is_idempotent_for_copy_rows() {
        let path = std::env::temp_dir().join(format!("copy-relay-test-{}.db", Uuid::new_v4()));
        let repo = SqliteRepository::connect(path.to_str().unwrap()).await.unwrap();
        let follower_id = Uuid::new_v4();

        let trade = sample_trade("0xLEADER", Some(follower_id), "hash-1");
        assert!(repo.put_trade(&trade).await.unwrap());
        let mut retried = sample_trade("0xLEADER", Some(follower_id), "hash-1");
        retried.id = Uuid::new_v4();
        assert!(!repo.put_trade(&retried).await.unwrap());

        // the matching leader row (follower_id NULL) for the same fill_hash
        // is a distinct conflict target and still inserts.
        let leader_row = sample_trade("0xLEADER", None, "hash-1");
        assert!(repo.put_trade(&leader_row).await.unwrap());

        let _ = std::fs::remove_file(&path);
    }
}
