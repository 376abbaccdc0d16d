// SQLite persistence for the sandbox
//
// One connection behind a mutex, WAL mode, with a per-user lock registry so
// multi-step ledger transactions never interleave for the same user.
// Monetary columns are decimal TEXT; floats never enter the ledger path.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::{SandboxError, SandboxResult};
use crate::types::{Action, Exchange, Money, OrderStatus, PriceType, ProductType, Symbol};

// =============================================================================
// Data Models
// =============================================================================

#[derive(Debug, Clone)]
pub struct Order {
    pub orderid: String,
    pub user_id: String,
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub action: Action,
    pub quantity: i64,
    pub price: Option<Money>,
    pub trigger_price: Option<Money>,
    pub price_type: PriceType,
    pub product: ProductType,
    pub order_status: OrderStatus,
    pub filled_quantity: i64,
    pub pending_quantity: i64,
    pub average_price: Option<Money>,
    pub rejection_reason: Option<String>,
    pub margin_blocked: Money,
    pub order_timestamp: DateTime<Utc>,
    pub update_timestamp: DateTime<Utc>,
    pub strategy: Option<String>,
}

impl Order {
    pub fn is_open(&self) -> bool {
        self.order_status == OrderStatus::Open
    }
}

#[derive(Debug, Clone)]
pub struct Trade {
    pub tradeid: String,
    pub orderid: String,
    pub user_id: String,
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub action: Action,
    pub quantity: i64,
    pub price: Money,
    pub product: ProductType,
    pub trade_timestamp: DateTime<Utc>,
}

/// Unique key of a position row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub user_id: String,
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub product: ProductType,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub user_id: String,
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub product: ProductType,
    /// Signed: > 0 long, < 0 short, 0 flat (kept for P&L accumulation)
    pub quantity: i64,
    pub average_price: Money,
    pub ltp: Money,
    pub pnl: Money,
    pub pnl_percent: f64,
    pub accumulated_realized_pnl: Money,
    pub margin_blocked: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey {
            user_id: self.user_id.clone(),
            symbol: self.symbol.clone(),
            exchange: self.exchange,
            product: self.product,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == 0
    }
}

#[derive(Debug, Clone)]
pub struct Holding {
    pub user_id: String,
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub quantity: i64,
    pub average_price: Money,
    pub ltp: Money,
    pub pnl: Money,
    pub pnl_percent: f64,
    pub settlement_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Funds {
    pub user_id: String,
    pub total_capital: Money,
    pub available_balance: Money,
    pub used_margin: Money,
    pub realized_pnl: Money,
    pub unrealized_pnl: Money,
    pub total_pnl: Money,
    pub last_reset_date: DateTime<Utc>,
    pub reset_count: i64,
}

// =============================================================================
// Store
// =============================================================================

/// Per-user lock registry. Write-side work for a user is serialized behind
/// the user's entry; quote fetches happen before the lock is taken.
#[derive(Default)]
struct UserLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    fn lock_for(&self, user: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap();
        map.entry(user.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct SandboxStore {
    conn: Arc<Mutex<Connection>>,
    locks: UserLocks,
}

impl SandboxStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            locks: UserLocks::default(),
        };
        store.create_tables()?;
        info!("sandbox store initialized at {}", db_path.display());
        Ok(store)
    }

    /// In-memory database, used by tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            locks: UserLocks::default(),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS orders (
                orderid TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                action TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price TEXT,
                trigger_price TEXT,
                price_type TEXT NOT NULL,
                product TEXT NOT NULL,
                order_status TEXT NOT NULL,
                filled_quantity INTEGER NOT NULL DEFAULT 0,
                pending_quantity INTEGER NOT NULL,
                average_price TEXT,
                rejection_reason TEXT,
                margin_blocked TEXT NOT NULL DEFAULT '0',
                order_timestamp TEXT NOT NULL,
                update_timestamp TEXT NOT NULL,
                strategy TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_orders_user_status
                ON orders(user_id, order_status);

            CREATE TABLE IF NOT EXISTS trades (
                tradeid TEXT PRIMARY KEY,
                orderid TEXT NOT NULL,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                action TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price TEXT NOT NULL,
                product TEXT NOT NULL,
                trade_timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_orderid ON trades(orderid);

            CREATE TABLE IF NOT EXISTS positions (
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                product TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                average_price TEXT NOT NULL DEFAULT '0',
                ltp TEXT NOT NULL DEFAULT '0',
                pnl TEXT NOT NULL DEFAULT '0',
                pnl_percent REAL NOT NULL DEFAULT 0,
                accumulated_realized_pnl TEXT NOT NULL DEFAULT '0',
                margin_blocked TEXT NOT NULL DEFAULT '0',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, symbol, exchange, product)
            );

            CREATE TABLE IF NOT EXISTS holdings (
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                average_price TEXT NOT NULL,
                ltp TEXT NOT NULL DEFAULT '0',
                pnl TEXT NOT NULL DEFAULT '0',
                pnl_percent REAL NOT NULL DEFAULT 0,
                settlement_date TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, symbol, exchange)
            );

            CREATE TABLE IF NOT EXISTS funds (
                user_id TEXT PRIMARY KEY,
                total_capital TEXT NOT NULL,
                available_balance TEXT NOT NULL,
                used_margin TEXT NOT NULL DEFAULT '0',
                realized_pnl TEXT NOT NULL DEFAULT '0',
                unrealized_pnl TEXT NOT NULL DEFAULT '0',
                total_pnl TEXT NOT NULL DEFAULT '0',
                last_reset_date TEXT NOT NULL,
                reset_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        debug!("database schema created/verified");
        Ok(())
    }

    /// Run `f` inside a transaction while holding the user's write lock.
    /// Commit on Ok; the transaction rolls back when `f` errors.
    pub fn with_user_tx<T>(
        &self,
        user: &str,
        f: impl FnOnce(&Connection) -> SandboxResult<T>,
    ) -> SandboxResult<T> {
        let user_lock = self.locks.lock_for(user);
        let _guard = user_lock.lock().unwrap();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(SandboxError::Storage)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(SandboxError::Storage)?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    /// Cross-user transaction (config rewrites, weekly reset). Serializes on
    /// the connection itself; per-user locks are not taken.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> SandboxResult<T>) -> SandboxResult<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(SandboxError::Storage)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(SandboxError::Storage)?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    /// Read-only access; no user lock is taken
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> SandboxResult<T>) -> SandboxResult<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn parse_enum<T>(row_idx: usize, text: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    text.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            row_idx,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn parse_ts(row_idx: usize, text: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                row_idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_date(row_idx: usize, text: String) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            row_idx,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        orderid: row.get(0)?,
        user_id: row.get(1)?,
        symbol: Symbol::new(row.get::<_, String>(2)?),
        exchange: parse_enum(3, row.get::<_, String>(3)?)?,
        action: parse_enum(4, row.get::<_, String>(4)?)?,
        quantity: row.get(5)?,
        price: row.get(6)?,
        trigger_price: row.get(7)?,
        price_type: parse_enum(8, row.get::<_, String>(8)?)?,
        product: parse_enum(9, row.get::<_, String>(9)?)?,
        order_status: parse_enum(10, row.get::<_, String>(10)?)?,
        filled_quantity: row.get(11)?,
        pending_quantity: row.get(12)?,
        average_price: row.get(13)?,
        rejection_reason: row.get(14)?,
        margin_blocked: row.get(15)?,
        order_timestamp: parse_ts(16, row.get::<_, String>(16)?)?,
        update_timestamp: parse_ts(17, row.get::<_, String>(17)?)?,
        strategy: row.get(18)?,
    })
}

const ORDER_COLS: &str = "orderid, user_id, symbol, exchange, action, quantity, price, \
     trigger_price, price_type, product, order_status, filled_quantity, pending_quantity, \
     average_price, rejection_reason, margin_blocked, order_timestamp, update_timestamp, strategy";

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<Trade> {
    Ok(Trade {
        tradeid: row.get(0)?,
        orderid: row.get(1)?,
        user_id: row.get(2)?,
        symbol: Symbol::new(row.get::<_, String>(3)?),
        exchange: parse_enum(4, row.get::<_, String>(4)?)?,
        action: parse_enum(5, row.get::<_, String>(5)?)?,
        quantity: row.get(6)?,
        price: row.get(7)?,
        product: parse_enum(8, row.get::<_, String>(8)?)?,
        trade_timestamp: parse_ts(9, row.get::<_, String>(9)?)?,
    })
}

const TRADE_COLS: &str = "tradeid, orderid, user_id, symbol, exchange, action, quantity, \
     price, product, trade_timestamp";

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        user_id: row.get(0)?,
        symbol: Symbol::new(row.get::<_, String>(1)?),
        exchange: parse_enum(2, row.get::<_, String>(2)?)?,
        product: parse_enum(3, row.get::<_, String>(3)?)?,
        quantity: row.get(4)?,
        average_price: row.get(5)?,
        ltp: row.get(6)?,
        pnl: row.get(7)?,
        pnl_percent: row.get(8)?,
        accumulated_realized_pnl: row.get(9)?,
        margin_blocked: row.get(10)?,
        created_at: parse_ts(11, row.get::<_, String>(11)?)?,
        updated_at: parse_ts(12, row.get::<_, String>(12)?)?,
    })
}

const POSITION_COLS: &str = "user_id, symbol, exchange, product, quantity, average_price, \
     ltp, pnl, pnl_percent, accumulated_realized_pnl, margin_blocked, created_at, updated_at";

fn holding_from_row(row: &Row<'_>) -> rusqlite::Result<Holding> {
    Ok(Holding {
        user_id: row.get(0)?,
        symbol: Symbol::new(row.get::<_, String>(1)?),
        exchange: parse_enum(2, row.get::<_, String>(2)?)?,
        quantity: row.get(3)?,
        average_price: row.get(4)?,
        ltp: row.get(5)?,
        pnl: row.get(6)?,
        pnl_percent: row.get(7)?,
        settlement_date: parse_date(8, row.get::<_, String>(8)?)?,
        created_at: parse_ts(9, row.get::<_, String>(9)?)?,
        updated_at: parse_ts(10, row.get::<_, String>(10)?)?,
    })
}

const HOLDING_COLS: &str = "user_id, symbol, exchange, quantity, average_price, ltp, pnl, \
     pnl_percent, settlement_date, created_at, updated_at";

fn funds_from_row(row: &Row<'_>) -> rusqlite::Result<Funds> {
    Ok(Funds {
        user_id: row.get(0)?,
        total_capital: row.get(1)?,
        available_balance: row.get(2)?,
        used_margin: row.get(3)?,
        realized_pnl: row.get(4)?,
        unrealized_pnl: row.get(5)?,
        total_pnl: row.get(6)?,
        last_reset_date: parse_ts(7, row.get::<_, String>(7)?)?,
        reset_count: row.get(8)?,
    })
}

const FUNDS_COLS: &str = "user_id, total_capital, available_balance, used_margin, \
     realized_pnl, unrealized_pnl, total_pnl, last_reset_date, reset_count";

// =============================================================================
// Orders
// =============================================================================

pub fn insert_order(conn: &Connection, order: &Order) -> SandboxResult<()> {
    conn.execute(
        "INSERT INTO orders (orderid, user_id, symbol, exchange, action, quantity, price,
             trigger_price, price_type, product, order_status, filled_quantity,
             pending_quantity, average_price, rejection_reason, margin_blocked,
             order_timestamp, update_timestamp, strategy)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            order.orderid,
            order.user_id,
            order.symbol.as_str(),
            order.exchange.as_str(),
            order.action.as_str(),
            order.quantity,
            order.price,
            order.trigger_price,
            order.price_type.as_str(),
            order.product.as_str(),
            order.order_status.as_str(),
            order.filled_quantity,
            order.pending_quantity,
            order.average_price,
            order.rejection_reason,
            order.margin_blocked,
            ts(order.order_timestamp),
            ts(order.update_timestamp),
            order.strategy,
        ],
    )?;
    Ok(())
}

pub fn update_order(conn: &Connection, order: &Order) -> SandboxResult<()> {
    conn.execute(
        "UPDATE orders SET quantity = ?2, price = ?3, trigger_price = ?4, price_type = ?5,
             order_status = ?6, filled_quantity = ?7, pending_quantity = ?8,
             average_price = ?9, rejection_reason = ?10, margin_blocked = ?11,
             update_timestamp = ?12
         WHERE orderid = ?1",
        params![
            order.orderid,
            order.quantity,
            order.price,
            order.trigger_price,
            order.price_type.as_str(),
            order.order_status.as_str(),
            order.filled_quantity,
            order.pending_quantity,
            order.average_price,
            order.rejection_reason,
            order.margin_blocked,
            ts(order.update_timestamp),
        ],
    )?;
    Ok(())
}

pub fn get_order(conn: &Connection, user: &str, orderid: &str) -> SandboxResult<Option<Order>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLS} FROM orders WHERE orderid = ?1 AND user_id = ?2"
    ))?;
    Ok(stmt
        .query_row(params![orderid, user], order_from_row)
        .optional()?)
}

/// All open orders across users, oldest first (deterministic engine order)
pub fn open_orders(conn: &Connection) -> SandboxResult<Vec<Order>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLS} FROM orders WHERE order_status = 'open' ORDER BY order_timestamp ASC, orderid ASC"
    ))?;
    let rows = stmt.query_map([], order_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn open_orders_for_user(conn: &Connection, user: &str) -> SandboxResult<Vec<Order>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLS} FROM orders WHERE user_id = ?1 AND order_status = 'open'
         ORDER BY order_timestamp ASC, orderid ASC"
    ))?;
    let rows = stmt.query_map(params![user], order_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Open MIS orders on any exchange in the group
pub fn open_mis_orders_in(conn: &Connection, exchanges: &[Exchange]) -> SandboxResult<Vec<Order>> {
    let placeholders = exchanges.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT {ORDER_COLS} FROM orders
         WHERE order_status = 'open' AND product = 'MIS' AND exchange IN ({placeholders})
         ORDER BY order_timestamp ASC, orderid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let exchange_strs: Vec<&'static str> = exchanges.iter().map(|e| e.as_str()).collect();
    let params_vec: Vec<&dyn rusqlite::types::ToSql> = exchange_strs
        .iter()
        .map(|s| s as &dyn rusqlite::types::ToSql)
        .collect();
    let rows = stmt.query_map(params_vec.as_slice(), order_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn list_orders(
    conn: &Connection,
    user: &str,
    strategy: Option<&str>,
) -> SandboxResult<Vec<Order>> {
    let mut stmt;
    let rows = match strategy {
        Some(tag) => {
            stmt = conn.prepare(&format!(
                "SELECT {ORDER_COLS} FROM orders WHERE user_id = ?1 AND strategy = ?2
                 ORDER BY order_timestamp ASC, orderid ASC"
            ))?;
            stmt.query_map(params![user, tag], order_from_row)?
        }
        None => {
            stmt = conn.prepare(&format!(
                "SELECT {ORDER_COLS} FROM orders WHERE user_id = ?1
                 ORDER BY order_timestamp ASC, orderid ASC"
            ))?;
            stmt.query_map(params![user], order_from_row)?
        }
    };
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// =============================================================================
// Trades
// =============================================================================

pub fn insert_trade(conn: &Connection, trade: &Trade) -> SandboxResult<()> {
    conn.execute(
        "INSERT INTO trades (tradeid, orderid, user_id, symbol, exchange, action, quantity,
             price, product, trade_timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            trade.tradeid,
            trade.orderid,
            trade.user_id,
            trade.symbol.as_str(),
            trade.exchange.as_str(),
            trade.action.as_str(),
            trade.quantity,
            trade.price,
            trade.product.as_str(),
            ts(trade.trade_timestamp),
        ],
    )?;
    Ok(())
}

pub fn list_trades(conn: &Connection, user: &str) -> SandboxResult<Vec<Trade>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TRADE_COLS} FROM trades WHERE user_id = ?1 ORDER BY trade_timestamp ASC, tradeid ASC"
    ))?;
    let rows = stmt.query_map(params![user], trade_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn trades_for_order(conn: &Connection, orderid: &str) -> SandboxResult<Vec<Trade>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TRADE_COLS} FROM trades WHERE orderid = ?1"
    ))?;
    let rows = stmt.query_map(params![orderid], trade_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// =============================================================================
// Positions
// =============================================================================

pub fn get_position(conn: &Connection, key: &PositionKey) -> SandboxResult<Option<Position>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {POSITION_COLS} FROM positions
         WHERE user_id = ?1 AND symbol = ?2 AND exchange = ?3 AND product = ?4"
    ))?;
    Ok(stmt
        .query_row(
            params![
                key.user_id,
                key.symbol.as_str(),
                key.exchange.as_str(),
                key.product.as_str()
            ],
            position_from_row,
        )
        .optional()?)
}

pub fn upsert_position(conn: &Connection, position: &Position) -> SandboxResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO positions (user_id, symbol, exchange, product, quantity,
             average_price, ltp, pnl, pnl_percent, accumulated_realized_pnl, margin_blocked,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            position.user_id,
            position.symbol.as_str(),
            position.exchange.as_str(),
            position.product.as_str(),
            position.quantity,
            position.average_price,
            position.ltp,
            position.pnl,
            position.pnl_percent,
            position.accumulated_realized_pnl,
            position.margin_blocked,
            ts(position.created_at),
            ts(position.updated_at),
        ],
    )?;
    Ok(())
}

pub fn delete_position(conn: &Connection, key: &PositionKey) -> SandboxResult<()> {
    conn.execute(
        "DELETE FROM positions
         WHERE user_id = ?1 AND symbol = ?2 AND exchange = ?3 AND product = ?4",
        params![
            key.user_id,
            key.symbol.as_str(),
            key.exchange.as_str(),
            key.product.as_str()
        ],
    )?;
    Ok(())
}

pub fn positions_for_user(conn: &Connection, user: &str) -> SandboxResult<Vec<Position>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {POSITION_COLS} FROM positions WHERE user_id = ?1"
    ))?;
    let rows = stmt.query_map(params![user], position_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Nonzero positions across all users (MTM refresh set)
pub fn nonzero_positions(conn: &Connection) -> SandboxResult<Vec<Position>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {POSITION_COLS} FROM positions WHERE quantity != 0"
    ))?;
    let rows = stmt.query_map([], position_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn nonzero_mis_positions_in(
    conn: &Connection,
    exchanges: &[Exchange],
) -> SandboxResult<Vec<Position>> {
    let placeholders = exchanges.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT {POSITION_COLS} FROM positions
         WHERE quantity != 0 AND product = 'MIS' AND exchange IN ({placeholders})"
    );
    let mut stmt = conn.prepare(&sql)?;
    let exchange_strs: Vec<&'static str> = exchanges.iter().map(|e| e.as_str()).collect();
    let params_vec: Vec<&dyn rusqlite::types::ToSql> = exchange_strs
        .iter()
        .map(|s| s as &dyn rusqlite::types::ToSql)
        .collect();
    let rows = stmt.query_map(params_vec.as_slice(), position_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// CNC positions created before the given instant (T+1 sweep set)
pub fn cnc_positions_created_before(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> SandboxResult<Vec<Position>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {POSITION_COLS} FROM positions WHERE product = 'CNC' AND created_at < ?1"
    ))?;
    let rows = stmt.query_map(params![ts(cutoff)], position_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// =============================================================================
// Holdings
// =============================================================================

pub fn get_holding(
    conn: &Connection,
    user: &str,
    symbol: &Symbol,
    exchange: Exchange,
) -> SandboxResult<Option<Holding>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {HOLDING_COLS} FROM holdings WHERE user_id = ?1 AND symbol = ?2 AND exchange = ?3"
    ))?;
    Ok(stmt
        .query_row(
            params![user, symbol.as_str(), exchange.as_str()],
            holding_from_row,
        )
        .optional()?)
}

pub fn upsert_holding(conn: &Connection, holding: &Holding) -> SandboxResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO holdings (user_id, symbol, exchange, quantity, average_price,
             ltp, pnl, pnl_percent, settlement_date, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            holding.user_id,
            holding.symbol.as_str(),
            holding.exchange.as_str(),
            holding.quantity,
            holding.average_price,
            holding.ltp,
            holding.pnl,
            holding.pnl_percent,
            holding.settlement_date.format("%Y-%m-%d").to_string(),
            ts(holding.created_at),
            ts(holding.updated_at),
        ],
    )?;
    Ok(())
}

pub fn delete_holding(
    conn: &Connection,
    user: &str,
    symbol: &Symbol,
    exchange: Exchange,
) -> SandboxResult<()> {
    conn.execute(
        "DELETE FROM holdings WHERE user_id = ?1 AND symbol = ?2 AND exchange = ?3",
        params![user, symbol.as_str(), exchange.as_str()],
    )?;
    Ok(())
}

pub fn holdings_for_user(conn: &Connection, user: &str) -> SandboxResult<Vec<Holding>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {HOLDING_COLS} FROM holdings WHERE user_id = ?1"
    ))?;
    let rows = stmt.query_map(params![user], holding_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn all_holdings(conn: &Connection) -> SandboxResult<Vec<Holding>> {
    let mut stmt = conn.prepare(&format!("SELECT {HOLDING_COLS} FROM holdings"))?;
    let rows = stmt.query_map([], holding_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// =============================================================================
// Funds
// =============================================================================

pub fn get_funds(conn: &Connection, user: &str) -> SandboxResult<Option<Funds>> {
    let mut stmt = conn.prepare(&format!("SELECT {FUNDS_COLS} FROM funds WHERE user_id = ?1"))?;
    Ok(stmt.query_row(params![user], funds_from_row).optional()?)
}

/// Fetch the user's funds row, creating it at `starting_capital` on first touch
pub fn ensure_funds(conn: &Connection, user: &str, starting_capital: Money) -> SandboxResult<Funds> {
    if let Some(funds) = get_funds(conn, user)? {
        return Ok(funds);
    }
    let funds = Funds {
        user_id: user.to_string(),
        total_capital: starting_capital,
        available_balance: starting_capital,
        used_margin: Money::ZERO,
        realized_pnl: Money::ZERO,
        unrealized_pnl: Money::ZERO,
        total_pnl: Money::ZERO,
        last_reset_date: Utc::now(),
        reset_count: 0,
    };
    conn.execute(
        "INSERT INTO funds (user_id, total_capital, available_balance, used_margin,
             realized_pnl, unrealized_pnl, total_pnl, last_reset_date, reset_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            funds.user_id,
            funds.total_capital,
            funds.available_balance,
            funds.used_margin,
            funds.realized_pnl,
            funds.unrealized_pnl,
            funds.total_pnl,
            ts(funds.last_reset_date),
            funds.reset_count,
        ],
    )?;
    debug!(user, capital = %starting_capital, "provisioned funds row");
    Ok(funds)
}

pub fn update_funds(conn: &Connection, funds: &Funds) -> SandboxResult<()> {
    conn.execute(
        "UPDATE funds SET total_capital = ?2, available_balance = ?3, used_margin = ?4,
             realized_pnl = ?5, unrealized_pnl = ?6, total_pnl = ?7, last_reset_date = ?8,
             reset_count = ?9
         WHERE user_id = ?1",
        params![
            funds.user_id,
            funds.total_capital,
            funds.available_balance,
            funds.used_margin,
            funds.realized_pnl,
            funds.unrealized_pnl,
            funds.total_pnl,
            ts(funds.last_reset_date),
            funds.reset_count,
        ],
    )?;
    Ok(())
}

pub fn all_fund_users(conn: &Connection) -> SandboxResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT user_id FROM funds ORDER BY user_id")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// =============================================================================
// Config + session wipe
// =============================================================================

pub fn config_get(conn: &Connection, key: &str) -> SandboxResult<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM config WHERE key = ?1")?;
    Ok(stmt
        .query_row(params![key], |row| row.get::<_, String>(0))
        .optional()?)
}

pub fn config_set(conn: &Connection, key: &str, value: &str) -> SandboxResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

/// Delete every order, trade, position, and holding for the user.
/// Funds and config are reset separately.
pub fn wipe_user_session(conn: &Connection, user: &str) -> SandboxResult<()> {
    conn.execute("DELETE FROM orders WHERE user_id = ?1", params![user])?;
    conn.execute("DELETE FROM trades WHERE user_id = ?1", params![user])?;
    conn.execute("DELETE FROM positions WHERE user_id = ?1", params![user])?;
    conn.execute("DELETE FROM holdings WHERE user_id = ?1", params![user])?;
    Ok(())
}
