//! Order management
//!
//! Validates drafts, prices and blocks margin, persists orders, and serves
//! modify/cancel. MARKET orders execute inline in the placement transaction;
//! everything else waits for the engine loop.

use chrono::{NaiveTime, Utc};
use rand::Rng;
use rusqlite::Connection;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::execution;
use crate::funds::Ledger;
use crate::instruments::{is_future, is_option};
use crate::margin::{margin_required, must_block_margin};
use crate::providers::{QuoteProvider, SymbolMetaProvider};
use crate::store::{self, Order, PositionKey, SandboxStore};
use crate::types::{Action, Exchange, Money, OrderStatus, PriceType, ProductType, Symbol};

/// Exchange opening time in the deploy zone; MIS orders placed earlier are
/// gated like post-cutoff ones
fn market_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).unwrap()
}

/// Incoming order request, before validation
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub action: Action,
    pub quantity: i64,
    pub price: Option<Money>,
    pub trigger_price: Option<Money>,
    pub price_type: PriceType,
    pub product: ProductType,
    pub strategy: Option<String>,
}

impl OrderDraft {
    pub fn market(
        symbol: Symbol,
        exchange: Exchange,
        action: Action,
        quantity: i64,
        product: ProductType,
    ) -> Self {
        Self {
            symbol,
            exchange,
            action,
            quantity,
            price: None,
            trigger_price: None,
            price_type: PriceType::Market,
            product,
            strategy: None,
        }
    }

    pub fn limit(
        symbol: Symbol,
        exchange: Exchange,
        action: Action,
        quantity: i64,
        price: Money,
        product: ProductType,
    ) -> Self {
        Self {
            symbol,
            exchange,
            action,
            quantity,
            price: Some(price),
            trigger_price: None,
            price_type: PriceType::Limit,
            product,
            strategy: None,
        }
    }

    pub fn with_strategy(mut self, tag: impl Into<String>) -> Self {
        self.strategy = Some(tag.into());
        self
    }
}

/// Fields a modify may change; None leaves the field untouched
#[derive(Debug, Clone, Default)]
pub struct OrderChanges {
    pub quantity: Option<i64>,
    pub price: Option<Money>,
    pub trigger_price: Option<Money>,
    pub price_type: Option<PriceType>,
}

/// Result of a successful placement
#[derive(Debug, Clone)]
pub struct PlacementReceipt {
    pub orderid: String,
    pub margin_blocked: Money,
}

/// Process-local sequence folded into generated ids so ids minted within the
/// same millisecond stay distinct
static ID_SEQUENCE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Opaque id: millisecond timestamp, sequence, and a random suffix; unique
/// without coordination
pub fn new_id() -> String {
    let seq = ID_SEQUENCE.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % 1000;
    let suffix: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("{}{:03}{:04}", Utc::now().timestamp_millis(), seq, suffix)
}

pub struct OrderManager {
    store: Arc<SandboxStore>,
    config: Arc<SandboxConfig>,
    ledger: Arc<Ledger>,
    quotes: Arc<dyn QuoteProvider>,
    symbols: Arc<dyn SymbolMetaProvider>,
}

impl OrderManager {
    pub fn new(
        store: Arc<SandboxStore>,
        config: Arc<SandboxConfig>,
        ledger: Arc<Ledger>,
        quotes: Arc<dyn QuoteProvider>,
        symbols: Arc<dyn SymbolMetaProvider>,
    ) -> Self {
        Self {
            store,
            config,
            ledger,
            quotes,
            symbols,
        }
    }

    /// Validate, price, block margin, persist. MARKET drafts fill inline in
    /// the same transaction; the receipt then reflects a completed order.
    pub async fn place_order(
        &self,
        user: &str,
        draft: OrderDraft,
    ) -> SandboxResult<PlacementReceipt> {
        validate_draft(&draft)?;

        if !self
            .symbols
            .exists(&draft.symbol, draft.exchange)
            .await
            .map_err(|e| SandboxError::Internal(format!("symbol lookup failed: {e}")))?
        {
            return Err(SandboxError::Validation(format!(
                "unknown symbol {} on {}",
                draft.symbol, draft.exchange
            )));
        }

        let lot_size = self.lot_size_for(&draft).await?;
        if lot_size > 1 && draft.quantity % lot_size != 0 {
            return Err(SandboxError::Validation(format!(
                "quantity {} is not a multiple of lot size {lot_size}",
                draft.quantity
            )));
        }

        if draft.product == ProductType::Mis {
            self.mis_gate(user, &draft)?;
        }

        // Quotes are fetched before any lock is taken
        let quote = self
            .quotes
            .quote(&draft.symbol, draft.exchange)
            .await
            .map_err(|e| SandboxError::QuoteUnavailable {
                symbol: draft.symbol.to_string(),
                exchange: draft.exchange.to_string(),
                reason: e.to_string(),
            })?;

        if draft.price_type == PriceType::Market && !quote.market_price(draft.action).is_positive()
        {
            return Err(SandboxError::QuoteUnavailable {
                symbol: draft.symbol.to_string(),
                exchange: draft.exchange.to_string(),
                reason: "no tradeable price in quote".to_string(),
            });
        }

        let need = if must_block_margin(&draft) {
            margin_required(&self.config, &draft, quote.ltp, lot_size)?
        } else {
            Money::ZERO
        };

        let now = Utc::now();
        let order = Order {
            orderid: new_id(),
            user_id: user.to_string(),
            symbol: draft.symbol.clone(),
            exchange: draft.exchange,
            action: draft.action,
            quantity: draft.quantity,
            price: draft.price,
            trigger_price: draft.trigger_price,
            price_type: draft.price_type,
            product: draft.product,
            order_status: OrderStatus::Open,
            filled_quantity: 0,
            pending_quantity: draft.quantity,
            average_price: None,
            rejection_reason: None,
            margin_blocked: need,
            order_timestamp: now,
            update_timestamp: now,
            strategy: draft.strategy.clone(),
        };

        let orderid = order.orderid.clone();
        let ledger = self.ledger.clone();
        self.store.with_user_tx(user, |conn| {
            if need > Money::ZERO {
                ledger.block_margin(conn, user, need)?;
            }
            if draft.action == Action::Sell && draft.product == ProductType::Cnc {
                check_cnc_sell_cover(conn, user, &draft)?;
            }
            store::insert_order(conn, &order)?;

            if draft.price_type == PriceType::Market {
                let exec_price = quote.market_price(draft.action);
                let mut filled = order.clone();
                execution::fill_order(conn, &ledger, &mut filled, exec_price)?;
            }
            Ok(())
        })?;

        info!(
            user,
            %orderid,
            symbol = %draft.symbol,
            exchange = %draft.exchange,
            action = %draft.action,
            qty = draft.quantity,
            price_type = %draft.price_type,
            margin = %need,
            "order placed"
        );
        Ok(PlacementReceipt {
            orderid,
            margin_blocked: need,
        })
    }

    /// Re-price an open order. A margin increase that cannot be covered
    /// leaves the order unmodified.
    pub async fn modify_order(
        &self,
        user: &str,
        orderid: &str,
        changes: OrderChanges,
    ) -> SandboxResult<()> {
        // Snapshot outside the lock only to fail fast and to drive the
        // provider lookups; symbol, exchange, action, and product cannot
        // change on a modify. The requested changes are merged onto a fresh
        // read inside the lock so a concurrent modify is never overwritten.
        let current = self
            .store
            .read(|conn| store::get_order(conn, user, orderid))?
            .ok_or_else(|| SandboxError::OrderNotFound(orderid.to_string()))?;
        if current.order_status.is_terminal() {
            return Err(SandboxError::AlreadyTerminal {
                orderid: orderid.to_string(),
                status: current.order_status,
            });
        }

        let probe = OrderDraft {
            symbol: current.symbol.clone(),
            exchange: current.exchange,
            action: current.action,
            quantity: changes.quantity.unwrap_or(current.quantity),
            price: changes.price.or(current.price),
            trigger_price: changes.trigger_price.or(current.trigger_price),
            price_type: changes.price_type.unwrap_or(current.price_type),
            product: current.product,
            strategy: current.strategy.clone(),
        };
        let lot_size = self.lot_size_for(&probe).await?;
        let ltp = if probe.price_type == PriceType::Market {
            self.quotes
                .quote(&probe.symbol, probe.exchange)
                .await
                .map_err(|e| SandboxError::QuoteUnavailable {
                    symbol: probe.symbol.to_string(),
                    exchange: probe.exchange.to_string(),
                    reason: e.to_string(),
                })?
                .ltp
        } else {
            Money::ZERO
        };

        let ledger = self.ledger.clone();
        let new_margin = self.store.with_user_tx(user, |conn| {
            let mut order = store::get_order(conn, user, orderid)?
                .ok_or_else(|| SandboxError::OrderNotFound(orderid.to_string()))?;
            if order.order_status.is_terminal() {
                return Err(SandboxError::AlreadyTerminal {
                    orderid: orderid.to_string(),
                    status: order.order_status,
                });
            }

            let draft = OrderDraft {
                symbol: order.symbol.clone(),
                exchange: order.exchange,
                action: order.action,
                quantity: changes.quantity.unwrap_or(order.quantity),
                price: changes.price.or(order.price),
                trigger_price: changes.trigger_price.or(order.trigger_price),
                price_type: changes.price_type.unwrap_or(order.price_type),
                product: order.product,
                strategy: order.strategy.clone(),
            };
            validate_draft(&draft)?;
            if lot_size > 1 && draft.quantity % lot_size != 0 {
                return Err(SandboxError::Validation(format!(
                    "quantity {} is not a multiple of lot size {lot_size}",
                    draft.quantity
                )));
            }

            let new_margin = if must_block_margin(&draft) {
                margin_required(&self.config, &draft, ltp, lot_size)?
            } else {
                Money::ZERO
            };
            let delta = new_margin - order.margin_blocked;
            if delta > Money::ZERO {
                ledger.block_margin(conn, user, delta)?;
            } else if delta < Money::ZERO {
                ledger.release_margin(conn, user, -delta, Money::ZERO)?;
            }

            order.quantity = draft.quantity;
            order.pending_quantity = draft.quantity;
            order.price = draft.price;
            order.trigger_price = draft.trigger_price;
            order.price_type = draft.price_type;
            order.margin_blocked = new_margin;
            order.update_timestamp = Utc::now();
            store::update_order(conn, &order)?;
            Ok(new_margin)
        })?;

        info!(user, orderid, margin = %new_margin, "order modified");
        Ok(())
    }

    pub fn cancel_order(&self, user: &str, orderid: &str) -> SandboxResult<()> {
        self.cancel_with_reason(user, orderid, None)
    }

    /// Cancel an open order, releasing its blocked margin. A second cancel
    /// reports the terminal state without touching the ledger again.
    pub fn cancel_with_reason(
        &self,
        user: &str,
        orderid: &str,
        reason: Option<&str>,
    ) -> SandboxResult<()> {
        let ledger = self.ledger.clone();
        self.store.with_user_tx(user, |conn| {
            let mut order = store::get_order(conn, user, orderid)?
                .ok_or_else(|| SandboxError::OrderNotFound(orderid.to_string()))?;
            if order.order_status.is_terminal() {
                return Err(SandboxError::AlreadyTerminal {
                    orderid: orderid.to_string(),
                    status: order.order_status,
                });
            }

            if order.margin_blocked > Money::ZERO {
                ledger.release_margin(conn, user, order.margin_blocked, Money::ZERO)?;
            }
            order.order_status = OrderStatus::Cancelled;
            order.rejection_reason = reason.map(|r| r.to_string());
            order.update_timestamp = Utc::now();
            store::update_order(conn, &order)
        })?;

        info!(user, orderid, "order cancelled");
        Ok(())
    }

    /// Cancel every open order; individual failures are logged, the sweep
    /// continues. Returns the number cancelled.
    pub fn cancel_all(&self, user: &str) -> SandboxResult<usize> {
        let open = self
            .store
            .read(|conn| store::open_orders_for_user(conn, user))?;
        let mut cancelled = 0;
        for order in &open {
            match self.cancel_order(user, &order.orderid) {
                Ok(()) => cancelled += 1,
                Err(e) => {
                    warn!(user, orderid = %order.orderid, error = %e, "cancel failed during sweep")
                }
            }
        }
        info!(user, cancelled, of = open.len(), "cancel-all sweep done");
        Ok(cancelled)
    }

    async fn lot_size_for(&self, draft: &OrderDraft) -> SandboxResult<i64> {
        if !is_option(&draft.symbol, draft.exchange) && !is_future(&draft.symbol, draft.exchange) {
            return Ok(1);
        }
        let lot = self
            .symbols
            .lot_size(&draft.symbol, draft.exchange)
            .await
            .map_err(|e| SandboxError::Internal(format!("lot size lookup failed: {e}")))?;
        if lot < 1 {
            return Err(SandboxError::Internal(format!(
                "symbol master returned lot size {lot} for {}",
                draft.symbol
            )));
        }
        Ok(lot)
    }

    /// Outside trading hours MIS placement is allowed only when it reduces
    /// an existing open MIS position on the same key.
    fn mis_gate(&self, user: &str, draft: &OrderDraft) -> SandboxResult<()> {
        let cutoff = self.config.square_off_time(draft.exchange.group())?;
        let now_local = Utc::now().with_timezone(&self.config.zone()).time();
        if within_mis_window(now_local, cutoff) {
            return Ok(());
        }

        let key = PositionKey {
            user_id: user.to_string(),
            symbol: draft.symbol.clone(),
            exchange: draft.exchange,
            product: ProductType::Mis,
        };
        let position = self.store.read(|conn| store::get_position(conn, &key))?;
        let reduces = match position {
            Some(p) => {
                (draft.action == Action::Buy && p.quantity < 0)
                    || (draft.action == Action::Sell && p.quantity > 0)
            }
            None => false,
        };
        if reduces {
            return Ok(());
        }
        Err(SandboxError::MisCutoffBlocked {
            exchange: draft.exchange.to_string(),
        })
    }
}

/// MIS entry window: from open up to (excluding) the group cutoff
pub fn within_mis_window(now_local: NaiveTime, cutoff: NaiveTime) -> bool {
    now_local >= market_open() && now_local < cutoff
}

fn validate_draft(draft: &OrderDraft) -> SandboxResult<()> {
    if draft.quantity <= 0 {
        return Err(SandboxError::Validation(format!(
            "quantity must be positive, got {}",
            draft.quantity
        )));
    }
    match draft.price_type {
        PriceType::Market => {}
        PriceType::Limit => {
            if !draft.price.map(Money::is_positive).unwrap_or(false) {
                return Err(SandboxError::Validation(
                    "LIMIT order requires a positive price".into(),
                ));
            }
        }
        PriceType::Sl => {
            if !draft.price.map(Money::is_positive).unwrap_or(false) {
                return Err(SandboxError::Validation(
                    "SL order requires a positive price".into(),
                ));
            }
            if !draft.trigger_price.map(Money::is_positive).unwrap_or(false) {
                return Err(SandboxError::Validation(
                    "SL order requires a positive trigger price".into(),
                ));
            }
        }
        PriceType::Slm => {
            if !draft.trigger_price.map(Money::is_positive).unwrap_or(false) {
                return Err(SandboxError::Validation(
                    "SL-M order requires a positive trigger price".into(),
                ));
            }
        }
    }
    Ok(())
}

/// A CNC sell must be covered by delivered holdings plus any long CNC
/// position on the same instrument.
fn check_cnc_sell_cover(conn: &Connection, user: &str, draft: &OrderDraft) -> SandboxResult<()> {
    let held = store::get_holding(conn, user, &draft.symbol, draft.exchange)?
        .map(|h| h.quantity)
        .unwrap_or(0);
    let key = PositionKey {
        user_id: user.to_string(),
        symbol: draft.symbol.clone(),
        exchange: draft.exchange,
        product: ProductType::Cnc,
    };
    let positioned = store::get_position(conn, &key)?
        .map(|p| p.quantity.max(0))
        .unwrap_or(0);

    let cover = held + positioned;
    if cover < draft.quantity {
        return Err(SandboxError::InsufficientHoldings {
            symbol: draft.symbol.to_string(),
            requested: draft.quantity,
            held: cover,
        });
    }
    Ok(())
}
