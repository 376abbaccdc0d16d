//! Execution engine
//!
//! The periodic matching loop: reads open orders, pulls one quote per
//! distinct instrument, applies the trigger predicates, and settles fills
//! through the position manager. Also owns the mark-to-market refresh.
//!
//! Quotes are always fetched before any user lock is taken; the fill
//! transaction re-reads the order so a cancel that committed first wins.

use chrono::Utc;
use itertools::Itertools;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::funds::Ledger;
use crate::orders::new_id;
use crate::positions;
use crate::providers::QuoteProvider;
use crate::store::{self, Order, SandboxStore, Trade};
use crate::types::{Action, Exchange, Money, OrderStatus, PriceType, Quote, Symbol};

/// Counters reported after each engine tick
#[derive(Debug, Default, Clone, Copy)]
pub struct TickStats {
    pub examined: usize,
    pub filled: usize,
    pub quote_failures: usize,
    pub deferred: usize,
}

/// Decide whether the quote triggers the order; returns the execution price.
///
/// MARKET fills at bid/ask immediately; everything else fills at LTP on the
/// first tick its predicate holds.
pub fn execution_price(order: &Order, quote: &Quote) -> Option<Money> {
    let ltp = quote.ltp;
    match (order.price_type, order.action) {
        (PriceType::Market, action) => {
            let price = quote.market_price(action);
            price.is_positive().then_some(price)
        }
        (PriceType::Limit, Action::Buy) => {
            let price = order.price?;
            (ltp <= price).then_some(ltp)
        }
        (PriceType::Limit, Action::Sell) => {
            let price = order.price?;
            (ltp >= price).then_some(ltp)
        }
        (PriceType::Sl, Action::Buy) => {
            let (price, trigger) = (order.price?, order.trigger_price?);
            (ltp >= trigger && ltp <= price).then_some(ltp)
        }
        (PriceType::Sl, Action::Sell) => {
            let (price, trigger) = (order.price?, order.trigger_price?);
            (ltp <= trigger && ltp >= price).then_some(ltp)
        }
        (PriceType::Slm, Action::Buy) => {
            let trigger = order.trigger_price?;
            (ltp >= trigger).then_some(ltp)
        }
        (PriceType::Slm, Action::Sell) => {
            let trigger = order.trigger_price?;
            (ltp <= trigger).then_some(ltp)
        }
    }
}

/// Settle a fill: trade row, position netting, order completion.
/// Runs inside the caller's per-user transaction.
pub fn fill_order(
    conn: &Connection,
    ledger: &Ledger,
    order: &mut Order,
    exec_price: Money,
) -> SandboxResult<(Trade, positions::FillOutcome)> {
    let now = Utc::now();
    let trade = Trade {
        tradeid: new_id(),
        orderid: order.orderid.clone(),
        user_id: order.user_id.clone(),
        symbol: order.symbol.clone(),
        exchange: order.exchange,
        action: order.action,
        quantity: order.quantity,
        price: exec_price,
        product: order.product,
        trade_timestamp: now,
    };
    store::insert_trade(conn, &trade)?;

    let outcome = positions::apply_fill(conn, ledger, order, exec_price)?;

    order.order_status = OrderStatus::Complete;
    order.filled_quantity = order.quantity;
    order.pending_quantity = 0;
    order.average_price = Some(exec_price);
    order.update_timestamp = now;
    store::update_order(conn, order)?;

    Ok((trade, outcome))
}

/// Simple per-second request throttle for upstream quote calls
struct RateLimiter {
    per_second: u64,
    window_start: Instant,
    used: u64,
}

impl RateLimiter {
    fn new(per_second: u64) -> Self {
        Self {
            per_second: per_second.max(1),
            window_start: Instant::now(),
            used: 0,
        }
    }

    async fn acquire(&mut self) {
        if self.window_start.elapsed() >= Duration::from_secs(1) {
            self.window_start = Instant::now();
            self.used = 0;
        }
        if self.used >= self.per_second {
            let wait = Duration::from_secs(1).saturating_sub(self.window_start.elapsed());
            sleep(wait).await;
            self.window_start = Instant::now();
            self.used = 0;
        }
        self.used += 1;
    }
}

pub struct ExecutionEngine {
    store: Arc<SandboxStore>,
    config: Arc<SandboxConfig>,
    ledger: Arc<Ledger>,
    quotes: Arc<dyn QuoteProvider>,
    /// Quotes seen this tick, reused by the MTM refresh
    quote_cache: Mutex<HashMap<(Symbol, Exchange), Quote>>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<SandboxStore>,
        config: Arc<SandboxConfig>,
        ledger: Arc<Ledger>,
        quotes: Arc<dyn QuoteProvider>,
    ) -> Self {
        Self {
            store,
            config,
            ledger,
            quotes,
            quote_cache: Mutex::new(HashMap::new()),
        }
    }

    /// One pass over all open orders across all users
    pub async fn run_tick(&self) -> SandboxResult<TickStats> {
        let open = self.store.read(store::open_orders)?;
        let mut stats = TickStats {
            examined: open.len(),
            ..TickStats::default()
        };
        if open.is_empty() {
            return Ok(stats);
        }

        let instruments: Vec<(Symbol, Exchange)> = open
            .iter()
            .map(|o| (o.symbol.clone(), o.exchange))
            .unique()
            .collect();
        let quotes = self.fetch_quotes(&instruments).await;
        stats.quote_failures = instruments.len() - quotes.len();

        let fill_budget = self.config.order_rate_limit()?;
        let mut fills: u64 = 0;

        for order in open {
            let Some(quote) = quotes.get(&(order.symbol.clone(), order.exchange)) else {
                continue;
            };
            let Some(exec_price) = execution_price(&order, quote) else {
                continue;
            };
            if fills >= fill_budget {
                // Stay within broker-emulation limits; the trigger holds and
                // the next tick picks the order up again.
                stats.deferred += 1;
                continue;
            }

            let user = order.user_id.clone();
            let orderid = order.orderid.clone();
            let ledger = self.ledger.clone();
            let result = self.store.with_user_tx(&user, |conn| {
                // A cancel may have won the race since the read
                let Some(mut current) = store::get_order(conn, &user, &orderid)? else {
                    return Ok(false);
                };
                if !current.is_open() {
                    return Ok(false);
                }
                fill_order(conn, &ledger, &mut current, exec_price)?;
                Ok(true)
            });
            match result {
                Ok(true) => {
                    fills += 1;
                    stats.filled += 1;
                }
                Ok(false) => debug!(%orderid, "order no longer open, skipped"),
                Err(e) => warn!(%orderid, error = %e, "fill failed; order left open"),
            }
        }

        if stats.filled > 0 || stats.quote_failures > 0 {
            info!(
                examined = stats.examined,
                filled = stats.filled,
                quote_failures = stats.quote_failures,
                deferred = stats.deferred,
                "engine tick"
            );
        }
        Ok(stats)
    }

    /// Execute a synthetic order (square-off, close-position) immediately.
    /// The order is persisted and filled at bid/ask in one transaction; a
    /// quote without a tradeable price rejects it instead.
    pub async fn execute_synthetic(
        &self,
        mut order: Order,
    ) -> SandboxResult<(Trade, positions::FillOutcome)> {
        let quote = self
            .quotes
            .quote(&order.symbol, order.exchange)
            .await
            .map_err(|e| SandboxError::QuoteUnavailable {
                symbol: order.symbol.to_string(),
                exchange: order.exchange.to_string(),
                reason: e.to_string(),
            })?;
        let exec_price = quote.market_price(order.action);

        let user = order.user_id.clone();
        let ledger = self.ledger.clone();
        let symbol = order.symbol.to_string();
        let exchange = order.exchange.to_string();
        // The rejected row must survive the transaction, so the no-price
        // case commits Ok(None) and the error surfaces afterwards
        let filled = self.store.with_user_tx(&user, |conn| {
            store::insert_order(conn, &order)?;
            if !exec_price.is_positive() {
                order.order_status = OrderStatus::Rejected;
                order.rejection_reason = Some("no tradeable price in quote".to_string());
                order.update_timestamp = Utc::now();
                store::update_order(conn, &order)?;
                return Ok(None);
            }
            fill_order(conn, &ledger, &mut order, exec_price).map(Some)
        })?;
        filled.ok_or(SandboxError::QuoteUnavailable {
            symbol,
            exchange,
            reason: "no tradeable price in quote".to_string(),
        })
    }

    /// Refresh marks for every nonzero position and every holding, then
    /// roll each user's unrealized P&L up into their funds row.
    pub async fn refresh_mtm(&self) -> SandboxResult<()> {
        let open_positions = self.store.read(store::nonzero_positions)?;
        let holdings = self.store.read(store::all_holdings)?;
        if open_positions.is_empty() && holdings.is_empty() {
            return Ok(());
        }

        let instruments: Vec<(Symbol, Exchange)> = open_positions
            .iter()
            .map(|p| (p.symbol.clone(), p.exchange))
            .chain(holdings.iter().map(|h| (h.symbol.clone(), h.exchange)))
            .unique()
            .collect();
        let quotes = self.cached_or_fetch(&instruments).await;

        let users: Vec<String> = open_positions
            .iter()
            .map(|p| p.user_id.clone())
            .chain(holdings.iter().map(|h| h.user_id.clone()))
            .unique()
            .collect();

        for user in users {
            let ledger = self.ledger.clone();
            let quotes = &quotes;
            let result = self.store.with_user_tx(&user, |conn| {
                let mut unrealized_total = Money::ZERO;
                for position in store::positions_for_user(conn, &user)? {
                    if position.quantity == 0 {
                        continue;
                    }
                    let mut position = position;
                    if let Some(quote) =
                        quotes.get(&(position.symbol.clone(), position.exchange))
                    {
                        positions::refresh_mark(&mut position, quote.ltp);
                        store::upsert_position(conn, &position)?;
                    }
                    unrealized_total += positions::unrealized_pnl(
                        position.quantity,
                        position.average_price,
                        position.ltp,
                    );
                }
                for mut holding in store::holdings_for_user(conn, &user)? {
                    if let Some(quote) = quotes.get(&(holding.symbol.clone(), holding.exchange)) {
                        holding.ltp = quote.ltp;
                        let unrealized = positions::unrealized_pnl(
                            holding.quantity,
                            holding.average_price,
                            quote.ltp,
                        );
                        holding.pnl = unrealized;
                        holding.pnl_percent = positions::pnl_percent(
                            unrealized,
                            holding.average_price,
                            holding.quantity,
                        );
                        holding.updated_at = Utc::now();
                        store::upsert_holding(conn, &holding)?;
                    }
                }
                ledger.set_unrealized(conn, &user, unrealized_total.round_paise())
            });
            if let Err(e) = result {
                warn!(%user, error = %e, "MTM refresh failed for user");
            }
        }
        Ok(())
    }

    /// Fetch quotes for the instruments, capped at `api_rate_limit` calls
    /// per second. Failures are skipped; the affected orders wait a tick.
    async fn fetch_quotes(
        &self,
        instruments: &[(Symbol, Exchange)],
    ) -> HashMap<(Symbol, Exchange), Quote> {
        let per_second = self.config.api_rate_limit().unwrap_or(50);
        let mut limiter = RateLimiter::new(per_second);
        let mut fetched = HashMap::new();
        for (symbol, exchange) in instruments {
            limiter.acquire().await;
            match self.quotes.quote(symbol, *exchange).await {
                Ok(quote) => {
                    fetched.insert((symbol.clone(), *exchange), quote);
                }
                Err(e) => {
                    warn!(symbol = %symbol, exchange = %exchange, error = %e, "quote fetch failed");
                }
            }
        }
        let mut cache = self.quote_cache.lock().unwrap();
        *cache = fetched.clone();
        fetched
    }

    /// Serve from the tick cache where possible, fetching only the rest
    async fn cached_or_fetch(
        &self,
        instruments: &[(Symbol, Exchange)],
    ) -> HashMap<(Symbol, Exchange), Quote> {
        let mut result = HashMap::new();
        let missing: Vec<(Symbol, Exchange)> = {
            let cache = self.quote_cache.lock().unwrap();
            instruments
                .iter()
                .filter(|key| {
                    if let Some(quote) = cache.get(key) {
                        result.insert((*key).clone(), quote.clone());
                        false
                    } else {
                        true
                    }
                })
                .cloned()
                .collect()
        };

        if !missing.is_empty() {
            let per_second = self.config.api_rate_limit().unwrap_or(50);
            let mut limiter = RateLimiter::new(per_second);
            for (symbol, exchange) in &missing {
                limiter.acquire().await;
                match self.quotes.quote(symbol, *exchange).await {
                    Ok(quote) => {
                        result.insert((symbol.clone(), *exchange), quote);
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, exchange = %exchange, error = %e, "quote fetch failed");
                    }
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProductType;

    fn quote(ltp: i64, bid: i64, ask: i64) -> Quote {
        Quote {
            ltp: Money::from_i64(ltp),
            bid: Money::from_i64(bid),
            ask: Money::from_i64(ask),
            ltt: None,
        }
    }

    fn order(
        action: Action,
        price_type: PriceType,
        price: Option<i64>,
        trigger: Option<i64>,
    ) -> Order {
        let now = Utc::now();
        Order {
            orderid: "O1".to_string(),
            user_id: "alice".to_string(),
            symbol: Symbol::new("SBIN"),
            exchange: Exchange::Nse,
            action,
            quantity: 10,
            price: price.map(Money::from_i64),
            trigger_price: trigger.map(Money::from_i64),
            price_type,
            product: ProductType::Mis,
            order_status: OrderStatus::Open,
            filled_quantity: 0,
            pending_quantity: 10,
            average_price: None,
            rejection_reason: None,
            margin_blocked: Money::ZERO,
            order_timestamp: now,
            update_timestamp: now,
            strategy: None,
        }
    }

    #[test]
    fn test_limit_buy_predicate() {
        let o = order(Action::Buy, PriceType::Limit, Some(590), None);
        assert_eq!(execution_price(&o, &quote(591, 0, 0)), None);
        // Fills at LTP, not at the limit price
        assert_eq!(
            execution_price(&o, &quote(589, 0, 0)),
            Some(Money::from_i64(589))
        );
        assert_eq!(
            execution_price(&o, &quote(590, 0, 0)),
            Some(Money::from_i64(590))
        );
    }

    #[test]
    fn test_limit_sell_predicate() {
        let o = order(Action::Sell, PriceType::Limit, Some(600), None);
        assert_eq!(execution_price(&o, &quote(599, 0, 0)), None);
        assert_eq!(
            execution_price(&o, &quote(601, 0, 0)),
            Some(Money::from_i64(601))
        );
    }

    #[test]
    fn test_sl_buy_band() {
        // Armed at 605, bounded by 610
        let o = order(Action::Buy, PriceType::Sl, Some(610), Some(605));
        assert_eq!(execution_price(&o, &quote(604, 0, 0)), None);
        assert_eq!(
            execution_price(&o, &quote(606, 0, 0)),
            Some(Money::from_i64(606))
        );
        // Beyond the limit price: not satisfiable
        assert_eq!(execution_price(&o, &quote(611, 0, 0)), None);
    }

    #[test]
    fn test_sl_sell_band() {
        let o = order(Action::Sell, PriceType::Sl, Some(1450), Some(1455));
        assert_eq!(execution_price(&o, &quote(1458, 0, 0)), None);
        assert_eq!(
            execution_price(&o, &quote(1454, 0, 0)),
            Some(Money::from_i64(1454))
        );
        assert_eq!(execution_price(&o, &quote(1449, 0, 0)), None);
    }

    #[test]
    fn test_slm_predicates() {
        let buy = order(Action::Buy, PriceType::Slm, None, Some(605));
        assert_eq!(execution_price(&buy, &quote(604, 0, 0)), None);
        assert_eq!(
            execution_price(&buy, &quote(605, 0, 0)),
            Some(Money::from_i64(605))
        );

        let sell = order(Action::Sell, PriceType::Slm, None, Some(595));
        assert_eq!(execution_price(&sell, &quote(596, 0, 0)), None);
        assert_eq!(
            execution_price(&sell, &quote(594, 0, 0)),
            Some(Money::from_i64(594))
        );
    }

    #[test]
    fn test_market_uses_bid_ask_with_ltp_fallback() {
        let buy = order(Action::Buy, PriceType::Market, None, None);
        assert_eq!(
            execution_price(&buy, &quote(600, 599, 601)),
            Some(Money::from_i64(601))
        );
        let sell = order(Action::Sell, PriceType::Market, None, None);
        assert_eq!(
            execution_price(&sell, &quote(600, 0, 601)),
            Some(Money::from_i64(600))
        );
    }

    #[test]
    fn test_impossible_sl_never_fills() {
        // BUY SL with price below trigger: no LTP satisfies both arms
        let o = order(Action::Buy, PriceType::Sl, Some(600), Some(605));
        for ltp in [590, 600, 604, 605, 606, 650] {
            assert_eq!(execution_price(&o, &quote(ltp, 0, 0)), None);
        }
    }
}
