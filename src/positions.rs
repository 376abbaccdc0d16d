//! Position netting
//!
//! One row per (user, symbol, exchange, product). Every fill lands here and
//! is netted against the existing row: open, add, reduce, close, or reverse.
//! This is the canonical site where margin is released back to the ledger
//! and realized P&L is booked.

use chrono::Utc;
use rusqlite::Connection;
use tracing::info;

use crate::error::SandboxResult;
use crate::funds::Ledger;
use crate::store::{self, Order, Position, PositionKey};
use crate::types::Money;

/// Ledger movement produced by netting one fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillOutcome {
    /// Margin released to the free balance (position slice + the order's own block)
    pub margin_released: Money,
    /// Realized P&L booked on the closed quantity
    pub realized_delta: Money,
}

/// Net a fill into the position row and settle its margin with the ledger.
///
/// `order.margin_blocked` is the amount reserved at placement; whatever part
/// of it does not stay on the position is released here, together with the
/// proportional slice of the position's stored margin for any closed
/// quantity. Runs inside the caller's per-user transaction.
pub fn apply_fill(
    conn: &Connection,
    ledger: &Ledger,
    order: &Order,
    exec_price: Money,
) -> SandboxResult<FillOutcome> {
    let key = PositionKey {
        user_id: order.user_id.clone(),
        symbol: order.symbol.clone(),
        exchange: order.exchange,
        product: order.product,
    };
    let existing = store::get_position(conn, &key)?;
    let now = Utc::now();

    let q_signed = order.action.sign() * order.quantity;
    let m_order = order.margin_blocked;

    let (position, outcome) = match existing {
        // Open: no prior row, or a flat row kept for its accumulated P&L
        None => (
            open_position(order, q_signed, exec_price, m_order, Money::ZERO),
            FillOutcome {
                margin_released: Money::ZERO,
                realized_delta: Money::ZERO,
            },
        ),
        Some(prior) if prior.quantity == 0 => {
            let mut reopened =
                open_position(order, q_signed, exec_price, m_order, prior.accumulated_realized_pnl);
            // The settlement clock restarts on reopen
            reopened.created_at = now;
            (
                reopened,
                FillOutcome {
                    margin_released: Money::ZERO,
                    realized_delta: Money::ZERO,
                },
            )
        }
        Some(prior) => net_against(&prior, q_signed, exec_price, m_order, order.quantity),
    };

    store::upsert_position(conn, &position)?;
    if outcome.margin_released > Money::ZERO || !outcome.realized_delta.is_zero() {
        ledger.release_margin(
            conn,
            &order.user_id,
            outcome.margin_released,
            outcome.realized_delta,
        )?;
    }

    info!(
        user = %order.user_id,
        symbol = %order.symbol,
        action = %order.action,
        qty = order.quantity,
        price = %exec_price,
        net_qty = position.quantity,
        realized = %outcome.realized_delta,
        "fill netted"
    );
    Ok(outcome)
}

fn open_position(
    order: &Order,
    q_signed: i64,
    exec_price: Money,
    m_order: Money,
    carried_realized: Money,
) -> Position {
    let now = Utc::now();
    let unrealized = Money::ZERO;
    Position {
        user_id: order.user_id.clone(),
        symbol: order.symbol.clone(),
        exchange: order.exchange,
        product: order.product,
        quantity: q_signed,
        average_price: exec_price,
        ltp: exec_price,
        pnl: carried_realized + unrealized,
        pnl_percent: 0.0,
        accumulated_realized_pnl: carried_realized,
        margin_blocked: m_order,
        created_at: now,
        updated_at: now,
    }
}

/// Net a fill against a nonzero row: add, reduce, close, or reverse
fn net_against(
    prior: &Position,
    q_signed: i64,
    exec_price: Money,
    m_order: Money,
    q_fill: i64,
) -> (Position, FillOutcome) {
    let q_old = prior.quantity;
    let q_new = q_old + q_signed;
    let now = Utc::now();
    let mut position = prior.clone();
    position.updated_at = now;
    position.ltp = exec_price;

    if q_old.signum() == q_signed.signum() {
        // Add: weighted-average entry, margins accumulate
        let total = q_old.abs() + q_signed.abs();
        position.average_price = ((prior.average_price.times(q_old.abs())
            + exec_price.times(q_signed.abs()))
            / Money::from_i64(total))
        .round_paise();
        position.quantity = q_new;
        position.margin_blocked = prior.margin_blocked + m_order;
        refresh_mark(&mut position, exec_price);
        return (
            position,
            FillOutcome {
                margin_released: Money::ZERO,
                realized_delta: Money::ZERO,
            },
        );
    }

    let direction = Money::from_i64(q_old.signum());

    if q_new == 0 {
        // Exact close: whole stored margin plus the order's own block comes back
        let delta = (direction * (exec_price - prior.average_price).times(q_old.abs()))
            .round_paise();
        position.quantity = 0;
        position.margin_blocked = Money::ZERO;
        position.accumulated_realized_pnl =
            (prior.accumulated_realized_pnl + delta).round_paise();
        position.pnl = position.accumulated_realized_pnl;
        position.pnl_percent = 0.0;
        return (
            position,
            FillOutcome {
                margin_released: prior.margin_blocked + m_order,
                realized_delta: delta,
            },
        );
    }

    if q_new.signum() == q_old.signum() {
        // Reduce: proportional margin release, entry price unchanged
        let closed = q_signed.abs();
        let delta =
            (direction * (exec_price - prior.average_price).times(closed)).round_paise();
        let m_rel = (prior.margin_blocked.times(closed) / Money::from_i64(q_old.abs()))
            .round_paise();
        position.quantity = q_new;
        position.margin_blocked = prior.margin_blocked - m_rel;
        position.accumulated_realized_pnl =
            (prior.accumulated_realized_pnl + delta).round_paise();
        refresh_mark(&mut position, exec_price);
        return (
            position,
            FillOutcome {
                margin_released: m_rel + m_order,
                realized_delta: delta,
            },
        );
    }

    // Reverse: close the old leg entirely, open the remainder the other way.
    // The fill's blocked margin splits pro rata between the closed and the
    // newly opened quantity.
    let q_close = q_old.abs();
    let delta = (direction * (exec_price - prior.average_price).times(q_close)).round_paise();
    let released_slice = (m_order.times(q_close) / Money::from_i64(q_fill)).round_paise();
    let kept_slice = m_order - released_slice;

    position.quantity = q_new;
    position.average_price = exec_price;
    position.margin_blocked = kept_slice;
    position.accumulated_realized_pnl = (prior.accumulated_realized_pnl + delta).round_paise();
    refresh_mark(&mut position, exec_price);
    (
        position,
        FillOutcome {
            margin_released: prior.margin_blocked + released_slice,
            realized_delta: delta,
        },
    )
}

/// Unrealized P&L of an open position at the given mark
pub fn unrealized_pnl(quantity: i64, average_price: Money, ltp: Money) -> Money {
    // sign(Q) * (ltp - avg) * |Q| collapses to (ltp - avg) * Q
    (ltp - average_price).times(quantity).round_paise()
}

/// Percent return on invested notional, 4 decimal places, display-only
pub fn pnl_percent(unrealized: Money, average_price: Money, quantity: i64) -> f64 {
    let invested = average_price.times(quantity.abs());
    if invested.is_zero() {
        return 0.0;
    }
    let pct = (unrealized / invested).to_f64() * 100.0;
    (pct * 10_000.0).round() / 10_000.0
}

/// Re-mark a position at `ltp`: refreshes `ltp`, `pnl`, `pnl_percent`
pub fn refresh_mark(position: &mut Position, ltp: Money) {
    position.ltp = ltp;
    if position.quantity == 0 {
        position.pnl = position.accumulated_realized_pnl;
        position.pnl_percent = 0.0;
        return;
    }
    let unrealized = unrealized_pnl(position.quantity, position.average_price, ltp);
    position.pnl = (position.accumulated_realized_pnl + unrealized).round_paise();
    position.pnl_percent = pnl_percent(unrealized, position.average_price, position.quantity);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::store::SandboxStore;
    use crate::types::{Action, Exchange, OrderStatus, PriceType, ProductType, Symbol};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn setup() -> (Arc<SandboxStore>, Ledger) {
        let store = Arc::new(SandboxStore::open_in_memory().unwrap());
        let config =
            Arc::new(SandboxConfig::new(store.clone(), chrono_tz::Asia::Kolkata).unwrap());
        (store, Ledger::new(config))
    }

    fn fill_order(action: Action, quantity: i64, margin: Money) -> Order {
        let now = Utc::now();
        Order {
            orderid: format!("T{}{}", action.as_str(), quantity),
            user_id: "alice".to_string(),
            symbol: Symbol::new("RELIANCE"),
            exchange: Exchange::Nse,
            action,
            quantity,
            price: None,
            trigger_price: None,
            price_type: PriceType::Market,
            product: ProductType::Mis,
            order_status: OrderStatus::Open,
            filled_quantity: 0,
            pending_quantity: quantity,
            average_price: None,
            rejection_reason: None,
            margin_blocked: margin,
            order_timestamp: now,
            update_timestamp: now,
            strategy: None,
        }
    }

    fn key() -> PositionKey {
        PositionKey {
            user_id: "alice".to_string(),
            symbol: Symbol::new("RELIANCE"),
            exchange: Exchange::Nse,
            product: ProductType::Mis,
        }
    }

    #[test]
    fn test_open_new_position() {
        let (store, ledger) = setup();
        store
            .with_user_tx("alice", |conn| {
                let margin = Money::new(dec!(24000));
                ledger.block_margin(conn, "alice", margin)?;
                let order = fill_order(Action::Buy, 100, margin);
                let outcome = apply_fill(conn, &ledger, &order, Money::new(dec!(1200)))?;
                assert_eq!(outcome.margin_released, Money::ZERO);

                let pos = store::get_position(conn, &key())?.unwrap();
                assert_eq!(pos.quantity, 100);
                assert_eq!(pos.average_price, Money::new(dec!(1200)));
                assert_eq!(pos.margin_blocked, margin);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_add_averages_entry() {
        let (store, ledger) = setup();
        store
            .with_user_tx("alice", |conn| {
                let m1 = Money::new(dec!(24000));
                ledger.block_margin(conn, "alice", m1)?;
                apply_fill(conn, &ledger, &fill_order(Action::Buy, 100, m1), Money::new(dec!(1200)))?;

                let m2 = Money::new(dec!(26000));
                ledger.block_margin(conn, "alice", m2)?;
                apply_fill(conn, &ledger, &fill_order(Action::Buy, 100, m2), Money::new(dec!(1300)))?;

                let pos = store::get_position(conn, &key())?.unwrap();
                assert_eq!(pos.quantity, 200);
                assert_eq!(pos.average_price, Money::new(dec!(1250)));
                assert_eq!(pos.margin_blocked, Money::new(dec!(50000)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_reduce_releases_proportional_margin() {
        let (store, ledger) = setup();
        store
            .with_user_tx("alice", |conn| {
                let m1 = Money::new(dec!(24000));
                ledger.block_margin(conn, "alice", m1)?;
                apply_fill(conn, &ledger, &fill_order(Action::Buy, 100, m1), Money::new(dec!(1200)))?;

                // Sell 40 out of 100 at 1250; order itself blocked 10000
                let m2 = Money::new(dec!(10000));
                ledger.block_margin(conn, "alice", m2)?;
                let outcome =
                    apply_fill(conn, &ledger, &fill_order(Action::Sell, 40, m2), Money::new(dec!(1250)))?;

                // 40% of 24000 plus the closing order's own block
                assert_eq!(outcome.margin_released, Money::new(dec!(19600)));
                assert_eq!(outcome.realized_delta, Money::new(dec!(2000)));

                let pos = store::get_position(conn, &key())?.unwrap();
                assert_eq!(pos.quantity, 60);
                assert_eq!(pos.average_price, Money::new(dec!(1200)));
                assert_eq!(pos.margin_blocked, Money::new(dec!(14400)));
                assert_eq!(pos.accumulated_realized_pnl, Money::new(dec!(2000)));

                let funds = store::get_funds(conn, "alice")?.unwrap();
                assert_eq!(funds.used_margin, Money::new(dec!(14400)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_exact_close_preserves_accumulated_pnl() {
        let (store, ledger) = setup();
        store
            .with_user_tx("alice", |conn| {
                let m1 = Money::new(dec!(24000));
                ledger.block_margin(conn, "alice", m1)?;
                apply_fill(conn, &ledger, &fill_order(Action::Buy, 100, m1), Money::new(dec!(1200)))?;

                let m2 = Money::new(dec!(25000));
                ledger.block_margin(conn, "alice", m2)?;
                let outcome =
                    apply_fill(conn, &ledger, &fill_order(Action::Sell, 100, m2), Money::new(dec!(1250)))?;
                assert_eq!(outcome.realized_delta, Money::new(dec!(5000)));
                assert_eq!(outcome.margin_released, Money::new(dec!(49000)));

                let pos = store::get_position(conn, &key())?.unwrap();
                assert_eq!(pos.quantity, 0);
                assert_eq!(pos.margin_blocked, Money::ZERO);
                assert_eq!(pos.accumulated_realized_pnl, Money::new(dec!(5000)));
                assert_eq!(pos.pnl, Money::new(dec!(5000)));

                let funds = store::get_funds(conn, "alice")?.unwrap();
                assert_eq!(funds.used_margin, Money::ZERO);
                assert_eq!(funds.available_balance, Money::new(dec!(10005000)));
                assert_eq!(funds.realized_pnl, Money::new(dec!(5000)));

                // Reopening on the flat row carries the accumulated P&L forward
                let m3 = Money::new(dec!(12000));
                ledger.block_margin(conn, "alice", m3)?;
                apply_fill(conn, &ledger, &fill_order(Action::Buy, 50, m3), Money::new(dec!(1220)))?;
                let pos = store::get_position(conn, &key())?.unwrap();
                assert_eq!(pos.quantity, 50);
                assert_eq!(pos.accumulated_realized_pnl, Money::new(dec!(5000)));
                assert_eq!(pos.average_price, Money::new(dec!(1220)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_reversal_splits_order_margin() {
        let (store, ledger) = setup();
        store
            .with_user_tx("alice", |conn| {
                let m1 = Money::new(dec!(24000));
                ledger.block_margin(conn, "alice", m1)?;
                apply_fill(conn, &ledger, &fill_order(Action::Buy, 100, m1), Money::new(dec!(1200)))?;

                // Sell 200 at 1250: closes 100, opens 100 short
                let m2 = Money::new(dec!(50000));
                ledger.block_margin(conn, "alice", m2)?;
                let outcome =
                    apply_fill(conn, &ledger, &fill_order(Action::Sell, 200, m2), Money::new(dec!(1250)))?;

                // Half the fill's margin follows the closed leg out
                assert_eq!(outcome.margin_released, Money::new(dec!(49000)));
                assert_eq!(outcome.realized_delta, Money::new(dec!(5000)));

                let pos = store::get_position(conn, &key())?.unwrap();
                assert_eq!(pos.quantity, -100);
                assert_eq!(pos.average_price, Money::new(dec!(1250)));
                assert_eq!(pos.margin_blocked, Money::new(dec!(25000)));

                let funds = store::get_funds(conn, "alice")?.unwrap();
                assert_eq!(funds.used_margin, Money::new(dec!(25000)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_short_reduce_realizes_gain_on_fall() {
        let (store, ledger) = setup();
        store
            .with_user_tx("alice", |conn| {
                let m1 = Money::new(dec!(30000));
                ledger.block_margin(conn, "alice", m1)?;
                apply_fill(conn, &ledger, &fill_order(Action::Sell, 100, m1), Money::new(dec!(1500)))?;

                let m2 = Money::new(dec!(14500));
                ledger.block_margin(conn, "alice", m2)?;
                let outcome =
                    apply_fill(conn, &ledger, &fill_order(Action::Buy, 50, m2), Money::new(dec!(1450)))?;

                // Short from 1500, bought back at 1450: +50 x 50
                assert_eq!(outcome.realized_delta, Money::new(dec!(2500)));
                let pos = store::get_position(conn, &key())?.unwrap();
                assert_eq!(pos.quantity, -50);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_pnl_percent_sign() {
        let unrealized = unrealized_pnl(-10, Money::new(dec!(100)), Money::new(dec!(110)));
        assert_eq!(unrealized, Money::new(dec!(-100)));
        let pct = pnl_percent(unrealized, Money::new(dec!(100)), -10);
        assert!((pct + 10.0).abs() < 1e-9);
    }
}
