//! Intraday square-off
//!
//! At each exchange group's cutoff, open MIS orders are cancelled and every
//! nonzero MIS position is force-closed through a synthetic reverse MARKET
//! order. Per-item failures are logged and never abort the sweep; an
//! every-minute backup pass repeats the sweep for any group already past
//! its cutoff in case the scheduled tick did not run.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::SandboxConfig;
use crate::error::SandboxResult;
use crate::execution::ExecutionEngine;
use crate::orders::{new_id, OrderManager};
use crate::store::{self, Order, Position, SandboxStore};
use crate::types::{Action, ExchangeGroup, Money, OrderStatus, PriceType};

pub const SQUARE_OFF_REASON: &str = "auto-cancelled at square-off";

#[derive(Debug, Default, Clone, Copy)]
pub struct SquareoffStats {
    pub orders_cancelled: usize,
    pub positions_closed: usize,
    pub failures: usize,
}

/// Synthetic MARKET order that flattens the position. Carries no blocked
/// margin of its own, so a forced close can never fail the funds check.
pub fn reverse_market_order(position: &Position) -> Order {
    let action = if position.quantity > 0 {
        Action::Sell
    } else {
        Action::Buy
    };
    let now = Utc::now();
    Order {
        orderid: new_id(),
        user_id: position.user_id.clone(),
        symbol: position.symbol.clone(),
        exchange: position.exchange,
        action,
        quantity: position.quantity.abs(),
        price: None,
        trigger_price: None,
        price_type: PriceType::Market,
        product: position.product,
        order_status: OrderStatus::Open,
        filled_quantity: 0,
        pending_quantity: position.quantity.abs(),
        average_price: None,
        rejection_reason: None,
        margin_blocked: Money::ZERO,
        order_timestamp: now,
        update_timestamp: now,
        strategy: None,
    }
}

pub struct SquareoffManager {
    store: Arc<SandboxStore>,
    config: Arc<SandboxConfig>,
    orders: Arc<OrderManager>,
    engine: Arc<ExecutionEngine>,
}

impl SquareoffManager {
    pub fn new(
        store: Arc<SandboxStore>,
        config: Arc<SandboxConfig>,
        orders: Arc<OrderManager>,
        engine: Arc<ExecutionEngine>,
    ) -> Self {
        Self {
            store,
            config,
            orders,
            engine,
        }
    }

    /// Cancel the group's open MIS orders, then flatten its MIS positions
    pub async fn square_off_group(&self, group: ExchangeGroup) -> SandboxResult<SquareoffStats> {
        let exchanges = group.members();
        let mut stats = SquareoffStats::default();

        let open_orders = self
            .store
            .read(|conn| store::open_mis_orders_in(conn, exchanges))?;
        for order in open_orders {
            match self.orders.cancel_with_reason(
                &order.user_id,
                &order.orderid,
                Some(SQUARE_OFF_REASON),
            ) {
                Ok(()) => stats.orders_cancelled += 1,
                Err(e) => {
                    stats.failures += 1;
                    warn!(orderid = %order.orderid, error = %e, "square-off cancel failed");
                }
            }
        }

        let positions = self
            .store
            .read(|conn| store::nonzero_mis_positions_in(conn, exchanges))?;
        for position in positions {
            let order = reverse_market_order(&position);
            match self.engine.execute_synthetic(order).await {
                Ok(_) => stats.positions_closed += 1,
                Err(e) => {
                    stats.failures += 1;
                    warn!(
                        user = %position.user_id,
                        symbol = %position.symbol,
                        error = %e,
                        "square-off close failed; position left open"
                    );
                }
            }
        }

        if stats.orders_cancelled > 0 || stats.positions_closed > 0 || stats.failures > 0 {
            info!(
                group = %group,
                cancelled = stats.orders_cancelled,
                closed = stats.positions_closed,
                failures = stats.failures,
                "square-off sweep done"
            );
        }
        Ok(stats)
    }

    /// Backup pass: sweep every group whose cutoff has already passed today.
    /// Idempotent; a clean group yields an empty sweep.
    pub async fn backup_sweep(&self) -> SandboxResult<()> {
        let now_local = Utc::now().with_timezone(&self.config.zone()).time();
        for group in ExchangeGroup::ALL {
            let cutoff = self.config.square_off_time(group)?;
            if now_local >= cutoff {
                if let Err(e) = self.square_off_group(group).await {
                    warn!(group = %group, error = %e, "backup square-off failed");
                }
            }
        }
        Ok(())
    }
}
