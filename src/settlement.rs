//! T+1 delivery settlement
//!
//! Runs at local midnight: CNC positions created before the start of today
//! leave the positions book. Buys merge into holdings and their blocked
//! margin stops counting as margin (the cash is now invested); sells reduce
//! the holding and credit sale proceeds at the recorded sale price. The
//! same sweep runs at startup as catch-up; a second run finds nothing.

use chrono::{DateTime, TimeZone, Utc};
use itertools::Itertools;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::SandboxConfig;
use crate::error::SandboxResult;
use crate::funds::Ledger;
use crate::store::{self, Holding, Position, SandboxStore};
use crate::types::Money;

#[derive(Debug, Default, Clone, Copy)]
pub struct SettlementStats {
    pub buys_settled: usize,
    pub sells_settled: usize,
    pub flat_removed: usize,
    pub failures: usize,
}

pub struct SettlementManager {
    store: Arc<SandboxStore>,
    config: Arc<SandboxConfig>,
    ledger: Arc<Ledger>,
}

impl SettlementManager {
    pub fn new(store: Arc<SandboxStore>, config: Arc<SandboxConfig>, ledger: Arc<Ledger>) -> Self {
        Self {
            store,
            config,
            ledger,
        }
    }

    /// Start of the current local day, as a UTC instant
    fn start_of_today(&self) -> DateTime<Utc> {
        let zone = self.config.zone();
        let today = Utc::now().with_timezone(&zone).date_naive();
        let midnight = today.and_hms_opt(0, 0, 0).unwrap();
        zone.from_local_datetime(&midnight)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    }

    /// Sweep CNC positions older than today into holdings
    pub fn settle_t1(&self) -> SandboxResult<SettlementStats> {
        let cutoff = self.start_of_today();
        let due = self
            .store
            .read(|conn| store::cnc_positions_created_before(conn, cutoff))?;
        let mut stats = SettlementStats::default();
        if due.is_empty() {
            return Ok(stats);
        }

        let users: Vec<String> = due.iter().map(|p| p.user_id.clone()).unique().collect();
        for user in users {
            let ledger = self.ledger.clone();
            let config = self.config.clone();
            let result = self.store.with_user_tx(&user, |conn| {
                // Re-read inside the lock; the engine may have netted rows
                // since the outer scan
                for position in store::cnc_positions_created_before(conn, cutoff)? {
                    if position.user_id != user {
                        continue;
                    }
                    match settle_position(conn, &ledger, &config, &position) {
                        Ok(kind) => match kind {
                            Settled::Buy => stats.buys_settled += 1,
                            Settled::Sell => stats.sells_settled += 1,
                            Settled::Flat => stats.flat_removed += 1,
                        },
                        Err(e) => {
                            stats.failures += 1;
                            warn!(
                                user = %position.user_id,
                                symbol = %position.symbol,
                                error = %e,
                                "T+1 settlement failed for position"
                            );
                        }
                    }
                }
                Ok(())
            });
            if let Err(e) = result {
                stats.failures += 1;
                warn!(%user, error = %e, "T+1 settlement transaction failed");
            }
        }

        info!(
            buys = stats.buys_settled,
            sells = stats.sells_settled,
            flat = stats.flat_removed,
            failures = stats.failures,
            "T+1 settlement sweep done"
        );
        Ok(stats)
    }

    /// Startup / sandbox-activation catch-up; same sweep, idempotent
    pub fn run_catchup(&self) -> SandboxResult<SettlementStats> {
        self.settle_t1()
    }
}

enum Settled {
    Buy,
    Sell,
    Flat,
}

fn settle_position(
    conn: &rusqlite::Connection,
    ledger: &Ledger,
    config: &SandboxConfig,
    position: &Position,
) -> SandboxResult<Settled> {
    let key = position.key();
    if position.quantity == 0 {
        store::delete_position(conn, &key)?;
        return Ok(Settled::Flat);
    }

    let zone = config.zone();
    let today = Utc::now().with_timezone(&zone).date_naive();
    let now = Utc::now();

    if position.quantity > 0 {
        // Delivered buy: merge into the holding at weighted-average cost
        let existing = store::get_holding(conn, &position.user_id, &position.symbol, position.exchange)?;
        let holding = match existing {
            Some(h) => {
                let new_qty = h.quantity + position.quantity;
                let new_avg = ((h.average_price.times(h.quantity)
                    + position.average_price.times(position.quantity))
                    / Money::from_i64(new_qty))
                .round_paise();
                Holding {
                    quantity: new_qty,
                    average_price: new_avg,
                    settlement_date: today,
                    updated_at: now,
                    ..h
                }
            }
            None => Holding {
                user_id: position.user_id.clone(),
                symbol: position.symbol.clone(),
                exchange: position.exchange,
                quantity: position.quantity,
                average_price: position.average_price,
                ltp: position.ltp,
                pnl: Money::ZERO,
                pnl_percent: 0.0,
                settlement_date: today,
                created_at: now,
                updated_at: now,
            },
        };
        store::upsert_holding(conn, &holding)?;
        ledger.transfer_margin_to_holdings(conn, &position.user_id, position.margin_blocked)?;
        store::delete_position(conn, &key)?;
        info!(
            user = %position.user_id,
            symbol = %position.symbol,
            qty = position.quantity,
            "CNC buy settled to holdings"
        );
        return Ok(Settled::Buy);
    }

    // Delivered sell: reduce the holding, credit proceeds at the sale price.
    // The profit against the holding's cost basis rides inside the proceeds,
    // so only the realized side of the ledger moves for it.
    let sold = position.quantity.abs();
    let mut realized = Money::ZERO;
    match store::get_holding(conn, &position.user_id, &position.symbol, position.exchange)? {
        Some(mut holding) => {
            realized = ((position.average_price - holding.average_price).times(sold)).round_paise();
            if holding.quantity < sold {
                warn!(
                    user = %position.user_id,
                    symbol = %position.symbol,
                    held = holding.quantity,
                    sold,
                    "holding smaller than settled sell; clamping to zero"
                );
                holding.quantity = 0;
            } else {
                holding.quantity -= sold;
            }
            if holding.quantity == 0 {
                store::delete_holding(conn, &position.user_id, &position.symbol, position.exchange)?;
            } else {
                holding.updated_at = now;
                store::upsert_holding(conn, &holding)?;
            }
        }
        None => {
            warn!(
                user = %position.user_id,
                symbol = %position.symbol,
                "no holding behind settled CNC sell"
            );
        }
    }
    let proceeds = position.average_price.times(sold).round_paise();
    ledger.credit_sale_proceeds(conn, &position.user_id, proceeds)?;
    ledger.book_realized(conn, &position.user_id, realized)?;
    store::delete_position(conn, &key)?;
    info!(
        user = %position.user_id,
        symbol = %position.symbol,
        qty = sold,
        proceeds = %proceeds,
        "CNC sell settled"
    );
    Ok(Settled::Sell)
}
