//! Ledger: per-user cash and margin bookkeeping
//!
//! The five monetary primitives run inside the caller's per-user
//! transaction; the ledger itself knows nothing about orders or positions.
//! A clamp that fires here means an upstream drift bug: the value is pinned
//! at zero, a warning is logged, and the violation counter is bumped.

use rusqlite::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::store::{self, Funds};
use crate::types::Money;

pub struct Ledger {
    config: Arc<SandboxConfig>,
    drift_violations: AtomicU64,
}

impl Ledger {
    pub fn new(config: Arc<SandboxConfig>) -> Self {
        Self {
            config,
            drift_violations: AtomicU64::new(0),
        }
    }

    /// Number of times a balance had to be clamped to stay non-negative
    pub fn drift_count(&self) -> u64 {
        self.drift_violations.load(Ordering::Relaxed)
    }

    fn funds_row(&self, conn: &Connection, user: &str) -> SandboxResult<Funds> {
        store::ensure_funds(conn, user, self.config.starting_capital()?)
    }

    /// Reserve margin for an order. Fails without mutation when the free
    /// balance cannot cover it.
    pub fn block_margin(&self, conn: &Connection, user: &str, amount: Money) -> SandboxResult<()> {
        let mut funds = self.funds_row(conn, user)?;
        if funds.available_balance < amount {
            return Err(SandboxError::InsufficientFunds {
                required: amount,
                available: funds.available_balance,
            });
        }
        funds.available_balance = (funds.available_balance - amount).round_paise();
        funds.used_margin = (funds.used_margin + amount).round_paise();
        store::update_funds(conn, &funds)?;
        debug!(user, %amount, available = %funds.available_balance, "margin blocked");
        Ok(())
    }

    /// Return margin to the free balance, booking any realized P&L from the
    /// fill that freed it. This is the only site where `realized_pnl` moves
    /// outside a reset.
    pub fn release_margin(
        &self,
        conn: &Connection,
        user: &str,
        amount: Money,
        realized_delta: Money,
    ) -> SandboxResult<()> {
        let mut funds = self.funds_row(conn, user)?;

        let release = if amount > funds.used_margin {
            self.drift_violations.fetch_add(1, Ordering::Relaxed);
            warn!(
                user,
                requested = %amount,
                used_margin = %funds.used_margin,
                "margin release exceeds used margin; clamping"
            );
            funds.used_margin
        } else {
            amount
        };

        funds.used_margin = (funds.used_margin - release).round_paise();
        funds.available_balance =
            (funds.available_balance + release + realized_delta).round_paise();
        if funds.available_balance.is_negative() {
            self.drift_violations.fetch_add(1, Ordering::Relaxed);
            warn!(
                user,
                balance = %funds.available_balance,
                "available balance went negative; clamping to zero"
            );
            funds.available_balance = Money::ZERO;
        }
        funds.realized_pnl = (funds.realized_pnl + realized_delta).round_paise();
        funds.total_pnl = (funds.realized_pnl + funds.unrealized_pnl).round_paise();
        store::update_funds(conn, &funds)?;
        debug!(
            user,
            released = %release,
            realized = %realized_delta,
            available = %funds.available_balance,
            "margin released"
        );
        Ok(())
    }

    /// T+1 settlement of a CNC buy: the blocked margin leaves `used_margin`
    /// without crediting the free balance; the cash is now invested.
    pub fn transfer_margin_to_holdings(
        &self,
        conn: &Connection,
        user: &str,
        amount: Money,
    ) -> SandboxResult<()> {
        let mut funds = self.funds_row(conn, user)?;
        let transfer = if amount > funds.used_margin {
            self.drift_violations.fetch_add(1, Ordering::Relaxed);
            warn!(
                user,
                requested = %amount,
                used_margin = %funds.used_margin,
                "holdings transfer exceeds used margin; clamping"
            );
            funds.used_margin
        } else {
            amount
        };
        funds.used_margin = (funds.used_margin - transfer).round_paise();
        store::update_funds(conn, &funds)?;
        debug!(user, %transfer, "margin transferred to holdings");
        Ok(())
    }

    /// T+1 settlement of a CNC sell: sale proceeds land in the free balance
    pub fn credit_sale_proceeds(
        &self,
        conn: &Connection,
        user: &str,
        amount: Money,
    ) -> SandboxResult<()> {
        let mut funds = self.funds_row(conn, user)?;
        funds.available_balance = (funds.available_balance + amount).round_paise();
        store::update_funds(conn, &funds)?;
        debug!(user, %amount, "sale proceeds credited");
        Ok(())
    }

    /// Book realized P&L whose cash already moved through another primitive
    /// (settlement proceeds carry the profit inside the credited amount)
    pub fn book_realized(
        &self,
        conn: &Connection,
        user: &str,
        realized_delta: Money,
    ) -> SandboxResult<()> {
        if realized_delta.is_zero() {
            return Ok(());
        }
        let mut funds = self.funds_row(conn, user)?;
        funds.realized_pnl = (funds.realized_pnl + realized_delta).round_paise();
        funds.total_pnl = (funds.realized_pnl + funds.unrealized_pnl).round_paise();
        store::update_funds(conn, &funds)?;
        debug!(user, realized = %realized_delta, "realized P&L booked");
        Ok(())
    }

    /// Replace the marked-to-market unrealized P&L
    pub fn set_unrealized(&self, conn: &Connection, user: &str, amount: Money) -> SandboxResult<()> {
        let mut funds = self.funds_row(conn, user)?;
        funds.unrealized_pnl = amount.round_paise();
        funds.total_pnl = (funds.realized_pnl + funds.unrealized_pnl).round_paise();
        store::update_funds(conn, &funds)
    }

    /// Restore the account to its starting capital
    pub fn reset(&self, conn: &Connection, user: &str) -> SandboxResult<()> {
        let mut funds = self.funds_row(conn, user)?;
        funds.available_balance = funds.total_capital;
        funds.used_margin = Money::ZERO;
        funds.realized_pnl = Money::ZERO;
        funds.unrealized_pnl = Money::ZERO;
        funds.total_pnl = Money::ZERO;
        funds.reset_count += 1;
        funds.last_reset_date = chrono::Utc::now();
        store::update_funds(conn, &funds)?;
        debug!(user, reset_count = funds.reset_count, "funds reset");
        Ok(())
    }
}
