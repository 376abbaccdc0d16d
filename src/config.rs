//! Configuration management
//!
//! Typed key/value store for leverages, cutoff times, intervals, and capital.
//! Every write is validated against its range; a failed write leaves state
//! unchanged. Successful writes report the effects the caller must apply
//! (reschedule a job, rebase fund balances).

use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::info;

use crate::error::{SandboxError, SandboxResult};
use crate::store::{self, SandboxStore};
use crate::types::{ExchangeGroup, Money};

/// Config keys. Writes outside this set are rejected.
pub mod keys {
    pub const STARTING_CAPITAL: &str = "starting_capital";
    pub const RESET_DAY: &str = "reset_day";
    pub const RESET_TIME: &str = "reset_time";
    pub const ORDER_CHECK_INTERVAL: &str = "order_check_interval";
    pub const MTM_UPDATE_INTERVAL: &str = "mtm_update_interval";
    pub const NSE_BSE_SQUARE_OFF_TIME: &str = "nse_bse_square_off_time";
    pub const CDS_BCD_SQUARE_OFF_TIME: &str = "cds_bcd_square_off_time";
    pub const MCX_SQUARE_OFF_TIME: &str = "mcx_square_off_time";
    pub const NCDEX_SQUARE_OFF_TIME: &str = "ncdex_square_off_time";
    pub const EQUITY_MIS_LEVERAGE: &str = "equity_mis_leverage";
    pub const EQUITY_CNC_LEVERAGE: &str = "equity_cnc_leverage";
    pub const FUTURES_LEVERAGE: &str = "futures_leverage";
    pub const OPTION_BUY_LEVERAGE: &str = "option_buy_leverage";
    pub const OPTION_SELL_LEVERAGE: &str = "option_sell_leverage";
    pub const API_RATE_LIMIT: &str = "api_rate_limit";
    pub const ORDER_RATE_LIMIT: &str = "order_rate_limit";
}

/// Internal bookkeeping key, not part of the public config surface
const LAST_AUTO_RESET_ON: &str = "last_auto_reset_on";

/// Capital amounts the sandbox can be provisioned with
const CAPITAL_CHOICES: [Decimal; 6] = [
    dec!(100000),
    dec!(500000),
    dec!(1000000),
    dec!(2500000),
    dec!(5000000),
    dec!(10000000),
];

const DEFAULTS: &[(&str, &str)] = &[
    (keys::STARTING_CAPITAL, "10000000"),
    (keys::RESET_DAY, "Sunday"),
    (keys::RESET_TIME, "00:00"),
    (keys::ORDER_CHECK_INTERVAL, "5"),
    (keys::MTM_UPDATE_INTERVAL, "5"),
    (keys::NSE_BSE_SQUARE_OFF_TIME, "15:15"),
    (keys::CDS_BCD_SQUARE_OFF_TIME, "16:45"),
    (keys::MCX_SQUARE_OFF_TIME, "23:30"),
    (keys::NCDEX_SQUARE_OFF_TIME, "17:00"),
    (keys::EQUITY_MIS_LEVERAGE, "5"),
    (keys::EQUITY_CNC_LEVERAGE, "1"),
    (keys::FUTURES_LEVERAGE, "10"),
    (keys::OPTION_BUY_LEVERAGE, "1"),
    (keys::OPTION_SELL_LEVERAGE, "1"),
    (keys::API_RATE_LIMIT, "50"),
    (keys::ORDER_RATE_LIMIT, "10"),
];

/// Effect of a committed config write that the owner must apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEffect {
    RescheduleSquareoff(ExchangeGroup),
    RescheduleReset,
    RescheduleEngine,
    RescheduleMtm,
    /// Fund balances were rebased to the new starting capital
    FundsRebased,
}

pub struct SandboxConfig {
    store: Arc<SandboxStore>,
    zone: Tz,
    /// Read-through cache: getters run on hot paths that already hold the
    /// store lock, so they must never touch SQLite themselves. A reader may
    /// see a value one tick stale after a write; effects are applied at job
    /// boundaries, never mid-tick.
    cache: std::sync::RwLock<std::collections::HashMap<String, String>>,
}

impl SandboxConfig {
    /// Open the config store; missing keys are seeded with defaults.
    /// `zone` is the single deployment timezone every cutoff and cron uses.
    pub fn new(store: Arc<SandboxStore>, zone: Tz) -> SandboxResult<Self> {
        let mut cache = std::collections::HashMap::new();
        store.with_tx(|conn| {
            for (key, default) in DEFAULTS {
                let value = match store::config_get(conn, key)? {
                    Some(existing) => existing,
                    None => {
                        store::config_set(conn, key, default)?;
                        default.to_string()
                    }
                };
                cache.insert(key.to_string(), value);
            }
            Ok(())
        })?;
        Ok(Self {
            store,
            zone,
            cache: std::sync::RwLock::new(cache),
        })
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    fn raw(&self, key: &'static str) -> SandboxResult<String> {
        if let Some(value) = self.cache.read().unwrap().get(key) {
            return Ok(value.clone());
        }
        DEFAULTS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
            .ok_or_else(|| SandboxError::Internal(format!("unknown config key {key}")))
    }

    pub fn starting_capital(&self) -> SandboxResult<Money> {
        let raw = self.raw(keys::STARTING_CAPITAL)?;
        Ok(Money::new(parse_decimal(keys::STARTING_CAPITAL, &raw)?))
    }

    pub fn leverage(&self, key: &'static str) -> SandboxResult<Money> {
        let raw = self.raw(key)?;
        Ok(Money::new(parse_decimal(key, &raw)?))
    }

    /// Engine tick period in seconds
    pub fn order_check_interval(&self) -> SandboxResult<u64> {
        let raw = self.raw(keys::ORDER_CHECK_INTERVAL)?;
        parse_u64(keys::ORDER_CHECK_INTERVAL, &raw)
    }

    /// MTM refresh period in seconds; 0 disables the refresh job
    pub fn mtm_update_interval(&self) -> SandboxResult<u64> {
        let raw = self.raw(keys::MTM_UPDATE_INTERVAL)?;
        parse_u64(keys::MTM_UPDATE_INTERVAL, &raw)
    }

    pub fn api_rate_limit(&self) -> SandboxResult<u64> {
        let raw = self.raw(keys::API_RATE_LIMIT)?;
        parse_u64(keys::API_RATE_LIMIT, &raw)
    }

    pub fn order_rate_limit(&self) -> SandboxResult<u64> {
        let raw = self.raw(keys::ORDER_RATE_LIMIT)?;
        parse_u64(keys::ORDER_RATE_LIMIT, &raw)
    }

    pub fn square_off_time(&self, group: ExchangeGroup) -> SandboxResult<NaiveTime> {
        let key = square_off_key(group);
        let raw = self.raw(key)?;
        parse_hhmm(key, &raw)
    }

    pub fn reset_day(&self) -> SandboxResult<Weekday> {
        let raw = self.raw(keys::RESET_DAY)?;
        raw.parse::<Weekday>().map_err(|_| SandboxError::InvalidConfigValue {
            key: keys::RESET_DAY.to_string(),
            reason: format!("{raw} is not a weekday name"),
        })
    }

    pub fn reset_time(&self) -> SandboxResult<NaiveTime> {
        let raw = self.raw(keys::RESET_TIME)?;
        parse_hhmm(keys::RESET_TIME, &raw)
    }

    /// Validate and persist a config write; returns the effects to apply.
    /// Failed validation leaves the stored value untouched.
    pub fn set(&self, key: &str, value: &str) -> SandboxResult<Vec<ConfigEffect>> {
        let value = value.trim();
        let effects = match key {
            keys::STARTING_CAPITAL => {
                let capital = parse_decimal(key, value)?;
                if !CAPITAL_CHOICES.contains(&capital) {
                    return Err(SandboxError::InvalidConfigValue {
                        key: key.to_string(),
                        reason: format!(
                            "{capital} is not one of the provisioned capital amounts {CAPITAL_CHOICES:?}"
                        ),
                    });
                }
                self.store.with_tx(|conn| {
                    store::config_set(conn, key, value)?;
                    rebase_funds(conn, Money::new(capital))?;
                    Ok(())
                })?;
                self.cache
                    .write()
                    .unwrap()
                    .insert(key.to_string(), value.to_string());
                info!(capital = %capital, "starting capital updated; fund balances rebased");
                return Ok(vec![ConfigEffect::FundsRebased]);
            }
            keys::RESET_DAY => {
                value.parse::<Weekday>().map_err(|_| SandboxError::InvalidConfigValue {
                    key: key.to_string(),
                    reason: format!("{value} is not a weekday name"),
                })?;
                vec![ConfigEffect::RescheduleReset]
            }
            keys::RESET_TIME => {
                parse_hhmm(key, value)?;
                vec![ConfigEffect::RescheduleReset]
            }
            keys::ORDER_CHECK_INTERVAL => {
                let n = parse_u64(key, value)?;
                if !(1..=30).contains(&n) {
                    return Err(range_error(key, "1..=30 seconds"));
                }
                vec![ConfigEffect::RescheduleEngine]
            }
            keys::MTM_UPDATE_INTERVAL => {
                let n = parse_u64(key, value)?;
                if n > 60 {
                    return Err(range_error(key, "0..=60 seconds (0 disables)"));
                }
                vec![ConfigEffect::RescheduleMtm]
            }
            keys::NSE_BSE_SQUARE_OFF_TIME => {
                parse_hhmm(key, value)?;
                vec![ConfigEffect::RescheduleSquareoff(ExchangeGroup::NseBse)]
            }
            keys::CDS_BCD_SQUARE_OFF_TIME => {
                parse_hhmm(key, value)?;
                vec![ConfigEffect::RescheduleSquareoff(ExchangeGroup::CdsBcd)]
            }
            keys::MCX_SQUARE_OFF_TIME => {
                parse_hhmm(key, value)?;
                vec![ConfigEffect::RescheduleSquareoff(ExchangeGroup::Mcx)]
            }
            keys::NCDEX_SQUARE_OFF_TIME => {
                parse_hhmm(key, value)?;
                vec![ConfigEffect::RescheduleSquareoff(ExchangeGroup::Ncdex)]
            }
            keys::EQUITY_MIS_LEVERAGE
            | keys::EQUITY_CNC_LEVERAGE
            | keys::FUTURES_LEVERAGE
            | keys::OPTION_BUY_LEVERAGE
            | keys::OPTION_SELL_LEVERAGE => {
                let leverage = parse_decimal(key, value)?;
                if leverage < dec!(1) || leverage > dec!(50) {
                    return Err(range_error(key, "1.0..=50.0"));
                }
                if !(leverage * dec!(10)).fract().is_zero() {
                    return Err(SandboxError::InvalidConfigValue {
                        key: key.to_string(),
                        reason: format!("{leverage} is not a multiple of 0.1"),
                    });
                }
                vec![]
            }
            keys::API_RATE_LIMIT | keys::ORDER_RATE_LIMIT => {
                let n = parse_u64(key, value)?;
                if !(1..=1000).contains(&n) {
                    return Err(range_error(key, "1..=1000 per second"));
                }
                vec![]
            }
            other => {
                return Err(SandboxError::InvalidConfigValue {
                    key: other.to_string(),
                    reason: "unknown config key".to_string(),
                })
            }
        };

        self.store
            .with_tx(|conn| store::config_set(conn, key, value))?;
        self.cache
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        info!(key, value, "config updated");
        Ok(effects)
    }

    /// Date (in the deploy zone) the weekly auto-reset last fired
    pub fn last_auto_reset_on(&self) -> SandboxResult<Option<chrono::NaiveDate>> {
        let raw = self
            .store
            .read(|conn| store::config_get(conn, LAST_AUTO_RESET_ON))?;
        Ok(raw.and_then(|s| chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()))
    }

    pub fn mark_auto_reset(&self, date: chrono::NaiveDate) -> SandboxResult<()> {
        self.store.with_tx(|conn| {
            store::config_set(
                conn,
                LAST_AUTO_RESET_ON,
                &date.format("%Y-%m-%d").to_string(),
            )
        })
    }
}

fn square_off_key(group: ExchangeGroup) -> &'static str {
    match group {
        ExchangeGroup::NseBse => keys::NSE_BSE_SQUARE_OFF_TIME,
        ExchangeGroup::CdsBcd => keys::CDS_BCD_SQUARE_OFF_TIME,
        ExchangeGroup::Mcx => keys::MCX_SQUARE_OFF_TIME,
        ExchangeGroup::Ncdex => keys::NCDEX_SQUARE_OFF_TIME,
    }
}

/// Rebase every funds row onto a new capital: available balance keeps the
/// blocked margin and accumulated P&L, only the capital base moves.
fn rebase_funds(conn: &rusqlite::Connection, capital: Money) -> SandboxResult<()> {
    for user in store::all_fund_users(conn)? {
        if let Some(mut funds) = store::get_funds(conn, &user)? {
            funds.total_capital = capital;
            funds.available_balance =
                (capital - funds.used_margin + funds.total_pnl).round_paise();
            store::update_funds(conn, &funds)?;
        }
    }
    Ok(())
}

fn parse_decimal(key: &str, value: &str) -> SandboxResult<Decimal> {
    value
        .parse::<Decimal>()
        .map_err(|_| SandboxError::InvalidConfigValue {
            key: key.to_string(),
            reason: format!("{value} is not a decimal number"),
        })
}

fn parse_u64(key: &str, value: &str) -> SandboxResult<u64> {
    value
        .parse::<u64>()
        .map_err(|_| SandboxError::InvalidConfigValue {
            key: key.to_string(),
            reason: format!("{value} is not a non-negative integer"),
        })
}

fn parse_hhmm(key: &str, value: &str) -> SandboxResult<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| SandboxError::InvalidConfigValue {
        key: key.to_string(),
        reason: format!("{value} is not a HH:MM time"),
    })
}

fn range_error(key: &str, range: &str) -> SandboxError {
    SandboxError::InvalidConfigValue {
        key: key.to_string(),
        reason: format!("value out of range, expected {range}"),
    }
}
