//! Core data types used across the sandbox
//!
//! Defines the closed trading enums, the `Money` fixed-point type used for
//! every cash value, and the quote snapshot consumed by the execution engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error for parsing a closed enum from its wire/database text
#[derive(Debug, Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Exchanges the sandbox accepts orders for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    #[serde(rename = "NSE")]
    Nse,
    #[serde(rename = "BSE")]
    Bse,
    #[serde(rename = "NFO")]
    Nfo,
    #[serde(rename = "BFO")]
    Bfo,
    #[serde(rename = "CDS")]
    Cds,
    #[serde(rename = "BCD")]
    Bcd,
    #[serde(rename = "MCX")]
    Mcx,
    #[serde(rename = "NCDEX")]
    Ncdex,
}

impl Exchange {
    pub fn as_str(self) -> &'static str {
        match self {
            Exchange::Nse => "NSE",
            Exchange::Bse => "BSE",
            Exchange::Nfo => "NFO",
            Exchange::Bfo => "BFO",
            Exchange::Cds => "CDS",
            Exchange::Bcd => "BCD",
            Exchange::Mcx => "MCX",
            Exchange::Ncdex => "NCDEX",
        }
    }

    /// Square-off group this exchange settles with (fixed mapping)
    pub fn group(self) -> ExchangeGroup {
        match self {
            Exchange::Nse | Exchange::Bse | Exchange::Nfo | Exchange::Bfo => ExchangeGroup::NseBse,
            Exchange::Cds | Exchange::Bcd => ExchangeGroup::CdsBcd,
            Exchange::Mcx => ExchangeGroup::Mcx,
            Exchange::Ncdex => ExchangeGroup::Ncdex,
        }
    }

    /// True for venues that list derivative contracts
    pub fn is_derivative_venue(self) -> bool {
        matches!(
            self,
            Exchange::Nfo
                | Exchange::Bfo
                | Exchange::Mcx
                | Exchange::Cds
                | Exchange::Bcd
                | Exchange::Ncdex
        )
    }
}

impl std::str::FromStr for Exchange {
    type Err = UnknownEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NSE" => Ok(Exchange::Nse),
            "BSE" => Ok(Exchange::Bse),
            "NFO" => Ok(Exchange::Nfo),
            "BFO" => Ok(Exchange::Bfo),
            "CDS" => Ok(Exchange::Cds),
            "BCD" => Ok(Exchange::Bcd),
            "MCX" => Ok(Exchange::Mcx),
            "NCDEX" => Ok(Exchange::Ncdex),
            other => Err(UnknownEnumError {
                kind: "exchange",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange groups sharing an intraday square-off cutoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeGroup {
    NseBse,
    CdsBcd,
    Mcx,
    Ncdex,
}

impl ExchangeGroup {
    pub const ALL: [ExchangeGroup; 4] = [
        ExchangeGroup::NseBse,
        ExchangeGroup::CdsBcd,
        ExchangeGroup::Mcx,
        ExchangeGroup::Ncdex,
    ];

    pub fn members(self) -> &'static [Exchange] {
        match self {
            ExchangeGroup::NseBse => &[Exchange::Nse, Exchange::Bse, Exchange::Nfo, Exchange::Bfo],
            ExchangeGroup::CdsBcd => &[Exchange::Cds, Exchange::Bcd],
            ExchangeGroup::Mcx => &[Exchange::Mcx],
            ExchangeGroup::Ncdex => &[Exchange::Ncdex],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeGroup::NseBse => "NSE_BSE",
            ExchangeGroup::CdsBcd => "CDS_BCD",
            ExchangeGroup::Mcx => "MCX",
            ExchangeGroup::Ncdex => "NCDEX",
        }
    }
}

impl std::fmt::Display for ExchangeGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
        }
    }

    pub fn reverse(self) -> Action {
        match self {
            Action::Buy => Action::Sell,
            Action::Sell => Action::Buy,
        }
    }

    /// Signed direction multiplier: +1 for BUY, -1 for SELL
    pub fn sign(self) -> i64 {
        match self {
            Action::Buy => 1,
            Action::Sell => -1,
        }
    }
}

impl std::str::FromStr for Action {
    type Err = UnknownEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Action::Buy),
            "SELL" => Ok(Action::Sell),
            other => Err(UnknownEnumError {
                kind: "action",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product type - determines leverage, square-off, and settlement handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductType {
    /// Delivery; settles into holdings on T+1
    #[serde(rename = "CNC")]
    Cnc,
    /// Positional with reduced leverage
    #[serde(rename = "NRML")]
    Nrml,
    /// Intraday; force-closed at the exchange group cutoff
    #[serde(rename = "MIS")]
    Mis,
}

impl ProductType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProductType::Cnc => "CNC",
            ProductType::Nrml => "NRML",
            ProductType::Mis => "MIS",
        }
    }
}

impl std::str::FromStr for ProductType {
    type Err = UnknownEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CNC" => Ok(ProductType::Cnc),
            "NRML" => Ok(ProductType::Nrml),
            "MIS" => Ok(ProductType::Mis),
            other => Err(UnknownEnumError {
                kind: "product",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ProductType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Price type - determines the execution predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriceType {
    /// Execute immediately at bid/ask (falls back to LTP)
    #[serde(rename = "MARKET")]
    Market,
    /// Buy fills when LTP <= price; sell fills when LTP >= price
    #[serde(rename = "LIMIT")]
    Limit,
    /// Stop-loss limit: trigger price arms the order, limit price bounds the fill
    #[serde(rename = "SL")]
    Sl,
    /// Stop-loss market: fills at LTP once the trigger price trades
    #[serde(rename = "SL-M")]
    Slm,
}

impl PriceType {
    pub fn as_str(self) -> &'static str {
        match self {
            PriceType::Market => "MARKET",
            PriceType::Limit => "LIMIT",
            PriceType::Sl => "SL",
            PriceType::Slm => "SL-M",
        }
    }
}

impl std::str::FromStr for PriceType {
    type Err = UnknownEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MARKET" => Ok(PriceType::Market),
            "LIMIT" => Ok(PriceType::Limit),
            "SL" => Ok(PriceType::Sl),
            "SL-M" => Ok(PriceType::Slm),
            other => Err(UnknownEnumError {
                kind: "price type",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for PriceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order state machine: open -> complete | cancelled | rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "rejected")]
    Rejected,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Complete => "complete",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::Open)
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = UnknownEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(OrderStatus::Open),
            "complete" => Ok(OrderStatus::Complete),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "rejected" => Ok(OrderStatus::Rejected),
            other => Err(UnknownEnumError {
                kind: "order status",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instrument symbol using Arc<str> for cheap cloning
///
/// Symbols are cloned on every order, trade, and position row touched by the
/// engine loop; Arc<str> keeps those clones allocation-free.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

/// Custom serde for Arc<str>
mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Quote snapshot from the upstream broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub ltp: Money,
    pub bid: Money,
    pub ask: Money,
    /// Last traded time, when the upstream reports one
    pub ltt: Option<DateTime<Utc>>,
}

impl Quote {
    /// Execution price for a MARKET order: bid/ask by side, LTP fallback
    pub fn market_price(&self, action: Action) -> Money {
        let side_price = match action {
            Action::Buy => self.ask,
            Action::Sell => self.bid,
        };
        if side_price > Money::ZERO {
            side_price
        } else {
            self.ltp
        }
    }
}

// ============================================================================
// Money Type - Precise Decimal Arithmetic for Monetary Values
// ============================================================================

use rust_decimal::{Decimal, RoundingStrategy};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// Money type for precise decimal arithmetic in the ledger path.
///
/// Wraps `rust_decimal::Decimal` so cash never touches floating point.
/// `0.1 + 0.2 != 0.3` in f64; over thousands of fills the ledger would
/// drift away from the conservation identity it must uphold.
///
/// All committed cash values are rounded to the paisa (2 decimal places,
/// banker's rounding) via [`Money::round_paise`]. Only `pnl_percent` is a
/// display-only float and lives outside this type.
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    /// Zero value
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// One value
    pub const ONE: Money = Money(Decimal::ONE);

    pub const fn new(value: Decimal) -> Self {
        Money(value)
    }

    /// Create from i64 (whole currency units or signed quantities)
    pub fn from_i64(value: i64) -> Self {
        Money(Decimal::from(value))
    }

    /// Create from f64. Lossy for long fractions; never used in the ledger
    /// path, only at display/percent boundaries.
    pub fn from_f64(value: f64) -> Self {
        Money(Decimal::try_from(value).unwrap_or(Decimal::ZERO))
    }

    /// Convert to f64 (for `pnl_percent` and log formatting only)
    pub fn to_f64(self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(0.0)
    }

    /// Parse a decimal string (database TEXT column)
    pub fn parse(s: &str) -> Result<Self, rust_decimal::Error> {
        Ok(Money(s.parse::<Decimal>()?))
    }

    /// Get absolute value
    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    /// Check if value is zero
    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// Check if value is strictly positive
    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Check if value is negative
    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Get maximum of two values
    pub fn max(self, other: Self) -> Self {
        Money(self.0.max(other.0))
    }

    /// Get minimum of two values
    pub fn min(self, other: Self) -> Self {
        Money(self.0.min(other.0))
    }

    /// Round to the paisa: 2 decimal places, banker's rounding
    pub fn round_paise(self) -> Self {
        Money(
            self.0
                .round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven),
        )
    }

    /// Multiply by an integer quantity
    pub fn times(self, qty: i64) -> Self {
        Money(self.0 * Decimal::from(qty))
    }

    /// Get the underlying Decimal
    pub fn inner(self) -> Decimal {
        self.0
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq for Money {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl std::hash::Hash for Money {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Mul for Money {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Money(self.0 * rhs.0)
    }
}

impl Div for Money {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        if rhs.0.is_zero() {
            Money::ZERO
        } else {
            Money(self.0 / rhs.0)
        }
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Money(value)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

impl<'a> std::iter::Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + *x)
    }
}

impl rusqlite::types::ToSql for Money {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::from(self.0.to_string()))
    }
}

impl rusqlite::types::FromSql for Money {
    fn column_result(
        value: rusqlite::types::ValueRef<'_>,
    ) -> rusqlite::types::FromSqlResult<Self> {
        let text = value.as_str()?;
        Money::parse(text).map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
    }
}
