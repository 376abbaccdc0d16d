//! Sandbox error taxonomy
//!
//! Validation and business errors are returned to the caller synchronously;
//! transient errors inside background jobs are logged and never escalate.

use crate::types::{Money, OrderStatus, UnknownEnumError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// Malformed draft, unknown symbol, bad enum, non-positive quantity
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Money, available: Money },

    #[error("insufficient holdings for {symbol}: selling {requested}, holding {held}")]
    InsufficientHoldings {
        symbol: String,
        requested: i64,
        held: i64,
    },

    /// Upstream quote failed at order placement
    #[error("quote unavailable for {symbol} on {exchange}: {reason}")]
    QuoteUnavailable {
        symbol: String,
        exchange: String,
        reason: String,
    },

    /// MIS order outside trading hours that does not reduce a position
    #[error("MIS orders are blocked after square-off for {exchange}; only position-reducing orders are accepted")]
    MisCutoffBlocked { exchange: String },

    /// Modify/cancel on an order that already reached a terminal state
    #[error("order {orderid} is already {status}")]
    AlreadyTerminal {
        orderid: String,
        status: OrderStatus,
    },

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("config key {key}: {reason}")]
    InvalidConfigValue { key: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<UnknownEnumError> for SandboxError {
    fn from(e: UnknownEnumError) -> Self {
        SandboxError::Validation(e.to_string())
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
