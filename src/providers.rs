//! Upstream broker contracts
//!
//! The sandbox never talks HTTP itself; quotes and symbol metadata arrive
//! through these traits. Implementations live with the broker integration.

use async_trait::async_trait;

use crate::types::{Exchange, Quote, Symbol};

/// Live market quotes from the upstream broker.
///
/// Calls may take arbitrary wall time; the engine fetches quotes before
/// taking any user lock. A failed call leaves the affected orders open for
/// the next tick.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn quote(&self, symbol: &Symbol, exchange: Exchange) -> anyhow::Result<Quote>;
}

/// Symbol master lookups: existence and derivative lot sizes
#[async_trait]
pub trait SymbolMetaProvider: Send + Sync {
    /// Minimum tradeable unit; 1 for non-derivatives
    async fn lot_size(&self, symbol: &Symbol, exchange: Exchange) -> anyhow::Result<i64>;

    async fn exists(&self, symbol: &Symbol, exchange: Exchange) -> anyhow::Result<bool>;
}
