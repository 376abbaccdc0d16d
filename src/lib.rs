//! Broker Sandbox
//!
//! A simulated brokerage core that runs alongside a live trading
//! application: orders are margin-checked and matched against real-time
//! quotes, fills are netted into positions, intraday products are squared
//! off at exchange cutoffs, and delivery products settle into holdings on
//! T+1 - all against a money-conserving per-user ledger.

pub mod config;
pub mod error;
pub mod execution;
pub mod funds;
pub mod instruments;
pub mod margin;
pub mod orders;
pub mod positions;
pub mod providers;
pub mod sandbox;
pub mod scheduler;
pub mod settlement;
pub mod squareoff;
pub mod store;
pub mod types;

pub use error::{SandboxError, SandboxResult};
pub use orders::{OrderChanges, OrderDraft, PlacementReceipt};
pub use providers::{QuoteProvider, SymbolMetaProvider};
pub use sandbox::{CloseReceipt, Sandbox};
pub use store::{Funds, Holding, Order, Position, PositionKey, SandboxStore, Trade};
pub use types::*;
