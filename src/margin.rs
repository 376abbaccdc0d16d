//! Margin pricing
//!
//! Sizes the margin a draft must block before it is accepted. The reference
//! price depends on the price type: MARKET orders margin against the live
//! LTP, LIMIT against the limit price, SL/SL-M against the trigger.

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::instruments::{is_future, is_option, leverage_for};
use crate::orders::OrderDraft;
use crate::types::{Action, Money, PriceType, ProductType};

/// Price the margin calculation keys on
pub fn reference_price(draft: &OrderDraft, ltp: Money) -> SandboxResult<Money> {
    match draft.price_type {
        PriceType::Market => Ok(ltp),
        PriceType::Limit => draft
            .price
            .ok_or_else(|| SandboxError::Validation("LIMIT order requires a price".into())),
        PriceType::Sl | PriceType::Slm => draft.trigger_price.ok_or_else(|| {
            SandboxError::Validation(format!(
                "{} order requires a trigger price",
                draft.price_type
            ))
        }),
    }
}

/// Margin required to carry the draft, rounded to the paisa
pub fn margin_required(
    config: &SandboxConfig,
    draft: &OrderDraft,
    ltp: Money,
    lot_size: i64,
) -> SandboxResult<Money> {
    let reference = reference_price(draft, ltp)?;
    let leverage = leverage_for(config, &draft.symbol, draft.exchange, draft.product, draft.action)?;
    let quantity = draft.quantity;

    let margin = if is_option(&draft.symbol, draft.exchange) {
        let notional = reference.times(lot_size).times(quantity);
        match draft.action {
            // Option buys pay the full premium, no leverage
            Action::Buy => notional,
            Action::Sell => notional / leverage,
        }
    } else if is_future(&draft.symbol, draft.exchange) {
        reference.times(lot_size).times(quantity) / leverage
    } else {
        reference.times(quantity) / leverage
    };

    Ok(margin.round_paise())
}

/// Whether placement must block margin at all.
/// The one exemption is a CNC SELL, which disposes of an existing holding.
pub fn must_block_margin(draft: &OrderDraft) -> bool {
    match draft.action {
        Action::Buy => true,
        Action::Sell => {
            is_option(&draft.symbol, draft.exchange)
                || is_future(&draft.symbol, draft.exchange)
                || matches!(draft.product, ProductType::Mis | ProductType::Nrml)
        }
    }
}
