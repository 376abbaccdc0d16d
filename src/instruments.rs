//! Instrument classification
//!
//! Pure predicates over symbol and exchange, plus the leverage decision
//! table. Lot sizes come from the symbol master, not from here.

use crate::config::{keys, SandboxConfig};
use crate::error::SandboxResult;
use crate::types::{Action, Exchange, Money, ProductType, Symbol};

/// True iff the venue lists derivatives and the symbol is a CE/PE contract
pub fn is_option(symbol: &Symbol, exchange: Exchange) -> bool {
    exchange.is_derivative_venue()
        && (symbol.as_str().ends_with("CE") || symbol.as_str().ends_with("PE"))
}

/// True iff the venue lists derivatives and the symbol is a futures contract
pub fn is_future(symbol: &Symbol, exchange: Exchange) -> bool {
    exchange.is_derivative_venue() && symbol.as_str().ends_with("FUT")
}

/// Leverage applied when sizing margin for this order
pub fn leverage_for(
    config: &SandboxConfig,
    symbol: &Symbol,
    exchange: Exchange,
    product: ProductType,
    action: Action,
) -> SandboxResult<Money> {
    if matches!(exchange, Exchange::Nse | Exchange::Bse) {
        return match product {
            ProductType::Mis => config.leverage(keys::EQUITY_MIS_LEVERAGE),
            ProductType::Cnc | ProductType::Nrml => config.leverage(keys::EQUITY_CNC_LEVERAGE),
        };
    }
    if is_option(symbol, exchange) {
        return match action {
            Action::Buy => config.leverage(keys::OPTION_BUY_LEVERAGE),
            Action::Sell => config.leverage(keys::OPTION_SELL_LEVERAGE),
        };
    }
    if is_future(symbol, exchange) {
        return config.leverage(keys::FUTURES_LEVERAGE);
    }
    Ok(Money::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SandboxStore;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn config() -> SandboxConfig {
        let store = Arc::new(SandboxStore::open_in_memory().unwrap());
        SandboxConfig::new(store, chrono_tz::Asia::Kolkata).unwrap()
    }

    #[test]
    fn test_option_detection() {
        assert!(is_option(&Symbol::new("NIFTY25AUG24000CE"), Exchange::Nfo));
        assert!(is_option(&Symbol::new("NIFTY25AUG24000PE"), Exchange::Nfo));
        // Equity venue never classifies as option, whatever the suffix
        assert!(!is_option(&Symbol::new("SUNCE"), Exchange::Nse));
        assert!(!is_option(&Symbol::new("NIFTY25AUGFUT"), Exchange::Nfo));
    }

    #[test]
    fn test_future_detection() {
        assert!(is_future(&Symbol::new("NIFTY25AUGFUT"), Exchange::Nfo));
        assert!(is_future(&Symbol::new("CRUDEOIL25AUGFUT"), Exchange::Mcx));
        assert!(!is_future(&Symbol::new("RELIANCE"), Exchange::Nse));
    }

    #[test]
    fn test_leverage_decision_table() {
        let cfg = config();
        let lev = |sym: &str, exch, product, action| {
            leverage_for(&cfg, &Symbol::new(sym), exch, product, action).unwrap()
        };

        assert_eq!(
            lev("RELIANCE", Exchange::Nse, ProductType::Mis, Action::Buy),
            Money::new(dec!(5))
        );
        assert_eq!(
            lev("RELIANCE", Exchange::Nse, ProductType::Cnc, Action::Buy),
            Money::new(dec!(1))
        );
        assert_eq!(
            lev("NIFTY25AUGFUT", Exchange::Nfo, ProductType::Nrml, Action::Buy),
            Money::new(dec!(10))
        );
        assert_eq!(
            lev(
                "NIFTY25AUG24000CE",
                Exchange::Nfo,
                ProductType::Nrml,
                Action::Buy
            ),
            Money::new(dec!(1))
        );
        // No table row matches: unleveraged
        assert_eq!(
            lev("GOLDBEES", Exchange::Mcx, ProductType::Nrml, Action::Buy),
            Money::ONE
        );
    }
}
