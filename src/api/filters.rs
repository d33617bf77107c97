use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::models::de;

/// Price/quantity constraints for one symbol
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolFilters {
    pub symbol: String,
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
}

// (symbol, tick size, step size) used when exchangeInfo is unavailable
const FALLBACK_PRECISION: &[(&str, &str, &str)] = &[
    ("BTCUSDT", "0.1", "0.001"),
    ("ETHUSDT", "0.01", "0.001"),
    ("BNBUSDT", "0.01", "0.01"),
    ("SOLUSDT", "0.01", "0.01"),
    ("XRPUSDT", "0.0001", "0.1"),
    ("DOGEUSDT", "0.00001", "1"),
    ("ADAUSDT", "0.0001", "1"),
    ("AVAXUSDT", "0.001", "0.1"),
    ("DOTUSDT", "0.001", "0.1"),
    ("MATICUSDT", "0.0001", "1"),
];

const DEFAULT_TICK_SIZE: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01
const DEFAULT_STEP_SIZE: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001

impl SymbolFilters {
    /// Built-in precision for a symbol (default tick 0.01, step 0.001)
    pub fn fallback(symbol: &str) -> Self {
        let (tick_size, step_size) = FALLBACK_PRECISION
            .iter()
            .find(|(s, _, _)| *s == symbol)
            .and_then(|(_, tick, step)| {
                Some((Decimal::from_str(tick).ok()?, Decimal::from_str(step).ok()?))
            })
            .unwrap_or((DEFAULT_TICK_SIZE, DEFAULT_STEP_SIZE));

        Self {
            symbol: symbol.to_string(),
            tick_size,
            step_size,
            min_qty: step_size,
        }
    }

    /// Round a price to the nearest tick
    pub fn round_price(&self, price: Decimal) -> Decimal {
        if self.tick_size <= Decimal::ZERO {
            return price;
        }
        ((price / self.tick_size).round() * self.tick_size).normalize()
    }

    /// Round an f64 price to the nearest tick, returning it as f64
    pub fn round_price_f64(&self, price: f64) -> f64 {
        Decimal::from_f64(price)
            .map(|p| self.round_price(p))
            .and_then(|p| p.to_f64())
            .unwrap_or(price)
    }

    /// Floor a quantity to a multiple of the step size
    pub fn floor_quantity(&self, quantity: Decimal) -> Decimal {
        if self.step_size <= Decimal::ZERO {
            return quantity;
        }
        ((quantity / self.step_size).floor() * self.step_size).normalize()
    }

    /// `usd / price` floored to the step size; zero for unusable inputs
    pub fn quantity_for_notional(&self, usd_amount: f64, price: f64) -> Decimal {
        if !(usd_amount > 0.0 && price > 0.0) {
            return Decimal::ZERO;
        }
        match (Decimal::from_f64(usd_amount), Decimal::from_f64(price)) {
            (Some(usd), Some(px)) if !px.is_zero() => self.floor_quantity(usd / px),
            _ => Decimal::ZERO,
        }
    }
}

// ====== exchangeInfo parsing ======

#[derive(Debug, Deserialize)]
pub(crate) struct RawExchangeInfo {
    #[serde(default)]
    pub symbols: Vec<RawSymbolInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawSymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub filters: Vec<RawFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawFilter {
    pub filter_type: String,
    #[serde(default, deserialize_with = "de::string_lenient")]
    pub tick_size: String,
    #[serde(default, deserialize_with = "de::string_lenient")]
    pub step_size: String,
    #[serde(default, deserialize_with = "de::string_lenient")]
    pub min_qty: String,
}

impl From<RawSymbolInfo> for SymbolFilters {
    fn from(raw: RawSymbolInfo) -> Self {
        let mut filters = SymbolFilters::fallback(&raw.symbol);
        let mut min_qty = None;

        for filter in raw.filters {
            match filter.filter_type.as_str() {
                "PRICE_FILTER" => {
                    if let Ok(tick) = Decimal::from_str(&filter.tick_size) {
                        if tick > Decimal::ZERO {
                            filters.tick_size = tick.normalize();
                        }
                    }
                }
                "LOT_SIZE" => {
                    if let Ok(step) = Decimal::from_str(&filter.step_size) {
                        if step > Decimal::ZERO {
                            filters.step_size = step.normalize();
                        }
                    }
                    min_qty = Decimal::from_str(&filter.min_qty).ok();
                }
                _ => {}
            }
        }

        filters.min_qty = min_qty.map(|q| q.normalize()).unwrap_or(filters.step_size);
        filters
    }
}
