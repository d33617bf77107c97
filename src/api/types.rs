use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::de;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    StopLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
            // Binance futures names the stop-limit type plain "STOP"
            OrderType::StopLimit => "STOP",
        }
    }

    pub fn needs_price(&self) -> bool {
        matches!(self, OrderType::Limit | OrderType::StopLimit)
    }

    pub fn needs_stop_price(&self) -> bool {
        matches!(self, OrderType::StopMarket | OrderType::StopLimit)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TimeInForce {
    #[default]
    #[serde(rename = "GTC")]
    Gtc,
    #[serde(rename = "IOC")]
    Ioc,
    #[serde(rename = "FOK")]
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }
}

/// Order parameters before tick/step rounding
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            time_in_force: None,
            reduce_only: false,
        }
    }

    pub fn limit(symbol: &str, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            time_in_force: Some(TimeInForce::Gtc),
            ..Self::market(symbol, side, quantity)
        }
    }

    pub fn stop_market(symbol: &str, side: OrderSide, quantity: Decimal, stop: Decimal) -> Self {
        Self {
            order_type: OrderType::StopMarket,
            stop_price: Some(stop),
            ..Self::market(symbol, side, quantity)
        }
    }

    pub fn stop_limit(
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        stop: Decimal,
    ) -> Self {
        Self {
            order_type: OrderType::StopLimit,
            price: Some(price),
            stop_price: Some(stop),
            time_in_force: Some(TimeInForce::Gtc),
            ..Self::market(symbol, side, quantity)
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Response from POST /fapi/v1/order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    #[serde(deserialize_with = "de::string_lenient")]
    pub order_id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub avg_price: f64,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub executed_qty: f64,
}

/// Entry of GET /fapi/v2/balance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub asset: String,
    #[serde(deserialize_with = "de::f64_lenient")]
    pub balance: f64,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub available_balance: f64,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub cross_un_pnl: f64,
}

impl AssetBalance {
    pub fn empty(asset: &str) -> Self {
        Self {
            asset: asset.to_string(),
            balance: 0.0,
            available_balance: 0.0,
            cross_un_pnl: 0.0,
        }
    }
}

/// Entry of GET /fapi/v1/positionRisk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    #[serde(deserialize_with = "de::f64_lenient")]
    pub position_amt: f64,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub entry_price: f64,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub mark_price: f64,
    #[serde(rename = "unRealizedProfit", default, deserialize_with = "de::f64_lenient")]
    pub unrealized_profit: f64,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub leverage: f64,
    #[serde(default)]
    pub margin_type: String,
}

impl PositionRisk {
    pub fn is_open(&self) -> bool {
        self.position_amt != 0.0
    }

    /// Side that reduces this position
    pub fn closing_side(&self) -> OrderSide {
        if self.position_amt > 0.0 {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }
}

/// Entry of GET /fapi/v1/openOrders
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub symbol: String,
    #[serde(deserialize_with = "de::string_lenient")]
    pub order_id: String,
    #[serde(rename = "type")]
    pub order_type: String,
    #[serde(default)]
    pub side: String,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub stop_price: f64,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub orig_qty: f64,
    #[serde(default, deserialize_with = "de::bool_lenient")]
    pub reduce_only: bool,
}

impl OpenOrder {
    /// Stop orders left behind by closed positions
    pub fn is_stop(&self) -> bool {
        matches!(self.order_type.as_str(), "STOP_MARKET" | "STOP")
    }
}

/// GET /fapi/v1/ticker/24hr for one symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24h {
    pub symbol: String,
    #[serde(deserialize_with = "de::f64_lenient")]
    pub last_price: f64,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub price_change_percent: f64,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub high_price: f64,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub low_price: f64,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub volume: f64,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub quote_volume: f64,
}

/// Result of a close request
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Closed {
        order: OrderResponse,
        quantity: Decimal,
    },
    /// Nothing held for the symbol, no order was sent
    NoPosition { symbol: String },
}

impl CloseOutcome {
    pub fn is_closed(&self) -> bool {
        matches!(self, CloseOutcome::Closed { .. })
    }
}
