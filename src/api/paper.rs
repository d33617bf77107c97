use async_trait::async_trait;
use rust_decimal::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::exchange::FuturesExchange;
use super::filters::SymbolFilters;
use super::types::{
    AssetBalance, OpenOrder, OrderRequest, OrderResponse, OrderSide, OrderType, PositionRisk,
    Ticker24h,
};
use crate::error::{BotError, Result};

/// Exchange operation recorded by [`PaperExchange`]
#[derive(Debug, Clone, PartialEq)]
pub enum PaperCall {
    SetLeverage { symbol: String, leverage: u32 },
    PlaceOrder(OrderRequest),
    CancelOrder { symbol: String, order_id: String },
}

#[derive(Debug, Clone, Default)]
struct PaperPosition {
    amount: f64,
    entry_price: f64,
    leverage: u32,
}

#[derive(Debug, Default)]
struct PaperState {
    quote_asset: String,
    balance: f64,
    prices: HashMap<String, f64>,
    positions: HashMap<String, PaperPosition>,
    open_orders: Vec<OpenOrder>,
    leverage: HashMap<String, u32>,
    rejected_types: HashSet<OrderType>,
    offline: bool,
    next_order_id: u64,
    calls: Vec<PaperCall>,
}

/// In-memory futures venue for dry runs.
///
/// Market orders fill immediately at the current price; protective LIMIT and
/// STOP orders rest in the open-order list. Prices come from `set_price` or,
/// when configured, from a live market-data source.
#[derive(Clone)]
pub struct PaperExchange {
    state: Arc<Mutex<PaperState>>,
    market: Option<Arc<dyn FuturesExchange>>,
}

impl PaperExchange {
    pub fn new(quote_asset: &str, balance: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(PaperState {
                quote_asset: quote_asset.to_string(),
                balance,
                next_order_id: 1,
                ..PaperState::default()
            })),
            market: None,
        }
    }

    /// Read prices and tickers from a live venue instead of `set_price`
    pub fn with_market_data(mut self, market: Arc<dyn FuturesExchange>) -> Self {
        self.market = Some(market);
        self
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state().prices.insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, balance: f64) {
        self.state().balance = balance;
    }

    /// Seed an existing position (negative amount for short)
    pub fn open_position(&self, symbol: &str, amount: f64, entry_price: f64) {
        self.state().positions.insert(
            symbol.to_string(),
            PaperPosition {
                amount,
                entry_price,
                leverage: 1,
            },
        );
    }

    /// Drop a position as if its stop or target had filled
    pub fn liquidate(&self, symbol: &str) {
        let mut state = self.state();
        state.positions.remove(symbol);
        state.open_orders.retain(|o| o.symbol != symbol || o.is_stop());
    }

    pub fn add_open_order(&self, order: OpenOrder) {
        self.state().open_orders.push(order);
    }

    /// Make every order of this type fail with an exchange error
    pub fn reject_orders_of_type(&self, order_type: OrderType) {
        self.state().rejected_types.insert(order_type);
    }

    /// Simulate a network outage for every call
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn calls(&self) -> Vec<PaperCall> {
        self.state().calls.clone()
    }

    pub fn open_orders_snapshot(&self) -> Vec<OpenOrder> {
        self.state().open_orders.clone()
    }

    pub fn position_amount(&self, symbol: &str) -> f64 {
        self.state()
            .positions
            .get(symbol)
            .map(|p| p.amount)
            .unwrap_or(0.0)
    }

    fn check_online(&self) -> Result<()> {
        if self.state().offline {
            return Err(BotError::Timeout("paper exchange offline".to_string()));
        }
        Ok(())
    }

    async fn price(&self, symbol: &str) -> Result<f64> {
        let local = self.state().prices.get(symbol).copied();
        if let Some(price) = local {
            return Ok(price);
        }
        match &self.market {
            Some(market) => market.get_last_price(symbol).await,
            None => Err(BotError::Exchange {
                status: 400,
                code: Some(-1121),
                message: format!("Invalid symbol {}", symbol),
            }),
        }
    }
}

fn signed_quantity(side: OrderSide, quantity: f64) -> f64 {
    match side {
        OrderSide::Buy => quantity,
        OrderSide::Sell => -quantity,
    }
}

#[async_trait]
impl FuturesExchange for PaperExchange {
    async fn sync_clock(&self) {}

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    async fn get_balance(&self, asset: &str) -> Result<AssetBalance> {
        self.check_online()?;
        let state = self.state();
        if asset != state.quote_asset {
            return Ok(AssetBalance::empty(asset));
        }
        Ok(AssetBalance {
            asset: asset.to_string(),
            balance: state.balance,
            available_balance: state.balance,
            cross_un_pnl: 0.0,
        })
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionRisk>> {
        self.check_online()?;
        let state = self.state();
        let mut positions: Vec<PositionRisk> = state
            .positions
            .iter()
            .filter(|(s, p)| p.amount != 0.0 && symbol.map_or(true, |wanted| wanted == s.as_str()))
            .map(|(s, p)| {
                let mark = state.prices.get(s).copied().unwrap_or(p.entry_price);
                PositionRisk {
                    symbol: s.clone(),
                    position_amt: p.amount,
                    entry_price: p.entry_price,
                    mark_price: mark,
                    unrealized_profit: (mark - p.entry_price) * p.amount,
                    leverage: p.leverage as f64,
                    margin_type: "cross".to_string(),
                }
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>> {
        self.check_online()?;
        Ok(self
            .state()
            .open_orders
            .iter()
            .filter(|o| symbol.map_or(true, |s| s == o.symbol))
            .cloned()
            .collect())
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        self.check_online()?;
        let mut state = self.state();
        state.calls.push(PaperCall::CancelOrder {
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
        });
        let before = state.open_orders.len();
        state
            .open_orders
            .retain(|o| !(o.symbol == symbol && o.order_id == order_id));
        if state.open_orders.len() == before {
            return Err(BotError::Exchange {
                status: 400,
                code: Some(-2011),
                message: "Unknown order sent.".to_string(),
            });
        }
        Ok(())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResponse> {
        self.check_online()?;
        let filters = SymbolFilters::fallback(&order.symbol);
        let quantity = filters.floor_quantity(order.quantity);
        let fill_price = if order.order_type == OrderType::Market {
            Some(self.price(&order.symbol).await?)
        } else {
            None
        };

        let mut state = self.state();
        state.calls.push(PaperCall::PlaceOrder(order.clone()));

        if state.rejected_types.contains(&order.order_type) {
            return Err(BotError::Exchange {
                status: 400,
                code: Some(-2021),
                message: format!("{} order rejected", order.order_type.as_str()),
            });
        }
        if quantity <= Decimal::ZERO {
            return Err(BotError::Validation(format!(
                "{} quantity {} is below step size {}",
                order.symbol, order.quantity, filters.step_size
            )));
        }

        let order_id = state.next_order_id.to_string();
        state.next_order_id += 1;
        let qty = quantity.to_f64().unwrap_or(0.0);

        match fill_price {
            Some(price) => {
                let leverage = state.leverage.get(&order.symbol).copied().unwrap_or(1);
                let position = state.positions.entry(order.symbol.clone()).or_default();
                let delta = signed_quantity(order.side, qty);

                if order.reduce_only {
                    if position.amount == 0.0 || position.amount.signum() == delta.signum() {
                        return Err(BotError::Exchange {
                            status: 400,
                            code: Some(-2022),
                            message: "ReduceOnly Order is rejected.".to_string(),
                        });
                    }
                    let reduced = delta.abs().min(position.amount.abs());
                    position.amount -= position.amount.signum() * reduced;
                    if position.amount.abs() < 1e-12 {
                        position.amount = 0.0;
                    }
                } else if position.amount == 0.0 || position.amount.signum() == delta.signum() {
                    let total = position.amount.abs() + qty;
                    position.entry_price =
                        (position.entry_price * position.amount.abs() + price * qty) / total;
                    position.amount += delta;
                    position.leverage = leverage;
                } else {
                    position.amount += delta;
                    position.entry_price = price;
                }

                if position.amount == 0.0 {
                    state.positions.remove(&order.symbol);
                }

                Ok(OrderResponse {
                    order_id,
                    symbol: order.symbol.clone(),
                    status: "FILLED".to_string(),
                    client_order_id: None,
                    avg_price: price,
                    executed_qty: qty,
                })
            }
            None => {
                let price = order.price.map(|p| filters.round_price(p));
                let stop = order.stop_price.map(|p| filters.round_price(p));
                state.open_orders.push(OpenOrder {
                    symbol: order.symbol.clone(),
                    order_id: order_id.clone(),
                    order_type: order.order_type.as_str().to_string(),
                    side: order.side.as_str().to_string(),
                    stop_price: stop.and_then(|p| p.to_f64()).unwrap_or(0.0),
                    orig_qty: qty,
                    reduce_only: order.reduce_only,
                });
                tracing::debug!(
                    "Paper {} {} resting at {:?}/{:?}",
                    order.order_type.as_str(),
                    order.symbol,
                    price,
                    stop
                );

                Ok(OrderResponse {
                    order_id,
                    symbol: order.symbol.clone(),
                    status: "NEW".to_string(),
                    client_order_id: None,
                    avg_price: 0.0,
                    executed_qty: 0.0,
                })
            }
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.check_online()?;
        let mut state = self.state();
        state.calls.push(PaperCall::SetLeverage {
            symbol: symbol.to_string(),
            leverage,
        });
        state.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn get_last_price(&self, symbol: &str) -> Result<f64> {
        self.check_online()?;
        self.price(symbol).await
    }

    async fn get_ticker_24h(&self, symbol: &str) -> Result<Ticker24h> {
        self.check_online()?;
        let local = self.state().prices.get(symbol).copied();
        match (local, &self.market) {
            (Some(price), _) => Ok(Ticker24h {
                symbol: symbol.to_string(),
                last_price: price,
                price_change_percent: 0.0,
                high_price: price,
                low_price: price,
                volume: 0.0,
                quote_volume: 0.0,
            }),
            (None, Some(market)) => market.get_ticker_24h(symbol).await,
            (None, None) => Err(BotError::Exchange {
                status: 400,
                code: Some(-1121),
                message: format!("Invalid symbol {}", symbol),
            }),
        }
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        Ok(SymbolFilters::fallback(symbol))
    }
}
