use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

use crate::api::{CloseOutcome, FuturesExchange, OrderRequest, OrderSide};
use crate::models::{DecisionAction, TradeDecision, TradeSide};
use crate::risk::{risk_reward_ratio, Rejection, TradingLimits};

/// Which protective orders made it onto the exchange
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Protection {
    pub stop_loss_placed: bool,
    pub take_profit_placed: bool,
}

impl Protection {
    pub fn is_complete(&self) -> bool {
        self.stop_loss_placed && self.take_profit_placed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Held,
    Rejected(Rejection),
    /// CLOSE handled; `had_position` is false for the no-op case
    Closed { had_position: bool },
    Opened,
    Failed,
}

/// Result of executing one decision, returned even on partial failure
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub message: String,
    pub outcome: ExecutionOutcome,
    pub order_id: Option<String>,
    pub entry_price: Option<f64>,
    pub quantity: Option<Decimal>,
    /// Leverage after clamping
    pub leverage: u32,
    /// Protective prices after tick rounding
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub protection: Protection,
    pub risk_reward: Option<f64>,
}

impl ExecutionResult {
    fn new(outcome: ExecutionOutcome, success: bool, message: impl Into<String>, leverage: u32) -> Self {
        Self {
            success,
            message: message.into(),
            outcome,
            order_id: None,
            entry_price: None,
            quantity: None,
            leverage,
            stop_loss: None,
            take_profit: None,
            protection: Protection::default(),
            risk_reward: None,
        }
    }

    pub(crate) fn rejected(rejection: Rejection, leverage: u32) -> Self {
        let message = format!("Skipped: {}", rejection);
        Self::new(ExecutionOutcome::Rejected(rejection), false, message, leverage)
    }

    fn failed(message: impl Into<String>, leverage: u32) -> Self {
        Self::new(ExecutionOutcome::Failed, false, message, leverage)
    }
}

/// Turns validated decisions into exchange orders for one agent
pub struct PositionManager {
    exchange: Arc<dyn FuturesExchange>,
    limits: TradingLimits,
}

impl PositionManager {
    pub fn new(exchange: Arc<dyn FuturesExchange>, limits: TradingLimits) -> Self {
        Self { exchange, limits }
    }

    pub fn limits(&self) -> &TradingLimits {
        &self.limits
    }

    /// Validate and execute a decision
    pub async fn execute(&self, decision: &TradeDecision) -> ExecutionResult {
        let leverage = self.limits.clamp_leverage(decision.leverage);
        if leverage != decision.leverage {
            tracing::warn!(
                "Leverage {}x clamped to {}x for {}",
                decision.leverage,
                leverage,
                decision.symbol
            );
        }

        if let Err(rejection) = self.limits.check_confidence(decision) {
            tracing::info!("Skipping {} {}: {}", decision.action, decision.symbol, rejection);
            return ExecutionResult::rejected(rejection, leverage);
        }

        match decision.action {
            DecisionAction::Hold => {
                ExecutionResult::new(ExecutionOutcome::Held, true, "Holding", leverage)
            }
            DecisionAction::Close => self.close(&decision.symbol, leverage).await,
            DecisionAction::Long => self.open(decision, TradeSide::Long, leverage).await,
            DecisionAction::Short => self.open(decision, TradeSide::Short, leverage).await,
        }
    }

    async fn close(&self, symbol: &str, leverage: u32) -> ExecutionResult {
        match self.exchange.close_position(symbol).await {
            Ok(CloseOutcome::Closed { order, quantity }) => {
                let mut result = ExecutionResult::new(
                    ExecutionOutcome::Closed { had_position: true },
                    true,
                    format!("Closed {} {}", quantity, symbol),
                    leverage,
                );
                result.order_id = Some(order.order_id);
                result.quantity = Some(quantity);
                if order.avg_price > 0.0 {
                    result.entry_price = Some(order.avg_price);
                }
                result
            }
            Ok(CloseOutcome::NoPosition { .. }) => ExecutionResult::new(
                ExecutionOutcome::Closed { had_position: false },
                true,
                "No position to close",
                leverage,
            ),
            Err(e) => {
                tracing::error!("Failed to close {}: {}", symbol, e);
                ExecutionResult::failed(format!("Close failed: {}", e), leverage)
            }
        }
    }

    async fn open(&self, decision: &TradeDecision, side: TradeSide, leverage: u32) -> ExecutionResult {
        let symbol = decision.symbol.as_str();

        let (stop_loss, take_profit) = match TradingLimits::require_protection(decision) {
            Ok(prices) => prices,
            Err(rejection) => {
                tracing::warn!("Rejecting {} {}: {}", side, symbol, rejection);
                return ExecutionResult::rejected(rejection, leverage);
            }
        };

        let price = match self.exchange.get_last_price(symbol).await {
            Ok(p) => p,
            Err(e) => return ExecutionResult::failed(format!("Price unavailable: {}", e), leverage),
        };
        let filters = match self.exchange.symbol_filters(symbol).await {
            Ok(f) => f,
            Err(e) => return ExecutionResult::failed(format!("Symbol info unavailable: {}", e), leverage),
        };
        let stop_loss = filters.round_price_f64(stop_loss);
        let take_profit = filters.round_price_f64(take_profit);

        if let Err(rejection) = TradingLimits::check_stop_side(decision.action, stop_loss, price) {
            tracing::warn!("Rejecting {} {}: {}", side, symbol, rejection);
            return ExecutionResult::rejected(rejection, leverage);
        }

        if let Err(e) = self.exchange.set_leverage(symbol, leverage).await {
            return ExecutionResult::failed(format!("Set leverage failed: {}", e), leverage);
        }

        let quantity = match self
            .exchange
            .calculate_quantity(symbol, decision.usd_amount, price)
            .await
        {
            Ok(q) if q > Decimal::ZERO => q,
            Ok(_) => {
                return ExecutionResult::failed(
                    format!("${:.2} is below the minimum size for {}", decision.usd_amount, symbol),
                    leverage,
                )
            }
            Err(e) => return ExecutionResult::failed(format!("Sizing failed: {}", e), leverage),
        };

        let order_side = match side {
            TradeSide::Long => OrderSide::Buy,
            TradeSide::Short => OrderSide::Sell,
        };
        let order = match self
            .exchange
            .place_order(&OrderRequest::market(symbol, order_side, quantity))
            .await
        {
            Ok(order) => order,
            Err(e) => {
                tracing::error!("{} {} market order failed: {}", side, symbol, e);
                return ExecutionResult::failed(format!("Order failed: {}", e), leverage);
            }
        };
        let entry_price = if order.avg_price > 0.0 {
            order.avg_price
        } else {
            price
        };

        tracing::info!(
            "Opened {} {} x{} qty {} @ ${} (order {})",
            side,
            symbol,
            leverage,
            quantity,
            entry_price,
            order.order_id
        );

        let mut protection = Protection::default();
        match self.exchange.set_stop_loss(symbol, stop_loss, Some(quantity)).await {
            Ok(_) => protection.stop_loss_placed = true,
            Err(e) => tracing::error!("Stop-loss for {} {} NOT placed: {}", side, symbol, e),
        }
        match self
            .exchange
            .set_take_profit(symbol, take_profit, Some(quantity))
            .await
        {
            Ok(_) => protection.take_profit_placed = true,
            Err(e) => tracing::error!("Take-profit for {} {} NOT placed: {}", side, symbol, e),
        }

        let risk_reward = risk_reward_ratio(entry_price, stop_loss, take_profit);
        if let Some(rr) = risk_reward {
            tracing::info!(
                "{} {} SL ${} / TP ${}, risk/reward 1:{:.2}",
                side,
                symbol,
                stop_loss,
                take_profit,
                rr
            );
        }

        let message = if protection.is_complete() {
            format!("Opened {} {} with stop-loss and take-profit", side, symbol)
        } else {
            format!(
                "Opened {} {} UNPROTECTED (stop-loss placed: {}, take-profit placed: {})",
                side, symbol, protection.stop_loss_placed, protection.take_profit_placed
            )
        };

        ExecutionResult {
            success: true,
            message,
            outcome: ExecutionOutcome::Opened,
            order_id: Some(order.order_id),
            entry_price: Some(entry_price),
            quantity: Some(quantity),
            leverage,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            protection,
            risk_reward,
        }
    }
}
