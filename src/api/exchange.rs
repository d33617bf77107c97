use async_trait::async_trait;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use super::filters::SymbolFilters;
use super::types::{
    AssetBalance, CloseOutcome, OpenOrder, OrderRequest, OrderResponse, PositionRisk, Ticker24h,
};
use crate::error::{BotError, Result};

/// Futures venue used by the position manager and the scheduler.
///
/// Implementors provide the primitive REST operations; position-level helpers
/// (close, protective orders, sizing) are built on top of them.
#[async_trait]
pub trait FuturesExchange: Send + Sync {
    /// Refresh the clock offset (never fails, falls back on error)
    async fn sync_clock(&self);

    async fn ping(&self) -> Result<()>;

    /// Balance for one asset; zero balance if the asset is absent
    async fn get_balance(&self, asset: &str) -> Result<AssetBalance>;

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionRisk>>;

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    /// Place an order; price/stop are rounded to tick, quantity floored to step
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResponse>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    async fn get_last_price(&self, symbol: &str) -> Result<f64>;

    async fn get_ticker_24h(&self, symbol: &str) -> Result<Ticker24h>;

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters>;

    /// First non-zero position for the symbol
    async fn held_position(&self, symbol: &str) -> Result<Option<PositionRisk>> {
        let positions = self.get_positions(Some(symbol)).await?;
        Ok(positions
            .into_iter()
            .find(|p| p.symbol == symbol && p.is_open()))
    }

    /// Flatten the position with an opposite-side reduce-only market order
    async fn close_position(&self, symbol: &str) -> Result<CloseOutcome> {
        let Some(position) = self.held_position(symbol).await? else {
            tracing::info!("No position to close for {}", symbol);
            return Ok(CloseOutcome::NoPosition {
                symbol: symbol.to_string(),
            });
        };

        let quantity = position_quantity(&position)?;
        let side = position.closing_side();
        tracing::info!(
            "Closing {} position: {} {} (entry ${:.4})",
            symbol,
            side.as_str(),
            quantity,
            position.entry_price
        );

        let order = self
            .place_order(&OrderRequest::market(symbol, side, quantity).reduce_only())
            .await?;
        Ok(CloseOutcome::Closed { order, quantity })
    }

    /// Reduce-only STOP_MARKET opposite the held position
    async fn set_stop_loss(
        &self,
        symbol: &str,
        stop_price: f64,
        quantity: Option<Decimal>,
    ) -> Result<OrderResponse> {
        let position = self
            .held_position(symbol)
            .await?
            .ok_or_else(|| BotError::NoPosition(symbol.to_string()))?;
        let quantity = match quantity {
            Some(q) => q,
            None => position_quantity(&position)?,
        };
        let stop = to_decimal(stop_price, "stop price")?;

        self.place_order(
            &OrderRequest::stop_market(symbol, position.closing_side(), quantity, stop).reduce_only(),
        )
        .await
    }

    /// Reduce-only LIMIT opposite the held position
    async fn set_take_profit(
        &self,
        symbol: &str,
        target_price: f64,
        quantity: Option<Decimal>,
    ) -> Result<OrderResponse> {
        let position = self
            .held_position(symbol)
            .await?
            .ok_or_else(|| BotError::NoPosition(symbol.to_string()))?;
        let quantity = match quantity {
            Some(q) => q,
            None => position_quantity(&position)?,
        };
        let price = to_decimal(target_price, "take-profit price")?;

        self.place_order(
            &OrderRequest::limit(symbol, position.closing_side(), quantity, price).reduce_only(),
        )
        .await
    }

    /// Contract quantity for a USD notional, floored to the step size
    async fn calculate_quantity(&self, symbol: &str, usd_amount: f64, price: f64) -> Result<Decimal> {
        let filters = self.symbol_filters(symbol).await?;
        Ok(filters.quantity_for_notional(usd_amount, price))
    }
}

fn position_quantity(position: &PositionRisk) -> Result<Decimal> {
    Decimal::from_f64(position.position_amt.abs())
        .map(|q| q.normalize())
        .ok_or_else(|| {
            BotError::Validation(format!(
                "unrepresentable position amount {}",
                position.position_amt
            ))
        })
}

fn to_decimal(value: f64, what: &str) -> Result<Decimal> {
    if !(value.is_finite() && value > 0.0) {
        return Err(BotError::Validation(format!("invalid {}: {}", what, value)));
    }
    Decimal::from_f64(value).ok_or_else(|| BotError::Validation(format!("invalid {}: {}", what, value)))
}
