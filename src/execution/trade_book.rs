use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::api::PositionRisk;
use crate::models::{CloseReason, Trade, TradeStatus};

// Closed/failed trades kept per agent; open trades are never pruned
const MAX_SETTLED_TRADES: usize = 100;

/// An agent's trades, newest last
#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeBook {
    trades: Vec<Trade>,
}

impl TradeBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all trades (open and settled)
    pub fn all(&self) -> &[Trade] {
        &self.trades
    }

    pub fn record(&mut self, trade: Trade) {
        self.trades.push(trade);

        let settled = self.trades.iter().filter(|t| !t.status.is_open()).count();
        if settled > MAX_SETTLED_TRADES {
            let mut excess = settled - MAX_SETTLED_TRADES;
            self.trades.retain(|t| {
                if excess > 0 && !t.status.is_open() {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Get all open trades (active or unprotected)
    pub fn open_trades(&self) -> Vec<&Trade> {
        self.trades.iter().filter(|t| t.status.is_open()).collect()
    }

    pub fn open_count(&self) -> usize {
        self.trades.iter().filter(|t| t.status.is_open()).count()
    }

    /// Oldest open trade by open time
    pub fn oldest_open(&self) -> Option<&Trade> {
        self.trades
            .iter()
            .filter(|t| t.status.is_open())
            .min_by_key(|t| t.opened_at)
    }

    pub fn get(&self, id: Uuid) -> Option<&Trade> {
        self.trades.iter().find(|t| t.id == id)
    }

    fn get_mut(&mut self, id: Uuid) -> anyhow::Result<&mut Trade> {
        self.trades
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| anyhow::anyhow!("Trade {} not found", id))
    }

    /// Settle an open trade
    pub fn mark_closed(
        &mut self,
        id: Uuid,
        exit_price: Option<f64>,
        reason: CloseReason,
    ) -> anyhow::Result<()> {
        let trade = self.get_mut(id)?;
        if !trade.status.is_open() {
            anyhow::bail!("Trade {} is already {:?}", id, trade.status);
        }

        let exit = exit_price.unwrap_or(trade.current_price);
        trade.status = TradeStatus::Closed;
        trade.exit_price = Some(exit);
        trade.current_price = exit;
        trade.closed_at = Some(Utc::now());
        trade.close_reason = Some(reason);
        trade.realized_pnl = Some(trade.unrealized_pnl);

        tracing::info!(
            "Trade {} {} {} closed ({:?}): P&L ${:.2}",
            trade.side,
            trade.symbol,
            trade.id,
            reason,
            trade.unrealized_pnl
        );
        Ok(())
    }

    /// Settle every open trade on a symbol; returns how many were closed
    pub fn close_symbol(&mut self, symbol: &str, exit_price: Option<f64>, reason: CloseReason) -> usize {
        let ids: Vec<Uuid> = self
            .trades
            .iter()
            .filter(|t| t.status.is_open() && t.symbol == symbol)
            .map(|t| t.id)
            .collect();

        ids.iter()
            .filter(|id| self.mark_closed(**id, exit_price, reason).is_ok())
            .count()
    }

    /// Update open trades from live positions.
    ///
    /// Trades whose symbol has no open position are settled with their last
    /// unrealized P&L. When several open trades share a symbol, the position's
    /// P&L is split by notional. Returns the number of trades settled.
    pub fn refresh_from_positions(&mut self, positions: &[PositionRisk]) -> usize {
        let mut settled = 0;
        let symbols: Vec<String> = self
            .open_trades()
            .iter()
            .map(|t| t.symbol.clone())
            .collect();

        for symbol in dedup(symbols) {
            let live = positions.iter().find(|p| p.symbol == symbol && p.is_open());
            match live {
                Some(position) => {
                    let notional: f64 = self
                        .trades
                        .iter()
                        .filter(|t| t.status.is_open() && t.symbol == symbol)
                        .map(|t| t.usd_amount.max(0.0))
                        .sum();
                    let share_count = self
                        .trades
                        .iter()
                        .filter(|t| t.status.is_open() && t.symbol == symbol)
                        .count() as f64;

                    for trade in self
                        .trades
                        .iter_mut()
                        .filter(|t| t.status.is_open() && t.symbol == symbol)
                    {
                        let share = if notional > 0.0 {
                            trade.usd_amount.max(0.0) / notional
                        } else {
                            1.0 / share_count
                        };
                        if position.mark_price > 0.0 {
                            trade.current_price = position.mark_price;
                        }
                        trade.unrealized_pnl = position.unrealized_profit * share;
                    }
                }
                None => {
                    settled += self.close_symbol(&symbol, None, CloseReason::Exchange);
                }
            }
        }
        settled
    }

    /// Realized P&L of closed trades plus unrealized P&L of open ones
    pub fn total_pnl(&self) -> f64 {
        self.trades.iter().map(Trade::pnl).sum()
    }
}

fn dedup(mut symbols: Vec<String>) -> Vec<String> {
    symbols.sort();
    symbols.dedup();
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeSide;
    use chrono::Duration;

    fn trade(symbol: &str, minutes_ago: i64, status: TradeStatus) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            agent_id: 1,
            symbol: symbol.to_string(),
            side: TradeSide::Long,
            leverage: 10,
            usd_amount: 100.0,
            entry_price: 100.0,
            current_price: 100.0,
            exit_price: None,
            stop_loss: 95.0,
            take_profit: 110.0,
            order_id: None,
            opened_at: Utc::now() - Duration::minutes(minutes_ago),
            closed_at: None,
            status,
            close_reason: None,
            unrealized_pnl: 0.0,
            realized_pnl: None,
            confidence: 70.0,
            reasoning: String::new(),
        }
    }

    fn position(symbol: &str, amount: f64, mark: f64, pnl: f64) -> PositionRisk {
        PositionRisk {
            symbol: symbol.to_string(),
            position_amt: amount,
            entry_price: 100.0,
            mark_price: mark,
            unrealized_profit: pnl,
            leverage: 10.0,
            margin_type: "cross".to_string(),
        }
    }

    #[test]
    fn test_oldest_open_ignores_settled() {
        let mut book = TradeBook::new();
        book.record(trade("BTCUSDT", 90, TradeStatus::Closed));
        book.record(trade("ETHUSDT", 30, TradeStatus::Active));
        book.record(trade("SOLUSDT", 60, TradeStatus::Unprotected));
        book.record(trade("BNBUSDT", 120, TradeStatus::Failed));

        assert_eq!(book.open_count(), 2);
        assert_eq!(book.oldest_open().unwrap().symbol, "SOLUSDT");
    }

    #[test]
    fn test_mark_closed_realizes_pnl() {
        let mut book = TradeBook::new();
        let mut t = trade("BTCUSDT", 5, TradeStatus::Active);
        t.unrealized_pnl = 12.5;
        let id = t.id;
        book.record(t);

        book.mark_closed(id, Some(105.0), CloseReason::PositionLimit).unwrap();
        let closed = book.get(id).unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.realized_pnl, Some(12.5));
        assert_eq!(closed.exit_price, Some(105.0));
        assert_eq!(closed.close_reason, Some(CloseReason::PositionLimit));

        // Closing twice is an error
        assert!(book.mark_closed(id, None, CloseReason::Manual).is_err());
    }

    #[test]
    fn test_refresh_updates_and_settles() {
        let mut book = TradeBook::new();
        book.record(trade("BTCUSDT", 10, TradeStatus::Active));
        book.record(trade("ETHUSDT", 5, TradeStatus::Unprotected));

        let positions = vec![
            position("BTCUSDT", 0.01, 104.0, 4.0),
            position("ETHUSDT", 0.0, 99.0, 0.0),
        ];
        let settled = book.refresh_from_positions(&positions);

        assert_eq!(settled, 1);
        assert_eq!(book.open_count(), 1);
        let btc = &book.open_trades()[0];
        assert_eq!(btc.current_price, 104.0);
        assert_eq!(btc.unrealized_pnl, 4.0);
        assert_eq!(book.total_pnl(), 4.0);
    }

    #[test]
    fn test_shared_symbol_pnl_split_by_notional() {
        let mut book = TradeBook::new();
        let mut small = trade("SOLUSDT", 10, TradeStatus::Active);
        small.usd_amount = 100.0;
        let mut large = trade("SOLUSDT", 5, TradeStatus::Active);
        large.usd_amount = 300.0;
        book.record(small);
        book.record(large);

        book.refresh_from_positions(&[position("SOLUSDT", 2.0, 160.0, 40.0)]);
        let pnl: Vec<f64> = book.open_trades().iter().map(|t| t.unrealized_pnl).collect();
        assert_eq!(pnl, vec![10.0, 30.0]);
    }

    #[test]
    fn test_settled_trades_are_pruned() {
        let mut book = TradeBook::new();
        book.record(trade("BTCUSDT", 500, TradeStatus::Active));
        for n in 0..(MAX_SETTLED_TRADES + 5) {
            book.record(trade("ETHUSDT", n as i64, TradeStatus::Failed));
        }
        assert_eq!(book.all().len(), MAX_SETTLED_TRADES + 1);
        assert_eq!(book.open_count(), 1);
    }
}
