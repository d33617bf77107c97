use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub(crate) mod de;

/// Numeric agent identifier (1-based, matches the `AGENT{n}_*` credentials)
pub type AgentId = u32;

/// Direction of a futures trade
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Long => "LONG",
            TradeSide::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Active,
    /// Open on the exchange but a stop-loss or take-profit order failed to place
    Unprotected,
    Closed,
    Failed,
}

impl TradeStatus {
    /// Active and unprotected trades both hold exchange exposure
    pub fn is_open(&self) -> bool {
        matches!(self, TradeStatus::Active | TradeStatus::Unprotected)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    /// Oldest trade closed to make room under the position limit
    PositionLimit,
    /// Agent decided to CLOSE the symbol
    Decision,
    /// Exchange no longer reports the position (stop/target hit or liquidated)
    Exchange,
    Manual,
    Shutdown,
}

/// A leveraged trade opened (or attempted) by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub symbol: String,
    pub side: TradeSide,
    pub leverage: u32,
    pub usd_amount: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub exit_price: Option<f64>,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: TradeStatus,
    pub close_reason: Option<CloseReason>,
    pub unrealized_pnl: f64,
    pub realized_pnl: Option<f64>,
    pub confidence: f64,
    pub reasoning: String,
}

impl Trade {
    /// P&L contribution: realized once closed, unrealized while open
    pub fn pnl(&self) -> f64 {
        match self.status {
            TradeStatus::Active | TradeStatus::Unprotected => self.unrealized_pnl,
            TradeStatus::Closed => self.realized_pnl.unwrap_or(0.0),
            TradeStatus::Failed => 0.0,
        }
    }
}

/// Action proposed by a decision provider
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionAction {
    Long,
    Short,
    Close,
    Hold,
}

impl DecisionAction {
    pub fn side(&self) -> Option<TradeSide> {
        match self {
            DecisionAction::Long => Some(TradeSide::Long),
            DecisionAction::Short => Some(TradeSide::Short),
            DecisionAction::Close | DecisionAction::Hold => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::Long => "LONG",
            DecisionAction::Short => "SHORT",
            DecisionAction::Close => "CLOSE",
            DecisionAction::Hold => "HOLD",
        }
    }
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured trade proposal returned by a decision gateway
///
/// Numeric fields are parsed leniently: providers sometimes quote numbers
/// or send `20.0` for an integer leverage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TradeDecision {
    #[serde(default)]
    pub symbol: String,
    pub action: DecisionAction,
    #[serde(default = "default_leverage", deserialize_with = "de::u32_lenient")]
    pub leverage: u32,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub usd_amount: f64,
    #[serde(default, deserialize_with = "de::f64_lenient")]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, deserialize_with = "de::positive_f64_opt")]
    pub stop_loss: Option<f64>,
    #[serde(default, deserialize_with = "de::positive_f64_opt")]
    pub take_profit: Option<f64>,
}

fn default_leverage() -> u32 {
    1
}

impl TradeDecision {
    /// HOLD decision carrying a reason (used when a provider fails)
    pub fn hold(reasoning: impl Into<String>) -> Self {
        Self {
            symbol: String::new(),
            action: DecisionAction::Hold,
            leverage: 1,
            usd_amount: 0.0,
            confidence: 0.0,
            reasoning: reasoning.into(),
            stop_loss: None,
            take_profit: None,
        }
    }
}

/// Per-symbol market data handed to the decision provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: f64,
    pub change_24h_pct: f64,
    pub volume_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
}

/// Everything a decision provider sees for one cycle
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionContext {
    pub agent_name: String,
    pub market: Vec<MarketSnapshot>,
    pub available_balance: f64,
    pub open_positions: usize,
    pub max_leverage: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decision_lenient_numbers() {
        let json = r#"{
            "symbol": "BTCUSDT",
            "action": "LONG",
            "leverage": "15",
            "usdAmount": 250,
            "confidence": 72.5,
            "reasoning": "breakout",
            "stopLoss": "64000.5",
            "takeProfit": 68000
        }"#;
        let decision: TradeDecision = serde_json::from_str(json).unwrap();

        assert_eq!(decision.action, DecisionAction::Long);
        assert_eq!(decision.leverage, 15);
        assert_eq!(decision.usd_amount, 250.0);
        assert_eq!(decision.confidence, 72.5);
        assert_eq!(decision.stop_loss, Some(64000.5));
        assert_eq!(decision.take_profit, Some(68000.0));
    }

    #[test]
    fn test_zero_or_null_protection_is_missing() {
        let json = r#"{"symbol":"ETHUSDT","action":"SHORT","leverage":10.0,
            "usdAmount":100,"confidence":60,"stopLoss":0,"takeProfit":null}"#;
        let decision: TradeDecision = serde_json::from_str(json).unwrap();

        assert_eq!(decision.leverage, 10);
        assert_eq!(decision.stop_loss, None);
        assert_eq!(decision.take_profit, None);
    }

    #[test]
    fn test_trade_pnl_by_status() {
        let mut trade = Trade {
            id: Uuid::new_v4(),
            agent_id: 1,
            symbol: "SOLUSDT".to_string(),
            side: TradeSide::Long,
            leverage: 5,
            usd_amount: 100.0,
            entry_price: 150.0,
            current_price: 155.0,
            exit_price: None,
            stop_loss: 140.0,
            take_profit: 170.0,
            order_id: Some("1".to_string()),
            opened_at: Utc::now(),
            closed_at: None,
            status: TradeStatus::Active,
            close_reason: None,
            unrealized_pnl: 3.3,
            realized_pnl: None,
            confidence: 70.0,
            reasoning: String::new(),
        };
        assert_eq!(trade.pnl(), 3.3);

        trade.status = TradeStatus::Closed;
        trade.realized_pnl = Some(4.0);
        assert_eq!(trade.pnl(), 4.0);

        trade.status = TradeStatus::Failed;
        assert_eq!(trade.pnl(), 0.0);
    }
}
