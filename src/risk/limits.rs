use serde::{Deserialize, Serialize};

use crate::models::{DecisionAction, TradeDecision};

/// Hard limits applied to every decision before it reaches the exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TradingLimits {
    pub max_active_trades: usize,
    pub max_leverage: u32,
    pub min_confidence: f64,
}

impl Default for TradingLimits {
    fn default() -> Self {
        Self {
            max_active_trades: 2,
            max_leverage: 20,
            min_confidence: 40.0,
        }
    }
}

/// Why a decision was not executed
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    LowConfidence { confidence: f64, threshold: f64 },
    MissingProtection,
    StopLossWrongSide {
        action: DecisionAction,
        stop_loss: f64,
        price: f64,
    },
    PositionLimit { active: usize, max: usize },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::LowConfidence {
                confidence,
                threshold,
            } => write!(f, "confidence {:.0}% below {:.0}%", confidence, threshold),
            Rejection::MissingProtection => f.write_str("stop-loss and take-profit are required"),
            Rejection::StopLossWrongSide {
                action,
                stop_loss,
                price,
            } => {
                let wanted = if *action == DecisionAction::Short {
                    "above"
                } else {
                    "below"
                };
                write!(
                    f,
                    "{} stop-loss {} must be {} current price {}",
                    action, stop_loss, wanted, price
                )
            }
            Rejection::PositionLimit { active, max } => {
                write!(f, "{} active trades, limit is {}", active, max)
            }
        }
    }
}

impl TradingLimits {
    /// Leverage within 1..=max_leverage
    pub fn clamp_leverage(&self, requested: u32) -> u32 {
        requested.clamp(1, self.max_leverage.max(1))
    }

    pub fn check_confidence(&self, decision: &TradeDecision) -> Result<(), Rejection> {
        // NaN compares false against the threshold, so reject it explicitly
        if !decision.confidence.is_finite() || decision.confidence < self.min_confidence {
            return Err(Rejection::LowConfidence {
                confidence: decision.confidence,
                threshold: self.min_confidence,
            });
        }
        Ok(())
    }

    /// Both protective prices must be present: returns (stop_loss, take_profit)
    pub fn require_protection(decision: &TradeDecision) -> Result<(f64, f64), Rejection> {
        match (decision.stop_loss, decision.take_profit) {
            (Some(sl), Some(tp)) => Ok((sl, tp)),
            _ => Err(Rejection::MissingProtection),
        }
    }

    /// Stop strictly below price for LONG, strictly above for SHORT
    pub fn check_stop_side(
        action: DecisionAction,
        stop_loss: f64,
        price: f64,
    ) -> Result<(), Rejection> {
        let valid = match action {
            DecisionAction::Long => stop_loss < price,
            DecisionAction::Short => stop_loss > price,
            DecisionAction::Close | DecisionAction::Hold => true,
        };
        if valid {
            Ok(())
        } else {
            Err(Rejection::StopLossWrongSide {
                action,
                stop_loss,
                price,
            })
        }
    }

    /// Whether a new trade may be opened with `active` trades open
    pub fn check_capacity(&self, active: usize) -> Result<(), Rejection> {
        if active >= self.max_active_trades {
            return Err(Rejection::PositionLimit {
                active,
                max: self.max_active_trades,
            });
        }
        Ok(())
    }
}

/// Reward per unit of risk for a protected entry
pub fn risk_reward_ratio(entry: f64, stop_loss: f64, take_profit: f64) -> Option<f64> {
    let risk = (entry - stop_loss).abs();
    if risk == 0.0 {
        return None;
    }
    Some((take_profit - entry).abs() / risk)
}
