// Risk management module
pub mod limits;

pub use limits::{risk_reward_ratio, Rejection, TradingLimits};
