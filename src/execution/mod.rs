// Decision execution and per-agent trade tracking
pub mod position_manager;
pub mod trade_book;

pub use position_manager::{ExecutionOutcome, ExecutionResult, PositionManager, Protection};
pub use trade_book::TradeBook;
