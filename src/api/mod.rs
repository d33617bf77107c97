// Futures exchange access
pub mod asterdex;
pub mod clock;
pub mod exchange;
pub mod filters;
pub mod paper;
pub mod signing;
pub mod types;

pub use asterdex::{AsterdexClient, MarginType, ASTERDEX_API_BASE};
pub use clock::ClockOffset;
pub use exchange::FuturesExchange;
pub use filters::SymbolFilters;
pub use paper::{PaperCall, PaperExchange};
pub use types::{
    AssetBalance, CloseOutcome, OpenOrder, OrderRequest, OrderResponse, OrderSide, OrderType,
    PositionRisk, Ticker24h, TimeInForce,
};
