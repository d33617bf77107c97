// Core modules
pub mod api;
pub mod automation;
pub mod config;
pub mod decision;
pub mod error;
pub mod execution;
pub mod models;
pub mod persistence;
pub mod risk;
pub mod shutdown;
pub mod wallet;

// Re-export commonly used types
pub use automation::{AgentScheduler, AgentStatus, AggregatedStats};
pub use error::{BotError, Result};
