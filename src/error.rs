use thiserror::Error;

use crate::models::AgentId;

/// Exchange code for "Timestamp for this request is outside of the recvWindow"
pub const TIMESTAMP_OUTSIDE_RECV_WINDOW: i64 = -1021;

#[derive(Error, Debug)]
pub enum BotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Exchange error (HTTP {status}, code {code:?}): {message}")]
    Exchange {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("No open position for {0}")]
    NoPosition(String),

    #[error("Insufficient balance: ${available:.2} available, ${required:.2} required")]
    InsufficientBalance { available: f64, required: f64 },

    #[error("Decision provider error: {0}")]
    Decision(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Unknown agent {0}")]
    UnknownAgent(AgentId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BotError {
    /// True when the exchange rejected the request timestamp (-1021)
    pub fn is_timestamp_error(&self) -> bool {
        match self {
            BotError::Exchange { code, message, .. } => {
                *code == Some(TIMESTAMP_OUTSIDE_RECV_WINDOW) || message.contains("-1021")
            }
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            BotError::Timeout(_) => true,
            BotError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_error_detection() {
        let err = BotError::Exchange {
            status: 400,
            code: Some(-1021),
            message: "Timestamp for this request is outside of the recvWindow.".to_string(),
        };
        assert!(err.is_timestamp_error());

        // Some gateways only echo the code inside the message
        let err = BotError::Exchange {
            status: 400,
            code: None,
            message: "{\"code\":-1021}".to_string(),
        };
        assert!(err.is_timestamp_error());

        let err = BotError::Exchange {
            status: 400,
            code: Some(-2019),
            message: "Margin is insufficient.".to_string(),
        };
        assert!(!err.is_timestamp_error());
        assert!(!BotError::Validation("x".into()).is_timestamp_error());
    }

    #[test]
    fn test_timeout_detection() {
        assert!(BotError::Timeout("decision".into()).is_timeout());
        assert!(!BotError::NotReady("routes".into()).is_timeout());
    }
}
