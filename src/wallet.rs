use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::api::FuturesExchange;
use crate::config::{AgentConfig, StatusConfig};
use crate::error::{BotError, Result};

/// External (non-exchange) balance source for an agent
#[async_trait]
pub trait LedgerBalance: Send + Sync {
    async fn balance_usd(&self) -> Result<f64>;
}

/// Constant ledger balance when no chain endpoint is configured
pub struct FixedLedger(pub f64);

#[async_trait]
impl LedgerBalance for FixedLedger {
    async fn balance_usd(&self) -> Result<f64> {
        Ok(self.0)
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<String>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Native balance of an address via `eth_getBalance`, valued in USD
pub struct JsonRpcLedger {
    client: Client,
    rpc_url: String,
    address: String,
    native_usd_price: f64,
}

impl JsonRpcLedger {
    pub fn new(rpc_url: &str, address: &str, native_usd_price: f64, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
            address: address.to_string(),
            native_usd_price,
        })
    }
}

#[async_trait]
impl LedgerBalance for JsonRpcLedger {
    async fn balance_usd(&self) -> Result<f64> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_getBalance",
            "params": [self.address, "latest"],
        });

        let response = self.client.post(&self.rpc_url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BotError::Exchange {
                status: status.as_u16(),
                code: None,
                message: format!("ledger RPC returned {}", status),
            });
        }

        let parsed: RpcResponse = response.json().await?;
        if let Some(err) = parsed.error {
            return Err(BotError::Exchange {
                status: status.as_u16(),
                code: Some(err.code),
                message: err.message,
            });
        }
        let hex_wei = parsed
            .result
            .ok_or_else(|| BotError::Validation("eth_getBalance returned no result".to_string()))?;

        let wei = u128::from_str_radix(hex_wei.trim_start_matches("0x"), 16)
            .map_err(|e| BotError::Validation(format!("bad balance {}: {}", hex_wei, e)))?;
        Ok(wei as f64 / 1e18 * self.native_usd_price)
    }
}

/// Pick the ledger source for an agent
pub fn ledger_for(agent: &AgentConfig, status: &StatusConfig, timeout: Duration) -> Arc<dyn LedgerBalance> {
    match (&status.ledger_rpc_url, &agent.ledger_address) {
        (Some(url), Some(address)) => {
            match JsonRpcLedger::new(url, address, status.ledger_native_usd_price, timeout) {
                Ok(ledger) => Arc::new(ledger),
                Err(e) => {
                    tracing::warn!(agent = agent.id, "Ledger client unavailable, using fixed balance: {}", e);
                    Arc::new(FixedLedger(status.ledger_fixed_balance))
                }
            }
        }
        _ => Arc::new(FixedLedger(status.ledger_fixed_balance)),
    }
}

/// Cached balances for one agent
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
    pub external_ledger_balance: f64,
    pub exchange_balance: f64,
    pub total: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Read both balances; exchange failures fall back to `fallback_exchange`
pub async fn fetch_balances(
    exchange: Option<&Arc<dyn FuturesExchange>>,
    ledger: &dyn LedgerBalance,
    quote_asset: &str,
    fallback_exchange: f64,
) -> BalanceSnapshot {
    let exchange_balance = match exchange {
        Some(exchange) => match exchange.get_balance(quote_asset).await {
            Ok(balance) if balance.balance > 0.0 => balance.balance,
            Ok(_) => fallback_exchange,
            Err(e) => {
                tracing::warn!("Exchange balance unavailable, using fallback ${:.2}: {}", fallback_exchange, e);
                fallback_exchange
            }
        },
        None => fallback_exchange,
    };

    let external_ledger_balance = match ledger.balance_usd().await {
        Ok(balance) => balance,
        Err(e) => {
            tracing::warn!("Ledger balance unavailable: {}", e);
            0.0
        }
    };

    BalanceSnapshot {
        external_ledger_balance,
        exchange_balance,
        total: external_ledger_balance + exchange_balance,
        updated_at: Some(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperExchange;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_json_rpc_ledger_converts_wei() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJsonString(
                r#"{"method":"eth_getBalance","params":["0xabc","latest"]}"#.to_string(),
            ))
            .with_status(200)
            // 1.5 native tokens
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x14d1120d7b160000"}"#)
            .create_async()
            .await;

        let ledger = JsonRpcLedger::new(&server.url(), "0xabc", 600.0, Duration::from_secs(5)).unwrap();
        let usd = ledger.balance_usd().await.unwrap();

        assert!((usd - 900.0).abs() < 1e-6);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_json_rpc_error_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"invalid address"}}"#)
            .create_async()
            .await;

        let ledger = JsonRpcLedger::new(&server.url(), "nope", 600.0, Duration::from_secs(5)).unwrap();
        let err = ledger.balance_usd().await.unwrap_err();
        assert!(matches!(err, BotError::Exchange { code: Some(-32602), .. }));
    }

    #[tokio::test]
    async fn test_fetch_balances_uses_fallback_when_offline() {
        let paper = PaperExchange::new("USDT", 750.0);
        let exchange: Arc<dyn FuturesExchange> = Arc::new(paper.clone());

        let snapshot = fetch_balances(Some(&exchange), &FixedLedger(1000.0), "USDT", 900.0).await;
        assert_eq!(snapshot.exchange_balance, 750.0);
        assert_eq!(snapshot.total, 1750.0);

        paper.set_offline(true);
        let snapshot = fetch_balances(Some(&exchange), &FixedLedger(1000.0), "USDT", 900.0).await;
        assert_eq!(snapshot.exchange_balance, 900.0);
        assert_eq!(snapshot.total, 1900.0);
        assert!(snapshot.updated_at.is_some());
    }
}
