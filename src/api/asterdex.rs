use governor::{Quota, RateLimiter};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use async_trait::async_trait;

use super::clock::ClockOffset;
use super::exchange::FuturesExchange;
use super::filters::{RawExchangeInfo, SymbolFilters};
use super::signing::{canonical_query, sign};
use super::types::{AssetBalance, OpenOrder, OrderRequest, OrderResponse, PositionRisk, Ticker24h};
use crate::config::ExchangeConfig;
use crate::error::{BotError, Result};

pub const ASTERDEX_API_BASE: &str = "https://fapi.asterdex.com";
const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const MAX_RETRIES: u32 = 3;
const MAX_LEVERAGE: u32 = 125;
/// "No need to change margin type"
const MARGIN_TYPE_UNCHANGED: i64 = -4046;

type ExchangeRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginType {
    Isolated,
    Crossed,
}

impl MarginType {
    fn as_str(&self) -> &'static str {
        match self {
            MarginType::Isolated => "ISOLATED",
            MarginType::Crossed => "CROSSED",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTime {
    server_time: i64,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    #[serde(deserialize_with = "crate::models::de::f64_lenient")]
    price: f64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    #[serde(default)]
    msg: String,
}

/// Signed REST client for a Binance-futures-compatible venue (Asterdex).
///
/// Cloneable; clones share the clock offset, symbol filter cache and rate
/// limiter. Each agent owns one client for its own credentials.
#[derive(Clone)]
pub struct AsterdexClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    clock: Arc<Mutex<ClockOffset>>,
    filters: Arc<RwLock<HashMap<String, SymbolFilters>>>,
    rate_limiter: Arc<ExchangeRateLimiter>,
}

impl AsterdexClient {
    pub fn new(
        config: &ExchangeConfig,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let rpm = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            recv_window_ms: config.recv_window_ms,
            clock: Arc::new(Mutex::new(ClockOffset::new(Duration::from_secs(
                config.clock_sync_cooldown_secs,
            )))),
            filters: Arc::new(RwLock::new(HashMap::new())),
            rate_limiter,
        })
    }

    fn clock(&self) -> MutexGuard<'_, ClockOffset> {
        self.clock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn clock_offset_ms(&self) -> i64 {
        self.clock().offset_ms()
    }

    /// Local time corrected by the exchange offset
    pub fn timestamp(&self) -> i64 {
        self.clock().timestamp(chrono::Utc::now().timestamp_millis())
    }

    /// Unsigned, so it goes straight to `send` and never triggers a resync
    pub async fn server_time(&self) -> Result<i64> {
        let value = self.send(&Method::GET, "/fapi/v1/time", &[], false).await?;
        let time: ServerTime = serde_json::from_value(value)?;
        Ok(time.server_time)
    }

    /// Resync ignoring the cooldown (after a -1021 rejection)
    pub async fn force_sync_clock(&self) {
        match self.server_time().await {
            Ok(server_ms) => {
                let local_ms = chrono::Utc::now().timestamp_millis();
                let mut clock = self.clock();
                clock.apply(server_ms, local_ms, Instant::now());
                tracing::debug!("Clock synced, offset {}ms", clock.offset_ms());
            }
            Err(e) => {
                tracing::warn!("Clock sync failed, using fallback offset: {}", e);
                self.clock().apply_fallback();
            }
        }
    }

    pub async fn get_account_info(&self) -> Result<Value> {
        self.request(Method::GET, "/fapi/v1/account", &[], true).await
    }

    /// Fetch symbol metadata and refresh the filter cache
    pub async fn get_exchange_info(&self) -> Result<Vec<SymbolFilters>> {
        let info: RawExchangeInfo = self
            .request_as(Method::GET, "/fapi/v1/exchangeInfo", &[], false)
            .await?;
        let filters: Vec<SymbolFilters> = info.symbols.into_iter().map(Into::into).collect();

        let mut cache = self.filters.write().await;
        for f in &filters {
            cache.insert(f.symbol.clone(), f.clone());
        }
        Ok(filters)
    }

    /// Cancel every open order for a symbol, or for every symbol with open orders
    pub async fn cancel_all_orders(&self, symbol: Option<&str>) -> Result<()> {
        let symbols: BTreeSet<String> = match symbol {
            Some(s) => BTreeSet::from([s.to_string()]),
            None => self
                .get_open_orders(None)
                .await?
                .into_iter()
                .map(|o| o.symbol)
                .collect(),
        };

        for symbol in symbols {
            self.request(
                Method::DELETE,
                "/fapi/v1/allOpenOrders",
                &[("symbol", symbol.clone())],
                true,
            )
            .await?;
            tracing::info!("Cancelled all open orders for {}", symbol);
        }
        Ok(())
    }

    pub async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> Result<()> {
        let params = [
            ("symbol", symbol.to_string()),
            ("marginType", margin_type.as_str().to_string()),
        ];
        match self.request(Method::POST, "/fapi/v1/marginType", &params, true).await {
            Ok(_) => Ok(()),
            Err(BotError::Exchange {
                code: Some(MARGIN_TYPE_UNCHANGED),
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn request_as<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<T> {
        let value = self.request(method, path, params, signed).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a request; a signed call rejected for its timestamp is retried
    /// exactly once after a forced clock resync
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<Value> {
        match self.send(&method, path, params, signed).await {
            Err(e) if signed && e.is_timestamp_error() => {
                tracing::warn!(
                    "{} {} rejected for timestamp, resyncing clock and retrying once",
                    method,
                    path
                );
                self.force_sync_clock().await;
                self.send(&method, path, params, signed).await
            }
            other => other,
        }
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<Value> {
        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            let query = self.build_query(params, signed)?;
            let url = format!("{}{}", self.base_url, path);
            let builder = if *method == Method::GET || *method == Method::DELETE {
                let url = if query.is_empty() {
                    url
                } else {
                    format!("{}?{}", url, query)
                };
                self.client.request(method.clone(), url)
            } else {
                self.client
                    .request(method.clone(), url)
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(query)
            };

            let response = builder
                .header(API_KEY_HEADER, &self.api_key)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        BotError::Timeout(format!("{} {}", method, path))
                    } else {
                        BotError::Http(e)
                    }
                })?;

            let status = response.status();
            let body = response.text().await?;

            // 429 means the request was not executed, safe to resend
            if status.as_u16() == 429 && attempt < MAX_RETRIES {
                let backoff_secs = 2u64.pow(attempt);
                tracing::warn!(
                    "Rate limited on {} (429), backing off for {}s (attempt {}/{})",
                    path,
                    backoff_secs,
                    attempt,
                    MAX_RETRIES
                );
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                continue;
            }

            if !status.is_success() {
                return Err(exchange_error(status.as_u16(), &body));
            }

            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&body)?);
        }

        Err(BotError::Exchange {
            status: 429,
            code: None,
            message: format!("{} still rate limited after {} attempts", path, MAX_RETRIES),
        })
    }

    fn build_query(&self, params: &[(&str, String)], signed: bool) -> Result<String> {
        if !signed {
            return Ok(canonical_query(params));
        }

        let mut all: Vec<(&str, String)> = params.to_vec();
        all.push(("timestamp", self.timestamp().to_string()));
        all.push(("recvWindow", self.recv_window_ms.to_string()));
        let query = canonical_query(&all);
        let signature = sign(&self.api_secret, &query)?;
        Ok(format!("{}&signature={}", query, signature))
    }
}

fn exchange_error(status: u16, body: &str) -> BotError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) => BotError::Exchange {
            status,
            code: Some(err.code),
            message: err.msg,
        },
        Err(_) => BotError::Exchange {
            status,
            code: None,
            message: body.chars().take(300).collect(),
        },
    }
}

#[async_trait]
impl FuturesExchange for AsterdexClient {
    async fn sync_clock(&self) {
        let due = self.clock().is_due(Instant::now());
        if !due {
            return;
        }
        self.force_sync_clock().await;
    }

    async fn ping(&self) -> Result<()> {
        self.request(Method::GET, "/fapi/v1/ping", &[], false).await?;
        Ok(())
    }

    async fn get_balance(&self, asset: &str) -> Result<AssetBalance> {
        let balances: Vec<AssetBalance> = self
            .request_as(Method::GET, "/fapi/v2/balance", &[], true)
            .await?;
        Ok(balances
            .into_iter()
            .find(|b| b.asset == asset)
            .unwrap_or_else(|| AssetBalance::empty(asset)))
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionRisk>> {
        let params: Vec<(&str, String)> = symbol
            .map(|s| vec![("symbol", s.to_string())])
            .unwrap_or_default();
        self.request_as(Method::GET, "/fapi/v1/positionRisk", &params, true)
            .await
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>> {
        let params: Vec<(&str, String)> = symbol
            .map(|s| vec![("symbol", s.to_string())])
            .unwrap_or_default();
        self.request_as(Method::GET, "/fapi/v1/openOrders", &params, true)
            .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        self.request(Method::DELETE, "/fapi/v1/order", &params, true)
            .await?;
        Ok(())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResponse> {
        let filters = self.symbol_filters(&order.symbol).await?;
        let quantity = filters.floor_quantity(order.quantity);
        if quantity <= rust_decimal::Decimal::ZERO {
            return Err(BotError::Validation(format!(
                "{} quantity {} is below step size {}",
                order.symbol, order.quantity, filters.step_size
            )));
        }

        let mut params: Vec<(&str, String)> = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", order.order_type.as_str().to_string()),
            ("quantity", quantity.to_string()),
        ];

        if order.order_type.needs_price() {
            let price = order.price.ok_or_else(|| {
                BotError::Validation(format!("{} order requires a price", order.order_type.as_str()))
            })?;
            params.push((
                "timeInForce",
                order.time_in_force.unwrap_or_default().as_str().to_string(),
            ));
            params.push(("price", filters.round_price(price).to_string()));
        }

        if order.order_type.needs_stop_price() {
            let stop = order.stop_price.ok_or_else(|| {
                BotError::Validation(format!(
                    "{} order requires a stop price",
                    order.order_type.as_str()
                ))
            })?;
            params.push(("stopPrice", filters.round_price(stop).to_string()));
        }

        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let response: OrderResponse = self
            .request_as(Method::POST, "/fapi/v1/order", &params, true)
            .await?;
        tracing::info!(
            "Order placed: {} {} {} {} (id {})",
            order.symbol,
            order.side.as_str(),
            order.order_type.as_str(),
            quantity,
            response.order_id
        );
        Ok(response)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        if !(1..=MAX_LEVERAGE).contains(&leverage) {
            return Err(BotError::Validation(format!(
                "leverage must be between 1 and {}, got {}",
                MAX_LEVERAGE, leverage
            )));
        }
        let params = [
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        self.request(Method::POST, "/fapi/v1/leverage", &params, true)
            .await?;
        Ok(())
    }

    async fn get_last_price(&self, symbol: &str) -> Result<f64> {
        let ticker: TickerPrice = self
            .request_as(
                Method::GET,
                "/fapi/v1/ticker/price",
                &[("symbol", symbol.to_string())],
                false,
            )
            .await?;
        Ok(ticker.price)
    }

    async fn get_ticker_24h(&self, symbol: &str) -> Result<Ticker24h> {
        self.request_as(
            Method::GET,
            "/fapi/v1/ticker/24hr",
            &[("symbol", symbol.to_string())],
            false,
        )
        .await
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        if let Some(filters) = self.filters.read().await.get(symbol) {
            return Ok(filters.clone());
        }

        if let Err(e) = self.get_exchange_info().await {
            tracing::warn!("exchangeInfo unavailable, using built-in precision: {}", e);
        }

        // Misses are cached too, so one failed lookup serves the whole order flow
        let mut cache = self.filters.write().await;
        let filters = cache
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolFilters::fallback(symbol));
        Ok(filters.clone())
    }
}
