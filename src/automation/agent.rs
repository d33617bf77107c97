use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::FuturesExchange;
use crate::config::AgentConfig;
use crate::decision::DecisionGateway;
use crate::error::{BotError, Result};
use crate::execution::TradeBook;
use crate::models::{AgentId, Trade, TradeDecision, TradeStatus};
use crate::persistence::JournalEntry;
use crate::wallet::{fetch_balances, BalanceSnapshot, LedgerBalance};

/// Mutable state of one agent, touched only by its own cycle or the scheduler
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
    pub last_decision: Option<TradeDecision>,
    pub trades: TradeBook,
}

pub(crate) struct RunningTask {
    pub stop_tx: watch::Sender<bool>,
    pub handle: JoinHandle<()>,
}

/// Registry entry for one agent.
///
/// `state` is held for a whole cycle so an agent never interleaves with
/// itself; `published` is a copy taken after every mutation so status reads
/// never wait on an in-flight cycle.
pub struct AgentSlot {
    pub config: AgentConfig,
    pub(crate) exchange: Option<Arc<dyn FuturesExchange>>,
    pub(crate) gateway: Option<Arc<dyn DecisionGateway>>,
    ledger: Arc<dyn LedgerBalance>,
    pub(crate) state: tokio::sync::Mutex<AgentState>,
    published: RwLock<AgentState>,
    running: AtomicBool,
    balances: RwLock<(BalanceSnapshot, Option<Instant>)>,
    pub(crate) control: Mutex<Option<RunningTask>>,
}

impl AgentSlot {
    pub fn new(
        config: AgentConfig,
        exchange: Option<Arc<dyn FuturesExchange>>,
        gateway: Option<Arc<dyn DecisionGateway>>,
        ledger: Arc<dyn LedgerBalance>,
    ) -> Self {
        Self {
            config,
            exchange,
            gateway,
            ledger,
            state: tokio::sync::Mutex::new(AgentState::default()),
            published: RwLock::new(AgentState::default()),
            running: AtomicBool::new(false),
            balances: RwLock::new((BalanceSnapshot::default(), None)),
            control: Mutex::new(None),
        }
    }

    pub fn id(&self) -> AgentId {
        self.config.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Exchange handle, or a configuration error when credentials are missing
    pub(crate) fn exchange(&self) -> Result<&Arc<dyn FuturesExchange>> {
        self.exchange.as_ref().ok_or_else(|| {
            BotError::Config(format!(
                "AGENT{}_API_KEY / AGENT{}_API_SECRET not configured",
                self.id(),
                self.id()
            ))
        })
    }

    pub(crate) fn gateway(&self) -> Result<&Arc<dyn DecisionGateway>> {
        self.gateway.as_ref().ok_or_else(|| {
            BotError::Config(format!(
                "no decision provider configured for agent {} (AGENT{}_MODEL_KEY)",
                self.id(),
                self.id()
            ))
        })
    }

    /// Copy the cycle-owned state for lock-free readers
    pub(crate) fn publish(&self, state: &AgentState) {
        let mut published = self
            .published
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *published = state.clone();
    }

    pub fn snapshot(&self) -> AgentState {
        self.published
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn balances(&self) -> BalanceSnapshot {
        self.balances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .0
            .clone()
    }

    fn balances_age(&self) -> Option<Duration> {
        self.balances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .1
            .map(|at| at.elapsed())
    }

    /// Re-read exchange and ledger balances
    pub(crate) async fn refresh_balances(&self, quote_asset: &str, fallback: f64) -> BalanceSnapshot {
        let fallback = self.config.fallback_exchange_balance.unwrap_or(fallback);
        let snapshot =
            fetch_balances(self.exchange.as_ref(), self.ledger.as_ref(), quote_asset, fallback).await;

        let mut balances = self
            .balances
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *balances = (snapshot.clone(), Some(Instant::now()));
        snapshot
    }

    /// Refresh only when the cached snapshot is older than `max_age`
    pub(crate) async fn refresh_balances_if_stale(
        &self,
        quote_asset: &str,
        fallback: f64,
        max_age: Duration,
    ) -> BalanceSnapshot {
        match self.balances_age() {
            Some(age) if age < max_age => self.balances(),
            _ => self.refresh_balances(quote_asset, fallback).await,
        }
    }
}

/// Point-in-time view of an agent for the control surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub id: AgentId,
    pub name: String,
    pub running: bool,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
    pub last_decision: Option<TradeDecision>,
    pub baseline_balance: f64,
    pub balances: BalanceSnapshot,
    /// Balance total minus the baseline
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    /// Realized plus unrealized P&L of tracked trades
    pub trade_pnl: f64,
    pub total_trades: usize,
    pub active_trades: usize,
    pub unprotected_trades: usize,
    pub trades: Vec<Trade>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal: Option<Vec<JournalEntry>>,
}

impl AgentStatus {
    pub(crate) fn build(slot: &AgentSlot, baseline: f64, journal: Option<Vec<JournalEntry>>) -> Self {
        let state = slot.snapshot();
        let balances = slot.balances();
        let total_pnl = if balances.updated_at.is_some() {
            balances.total - baseline
        } else {
            0.0
        };
        let total_pnl_pct = if baseline > 0.0 {
            total_pnl / baseline * 100.0
        } else {
            0.0
        };
        let trades = state.trades.all().to_vec();

        Self {
            id: slot.id(),
            name: slot.config.name.clone(),
            running: slot.is_running(),
            last_cycle_at: state.last_cycle_at,
            success_count: state.success_count,
            failure_count: state.failure_count,
            last_error: state.last_error,
            last_decision: state.last_decision,
            baseline_balance: baseline,
            balances,
            total_pnl,
            total_pnl_pct,
            trade_pnl: state.trades.total_pnl(),
            total_trades: trades.len(),
            active_trades: state.trades.open_count(),
            unprotected_trades: trades
                .iter()
                .filter(|t| t.status == TradeStatus::Unprotected)
                .count(),
            trades,
            journal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperExchange;
    use crate::wallet::FixedLedger;

    fn slot(exchange: Option<Arc<dyn FuturesExchange>>) -> AgentSlot {
        AgentSlot::new(AgentConfig::new(2), exchange, None, Arc::new(FixedLedger(1000.0)))
    }

    #[test]
    fn test_missing_credentials_are_config_errors() {
        let slot = slot(None);
        assert!(matches!(slot.exchange(), Err(BotError::Config(_))));
        assert!(matches!(slot.gateway(), Err(BotError::Config(_))));
    }

    #[tokio::test]
    async fn test_balances_are_cached_until_stale() {
        let paper = PaperExchange::new("USDT", 500.0);
        let slot = slot(Some(Arc::new(paper.clone())));

        let first = slot
            .refresh_balances_if_stale("USDT", 900.0, Duration::from_secs(120))
            .await;
        assert_eq!(first.total, 1500.0);

        paper.set_balance(800.0);
        let cached = slot
            .refresh_balances_if_stale("USDT", 900.0, Duration::from_secs(120))
            .await;
        assert_eq!(cached.total, 1500.0);

        let fresh = slot
            .refresh_balances_if_stale("USDT", 900.0, Duration::ZERO)
            .await;
        assert_eq!(fresh.total, 1800.0);
    }

    #[test]
    fn test_status_pnl_against_baseline() {
        let slot = slot(None);
        {
            let mut balances = slot.balances.write().unwrap();
            *balances = (
                BalanceSnapshot {
                    external_ledger_balance: 1000.0,
                    exchange_balance: 1090.0,
                    total: 2090.0,
                    updated_at: Some(Utc::now()),
                },
                Some(Instant::now()),
            );
        }
        let status = AgentStatus::build(&slot, 1900.0, None);
        assert_eq!(status.name, "GPT");
        assert!((status.total_pnl - 190.0).abs() < 1e-9);
        assert!((status.total_pnl_pct - 10.0).abs() < 1e-9);
        assert!(!status.running);
    }
}
