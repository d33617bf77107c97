//! Agent supervision.
//!
//! [`AgentScheduler`] owns every agent record and runs one tokio task per
//! started agent. Each task ticks on its own interval and is stopped through
//! a watch channel; a cycle that is already running always finishes.

pub mod agent;
pub mod cycle;
pub mod status;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::api::{AsterdexClient, CloseOutcome, FuturesExchange, PaperExchange, PositionRisk};
use crate::config::AppConfig;
use crate::decision::build_gateway;
use crate::error::{BotError, Result};
use crate::models::{AgentId, CloseReason};
use crate::persistence::{JournalEntry, JournalEntryType, JournalStore};
use crate::risk::TradingLimits;
use crate::wallet::ledger_for;

pub use agent::{AgentSlot, AgentState, AgentStatus};
pub use cycle::CycleReport;
pub use status::{AggregatedStats, StatusAggregator};

use agent::RunningTask;

/// Scheduler-wide settings shared by every agent
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub symbols: Vec<String>,
    pub quote_asset: String,
    pub min_balance_usd: f64,
    pub decision_timeout: Duration,
    /// Delay per agent index in `start_all`
    pub stagger: Duration,
    pub baseline_balance: f64,
    pub fallback_exchange_balance: f64,
    pub balance_refresh: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            symbols: config.scheduler.symbols.clone(),
            quote_asset: config.exchange.quote_asset.clone(),
            min_balance_usd: config.scheduler.min_balance_usd,
            decision_timeout: Duration::from_secs(config.scheduler.decision_timeout_secs),
            stagger: Duration::from_secs(config.scheduler.stagger_secs),
            baseline_balance: config.status.baseline_balance,
            fallback_exchange_balance: config.status.fallback_exchange_balance,
            balance_refresh: Duration::from_secs(config.status.balance_refresh_secs),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

pub(crate) struct Shared {
    pub settings: SchedulerSettings,
    pub limits: TradingLimits,
    pub journal: JournalStore,
    pub aggregator: StatusAggregator,
}

/// Registry and supervisor for all agents
#[derive(Clone)]
pub struct AgentScheduler {
    shared: Arc<Shared>,
    agents: Arc<BTreeMap<AgentId, Arc<AgentSlot>>>,
}

impl AgentScheduler {
    pub fn new(
        settings: SchedulerSettings,
        limits: TradingLimits,
        journal: JournalStore,
        slots: Vec<AgentSlot>,
    ) -> Self {
        let aggregator = StatusAggregator::new(settings.balance_refresh);
        let agents = slots
            .into_iter()
            .map(|slot| (slot.id(), Arc::new(slot)))
            .collect();

        Self {
            shared: Arc::new(Shared {
                settings,
                limits,
                journal,
                aggregator,
            }),
            agents: Arc::new(agents),
        }
    }

    /// Build every configured agent with its exchange client and provider.
    ///
    /// Agents without credentials or a provider key are still registered so
    /// they show up in status; starting them fails with a config error.
    pub fn from_config(config: &AppConfig, journal: JournalStore) -> Result<Self> {
        let timeout = Duration::from_secs(config.exchange.request_timeout_secs);
        let decision_timeout = Duration::from_secs(config.scheduler.decision_timeout_secs);
        let mut slots = Vec::with_capacity(config.agents.len());

        for agent in &config.agents {
            let exchange: Option<Arc<dyn FuturesExchange>> = if config.scheduler.paper {
                let market = AsterdexClient::new(&config.exchange, "", "")?;
                Some(Arc::new(
                    PaperExchange::new(&config.exchange.quote_asset, config.scheduler.paper_balance)
                        .with_market_data(Arc::new(market)),
                ))
            } else {
                match agent.credentials() {
                    Some((key, secret)) => {
                        Some(Arc::new(AsterdexClient::new(&config.exchange, key, secret)?))
                    }
                    None => {
                        tracing::warn!("Agent {} ({}) has no exchange credentials", agent.id, agent.name);
                        None
                    }
                }
            };

            let gateway = match (agent.provider, agent.model_key.as_deref()) {
                (Some(kind), Some(key)) => Some(build_gateway(
                    kind,
                    key,
                    agent.model.as_deref(),
                    &config.decision,
                    decision_timeout,
                )?),
                _ => {
                    tracing::warn!("Agent {} ({}) has no decision provider key", agent.id, agent.name);
                    None
                }
            };

            let ledger = ledger_for(agent, &config.status, timeout);
            slots.push(AgentSlot::new(agent.clone(), exchange, gateway, ledger));
        }

        Ok(Self::new(
            SchedulerSettings::from_config(config),
            TradingLimits::from(&config.trading),
            journal,
            slots,
        ))
    }

    pub fn journal(&self) -> &JournalStore {
        &self.shared.journal
    }

    pub fn limits(&self) -> &TradingLimits {
        &self.shared.limits
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.keys().copied().collect()
    }

    pub fn is_running(&self, id: AgentId) -> bool {
        self.agents.get(&id).is_some_and(|slot| slot.is_running())
    }

    fn slot(&self, id: AgentId) -> Result<&Arc<AgentSlot>> {
        self.agents.get(&id).ok_or(BotError::UnknownAgent(id))
    }

    fn baseline(&self, slot: &AgentSlot) -> f64 {
        slot.config
            .baseline_balance
            .unwrap_or(self.shared.settings.baseline_balance)
    }

    // ====== Lifecycle ======

    /// Start (or restart) an agent: an immediate cycle, then one per interval
    pub async fn start(&self, id: AgentId, interval: Duration) -> Result<()> {
        let slot = self.slot(id)?.clone();
        slot.exchange()?;
        slot.gateway()?;
        if interval.is_zero() {
            return Err(BotError::Config("automation interval must be > 0".to_string()));
        }

        if let Some(previous) = take_task(&slot) {
            let _ = previous.stop_tx.send(true);
            tracing::info!(agent = id, "Restarting automation");
        }
        slot.set_running(true);

        let settings = &self.shared.settings;
        let balances = slot
            .refresh_balances(&settings.quote_asset, settings.fallback_exchange_balance)
            .await;
        self.shared.journal.add_entry(
            id,
            JournalEntry::new(JournalEntryType::Decision)
                .decision("START")
                .amount(balances.total)
                .result(format!(
                    "Automation started, every {}s, balance ${:.2} (exchange ${:.2})",
                    interval.as_secs(),
                    balances.total,
                    balances.exchange_balance
                )),
        );
        tracing::info!(
            agent = id,
            "🚀 {} automation started (every {}s, balance ${:.2})",
            slot.config.name,
            interval.as_secs(),
            balances.total
        );

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let task_slot = slot.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        // Errors are already counted and journaled by the cycle
                        let _ = cycle::run_cycle(&shared, &task_slot).await;
                    }
                }
            }
            tracing::debug!(agent = task_slot.id(), "Automation task exited");
        });

        let mut control = slot
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *control = Some(RunningTask { stop_tx, handle });
        Ok(())
    }

    /// Stop an agent's schedule; optionally force-close its open trades.
    ///
    /// With `close_positions` the call waits for an in-flight cycle to end
    /// before closing. Returns the number of trades closed.
    pub async fn stop(&self, id: AgentId, close_positions: bool) -> Result<usize> {
        let slot = self.slot(id)?.clone();
        let was_running = slot.is_running();
        slot.set_running(false);

        if let Some(task) = take_task(&slot) {
            let _ = task.stop_tx.send(true);
            if close_positions {
                if let Err(e) = task.handle.await {
                    tracing::error!(agent = id, "Automation task ended abnormally: {}", e);
                }
            }
        }

        let closed = if close_positions && slot.exchange.is_some() {
            self.close_all_positions(id, CloseReason::Shutdown).await?
        } else {
            0
        };

        if was_running {
            self.shared.journal.add_entry(
                id,
                JournalEntry::new(JournalEntryType::Decision)
                    .decision("STOP")
                    .result(format!("Automation stopped, {} trade(s) closed", closed)),
            );
            tracing::info!(agent = id, "🛑 Automation stopped ({} trade(s) closed)", closed);
        }
        Ok(closed)
    }

    /// Start every agent, staggered by index; returns the ids that started
    pub async fn start_all(&self, interval: Duration) -> Vec<AgentId> {
        let mut started = Vec::new();
        for (index, id) in self.agent_ids().into_iter().enumerate() {
            if index > 0 && !self.shared.settings.stagger.is_zero() {
                tokio::time::sleep(self.shared.settings.stagger).await;
            }
            match self.start(id, interval).await {
                Ok(()) => started.push(id),
                Err(e) => tracing::error!(agent = id, "Failed to start: {}", e),
            }
        }
        started
    }

    /// Stop every agent; returns the total number of trades closed
    pub async fn stop_all(&self, close_positions: bool) -> usize {
        let mut closed = 0;
        for id in self.agent_ids() {
            match self.stop(id, close_positions).await {
                Ok(n) => closed += n,
                Err(e) => tracing::error!(agent = id, "Failed to stop cleanly: {}", e),
            }
        }
        closed
    }

    /// Run a single cycle now, outside the schedule
    pub async fn run_cycle_once(&self, id: AgentId) -> Result<CycleReport> {
        let slot = self.slot(id)?.clone();
        cycle::run_cycle(&self.shared, &slot).await
    }

    // ====== Positions ======

    /// Live exchange positions for an agent
    pub async fn positions(&self, id: AgentId) -> Result<Vec<PositionRisk>> {
        let slot = self.slot(id)?;
        let positions = slot.exchange()?.get_positions(None).await?;
        Ok(positions.into_iter().filter(|p| p.is_open()).collect())
    }

    /// Manually close one symbol and settle its tracked trades
    pub async fn close_position(&self, id: AgentId, symbol: &str) -> Result<CloseOutcome> {
        let slot = self.slot(id)?.clone();
        let exchange = slot.exchange()?.clone();
        let mut state = slot.state.lock().await;

        let outcome = exchange.close_position(symbol).await?;
        let exit_price = match &outcome {
            CloseOutcome::Closed { order, .. } => Some(order.avg_price).filter(|p| *p > 0.0),
            CloseOutcome::NoPosition { .. } => None,
        };
        state.trades.close_symbol(symbol, exit_price, CloseReason::Manual);
        slot.publish(&state);

        if let CloseOutcome::Closed { order, quantity } = &outcome {
            self.shared.journal.add_entry(
                id,
                JournalEntry::new(JournalEntryType::PositionClosed)
                    .symbol(symbol)
                    .decision("CLOSE")
                    .reasoning("Manual close")
                    .result(format!("Closed {} {}", quantity, symbol))
                    .external_ref(order.order_id.clone()),
            );
        }
        Ok(outcome)
    }

    /// Close every live position of an agent (tracked or not)
    pub async fn close_all_positions(&self, id: AgentId, reason: CloseReason) -> Result<usize> {
        let slot = self.slot(id)?.clone();
        let exchange = slot.exchange()?.clone();
        let mut state = slot.state.lock().await;

        let mut symbols: Vec<String> = exchange
            .get_positions(None)
            .await?
            .into_iter()
            .filter(|p| p.is_open())
            .map(|p| p.symbol)
            .collect();
        for trade in state.trades.open_trades() {
            if !symbols.contains(&trade.symbol) {
                symbols.push(trade.symbol.clone());
            }
        }

        let mut closed = 0;
        for symbol in &symbols {
            match exchange.close_position(symbol).await {
                Ok(outcome) => {
                    let exit_price = match &outcome {
                        CloseOutcome::Closed { order, .. } => {
                            Some(order.avg_price).filter(|p| *p > 0.0)
                        }
                        CloseOutcome::NoPosition { .. } => None,
                    };
                    closed += state.trades.close_symbol(symbol, exit_price, reason);
                    if outcome.is_closed() {
                        self.shared.journal.add_entry(
                            id,
                            JournalEntry::new(JournalEntryType::PositionClosed)
                                .symbol(symbol.clone())
                                .decision("CLOSE")
                                .reasoning(format!("Close all positions ({:?})", reason)),
                        );
                    }
                }
                Err(e) => tracing::error!(agent = id, "Failed to close {}: {}", symbol, e),
            }
        }

        slot.publish(&state);
        Ok(closed)
    }

    // ====== Status ======

    /// Status for one agent, optionally with its journal
    pub async fn status(&self, id: AgentId, include_journal: bool) -> Result<AgentStatus> {
        let slot = self.slot(id)?.clone();
        let settings = &self.shared.settings;
        slot.refresh_balances_if_stale(
            &settings.quote_asset,
            settings.fallback_exchange_balance,
            settings.balance_refresh,
        )
        .await;

        let journal = include_journal.then(|| self.shared.journal.entries(id));
        Ok(AgentStatus::build(&slot, self.baseline(&slot), journal))
    }

    /// Status for every agent; balances are re-read at most once per refresh interval
    pub async fn all_statuses(&self, include_journal: bool) -> Vec<AgentStatus> {
        if self.shared.aggregator.claim_refresh() {
            let settings = &self.shared.settings;
            let mut refreshes = JoinSet::new();
            for slot in self.agents.values() {
                let slot = slot.clone();
                let quote = settings.quote_asset.clone();
                let fallback = settings.fallback_exchange_balance;
                refreshes.spawn(async move {
                    slot.refresh_balances(&quote, fallback).await;
                });
            }
            while let Some(joined) = refreshes.join_next().await {
                if let Err(e) = joined {
                    tracing::warn!("Balance refresh task failed: {}", e);
                }
            }
        }

        self.agents
            .values()
            .map(|slot| {
                let journal = include_journal.then(|| self.shared.journal.entries(slot.id()));
                AgentStatus::build(slot, self.baseline(slot), journal)
            })
            .collect()
    }

    pub async fn aggregated(&self) -> AggregatedStats {
        StatusAggregator::aggregate(&self.all_statuses(false).await)
    }
}

fn take_task(slot: &AgentSlot) -> Option<RunningTask> {
    slot.control
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, JournalConfig};
    use crate::wallet::FixedLedger;

    fn journal(dir: &tempfile::TempDir) -> JournalStore {
        JournalStore::open(&JournalConfig {
            path: dir.path().join("journal.json"),
            ..JournalConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_without_credentials_fails() {
        let dir = tempfile::tempdir().unwrap();
        let slot = AgentSlot::new(AgentConfig::new(1), None, None, Arc::new(FixedLedger(0.0)));
        let scheduler = AgentScheduler::new(
            SchedulerSettings::default(),
            TradingLimits::default(),
            journal(&dir),
            vec![slot],
        );

        let err = scheduler
            .start(1, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Config(_)));
        assert!(!scheduler.is_running(1));

        assert!(matches!(
            scheduler.start(9, Duration::from_secs(60)).await,
            Err(BotError::UnknownAgent(9))
        ));
    }

    #[tokio::test]
    async fn test_from_config_registers_every_agent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        // Nothing listens here, so balance reads fail fast and fall back
        config.exchange.base_url = "http://127.0.0.1:1".to_string();
        config.resolve_agents(|key| match key {
            "AGENT1_API_KEY" => Some("k".to_string()),
            "AGENT1_API_SECRET" => Some("s".to_string()),
            "AGENT1_MODEL_KEY" => Some("m".to_string()),
            _ => None,
        });

        let scheduler = AgentScheduler::from_config(&config, journal(&dir)).unwrap();
        assert_eq!(scheduler.agent_ids(), vec![1, 2, 3, 4, 5, 6]);

        let statuses = scheduler.all_statuses(false).await;
        assert_eq!(statuses.len(), 6);
        assert!(statuses.iter().all(|s| !s.running));
        assert_eq!(statuses[0].name, "DeepSeek");
        assert_eq!(statuses[0].balances.exchange_balance, 900.0);
        assert_eq!(statuses[0].balances.total, 1900.0);
        assert_eq!(statuses[0].total_pnl, 0.0);
    }
}
