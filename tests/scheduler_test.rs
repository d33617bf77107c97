use async_trait::async_trait;
use perpdesk::api::{CloseOutcome, FuturesExchange, OrderType, PaperCall, PaperExchange};
use perpdesk::automation::{AgentScheduler, AgentSlot, SchedulerSettings};
use perpdesk::config::{AgentConfig, JournalConfig};
use perpdesk::decision::DecisionGateway;
use perpdesk::execution::ExecutionOutcome;
use perpdesk::models::{DecisionAction, TradeDecision, TradeStatus};
use perpdesk::persistence::{JournalEntry, JournalEntryType, JournalStore};
use perpdesk::risk::{Rejection, TradingLimits};
use perpdesk::wallet::FixedLedger;
use perpdesk::{BotError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

/// Replays queued decisions, then holds
struct ScriptedGateway {
    decisions: Mutex<VecDeque<TradeDecision>>,
}

impl ScriptedGateway {
    fn new(decisions: Vec<TradeDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
        }
    }
}

#[async_trait]
impl DecisionGateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        let next = self.decisions.lock().unwrap().pop_front().unwrap_or_else(|| {
            let mut hold = TradeDecision::hold("nothing to do");
            hold.confidence = 100.0;
            hold
        });
        Ok(serde_json::to_string(&next)?)
    }
}

struct Harness {
    scheduler: AgentScheduler,
    paper: PaperExchange,
    journal: JournalStore,
    _dir: tempfile::TempDir,
}

/// Holds after a delay, counting how many calls began
struct SlowGateway {
    delay: Duration,
    started: AtomicUsize,
}

#[async_trait]
impl DecisionGateway for SlowGateway {
    fn name(&self) -> &str {
        "slow"
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let mut hold = TradeDecision::hold("thinking took a while");
        hold.confidence = 100.0;
        Ok(serde_json::to_string(&hold)?)
    }
}

fn harness(decisions: Vec<TradeDecision>) -> Harness {
    harness_with(Arc::new(ScriptedGateway::new(decisions)))
}

fn harness_with(gateway: Arc<dyn DecisionGateway>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let journal = JournalStore::open(&JournalConfig {
        path: dir.path().join("journal.json"),
        ..JournalConfig::default()
    })
    .unwrap();

    let paper = PaperExchange::new("USDT", 1000.0);
    paper.set_price("BTCUSDT", 65000.0);
    paper.set_price("ETHUSDT", 3000.0);
    paper.set_price("SOLUSDT", 150.0);

    let exchange: Arc<dyn FuturesExchange> = Arc::new(paper.clone());
    let slot = AgentSlot::new(
        AgentConfig::new(1),
        Some(exchange),
        Some(gateway),
        Arc::new(FixedLedger(1000.0)),
    );

    let settings = SchedulerSettings {
        symbols: vec!["BTCUSDT".into(), "ETHUSDT".into(), "SOLUSDT".into()],
        stagger: Duration::ZERO,
        ..SchedulerSettings::default()
    };
    let scheduler = AgentScheduler::new(settings, TradingLimits::default(), journal.clone(), vec![slot]);

    Harness {
        scheduler,
        paper,
        journal,
        _dir: dir,
    }
}

fn long(symbol: &str, price: f64, confidence: f64) -> TradeDecision {
    TradeDecision {
        symbol: symbol.to_string(),
        action: DecisionAction::Long,
        leverage: 10,
        usd_amount: 200.0,
        confidence,
        reasoning: "trend".to_string(),
        stop_loss: Some(price * 0.98),
        take_profit: Some(price * 1.04),
    }
}

fn order_calls(paper: &PaperExchange) -> usize {
    paper
        .calls()
        .iter()
        .filter(|c| matches!(c, PaperCall::PlaceOrder(_) | PaperCall::SetLeverage { .. }))
        .count()
}

fn last_entry(journal: &JournalStore) -> JournalEntry {
    journal.entries(1).last().cloned().unwrap()
}

#[tokio::test]
async fn test_oldest_trade_closed_at_position_limit() {
    let h = harness(vec![
        long("BTCUSDT", 65000.0, 80.0),
        long("ETHUSDT", 3000.0, 80.0),
        long("SOLUSDT", 150.0, 80.0),
    ]);

    let first = assert_ok!(h.scheduler.run_cycle_once(1).await);
    assert_eq!(first.execution.outcome, ExecutionOutcome::Opened);
    let second = assert_ok!(h.scheduler.run_cycle_once(1).await);
    assert_eq!(second.active_trades, 2);

    let third = assert_ok!(h.scheduler.run_cycle_once(1).await);
    assert_eq!(third.limit_closed, vec!["BTCUSDT".to_string()]);
    assert_eq!(third.execution.outcome, ExecutionOutcome::Opened);
    assert_eq!(third.active_trades, 2);

    assert_eq!(h.paper.position_amount("BTCUSDT"), 0.0);
    assert!(h.paper.position_amount("ETHUSDT") > 0.0);
    assert!(h.paper.position_amount("SOLUSDT") > 0.0);

    let status = h.scheduler.status(1, true).await.unwrap();
    assert_eq!(status.active_trades, 2);
    assert_eq!(status.success_count, 3);
    let open: Vec<&str> = status
        .trades
        .iter()
        .filter(|t| t.status.is_open())
        .map(|t| t.symbol.as_str())
        .collect();
    assert_eq!(open, vec!["ETHUSDT", "SOLUSDT"]);

    let journal = status.journal.unwrap();
    assert!(journal.iter().any(|e| {
        e.entry_type == JournalEntryType::PositionClosed
            && e.symbol.as_deref() == Some("BTCUSDT")
            && e.reasoning.as_deref() == Some("Close position due to limit")
    }));
}

#[tokio::test]
async fn test_active_trades_never_exceed_limit() {
    let decisions = (0..6)
        .map(|i| match i % 3 {
            0 => long("BTCUSDT", 65000.0, 90.0),
            1 => long("ETHUSDT", 3000.0, 90.0),
            _ => long("SOLUSDT", 150.0, 90.0),
        })
        .collect();
    let h = harness(decisions);

    for _ in 0..6 {
        let report = assert_ok!(h.scheduler.run_cycle_once(1).await);
        assert!(report.active_trades <= 2, "{} active", report.active_trades);
    }
}

#[tokio::test]
async fn test_low_confidence_places_no_order() {
    let h = harness(vec![long("BTCUSDT", 65000.0, 30.0)]);

    let report = assert_ok!(h.scheduler.run_cycle_once(1).await);
    assert!(matches!(
        report.execution.outcome,
        ExecutionOutcome::Rejected(Rejection::LowConfidence { .. })
    ));
    assert_eq!(order_calls(&h.paper), 0);

    let entry = last_entry(&h.journal);
    assert_eq!(entry.entry_type, JournalEntryType::Decision);
    assert!(entry.result.unwrap().starts_with("SKIPPED"));

    // Skips count as neither success nor failure
    let status = h.scheduler.status(1, false).await.unwrap();
    assert_eq!((status.success_count, status.failure_count), (0, 0));
}

#[tokio::test]
async fn test_stop_above_price_rejected_before_leverage() {
    let mut decision = long("BTCUSDT", 65000.0, 80.0);
    decision.stop_loss = Some(66000.0);
    let h = harness(vec![decision]);

    let report = assert_ok!(h.scheduler.run_cycle_once(1).await);
    assert!(matches!(
        report.execution.outcome,
        ExecutionOutcome::Rejected(Rejection::StopLossWrongSide { .. })
    ));
    assert_eq!(order_calls(&h.paper), 0);
}

#[tokio::test]
async fn test_missing_protection_never_reaches_the_exchange() {
    let mut no_stop = long("BTCUSDT", 65000.0, 80.0);
    no_stop.stop_loss = None;
    let mut no_target = long("ETHUSDT", 3000.0, 80.0);
    no_target.take_profit = None;
    let h = harness(vec![no_stop, no_target]);

    for _ in 0..2 {
        let report = assert_ok!(h.scheduler.run_cycle_once(1).await);
        assert_eq!(
            report.execution.outcome,
            ExecutionOutcome::Rejected(Rejection::MissingProtection)
        );
    }
    assert_eq!(order_calls(&h.paper), 0);
}

#[tokio::test]
async fn test_close_without_position_is_structured_noop() {
    let h = harness(vec![]);

    let outcome = h.scheduler.close_position(1, "ETHUSDT").await.unwrap();
    assert_eq!(
        outcome,
        CloseOutcome::NoPosition {
            symbol: "ETHUSDT".to_string()
        }
    );
    assert_eq!(order_calls(&h.paper), 0);
}

#[tokio::test]
async fn test_journal_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = JournalConfig {
        path: dir.path().join("journal.json"),
        flush_interval_ms: 10,
        ..JournalConfig::default()
    };

    let journal = JournalStore::open(&config).unwrap();
    let writer = journal.spawn_writer(Duration::from_millis(config.flush_interval_ms));
    for n in 0..10 {
        journal.add_entry(
            3,
            JournalEntry::new(JournalEntryType::Decision)
                .symbol("BTCUSDT")
                .result(format!("entry {}", n)),
        );
    }
    let before = journal.entries(3);
    writer.shutdown().await;
    drop(journal);

    let reopened = JournalStore::open(&config).unwrap();
    let after = reopened.entries(3);
    assert_eq!(after.len(), 10);
    assert_eq!(after, before);
    assert_eq!(after[0].result.as_deref(), Some("entry 0"));
    assert_eq!(after[9].result.as_deref(), Some("entry 9"));
}

#[tokio::test]
async fn test_cycle_errors_are_counted_and_journaled() {
    let h = harness(vec![]);
    h.paper.set_offline(true);

    let err = assert_err!(h.scheduler.run_cycle_once(1).await);
    assert!(matches!(err, BotError::Timeout(_)));

    let entry = last_entry(&h.journal);
    assert_eq!(entry.entry_type, JournalEntryType::Error);

    h.paper.set_offline(false);
    let report = assert_ok!(h.scheduler.run_cycle_once(1).await);
    assert_eq!(report.execution.outcome, ExecutionOutcome::Held);

    let status = h.scheduler.status(1, false).await.unwrap();
    assert_eq!(status.failure_count, 1);
    assert!(status.last_cycle_at.is_some());
}

#[tokio::test]
async fn test_low_balance_skips_decision() {
    let h = harness(vec![long("BTCUSDT", 65000.0, 80.0)]);
    h.paper.set_balance(50.0);

    let err = assert_err!(h.scheduler.run_cycle_once(1).await);
    assert!(matches!(err, BotError::InsufficientBalance { .. }));
    assert_eq!(order_calls(&h.paper), 0);
}

#[tokio::test]
async fn test_failed_protection_marks_trade_unprotected() {
    let h = harness(vec![long("SOLUSDT", 150.0, 75.0)]);
    h.paper.reject_orders_of_type(OrderType::Limit);

    let report = assert_ok!(h.scheduler.run_cycle_once(1).await);
    assert_eq!(report.execution.outcome, ExecutionOutcome::Opened);
    assert!(report.execution.protection.stop_loss_placed);
    assert!(!report.execution.protection.take_profit_placed);

    let status = h.scheduler.status(1, true).await.unwrap();
    assert_eq!(status.trades[0].status, TradeStatus::Unprotected);
    assert_eq!(status.unprotected_trades, 1);
    // Left open, not auto-closed
    assert!(h.paper.position_amount("SOLUSDT") > 0.0);

    let journal = status.journal.unwrap();
    assert!(journal.iter().any(|e| e.entry_type == JournalEntryType::Error));

    let stats = h.scheduler.aggregated().await;
    assert_eq!(stats.unprotected_trades, 1);
    assert_eq!(stats.active_trades, 1);
}

#[tokio::test]
async fn test_exchange_side_close_settles_trade() {
    let h = harness(vec![long("BTCUSDT", 65000.0, 80.0)]);
    assert_ok!(h.scheduler.run_cycle_once(1).await);

    // Stop-loss filled on the exchange
    h.paper.liquidate("BTCUSDT");

    let report = assert_ok!(h.scheduler.run_cycle_once(1).await);
    assert_eq!(report.cleaned_orders, 1);
    assert_eq!(report.settled_trades, 1);
    assert_eq!(report.active_trades, 0);
    assert!(h.paper.open_orders_snapshot().iter().all(|o| !o.is_stop()));
}

#[tokio::test]
async fn test_start_runs_immediately_and_stop_is_idempotent() {
    let h = harness(vec![]);

    h.scheduler.start(1, Duration::from_secs(3600)).await.unwrap();
    // Restarting replaces the running task
    h.scheduler.start(1, Duration::from_secs(3600)).await.unwrap();
    assert!(h.scheduler.is_running(1));

    let mut ran = false;
    for _ in 0..100 {
        if h.scheduler.status(1, false).await.unwrap().last_cycle_at.is_some() {
            ran = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ran, "first cycle did not run");

    assert_eq!(h.scheduler.stop(1, false).await.unwrap(), 0);
    assert!(!h.scheduler.is_running(1));
    h.scheduler.stop(1, false).await.unwrap();

    let decisions: Vec<String> = h
        .journal
        .entries(1)
        .iter()
        .filter_map(|e| e.decision.clone())
        .collect();
    assert!(decisions.iter().any(|d| d == "START"));
    assert_eq!(decisions.iter().filter(|d| *d == "STOP").count(), 1);
}

#[tokio::test]
async fn test_no_cycle_starts_after_stop_returns() {
    for _ in 0..20 {
        let gateway = Arc::new(SlowGateway {
            delay: Duration::from_millis(30),
            started: AtomicUsize::new(0),
        });
        let h = harness_with(gateway.clone());

        // Interval far shorter than a cycle, so a tick is always pending
        h.scheduler.start(1, Duration::from_millis(5)).await.unwrap();
        while gateway.started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.scheduler.stop(1, false).await.unwrap();
        let at_stop = gateway.started.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(gateway.started.load(Ordering::SeqCst), at_stop);
        assert!(!h.scheduler.is_running(1));
    }
}
