use std::time::Duration;
use tokio::sync::mpsc;

use crate::automation::AgentScheduler;
use crate::persistence::JournalStore;

/// Why the process is shutting down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    Panic(String),
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Interrupt => f.write_str("SIGINT"),
            ShutdownReason::Terminate => f.write_str("SIGTERM"),
            ShutdownReason::Panic(msg) => write!(f, "panic: {}", msg),
        }
    }
}

/// Wait for SIGINT, or SIGTERM on unix
pub async fn wait_for_signal() -> ShutdownReason {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => ShutdownReason::Interrupt,
                _ = term.recv() => ShutdownReason::Terminate,
            },
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                ShutdownReason::Interrupt
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        ShutdownReason::Interrupt
    }
}

/// Route panics anywhere in the process to the returned receiver.
///
/// The previous hook still runs, so the panic message is printed as usual.
pub fn install_panic_hook() -> mpsc::UnboundedReceiver<ShutdownReason> {
    let (tx, rx) = mpsc::unbounded_channel();
    let previous = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        let location = info
            .location()
            .map(|l| format!(" at {}:{}", l.file(), l.line()))
            .unwrap_or_default();
        let _ = tx.send(ShutdownReason::Panic(format!("{}{}", message, location)));
        previous(info);
    }));

    rx
}

/// Stop every agent, force-close their trades and persist the journal.
///
/// Bounded by `timeout`; the journal is flushed even if closing runs out of
/// time. Returns the number of trades closed.
pub async fn emergency_shutdown(
    scheduler: &AgentScheduler,
    journal: &JournalStore,
    reason: &ShutdownReason,
    timeout: Duration,
) -> usize {
    tracing::warn!("🚨 Emergency shutdown ({}): stopping agents and closing positions", reason);

    let closed = match tokio::time::timeout(timeout, scheduler.stop_all(true)).await {
        Ok(closed) => {
            tracing::info!("Closed {} trade(s) during shutdown", closed);
            closed
        }
        Err(_) => {
            tracing::error!(
                "Shutdown did not finish within {}s, positions may still be open",
                timeout.as_secs()
            );
            0
        }
    };

    if let Err(e) = journal.flush() {
        tracing::error!("Failed to save journal during shutdown: {}", e);
    }
    closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FuturesExchange, PaperExchange};
    use crate::automation::{AgentSlot, SchedulerSettings};
    use crate::config::{AgentConfig, JournalConfig};
    use crate::decision::DecisionGateway;
    use crate::error::Result;
    use crate::models::TradeDecision;
    use crate::risk::TradingLimits;
    use crate::wallet::FixedLedger;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct AlwaysHold;

    #[async_trait]
    impl DecisionGateway for AlwaysHold {
        fn name(&self) -> &str {
            "hold"
        }

        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok(serde_json::to_string(&TradeDecision::hold("waiting"))?)
        }
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(ShutdownReason::Terminate.to_string(), "SIGTERM");
        assert_eq!(
            ShutdownReason::Panic("boom".into()).to_string(),
            "panic: boom"
        );
    }

    #[tokio::test]
    async fn test_emergency_shutdown_closes_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalStore::open(&JournalConfig {
            path: dir.path().join("journal.json"),
            ..JournalConfig::default()
        })
        .unwrap();

        let paper = PaperExchange::new("USDT", 1000.0);
        paper.set_price("BTCUSDT", 65000.0);
        paper.open_position("BTCUSDT", 0.01, 64000.0);
        let exchange: Arc<dyn FuturesExchange> = Arc::new(paper.clone());
        let gateway: Arc<dyn DecisionGateway> = Arc::new(AlwaysHold);
        let slot = AgentSlot::new(
            AgentConfig::new(1),
            Some(exchange),
            Some(gateway),
            Arc::new(FixedLedger(1000.0)),
        );
        let scheduler = AgentScheduler::new(
            SchedulerSettings::default(),
            TradingLimits::default(),
            journal.clone(),
            vec![slot],
        );

        scheduler.start(1, Duration::from_secs(3600)).await.unwrap();
        assert!(scheduler.is_running(1));

        emergency_shutdown(
            &scheduler,
            &journal,
            &ShutdownReason::Interrupt,
            Duration::from_secs(10),
        )
        .await;

        assert!(!scheduler.is_running(1));
        assert_eq!(paper.position_amount("BTCUSDT"), 0.0);
        assert!(dir.path().join("journal.json").exists());
    }
}
