use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::agent::AgentStatus;

/// System-wide totals across all agents
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStats {
    pub total_agents: usize,
    pub running_agents: usize,
    pub total_trades: usize,
    pub active_trades: usize,
    pub unprotected_trades: usize,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Realized plus unrealized trade P&L
    pub total_trade_pnl: f64,
    pub total_balance: f64,
    /// Sum of balance P&L against each agent's baseline
    pub total_pnl: f64,
}

/// Decides when agent balances are re-read for status views.
///
/// One timestamp is shared by every status reader, so a burst of status
/// requests costs at most one round of balance calls per interval.
#[derive(Clone)]
pub struct StatusAggregator {
    refresh_interval: Duration,
    last_refresh: Arc<Mutex<Option<Instant>>>,
}

impl StatusAggregator {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            last_refresh: Arc::new(Mutex::new(None)),
        }
    }

    /// True (and the timestamp is taken) if a refresh is due
    pub fn claim_refresh(&self) -> bool {
        let mut last = self
            .last_refresh
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *last {
            Some(at) if at.elapsed() <= self.refresh_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    pub fn aggregate(statuses: &[AgentStatus]) -> AggregatedStats {
        statuses.iter().fold(
            AggregatedStats {
                total_agents: statuses.len(),
                ..AggregatedStats::default()
            },
            |mut stats, s| {
                if s.running {
                    stats.running_agents += 1;
                }
                stats.total_trades += s.total_trades;
                stats.active_trades += s.active_trades;
                stats.unprotected_trades += s.unprotected_trades;
                stats.total_successes += s.success_count;
                stats.total_failures += s.failure_count;
                stats.total_trade_pnl += s.trade_pnl;
                stats.total_balance += s.balances.total;
                stats.total_pnl += s.total_pnl;
                stats
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::BalanceSnapshot;

    fn status(id: u32, running: bool, active: usize, pnl: f64) -> AgentStatus {
        AgentStatus {
            id,
            name: format!("Agent {}", id),
            running,
            last_cycle_at: None,
            success_count: 3,
            failure_count: 1,
            last_error: None,
            last_decision: None,
            baseline_balance: 1900.0,
            balances: BalanceSnapshot {
                total: 1900.0 + pnl,
                ..BalanceSnapshot::default()
            },
            total_pnl: pnl,
            total_pnl_pct: 0.0,
            trade_pnl: pnl / 2.0,
            total_trades: active + 1,
            active_trades: active,
            unprotected_trades: 0,
            trades: Vec::new(),
            journal: None,
        }
    }

    #[test]
    fn test_refresh_is_throttled() {
        let aggregator = StatusAggregator::new(Duration::from_secs(120));
        assert!(aggregator.claim_refresh());
        assert!(!aggregator.claim_refresh());

        // Clones share the timestamp
        assert!(!aggregator.clone().claim_refresh());

        let eager = StatusAggregator::new(Duration::ZERO);
        assert!(eager.claim_refresh());
        std::thread::sleep(Duration::from_millis(2));
        assert!(eager.claim_refresh());
    }

    #[test]
    fn test_aggregate_sums_agents() {
        let stats = StatusAggregator::aggregate(&[
            status(1, true, 2, 40.0),
            status(2, false, 1, -10.0),
        ]);

        assert_eq!(stats.total_agents, 2);
        assert_eq!(stats.running_agents, 1);
        assert_eq!(stats.active_trades, 3);
        assert_eq!(stats.total_trades, 5);
        assert_eq!(stats.total_successes, 6);
        assert_eq!(stats.total_failures, 2);
        assert!((stats.total_pnl - 30.0).abs() < 1e-9);
        assert!((stats.total_trade_pnl - 15.0).abs() < 1e-9);
        assert!((stats.total_balance - 3830.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_empty() {
        assert_eq!(
            StatusAggregator::aggregate(&[]),
            AggregatedStats::default()
        );
    }
}
