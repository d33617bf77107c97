use chrono::Utc;
use std::time::Instant;
use uuid::Uuid;

use super::agent::{AgentSlot, AgentState};
use super::Shared;
use crate::api::{CloseOutcome, FuturesExchange};
use crate::error::{BotError, Result};
use crate::execution::{ExecutionOutcome, ExecutionResult, PositionManager};
use crate::models::{
    AgentId, CloseReason, DecisionContext, MarketSnapshot, Trade, TradeDecision, TradeSide,
    TradeStatus,
};
use crate::persistence::{JournalEntry, JournalEntryType};

/// What one cycle did
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub agent_id: AgentId,
    /// Stop orders cancelled during cleanup
    pub cleaned_orders: usize,
    /// Symbols force-closed to stay under the position limit
    pub limit_closed: Vec<String>,
    pub decision: TradeDecision,
    pub execution: ExecutionResult,
    /// Trades settled because the exchange no longer holds their position
    pub settled_trades: usize,
    pub active_trades: usize,
}

/// Run one full cycle for an agent.
///
/// Holds the agent's state lock throughout. Errors are counted and journaled
/// here and then returned to the caller, which only logs them.
pub(crate) async fn run_cycle(shared: &Shared, slot: &AgentSlot) -> Result<CycleReport> {
    let id = slot.id();
    let mut state = slot.state.lock().await;
    let started = Instant::now();

    let result = execute_steps(shared, slot, &mut state).await;
    state.last_cycle_at = Some(Utc::now());

    match &result {
        Ok(report) => {
            match &report.execution.outcome {
                ExecutionOutcome::Opened | ExecutionOutcome::Closed { .. } => {
                    state.success_count += 1;
                    state.last_error = None;
                }
                ExecutionOutcome::Failed => {
                    state.failure_count += 1;
                    state.last_error = Some(report.execution.message.clone());
                }
                ExecutionOutcome::Held | ExecutionOutcome::Rejected(_) => {}
            }
            tracing::info!(
                agent = id,
                "Cycle complete in {:.1}s: {} {} -> {} ({} active)",
                started.elapsed().as_secs_f64(),
                report.decision.action,
                report.decision.symbol,
                report.execution.message,
                report.active_trades
            );
        }
        Err(e) => {
            state.failure_count += 1;
            state.last_error = Some(e.to_string());
            tracing::error!(agent = id, "Cycle failed: {}", e);
            shared.journal.add_entry(
                id,
                JournalEntry::new(JournalEntryType::Error).result(format!("Cycle failed: {}", e)),
            );
        }
    }

    slot.publish(&state);
    result
}

async fn execute_steps(
    shared: &Shared,
    slot: &AgentSlot,
    state: &mut AgentState,
) -> Result<CycleReport> {
    let id = slot.id();
    let settings = &shared.settings;
    let exchange = slot.exchange()?.clone();
    let gateway = slot.gateway()?.clone();

    // ====== 1. Cleanup ======
    let cleaned_orders = cancel_stale_orders(exchange.as_ref(), id).await?;

    // ====== 2. Position limit ======
    let limit_closed = enforce_position_limit(shared, id, exchange.as_ref(), state).await;

    // ====== 3. Context ======
    exchange.ping().await?;
    let balance = exchange.get_balance(&settings.quote_asset).await?;
    if balance.available_balance < settings.min_balance_usd {
        return Err(BotError::InsufficientBalance {
            available: balance.available_balance,
            required: settings.min_balance_usd,
        });
    }
    let positions = exchange.get_positions(None).await?;
    let market = market_snapshot(exchange.as_ref(), &settings.symbols, id).await;
    if market.is_empty() {
        return Err(BotError::Validation(
            "no market data for any configured symbol".to_string(),
        ));
    }

    let context = DecisionContext {
        agent_name: slot.config.name.clone(),
        market,
        available_balance: balance.available_balance,
        open_positions: positions.iter().filter(|p| p.is_open()).count(),
        max_leverage: shared.limits.max_leverage,
    };

    // ====== 4. Decision ======
    let decision = tokio::time::timeout(settings.decision_timeout, gateway.decide(&context))
        .await
        .map_err(|_| {
            BotError::Timeout(format!(
                "{} gave no decision within {}s",
                gateway.name(),
                settings.decision_timeout.as_secs()
            ))
        })??;
    tracing::info!(
        agent = id,
        "🤖 {} decided {} {} (confidence {:.0}%, leverage {}x, ${:.2})",
        gateway.name(),
        decision.action,
        decision.symbol,
        decision.confidence,
        decision.leverage,
        decision.usd_amount
    );
    state.last_decision = Some(decision.clone());

    // ====== 5. Execution ======
    let open_count = state.trades.open_count();
    let execution = match (
        decision.action.side(),
        shared.limits.check_capacity(open_count),
    ) {
        (Some(_), Err(rejection)) => {
            tracing::warn!(agent = id, "Not opening {}: {}", decision.symbol, rejection);
            ExecutionResult::rejected(rejection, shared.limits.clamp_leverage(decision.leverage))
        }
        _ => {
            PositionManager::new(exchange.clone(), shared.limits)
                .execute(&decision)
                .await
        }
    };
    record_outcome(shared, id, state, &decision, &execution);

    // ====== 6. Bookkeeping ======
    let positions = exchange.get_positions(None).await?;
    let settled_trades = state.trades.refresh_from_positions(&positions);
    if settled_trades > 0 {
        tracing::info!(agent = id, "{} trade(s) closed on the exchange", settled_trades);
    }
    slot.refresh_balances_if_stale(
        &settings.quote_asset,
        settings.fallback_exchange_balance,
        settings.balance_refresh,
    )
    .await;

    Ok(CycleReport {
        agent_id: id,
        cleaned_orders,
        limit_closed,
        decision,
        execution,
        settled_trades,
        active_trades: state.trades.open_count(),
    })
}

/// Cancel every resting stop order so they don't pile up against the
/// exchange's open-order ceiling. Individual cancel failures are ignored.
async fn cancel_stale_orders(exchange: &dyn FuturesExchange, id: AgentId) -> Result<usize> {
    let orders = exchange.get_open_orders(None).await?;

    let mut cancelled = 0;
    for order in orders.iter().filter(|o| o.is_stop()) {
        match exchange.cancel_order(&order.symbol, &order.order_id).await {
            Ok(()) => cancelled += 1,
            Err(e) => tracing::debug!(
                agent = id,
                "Could not cancel {} order {} on {}: {}",
                order.order_type,
                order.order_id,
                order.symbol,
                e
            ),
        }
    }

    if cancelled > 0 {
        tracing::info!(agent = id, "🧹 Cancelled {} stale stop order(s)", cancelled);
    }
    Ok(cancelled)
}

/// Close oldest open trades until there is room for a new one
async fn enforce_position_limit(
    shared: &Shared,
    id: AgentId,
    exchange: &dyn FuturesExchange,
    state: &mut AgentState,
) -> Vec<String> {
    let max = shared.limits.max_active_trades;
    let mut closed_symbols = Vec::new();

    while state.trades.open_count() >= max {
        let Some(oldest) = state.trades.oldest_open().cloned() else {
            break;
        };
        tracing::warn!(
            agent = id,
            "{} active trades (limit {}), closing oldest: {} {} opened {}",
            state.trades.open_count(),
            max,
            oldest.side,
            oldest.symbol,
            oldest.opened_at.format("%H:%M:%S")
        );

        let outcome = match exchange.close_position(&oldest.symbol).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(agent = id, "Failed to close {} for the limit: {}", oldest.symbol, e);
                break;
            }
        };

        let (exit_price, reference) = match &outcome {
            CloseOutcome::Closed { order, .. } => (
                Some(order.avg_price).filter(|p| *p > 0.0),
                Some(order.order_id.clone()),
            ),
            CloseOutcome::NoPosition { .. } => (None, None),
        };
        let closed = state
            .trades
            .close_symbol(&oldest.symbol, exit_price, CloseReason::PositionLimit);

        let mut entry = JournalEntry::new(JournalEntryType::PositionClosed)
            .symbol(oldest.symbol.clone())
            .decision("CLOSE")
            .reasoning("Close position due to limit")
            .amount(oldest.usd_amount)
            .leverage(oldest.leverage)
            .entry_price(oldest.entry_price)
            .result(format!("Closed {} trade(s), limit is {} active", closed, max));
        if let Some(reference) = reference {
            entry = entry.external_ref(reference);
        }
        shared.journal.add_entry(id, entry);
        closed_symbols.push(oldest.symbol);
    }

    closed_symbols
}

/// 24h ticker per symbol; symbols that fail are left out
async fn market_snapshot(
    exchange: &dyn FuturesExchange,
    symbols: &[String],
    id: AgentId,
) -> Vec<MarketSnapshot> {
    let mut market = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        match exchange.get_ticker_24h(symbol).await {
            Ok(ticker) => market.push(MarketSnapshot {
                symbol: symbol.clone(),
                price: ticker.last_price,
                change_24h_pct: ticker.price_change_percent,
                volume_24h: ticker.quote_volume,
                high_24h: ticker.high_price,
                low_24h: ticker.low_price,
            }),
            Err(e) => tracing::warn!(agent = id, "Skipping {}: {}", symbol, e),
        }
    }
    market
}

fn decision_entry(entry_type: JournalEntryType, decision: &TradeDecision) -> JournalEntry {
    let mut entry = JournalEntry::new(entry_type)
        .decision(decision.action.as_str())
        .reasoning(decision.reasoning.clone())
        .confidence(decision.confidence);
    if !decision.symbol.is_empty() {
        entry = entry.symbol(decision.symbol.clone());
    }
    if decision.action.side().is_some() {
        entry = entry
            .amount(decision.usd_amount)
            .leverage(decision.leverage)
            .protection(decision.stop_loss, decision.take_profit);
    }
    entry
}

/// Update the trade book and journal for an execution result
fn record_outcome(
    shared: &Shared,
    id: AgentId,
    state: &mut AgentState,
    decision: &TradeDecision,
    execution: &ExecutionResult,
) {
    let journal = &shared.journal;

    match &execution.outcome {
        ExecutionOutcome::Opened => {
            let Some(side) = decision.action.side() else {
                return;
            };
            let status = if execution.protection.is_complete() {
                TradeStatus::Active
            } else {
                TradeStatus::Unprotected
            };
            let entry_price = execution.entry_price.unwrap_or(0.0);
            let trade = Trade {
                id: Uuid::new_v4(),
                agent_id: id,
                symbol: decision.symbol.clone(),
                side,
                leverage: execution.leverage,
                usd_amount: decision.usd_amount,
                entry_price,
                current_price: entry_price,
                exit_price: None,
                stop_loss: execution.stop_loss.unwrap_or(0.0),
                take_profit: execution.take_profit.unwrap_or(0.0),
                order_id: execution.order_id.clone(),
                opened_at: Utc::now(),
                closed_at: None,
                status,
                close_reason: None,
                unrealized_pnl: 0.0,
                realized_pnl: None,
                confidence: decision.confidence,
                reasoning: decision.reasoning.clone(),
            };

            let entry_type = match side {
                TradeSide::Long => JournalEntryType::LongOpened,
                TradeSide::Short => JournalEntryType::ShortOpened,
            };
            let mut entry = decision_entry(entry_type, decision)
                .leverage(execution.leverage)
                .entry_price(entry_price)
                .protection(execution.stop_loss, execution.take_profit)
                .result(execution.message.clone());
            if let Some(order_id) = &execution.order_id {
                entry = entry.external_ref(order_id.clone());
            }
            journal.add_entry(id, entry);

            if status == TradeStatus::Unprotected {
                tracing::error!(
                    agent = id,
                    "⚠️ {} {} is OPEN WITHOUT full protection (stop-loss placed: {}, take-profit placed: {})",
                    side,
                    trade.symbol,
                    execution.protection.stop_loss_placed,
                    execution.protection.take_profit_placed
                );
                journal.add_entry(
                    id,
                    JournalEntry::new(JournalEntryType::Error)
                        .symbol(trade.symbol.clone())
                        .decision(side.as_str())
                        .result(execution.message.clone()),
                );
            }
            state.trades.record(trade);
        }
        ExecutionOutcome::Closed { had_position } => {
            if *had_position {
                state
                    .trades
                    .close_symbol(&decision.symbol, execution.entry_price, CloseReason::Decision);
            }
            let mut entry = decision_entry(JournalEntryType::PositionClosed, decision)
                .result(execution.message.clone());
            if let Some(order_id) = &execution.order_id {
                entry = entry.external_ref(order_id.clone());
            }
            journal.add_entry(id, entry);
        }
        ExecutionOutcome::Held => {
            journal.add_entry(id, decision_entry(JournalEntryType::Decision, decision).result("HOLD"));
        }
        ExecutionOutcome::Rejected(rejection) => {
            journal.add_entry(
                id,
                decision_entry(JournalEntryType::Decision, decision)
                    .result(format!("SKIPPED: {}", rejection)),
            );
        }
        ExecutionOutcome::Failed => {
            if let Some(side) = decision.action.side() {
                state.trades.record(Trade {
                    id: Uuid::new_v4(),
                    agent_id: id,
                    symbol: decision.symbol.clone(),
                    side,
                    leverage: execution.leverage,
                    usd_amount: decision.usd_amount,
                    entry_price: 0.0,
                    current_price: 0.0,
                    exit_price: None,
                    stop_loss: decision.stop_loss.unwrap_or(0.0),
                    take_profit: decision.take_profit.unwrap_or(0.0),
                    order_id: None,
                    opened_at: Utc::now(),
                    closed_at: None,
                    status: TradeStatus::Failed,
                    close_reason: None,
                    unrealized_pnl: 0.0,
                    realized_pnl: None,
                    confidence: decision.confidence,
                    reasoning: decision.reasoning.clone(),
                });
            }
            journal.add_entry(
                id,
                decision_entry(JournalEntryType::Decision, decision)
                    .result(format!("FAILED: {}", execution.message)),
            );
        }
    }
}
