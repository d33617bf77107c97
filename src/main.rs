use anyhow::Context;
use clap::{Parser, Subcommand};
use perpdesk::api::CloseOutcome;
use perpdesk::automation::{AgentScheduler, StatusAggregator};
use perpdesk::config::{AppConfig, LoggingConfig};
use perpdesk::models::{AgentId, CloseReason};
use perpdesk::persistence::JournalStore;
use perpdesk::shutdown::{emergency_shutdown, install_panic_hook, wait_for_signal};
use std::path::PathBuf;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "perpdesk")]
#[command(about = "Supervisor for LLM-driven futures trading agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (default: perpdesk.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start automation and supervise until interrupted
    Run {
        /// Minutes between cycles (overrides scheduler.interval_minutes)
        #[arg(short, long)]
        interval: Option<u64>,

        /// Only start these agents (repeatable); all agents when omitted
        #[arg(short, long = "agent")]
        agents: Vec<AgentId>,

        /// Trade against the in-memory paper exchange with live prices
        #[arg(long)]
        paper: bool,
    },

    /// Print agent balances and journal as JSON.
    ///
    /// Runs in its own process, so it always reports agents as stopped with
    /// empty counters and trades. Live figures come from the 📊 stats line
    /// that `run` logs periodically.
    Status {
        #[arg(short, long)]
        agent: Option<AgentId>,

        /// Include journal entries
        #[arg(long)]
        journal: bool,
    },

    /// List an agent's live exchange positions
    Positions {
        #[arg(short, long)]
        agent: AgentId,
    },

    /// Close one position, or every position of the agent
    Close {
        #[arg(short, long)]
        agent: AgentId,

        #[arg(short, long)]
        symbol: Option<String>,
    },

    /// Inspect or reset the journal
    Journal {
        #[command(subcommand)]
        action: JournalAction,
    },
}

#[derive(Subcommand)]
enum JournalAction {
    /// Write the full journal as JSON (stdout when --out is omitted)
    Export {
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Remove entries for one agent, or all
    Clear {
        #[arg(short, long)]
        agent: Option<AgentId>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let _log_guard = setup_logging(&config.logging);

    let journal = JournalStore::open(&config.journal).context("Failed to open journal")?;

    match cli.command {
        Commands::Run {
            interval,
            agents,
            paper,
        } => {
            if let Some(minutes) = interval {
                config.scheduler.interval_minutes = minutes;
            }
            config.scheduler.paper |= paper;
            run(config, journal, agents).await?;
        }
        Commands::Status { agent, journal: with_journal } => {
            let scheduler = AgentScheduler::from_config(&config, journal)?;
            match agent {
                Some(id) => {
                    let status = scheduler.status(id, with_journal).await?;
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
                None => {
                    let statuses = scheduler.all_statuses(with_journal).await;
                    let stats = StatusAggregator::aggregate(&statuses);
                    let report = serde_json::json!({ "stats": stats, "agents": statuses });
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
            }
        }
        Commands::Positions { agent } => {
            let scheduler = AgentScheduler::from_config(&config, journal)?;
            let positions = scheduler.positions(agent).await?;
            if positions.is_empty() {
                println!("Agent {} has no open positions", agent);
            }
            for p in positions {
                println!(
                    "{:<12} {:>12} @ {:<12} mark {:<12} uPnL {:>10.2}",
                    p.symbol, p.position_amt, p.entry_price, p.mark_price, p.unrealized_profit
                );
            }
        }
        Commands::Close { agent, symbol } => {
            let scheduler = AgentScheduler::from_config(&config, journal.clone())?;
            match symbol {
                Some(symbol) => {
                    let symbol = symbol.to_ascii_uppercase();
                    match scheduler.close_position(agent, &symbol).await? {
                        CloseOutcome::Closed { order, quantity } => println!(
                            "Closed {} {} (order {}, avg ${})",
                            quantity, symbol, order.order_id, order.avg_price
                        ),
                        CloseOutcome::NoPosition { .. } => println!("No position to close for {}", symbol),
                    }
                }
                None => {
                    let closed = scheduler
                        .close_all_positions(agent, CloseReason::Manual)
                        .await?;
                    println!("Closed {} tracked trade(s)", closed);
                }
            }
            journal.flush()?;
        }
        Commands::Journal { action } => match action {
            JournalAction::Export { out } => {
                let json = journal.export_json()?;
                match out {
                    Some(path) => {
                        std::fs::write(&path, json)
                            .with_context(|| format!("Failed to write {}", path.display()))?;
                        println!("Journal exported to {}", path.display());
                    }
                    None => println!("{}", json),
                }
            }
            JournalAction::Clear { agent } => {
                journal.clear(agent);
                journal.flush()?;
                match agent {
                    Some(id) => println!("Cleared journal for agent {}", id),
                    None => println!("Cleared journal"),
                }
            }
        },
    }

    Ok(())
}

// ============================================================================
// Supervisor
// ============================================================================

async fn run(config: AppConfig, journal: JournalStore, agents: Vec<AgentId>) -> anyhow::Result<()> {
    let mut panics = install_panic_hook();
    let writer = journal.spawn_writer(Duration::from_millis(config.journal.flush_interval_ms));
    let scheduler = AgentScheduler::from_config(&config, journal.clone())?;
    let interval = config.scheduler.interval();

    tracing::info!(
        "🚀 perpdesk starting: {} agent(s), every {} min{}",
        scheduler.agent_ids().len(),
        config.scheduler.interval_minutes,
        if config.scheduler.paper { " (paper)" } else { "" }
    );

    let started = if agents.is_empty() {
        scheduler.start_all(interval).await
    } else {
        let mut started = Vec::new();
        for (index, id) in agents.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(Duration::from_secs(config.scheduler.stagger_secs)).await;
            }
            match scheduler.start(id, interval).await {
                Ok(()) => started.push(id),
                Err(e) => tracing::error!(agent = id, "Failed to start: {}", e),
            }
        }
        started
    };

    if started.is_empty() {
        writer.shutdown().await;
        anyhow::bail!("No agent could be started; check AGENT{{n}}_* credentials");
    }
    tracing::info!("✅ Running agents: {:?}", started);

    let mut status_ticker =
        tokio::time::interval(Duration::from_secs(config.status.log_interval_secs.max(1)));
    status_ticker.tick().await;

    let signal = wait_for_signal();
    tokio::pin!(signal);

    let reason = loop {
        tokio::select! {
            reason = &mut signal => break reason,
            Some(reason) = panics.recv() => break reason,
            _ = status_ticker.tick() => log_stats(&scheduler).await,
        }
    };

    emergency_shutdown(&scheduler, &journal, &reason, SHUTDOWN_TIMEOUT).await;
    writer.shutdown().await;
    tracing::info!("👋 perpdesk stopped");
    Ok(())
}

async fn log_stats(scheduler: &AgentScheduler) {
    let stats = scheduler.aggregated().await;
    tracing::info!(
        "📊 {}/{} agents running | {} active trades ({} unprotected) | {} ok / {} failed | trade P&L ${:.2} | balance ${:.2} (P&L ${:.2})",
        stats.running_agents,
        stats.total_agents,
        stats.active_trades,
        stats.unprotected_trades,
        stats.total_successes,
        stats.total_failures,
        stats.total_trade_pnl,
        stats.total_balance,
        stats.total_pnl
    );
}

fn setup_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (file_layer, guard) = match &config.dir {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                (
                    Some(fmt::layer().with_writer(writer).with_ansi(false)),
                    Some(guard),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: could not create log directory {} ({}), file logging disabled",
                    dir.display(),
                    e
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    guard
}
