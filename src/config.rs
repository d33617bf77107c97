use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ASTERDEX_API_BASE;
use crate::decision::ProviderKind;
use crate::error::{BotError, Result};
use crate::models::AgentId;
use crate::risk::TradingLimits;

const DEFAULT_CONFIG_FILE: &str = "perpdesk.toml";

// (display name, provider) for agents 1..=6 when nothing is configured
const DEFAULT_AGENTS: &[(&str, ProviderKind)] = &[
    ("DeepSeek", ProviderKind::DeepSeek),
    ("GPT", ProviderKind::OpenAi),
    ("Grok", ProviderKind::Xai),
    ("Qwen", ProviderKind::Qwen),
    ("Gemini", ProviderKind::Google),
    ("Claude", ProviderKind::Anthropic),
];

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub exchange: ExchangeConfig,
    pub scheduler: SchedulerConfig,
    pub trading: TradingConfig,
    pub decision: DecisionConfig,
    pub journal: JournalConfig,
    pub status: StatusConfig,
    pub logging: LoggingConfig,
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// REST base URL of the futures venue
    pub base_url: String,
    pub recv_window_ms: u64,
    pub request_timeout_secs: u64,
    /// Client-side rate limit per agent
    pub requests_per_minute: u32,
    pub clock_sync_cooldown_secs: u64,
    /// Margin asset for balances and sizing
    pub quote_asset: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: ASTERDEX_API_BASE.to_string(),
            recv_window_ms: 60_000,
            request_timeout_secs: 30,
            requests_per_minute: 1200,
            clock_sync_cooldown_secs: 60,
            quote_asset: "USDT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_minutes: u64,
    /// Delay between agents in start-all, multiplied by the agent's index
    pub stagger_secs: u64,
    pub decision_timeout_secs: u64,
    /// Minimum available quote balance to ask for a decision
    pub min_balance_usd: f64,
    pub symbols: Vec<String>,
    /// Number of `AGENT{n}_*` slots read when no `[[agents]]` are configured
    pub agent_count: u32,
    /// Trade against the in-memory paper exchange
    pub paper: bool,
    pub paper_balance: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 3,
            stagger_secs: 2,
            decision_timeout_secs: 60,
            min_balance_usd: 100.0,
            symbols: ["BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            agent_count: 6,
            paper: false,
            paper_balance: 1000.0,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub max_active_trades: usize,
    pub max_leverage: u32,
    pub min_confidence: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        let limits = TradingLimits::default();
        Self {
            max_active_trades: limits.max_active_trades,
            max_leverage: limits.max_leverage,
            min_confidence: limits.min_confidence,
        }
    }
}

impl From<&TradingConfig> for TradingLimits {
    fn from(config: &TradingConfig) -> Self {
        Self {
            max_active_trades: config.max_active_trades,
            max_leverage: config.max_leverage,
            min_confidence: config.min_confidence,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub path: PathBuf,
    pub per_agent_cap: usize,
    pub total_cap: usize,
    pub flush_interval_ms: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logs/journal.json"),
            per_agent_cap: 100,
            total_cap: 500,
            flush_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub balance_refresh_secs: u64,
    /// Reference balance P&L is measured against
    pub baseline_balance: f64,
    /// Used when the exchange balance can't be read
    pub fallback_exchange_balance: f64,
    /// External ledger balance when no RPC endpoint is configured
    pub ledger_fixed_balance: f64,
    /// JSON-RPC endpoint for `eth_getBalance` on the agent's ledger address
    pub ledger_rpc_url: Option<String>,
    /// USD value of one native token on the ledger chain
    pub ledger_native_usd_price: f64,
    /// How often `run` logs aggregated statistics
    pub log_interval_secs: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            balance_refresh_secs: 120,
            baseline_balance: 1900.0,
            fallback_exchange_balance: 900.0,
            ledger_fixed_balance: 1000.0,
            ledger_rpc_url: None,
            ledger_native_usd_price: 600.0,
            log_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive, overridden by RUST_LOG
    pub level: String,
    /// Directory for the daily rolling log file; stdout only when unset
    pub dir: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "perpdesk=info".to_string(),
            dir: None,
            file_prefix: "perpdesk.log".to_string(),
        }
    }
}

/// One trading agent: exchange credentials plus its decision provider
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub id: AgentId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub model_key: Option<String>,
    /// Provider model override
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub ledger_address: Option<String>,
    #[serde(default)]
    pub baseline_balance: Option<f64>,
    #[serde(default)]
    pub fallback_exchange_balance: Option<f64>,
}

impl AgentConfig {
    pub fn new(id: AgentId) -> Self {
        let (name, provider) = DEFAULT_AGENTS
            .get((id as usize).wrapping_sub(1))
            .map(|(name, provider)| (name.to_string(), *provider))
            .unwrap_or_else(|| (format!("Agent {}", id), ProviderKind::OpenAi));

        Self {
            id,
            name,
            api_key: None,
            api_secret: None,
            provider: Some(provider),
            model_key: None,
            model: None,
            ledger_address: None,
            baseline_balance: None,
            fallback_exchange_balance: None,
        }
    }

    /// Fill unset fields from `AGENT{n}_*` variables
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let id = self.id;
        let var = |suffix: &str| {
            lookup(&format!("AGENT{}_{}", id, suffix)).filter(|v| !v.trim().is_empty())
        };

        if self.api_key.is_none() {
            self.api_key = var("API_KEY");
        }
        if self.api_secret.is_none() {
            self.api_secret = var("API_SECRET");
        }
        if self.model_key.is_none() {
            self.model_key = var("MODEL_KEY");
        }
        if self.ledger_address.is_none() {
            self.ledger_address = var("LEDGER_ADDRESS");
        }
        if let Some(provider) = var("PROVIDER") {
            match provider.parse::<ProviderKind>() {
                Ok(kind) => self.provider = Some(kind),
                Err(e) => tracing::warn!("Ignoring AGENT{}_PROVIDER: {}", self.id, e),
            }
        }
        if self.name.is_empty() {
            self.name = AgentConfig::new(self.id).name;
        }
        if self.provider.is_none() {
            self.provider = AgentConfig::new(self.id).provider;
        }
    }

    /// Exchange key pair, if both halves are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.api_key.as_deref(), self.api_secret.as_deref()) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some((key, secret))
            }
            _ => None,
        }
    }
}

impl AppConfig {
    /// Load `perpdesk.toml` (or `path`) layered under `PERPDESK__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let settings = Config::builder()
            .add_source(File::from(file).required(path.is_some()))
            .add_source(
                Environment::with_prefix("PERPDESK")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("scheduler.symbols"),
            )
            .build()?;

        let mut config: AppConfig = settings.try_deserialize()?;
        config.resolve_agents(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Create agent slots when none are configured, then apply env credentials
    pub fn resolve_agents<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.agents.is_empty() {
            self.agents = (1..=self.scheduler.agent_count).map(AgentConfig::new).collect();
        }
        for agent in &mut self.agents {
            agent.apply_env(&lookup);
        }
        self.agents.sort_by_key(|a| a.id);
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.interval_minutes == 0 {
            return Err(BotError::Config("scheduler.interval_minutes must be > 0".into()));
        }
        if self.scheduler.symbols.is_empty() {
            return Err(BotError::Config("scheduler.symbols must not be empty".into()));
        }
        if self.trading.max_active_trades == 0 {
            return Err(BotError::Config("trading.max_active_trades must be > 0".into()));
        }
        if !(1..=125).contains(&self.trading.max_leverage) {
            return Err(BotError::Config("trading.max_leverage must be in 1..=125".into()));
        }
        if self.journal.per_agent_cap == 0 || self.journal.total_cap == 0 {
            return Err(BotError::Config("journal caps must be > 0".into()));
        }

        let mut ids: Vec<AgentId> = self.agents.iter().map(|a| a.id).collect();
        ids.dedup();
        if ids.len() != self.agents.len() {
            return Err(BotError::Config("agent ids must be unique".into()));
        }
        if self.agents.iter().any(|a| a.id == 0) {
            return Err(BotError::Config("agent ids start at 1".into()));
        }
        Ok(())
    }

    pub fn agent(&self, id: AgentId) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }
}
