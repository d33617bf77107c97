//! Trade decision providers.
//!
//! Each agent asks one language-model provider for a structured trade
//! proposal per cycle. Providers are picked once at configuration time; the
//! prompt, JSON extraction and failure policy are shared.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DecisionConfig;
use crate::error::{BotError, Result};
use crate::models::{DecisionContext, TradeDecision};

pub use anthropic::AnthropicGateway;
pub use gemini::GeminiGateway;
pub use openai::ChatCompletionsGateway;

const SYSTEM_PROMPT: &str = "You are a disciplined crypto futures trader. \
Respond with a single JSON object only, no markdown.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    DeepSeek,
    OpenAi,
    Xai,
    Qwen,
    Google,
    Anthropic,
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deepseek" => Ok(ProviderKind::DeepSeek),
            "openai" | "gpt" => Ok(ProviderKind::OpenAi),
            "xai" | "grok" => Ok(ProviderKind::Xai),
            "qwen" | "openrouter" => Ok(ProviderKind::Qwen),
            "google" | "gemini" => Ok(ProviderKind::Google),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            other => Err(format!("unknown decision provider '{}'", other)),
        }
    }
}

/// Source of trade decisions for one agent
#[async_trait]
pub trait DecisionGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Send a prompt and return the raw model reply
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Ask for a decision.
    ///
    /// Provider failures become a HOLD with the error as reasoning. Only
    /// [`BotError::NotReady`] is returned as an error, so the caller skips
    /// the cycle instead of journaling a HOLD.
    async fn decide(&self, context: &DecisionContext) -> Result<TradeDecision> {
        let prompt = build_prompt(context);
        match self.complete(&prompt).await {
            Ok(reply) => match parse_decision(&reply) {
                Ok(decision) => Ok(decision),
                Err(e) => {
                    tracing::warn!("{} returned an unusable decision: {}", self.name(), e);
                    Ok(TradeDecision::hold(format!(
                        "{} reply could not be parsed: {}",
                        self.name(),
                        e
                    )))
                }
            },
            Err(e @ BotError::NotReady(_)) => Err(e),
            Err(e) => {
                tracing::warn!("{} decision failed, holding: {}", self.name(), e);
                Ok(TradeDecision::hold(format!("{} error: {}", self.name(), e)))
            }
        }
    }
}

/// Build the gateway for a provider family
pub fn build_gateway(
    kind: ProviderKind,
    api_key: &str,
    model: Option<&str>,
    config: &DecisionConfig,
    timeout: Duration,
) -> Result<Arc<dyn DecisionGateway>> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;

    let gateway: Arc<dyn DecisionGateway> = match kind {
        ProviderKind::Google => Arc::new(GeminiGateway::new(client, api_key, model, config)),
        ProviderKind::Anthropic => Arc::new(AnthropicGateway::new(client, api_key, model, config)),
        chat => Arc::new(ChatCompletionsGateway::for_provider(
            chat, client, api_key, model, config,
        )),
    };
    Ok(gateway)
}

/// Prompt describing the market, the account and the required reply format
pub fn build_prompt(context: &DecisionContext) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "You are {}, trading USDT-margined perpetual futures.\n",
        context.agent_name
    );
    let _ = writeln!(prompt, "MARKET:");
    for m in &context.market {
        let _ = writeln!(
            prompt,
            "- {}: ${} ({:+.2}% 24h, high ${}, low ${}, volume {:.0})",
            m.symbol, m.price, m.change_24h_pct, m.high_24h, m.low_24h, m.volume_24h
        );
    }
    let _ = writeln!(
        prompt,
        "\nACCOUNT: ${:.2} available, {} open position(s).",
        context.available_balance, context.open_positions
    );
    let _ = writeln!(
        prompt,
        "\nRULES:\n\
         - Leverage between 1 and {max_lev}.\n\
         - LONG and SHORT must include stopLoss and takeProfit prices.\n\
         - stopLoss below entry for LONG, above entry for SHORT.\n\
         - Use CLOSE to exit a symbol, HOLD when there is no edge.\n\
         - confidence is 0-100; below 40 nothing is executed.",
        max_lev = context.max_leverage
    );
    let _ = write!(
        prompt,
        "\nReply with JSON only:\n\
         {{\"symbol\": \"BTCUSDT\", \"action\": \"LONG|SHORT|CLOSE|HOLD\", \"leverage\": 10, \
         \"usdAmount\": 100, \"confidence\": 75, \"reasoning\": \"...\", \
         \"stopLoss\": 0.0, \"takeProfit\": 0.0}}"
    );
    prompt
}

/// First `{...}` object in a reply, with markdown fences removed
pub fn extract_json(reply: &str) -> Option<&str> {
    let text = reply.trim();
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text);
    let text = text.trim_end().strip_suffix("```").unwrap_or(text);

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

pub fn parse_decision(reply: &str) -> Result<TradeDecision> {
    let json = extract_json(reply)
        .ok_or_else(|| BotError::Decision("no JSON object in reply".to_string()))?;
    let mut decision: TradeDecision = serde_json::from_str(json)?;
    decision.symbol = decision.symbol.trim().to_ascii_uppercase();
    Ok(decision)
}
