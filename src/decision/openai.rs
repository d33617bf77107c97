use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{DecisionGateway, ProviderKind, SYSTEM_PROMPT};
use crate::config::DecisionConfig;
use crate::error::{BotError, Result};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEEPSEEK_API_URL: &str = "https://api.deepseek.com/v1/chat/completions";
const XAI_API_URL: &str = "https://api.x.ai/v1/chat/completions";
const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` endpoint (OpenAI, DeepSeek, xAI, OpenRouter)
pub struct ChatCompletionsGateway {
    client: Client,
    name: String,
    url: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl ChatCompletionsGateway {
    pub fn for_provider(
        kind: ProviderKind,
        client: Client,
        api_key: &str,
        model: Option<&str>,
        config: &DecisionConfig,
    ) -> Self {
        let (name, url, default_model) = match kind {
            ProviderKind::DeepSeek => ("DeepSeek", DEEPSEEK_API_URL, "deepseek-chat"),
            ProviderKind::Xai => ("xAI", XAI_API_URL, "grok-2-1212"),
            ProviderKind::Qwen => ("OpenRouter", OPENROUTER_API_URL, "qwen/qwen-2.5-72b-instruct"),
            _ => ("OpenAI", OPENAI_API_URL, "gpt-4"),
        };

        Self {
            client,
            name: name.to_string(),
            url: url.to_string(),
            api_key: api_key.to_string(),
            model: model.unwrap_or(default_model).to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    /// Point at a different endpoint (self-hosted proxy, tests)
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl DecisionGateway for ChatCompletionsGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Message {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        check_status(&self.name, status, &body)?;

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|_| BotError::NotReady(format!("{} returned a non-JSON body", self.name)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BotError::Decision(format!("{} returned no choices", self.name)))
    }
}

/// Shared status handling: 404 means the endpoint isn't there yet
pub(crate) fn check_status(name: &str, status: reqwest::StatusCode, body: &str) -> Result<()> {
    if status.as_u16() == 404 {
        return Err(BotError::NotReady(format!("{} endpoint returned 404", name)));
    }
    if !status.is_success() {
        let snippet: String = body.chars().take(200).collect();
        return Err(BotError::Decision(format!(
            "{} API error {}: {}",
            name, status, snippet
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DecisionAction;
    use mockito::Matcher;

    fn gateway(server: &mockito::ServerGuard) -> ChatCompletionsGateway {
        ChatCompletionsGateway::for_provider(
            ProviderKind::DeepSeek,
            Client::new(),
            "sk-test",
            None,
            &DecisionConfig::default(),
        )
        .with_url(format!("{}/v1/chat/completions", server.url()))
    }

    #[tokio::test]
    async fn test_complete_reads_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJsonString(
                r#"{"model":"deepseek-chat"}"#.to_string(),
            ))
            .with_status(200)
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"```json\n{\"symbol\":\"SOLUSDT\",\"action\":\"LONG\",\"leverage\":8,\"usdAmount\":120,\"confidence\":81,\"reasoning\":\"trend\",\"stopLoss\":140,\"takeProfit\":170}\n```"}}]}"#,
            )
            .create_async()
            .await;

        let gateway = gateway(&server);
        let reply = gateway.complete("prompt").await.unwrap();
        let decision = super::super::parse_decision(&reply).unwrap();

        assert_eq!(decision.action, DecisionAction::Long);
        assert_eq!(decision.leverage, 8);
        assert_eq!(decision.stop_loss, Some(140.0));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_404_is_not_ready() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/chat/completions")
            .with_status(404)
            .with_body("<html>Not Found</html>")
            .create_async()
            .await;

        let result = gateway(&server).complete("prompt").await;
        assert!(matches!(result, Err(BotError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_non_json_body_is_not_ready() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body("<!DOCTYPE html><html></html>")
            .create_async()
            .await;

        let result = gateway(&server).complete("prompt").await;
        assert!(matches!(result, Err(BotError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_server_error_is_decision_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/chat/completions")
            .with_status(500)
            .with_body(r#"{"error":"overloaded"}"#)
            .create_async()
            .await;

        let result = gateway(&server).complete("prompt").await;
        assert!(matches!(result, Err(BotError::Decision(_))));
    }
}
