use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::openai::check_status;
use super::{DecisionGateway, SYSTEM_PROMPT};
use crate::config::DecisionConfig;
use crate::error::{BotError, Result};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

/// Anthropic Messages API
pub struct AnthropicGateway {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl AnthropicGateway {
    pub fn new(client: Client, api_key: &str, model: Option<&str>, config: &DecisionConfig) -> Self {
        Self {
            client,
            url: ANTHROPIC_API_URL.to_string(),
            api_key: api_key.to_string(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl DecisionGateway for AnthropicGateway {
    fn name(&self) -> &str {
        "Anthropic"
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: SYSTEM_PROMPT,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        check_status(self.name(), status, &body)?;

        let parsed: MessagesResponse = serde_json::from_str(&body)
            .map_err(|_| BotError::NotReady("Anthropic returned a non-JSON body".to_string()))?;
        parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| BotError::Decision("Anthropic returned no text content".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_sends_version_and_reads_text() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "ak-test")
            .match_header("anthropic-version", "2023-06-01")
            .with_status(200)
            .with_body(r#"{"content":[{"type":"text","text":"{\"action\":\"HOLD\"}"}]}"#)
            .create_async()
            .await;

        let gateway = AnthropicGateway::new(Client::new(), "ak-test", None, &DecisionConfig::default())
            .with_url(format!("{}/v1/messages", server.url()));
        let reply = gateway.complete("prompt").await.unwrap();

        assert_eq!(reply, r#"{"action":"HOLD"}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_content_is_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_body(r#"{"content":[]}"#)
            .create_async()
            .await;

        let gateway = AnthropicGateway::new(Client::new(), "ak", None, &DecisionConfig::default())
            .with_url(format!("{}/v1/messages", server.url()));
        assert!(matches!(
            gateway.complete("prompt").await,
            Err(BotError::Decision(_))
        ));
    }
}
