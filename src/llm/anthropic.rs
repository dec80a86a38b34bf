use super::{http_client, send_json, GenerateOptions, LlmProvider};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String, base_url: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            api_key,
            model,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timeout,
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String> {
        let model = options.model.as_deref().unwrap_or(&self.model);
        let body = serde_json::json!({
            "model": model,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "messages": [
                {"role": "user", "content": prompt}
            ],
        });

        debug!("anthropic request: model={} prompt_chars={}", model, prompt.len());
        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body);
        let response_json = send_json("anthropic", request, self.timeout).await?;

        let blocks = response_json
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| EngineError::Provider("No content in anthropic response".to_string()))?;
        let text: String = blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect();
        if text.trim().is_empty() {
            return Err(EngineError::Provider("Empty content in anthropic response".to_string()));
        }
        Ok(text)
    }
}
