use super::{http_client, send_json, GenerateOptions, LlmProvider};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAiProvider {
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

/// Newer chat models reject `max_tokens` and want `max_completion_tokens`.
fn token_field(model: &str) -> &'static str {
    if model.starts_with("gpt-5") || model.starts_with("gpt-4") || model.starts_with("o1") || model.starts_with("o3") {
        "max_completion_tokens"
    } else {
        "max_tokens"
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String> {
        let model = options.model.as_deref().unwrap_or(&self.model);
        let mut body = serde_json::json!({
            "model": model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "temperature": options.temperature,
        });
        body[token_field(model)] = serde_json::json!(options.max_tokens);

        debug!("openai request: model={} prompt_chars={}", model, prompt.len());
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body);
        let response_json = send_json("openai", request, self.timeout).await?;

        let choice = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| EngineError::Provider("No choices in openai response".to_string()))?;

        match choice.get("finish_reason").and_then(|r| r.as_str()) {
            Some("length") => warn!("openai response was truncated at the token limit"),
            Some("content_filter") => {
                return Err(EngineError::Provider(
                    "openai response was filtered by content policy".to_string(),
                ))
            }
            _ => {}
        }

        let content = choice["message"]["content"]
            .as_str()
            .ok_or_else(|| EngineError::Provider("No content in openai response".to_string()))?;
        if content.trim().is_empty() {
            return Err(EngineError::Provider("Empty content in openai response".to_string()));
        }
        Ok(content.to_string())
    }
}
