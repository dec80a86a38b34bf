//! Provider adapter
//!
//! One [`LlmProvider`] implementation per backend. The backend is picked from
//! the [`ProviderConfig`] tag once, when the engine is built; synthesizers only
//! ever see `generate(prompt, options) -> text`.

mod anthropic;
mod google;
mod openai;
mod scripted;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use openai::OpenAiProvider;
pub use scripted::{ScriptedProvider, ScriptedReply};

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Per-call generation options.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Overrides the configured model for this call only
    pub model: Option<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 2048,
            model: None,
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider id for logging and performance bookkeeping
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Single-shot text completion. No retries happen in here.
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Google,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Google => "google",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    fn default_key_env(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Google => "GOOGLE_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "google" | "gemini" => Ok(ProviderKind::Google),
            "anthropic" => Ok(ProviderKind::Anthropic),
            other => Err(EngineError::Configuration(format!(
                "Unknown LLM provider '{}'. Expected one of: openai, google, anthropic",
                other
            ))),
        }
    }
}

/// Where the API key comes from. Inline keys are never printed.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_temperature() -> f32 {
    GenerateOptions::default().temperature
}

fn default_max_tokens() -> u32 {
    GenerateOptions::default().max_tokens
}

impl ProviderConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            credentials: Credentials::default(),
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.credentials.api_key = Some(key.into());
        self
    }

    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.credentials.api_key_env = Some(var.into());
        self
    }

    pub fn kind(&self) -> Result<ProviderKind> {
        self.provider.parse()
    }

    /// Check the shape of the config without touching credentials.
    pub fn validate(&self) -> Result<()> {
        self.kind()?;
        if self.model.trim().is_empty() {
            return Err(EngineError::Configuration("Provider model must not be empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(EngineError::Configuration(format!(
                "Temperature {} is outside 0.0..=2.0",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(EngineError::Configuration("max_tokens must be positive".to_string()));
        }
        Ok(())
    }

    /// Inline key first, then the named variable, then the backend's usual variable.
    pub fn resolve_api_key(&self) -> Result<String> {
        let kind = self.kind()?;
        let key = match (&self.credentials.api_key, &self.credentials.api_key_env) {
            (Some(key), _) => Some(key.clone()),
            (None, Some(var)) => std::env::var(var).ok(),
            (None, None) => std::env::var(kind.default_key_env()).ok(),
        };
        match key {
            Some(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => Err(EngineError::Configuration(format!(
                "No API key configured for provider '{}' (set {})",
                kind,
                self.credentials
                    .api_key_env
                    .as_deref()
                    .unwrap_or(kind.default_key_env())
            ))),
        }
    }

    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            model: None,
        }
    }
}

/// Resolve the backend for `config`. Fails fast on unknown providers or missing keys.
pub fn build_provider(config: &ProviderConfig, default_timeout: Duration) -> Result<Arc<dyn LlmProvider>> {
    config.validate()?;
    let api_key = config.resolve_api_key()?;
    let timeout = config
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(default_timeout);

    let provider: Arc<dyn LlmProvider> = match config.kind()? {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
            timeout,
        )?),
        ProviderKind::Google => Arc::new(GoogleProvider::new(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
            timeout,
        )?),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
            timeout,
        )?),
    };
    tracing::info!("Using LLM provider {} ({})", provider.name(), provider.model());
    Ok(provider)
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| EngineError::Configuration(format!("Failed to build HTTP client: {}", e)))
}

/// Send a request under a hard deadline and return the JSON body.
pub(crate) async fn send_json(
    provider: &str,
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<serde_json::Value> {
    let response = tokio::time::timeout(timeout, request.send())
        .await
        .map_err(|_| EngineError::Provider(format!("{} request timed out after {:?}", provider, timeout)))?
        .map_err(|e| EngineError::Provider(format!("{} API call failed: {}", provider, e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(status_error(provider, status, &body));
    }

    let json: serde_json::Value = response
        .json()
        .await
        .map_err(|e| EngineError::Provider(format!("Failed to parse {} response: {}", provider, e)))?;

    if let Some(error) = json.get("error") {
        return Err(EngineError::Provider(format!("{} API error: {}", provider, error)));
    }
    Ok(json)
}

fn status_error(provider: &str, status: StatusCode, body: &str) -> EngineError {
    let reason = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "authentication failed",
        StatusCode::TOO_MANY_REQUESTS => "rate limited",
        s if s.is_server_error() => "server error",
        _ => "request rejected",
    };
    let snippet: String = body.chars().take(300).collect();
    EngineError::Provider(format!("{} {} ({}): {}", provider, reason, status, snippet))
}

/// Strip markdown code fences the models like to wrap JSON in.
pub fn clean_json_response(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```python")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_parses_known_ids_only() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("gemini".parse::<ProviderKind>().unwrap(), ProviderKind::Google);
        assert_eq!("anthropic".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        let err = "cohere".parse::<ProviderKind>().unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn missing_or_blank_key_is_configuration_error() {
        let config = ProviderConfig::new("openai", "gpt-4o-mini")
            .with_api_key_env("QUERY_SYNTH_TEST_KEY_THAT_IS_NOT_SET");
        let err = build_provider(&config, Duration::from_secs(5)).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);

        let blank = ProviderConfig::new("anthropic", "claude").with_api_key("   ");
        assert!(matches!(blank.resolve_api_key(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn builds_each_backend_from_tag() {
        for (tag, name) in [("openai", "openai"), ("google", "google"), ("anthropic", "anthropic")] {
            let config = ProviderConfig::new(tag, "some-model").with_api_key("k-123");
            let provider = build_provider(&config, Duration::from_secs(5)).unwrap();
            assert_eq!(provider.name(), name);
            assert_eq!(provider.model(), "some-model");
        }
    }

    #[test]
    fn credentials_debug_hides_key() {
        let config = ProviderConfig::new("openai", "gpt-4o").with_api_key("sk-secret");
        let printed = format!("{:?}", config);
        assert!(!printed.contains("sk-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn status_errors_name_the_cause() {
        let err = status_error("openai", StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(err.to_string().contains("rate limited"));
        let err = status_error("google", StatusCode::UNAUTHORIZED, "");
        assert!(err.to_string().contains("authentication failed"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn fences_are_stripped() {
        assert_eq!(clean_json_response("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(clean_json_response("  {}  "), "{}");
    }
}
