//! Provider that replays canned replies. Used by the test suite and by the
//! CLI's `--offline` mode.

use super::{GenerateOptions, LlmProvider};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ScriptedReply {
    Text(String),
    /// Surfaces as a provider failure
    Fail(String),
}

impl ScriptedReply {
    fn into_result(self) -> Result<String> {
        match self {
            ScriptedReply::Text(text) => Ok(text),
            ScriptedReply::Fail(message) => Err(EngineError::Provider(message)),
        }
    }
}

#[derive(Debug)]
struct Rule {
    marker: String,
    reply: ScriptedReply,
}

/// Replies are chosen by the first rule whose marker occurs in the prompt;
/// prompts no rule matches consume the queue in order.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    rules: Vec<Rule>,
    queue: Mutex<VecDeque<ScriptedReply>>,
    prompts: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `text` whenever the prompt contains `marker`.
    pub fn on(mut self, marker: impl Into<String>, text: impl Into<String>) -> Self {
        self.rules.push(Rule {
            marker: marker.into(),
            reply: ScriptedReply::Text(text.into()),
        });
        self
    }

    /// Fail every prompt that contains `marker`.
    pub fn fail_on(mut self, marker: impl Into<String>, message: impl Into<String>) -> Self {
        self.rules.push(Rule {
            marker: marker.into(),
            reply: ScriptedReply::Fail(message.into()),
        });
        self
    }

    /// Queue one reply for the next unmatched prompt.
    pub fn then(self, text: impl Into<String>) -> Self {
        self.push(ScriptedReply::Text(text.into()));
        self
    }

    pub fn then_fail(self, message: impl Into<String>) -> Self {
        self.push(ScriptedReply::Fail(message.into()));
        self
    }

    pub fn from_replies(replies: Vec<ScriptedReply>) -> Self {
        let provider = Self::new();
        for reply in replies {
            provider.push(reply);
        }
        provider
    }

    fn push(&self, reply: ScriptedReply) {
        lock(&self.queue).push_back(reply);
    }

    pub fn calls(&self) -> usize {
        lock(&self.prompts).len()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.queue).len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str, _options: &GenerateOptions) -> Result<String> {
        lock(&self.prompts).push(prompt.to_string());

        if let Some(rule) = self.rules.iter().find(|r| prompt.contains(&r.marker)) {
            return rule.reply.clone().into_result();
        }
        let next = lock(&self.queue).pop_front();
        match next {
            Some(reply) => reply.into_result(),
            None => Err(EngineError::Provider("Scripted provider has no reply left".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rules_win_over_queue() {
        let provider = ScriptedProvider::new()
            .on("QuerySpec", "{\"limit\": 5}")
            .then("first")
            .then_fail("boom");
        let options = GenerateOptions::default();

        assert_eq!(provider.generate("emit a QuerySpec", &options).await.unwrap(), "{\"limit\": 5}");
        assert_eq!(provider.generate("anything", &options).await.unwrap(), "first");
        let err = provider.generate("anything", &options).await.unwrap_err();
        assert!(matches!(err, EngineError::Provider(ref m) if m == "boom"));
        assert!(provider.generate("again", &options).await.is_err());
        assert_eq!(provider.calls(), 4);
        assert_eq!(provider.remaining(), 0);
    }

    #[test]
    fn replies_deserialize_from_script_files() {
        let replies: Vec<ScriptedReply> =
            serde_json::from_str(r#"[{"type":"text","value":"{}"},{"type":"fail","value":"429"}]"#).unwrap();
        assert_eq!(replies[1], ScriptedReply::Fail("429".to_string()));
        assert_eq!(ScriptedProvider::from_replies(replies).remaining(), 2);
    }
}
