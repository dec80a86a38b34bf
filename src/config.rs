//! Engine configuration
//!
//! Defaults mirror the profile constants the engine has always shipped with;
//! every value can be overridden through `QUERY_SYNTH_*` environment variables.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_QUERY_LIMIT: usize = 100;
pub const MAX_QUERY_LIMIT: usize = 500;
pub const DEFAULT_SAMPLE_ROWS: usize = 3;
pub const DEFAULT_MAX_DISPLAY_ROWS: usize = 50;
pub const DEFAULT_MAX_DISPLAY_CHARS: usize = 6000;
pub const DEFAULT_SOURCES_LIMIT: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on methods tried per question, whatever the ranking length
    pub max_attempts: usize,

    /// Reasoning steps the agent may take before giving up
    pub agent_max_steps: usize,

    /// Per-call provider timeout in seconds
    pub provider_timeout_secs: u64,

    pub default_limit: usize,
    pub max_limit: usize,
    pub sample_rows: usize,
    pub max_display_rows: usize,
    pub max_display_chars: usize,
    pub sources_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            agent_max_steps: 6,
            provider_timeout_secs: 30,
            default_limit: DEFAULT_QUERY_LIMIT,
            max_limit: MAX_QUERY_LIMIT,
            sample_rows: DEFAULT_SAMPLE_ROWS,
            max_display_rows: DEFAULT_MAX_DISPLAY_ROWS,
            max_display_chars: DEFAULT_MAX_DISPLAY_CHARS,
            sources_limit: DEFAULT_SOURCES_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Load defaults, then apply any `QUERY_SYNTH_*` overrides from the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        override_from_env("QUERY_SYNTH_MAX_ATTEMPTS", &mut config.max_attempts)?;
        override_from_env("QUERY_SYNTH_AGENT_MAX_STEPS", &mut config.agent_max_steps)?;
        override_from_env("QUERY_SYNTH_PROVIDER_TIMEOUT_SECS", &mut config.provider_timeout_secs)?;
        override_from_env("QUERY_SYNTH_DEFAULT_LIMIT", &mut config.default_limit)?;
        override_from_env("QUERY_SYNTH_MAX_LIMIT", &mut config.max_limit)?;
        override_from_env("QUERY_SYNTH_SAMPLE_ROWS", &mut config.sample_rows)?;
        override_from_env("QUERY_SYNTH_MAX_DISPLAY_ROWS", &mut config.max_display_rows)?;
        override_from_env("QUERY_SYNTH_MAX_DISPLAY_CHARS", &mut config.max_display_chars)?;
        override_from_env("QUERY_SYNTH_SOURCES_LIMIT", &mut config.sources_limit)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(EngineError::Configuration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.agent_max_steps == 0 {
            return Err(EngineError::Configuration(
                "agent_max_steps must be at least 1".to_string(),
            ));
        }
        if self.default_limit == 0 || self.default_limit > self.max_limit {
            return Err(EngineError::Configuration(format!(
                "default_limit {} must be between 1 and max_limit {}",
                self.default_limit, self.max_limit
            )));
        }
        Ok(())
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

fn override_from_env<T: FromStr>(key: &str, target: &mut T) -> Result<()> {
    if let Ok(raw) = std::env::var(key) {
        *target = raw.trim().parse::<T>().map_err(|_| {
            EngineError::Configuration(format!("Invalid value for {}: {:?}", key, raw))
        })?;
    }
    Ok(())
}
