use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::selector::SynthesisMethod;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("All synthesis methods failed: {}", describe_attempts(.0))]
    Exhausted(Vec<AttemptFailure>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse failure category surfaced to callers (HTTP layer picks status codes from it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Synthesis,
    Execution,
    Provider,
    Exhausted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Synthesis => "SynthesisError",
            ErrorKind::Execution => "ExecutionError",
            ErrorKind::Provider => "ProviderError",
            ErrorKind::Exhausted => "ExhaustedError",
        };
        write!(f, "{}", name)
    }
}

/// One failed attempt recorded by the fallback handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub method: SynthesisMethod,
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Configuration(_) | EngineError::Io(_) => ErrorKind::Configuration,
            EngineError::Synthesis(_) => ErrorKind::Synthesis,
            EngineError::Execution(_) => ErrorKind::Execution,
            EngineError::Provider(_) => ErrorKind::Provider,
            EngineError::Exhausted(_) => ErrorKind::Exhausted,
        }
    }

    /// Whether the fallback handler may move on to the next method.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Synthesis | ErrorKind::Execution | ErrorKind::Provider
        )
    }

    pub fn attempts(&self) -> &[AttemptFailure] {
        match self {
            EngineError::Exhausted(attempts) => attempts,
            _ => &[],
        }
    }
}

fn describe_attempts(attempts: &[AttemptFailure]) -> String {
    if attempts.is_empty() {
        return "no methods were attempted".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("[{}] {}: {}", a.method, a.kind, a.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<polars::error::PolarsError> for EngineError {
    fn from(err: polars::error::PolarsError) -> Self {
        EngineError::Execution(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
