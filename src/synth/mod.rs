//! Synthesis strategies
//!
//! Every strategy turns a [`QuestionContext`] into one of three outputs: a
//! structured [`QuerySpec`], a restricted [`ExecutableTransform`], or a direct
//! text answer. The engine executes the first two through the same executor.

mod agent;
mod direct;
pub mod prompts;
mod traditional;

pub use agent::AgentSynthesizer;
pub use direct::DirectSynthesizer;
pub use traditional::TraditionalSynthesizer;

use crate::censor::CensoringService;
use crate::context::QuestionContext;
use crate::dataset::Dataset;
use crate::error::Result;
use crate::executor::QueryExecutor;
use crate::llm::{GenerateOptions, LlmProvider};
use crate::query_spec::QuerySpec;
use crate::selector::SynthesisMethod;
use crate::transform::ExecutableTransform;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn downgrade(self) -> Self {
        match self {
            Confidence::High => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SynthesisOutput {
    Spec(QuerySpec),
    Transform(ExecutableTransform),
    DirectAnswer(String),
}

#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub output: SynthesisOutput,
    pub method: SynthesisMethod,
    pub latency_ms: u64,
    pub confidence: Option<Confidence>,
}

/// Shared, read-only inputs for one synthesis attempt.
pub struct SynthesisContext<'a> {
    pub question: &'a QuestionContext,
    pub provider: &'a dyn LlmProvider,
    pub dataset: &'a Dataset,
    pub executor: &'a QueryExecutor,
    pub censor: &'a CensoringService,
    pub options: GenerateOptions,
    pub max_limit: usize,
    pub agent_max_steps: usize,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn method(&self) -> SynthesisMethod;

    async fn synthesize(&self, ctx: &SynthesisContext<'_>) -> Result<SynthesisResult>;
}

/// One synthesizer per method, in canonical order.
pub fn default_synthesizers() -> Vec<Arc<dyn Synthesizer>> {
    vec![
        Arc::new(TraditionalSynthesizer),
        Arc::new(DirectSynthesizer),
        Arc::new(AgentSynthesizer),
    ]
}
