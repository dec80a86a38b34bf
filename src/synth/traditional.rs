use super::{prompts, Confidence, SynthesisContext, SynthesisOutput, SynthesisResult, Synthesizer};
use crate::error::Result;
use crate::llm::clean_json_response;
use crate::query_spec::QuerySpec;
use crate::selector::SynthesisMethod;
use async_trait::async_trait;
use std::time::Instant;
use tracing::debug;

/// Asks the model for a QuerySpec JSON object and validates it against the schema.
pub struct TraditionalSynthesizer;

#[async_trait]
impl Synthesizer for TraditionalSynthesizer {
    fn method(&self) -> SynthesisMethod {
        SynthesisMethod::Traditional
    }

    async fn synthesize(&self, ctx: &SynthesisContext<'_>) -> Result<SynthesisResult> {
        let started = Instant::now();
        let prompt = prompts::traditional_prompt(ctx.question, ctx.max_limit);
        let response = ctx.provider.generate(&prompt, &ctx.options).await?;
        let cleaned = clean_json_response(&response);
        debug!("traditional spec: {}", cleaned);

        let spec = QuerySpec::parse(cleaned)?.validate(&ctx.question.schema, ctx.max_limit)?;

        Ok(SynthesisResult {
            output: SynthesisOutput::Spec(spec),
            method: SynthesisMethod::Traditional,
            latency_ms: started.elapsed().as_millis() as u64,
            confidence: Some(Confidence::High),
        })
    }
}
