use super::{prompts, Confidence, SynthesisContext, SynthesisOutput, SynthesisResult, Synthesizer};
use crate::error::{EngineError, Result};
use crate::llm::clean_json_response;
use crate::selector::SynthesisMethod;
use crate::transform::{AllowedOperation, ExecutableTransform};
use async_trait::async_trait;
use std::time::Instant;
use tracing::debug;

/// Single-shot: the model writes one pipeline in the transform language.
pub struct DirectSynthesizer;

#[async_trait]
impl Synthesizer for DirectSynthesizer {
    fn method(&self) -> SynthesisMethod {
        SynthesisMethod::LangChainDirect
    }

    async fn synthesize(&self, ctx: &SynthesisContext<'_>) -> Result<SynthesisResult> {
        let started = Instant::now();
        let allowed = AllowedOperation::default_set();
        let prompt = prompts::direct_prompt(ctx.question, ctx.max_limit, &allowed);
        let response = ctx.provider.generate(&prompt, &ctx.options).await?;

        let code = extract_pipeline(clean_json_response(&response));
        debug!("direct pipeline: {}", code);

        // parse failures here mean the model wrote something unusable
        let transform = ExecutableTransform::parse(&code, allowed).map_err(|e| match e {
            EngineError::Execution(message) => EngineError::Synthesis(message),
            other => other,
        })?;
        transform.lower(&ctx.question.schema).map_err(|e| match e {
            EngineError::Execution(message) => EngineError::Synthesis(message),
            other => other,
        })?;

        Ok(SynthesisResult {
            output: SynthesisOutput::Transform(transform),
            method: SynthesisMethod::LangChainDirect,
            latency_ms: started.elapsed().as_millis() as u64,
            confidence: Some(Confidence::Medium),
        })
    }
}

/// Models sometimes add a sentence around the code; keep the pipeline itself,
/// including continuation lines that start with `.` or `)`.
fn extract_pipeline(text: &str) -> String {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    match lines.iter().position(|l| l.starts_with("df") || l.starts_with("(df")) {
        Some(start) => {
            let mut code = lines[start].to_string();
            for line in &lines[start + 1..] {
                if !(line.starts_with('.') || line.starts_with(')')) {
                    break;
                }
                code.push_str(line);
            }
            code
        }
        None => text.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_pipeline_out_of_chatter() {
        assert_eq!(extract_pipeline("Here you go:\ndf.mean(value)\n"), "df.mean(value)");
        assert_eq!(extract_pipeline("df.filter(value > 1)\n  .head(3)\nDone."), "df.filter(value > 1).head(3)");
        assert_eq!(extract_pipeline("nothing useful"), "nothing useful");
    }
}
