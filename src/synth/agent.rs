use super::{prompts, Confidence, SynthesisContext, SynthesisOutput, SynthesisResult, Synthesizer};
use crate::error::{EngineError, Result};
use crate::llm::clean_json_response;
use crate::selector::SynthesisMethod;
use crate::transform::{AllowedOperation, ExecutableTransform};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, info, warn};

const PREVIEW_ROWS: usize = 5;
const SAMPLE_VALUE_SCAN: usize = 200;
const SAMPLE_VALUE_COUNT: usize = 10;
const MAX_OBSERVATION_CHARS: usize = 1500;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum AgentAction {
    SchemaLookup,
    SampleValues {
        column: String,
        #[serde(default)]
        query: Option<String>,
    },
    RunTransform {
        code: String,
    },
    FinalTransform {
        code: String,
    },
    FinalAnswer {
        text: String,
    },
}

/// ReAct-style loop: the model picks one tool action per step and sees the
/// observation on the next step, until it commits to a final transform or answer.
pub struct AgentSynthesizer;

enum Step {
    Observe(String),
    Done(SynthesisOutput, Confidence),
}

impl AgentSynthesizer {
    fn act(&self, ctx: &SynthesisContext<'_>, allowed: &BTreeSet<AllowedOperation>, action: AgentAction) -> Step {
        match action {
            AgentAction::SchemaLookup => Step::Observe(ctx.question.schema.describe()),
            AgentAction::SampleValues { column, query } => match sample_values(ctx, &column, query.as_deref()) {
                Ok(values) => Step::Observe(Value::from(values).to_string()),
                Err(e) => Step::Observe(format!("Error: {}", e)),
            },
            AgentAction::RunTransform { code } => {
                let preview = ExecutableTransform::parse(&code, allowed.clone())
                    .and_then(|t| ctx.executor.execute_transform(ctx.dataset, &t));
                match preview {
                    Ok(result) => {
                        let rows: Vec<_> = result.rows.iter().take(PREVIEW_ROWS).cloned().collect();
                        let rows = ctx.censor.censor_rows(&rows);
                        Step::Observe(format!(
                            "{} row(s). First rows: {}",
                            result.row_count,
                            serde_json::to_string(&rows).unwrap_or_default()
                        ))
                    }
                    Err(e) => Step::Observe(format!("Error: {}", e)),
                }
            }
            AgentAction::FinalTransform { code } => {
                let transform = ExecutableTransform::parse(&code, allowed.clone())
                    .and_then(|t| t.lower(&ctx.question.schema).map(|_| t));
                match transform {
                    Ok(t) => Step::Done(SynthesisOutput::Transform(t), Confidence::Medium),
                    Err(e) => Step::Observe(format!("Error: {}. Fix the pipeline and try again.", e)),
                }
            }
            AgentAction::FinalAnswer { text } => {
                if text.trim().is_empty() {
                    Step::Observe("Error: final_answer text is empty".to_string())
                } else {
                    Step::Done(SynthesisOutput::DirectAnswer(text), Confidence::Low)
                }
            }
        }
    }
}

/// Distinct values of a column, censored, closest to `query` first when given.
fn sample_values(ctx: &SynthesisContext<'_>, column: &str, query: Option<&str>) -> Result<Vec<String>> {
    let schema = &ctx.question.schema;
    let column = schema
        .resolve(column)
        .ok_or_else(|| EngineError::Execution(format!("Unknown column '{}'", column)))?;

    let mut values: Vec<String> = ctx
        .dataset
        .distinct_values(column, SAMPLE_VALUE_SCAN)?
        .into_iter()
        .map(|raw| match ctx.censor.censor_value(column, &Value::String(raw)) {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .filter(|v| !v.is_empty())
        .collect();

    if let Some(query) = query.map(str::to_lowercase).filter(|q| !q.trim().is_empty()) {
        let mut scored: Vec<(f64, String)> = values
            .into_iter()
            .map(|v| (strsim::jaro_winkler(&v.to_lowercase(), &query), v))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        values = scored.into_iter().map(|(_, v)| v).collect();
    }
    values.truncate(SAMPLE_VALUE_COUNT);
    Ok(values)
}

fn truncate_observation(text: String) -> String {
    if text.chars().count() <= MAX_OBSERVATION_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(MAX_OBSERVATION_CHARS).collect();
    cut.push_str(" ...");
    cut
}

#[async_trait]
impl Synthesizer for AgentSynthesizer {
    fn method(&self) -> SynthesisMethod {
        SynthesisMethod::LangChainAgent
    }

    async fn synthesize(&self, ctx: &SynthesisContext<'_>) -> Result<SynthesisResult> {
        let started = Instant::now();
        let allowed = AllowedOperation::default_set();
        let mut history: Vec<(String, String)> = Vec::new();

        for step in 0..ctx.agent_max_steps {
            let prompt = prompts::agent_prompt(
                ctx.question,
                ctx.max_limit,
                &allowed,
                &history,
                ctx.agent_max_steps - step,
            );
            let response = ctx.provider.generate(&prompt, &ctx.options).await?;
            let raw = clean_json_response(&response).to_string();

            let observation = match serde_json::from_str::<AgentAction>(&raw) {
                Ok(action) => {
                    debug!("agent step {}: {:?}", step + 1, action);
                    match self.act(ctx, &allowed, action) {
                        Step::Done(output, confidence) => {
                            info!("Agent finished after {} step(s)", step + 1);
                            return Ok(SynthesisResult {
                                output,
                                method: SynthesisMethod::LangChainAgent,
                                latency_ms: started.elapsed().as_millis() as u64,
                                confidence: Some(confidence),
                            });
                        }
                        Step::Observe(text) => text,
                    }
                }
                Err(e) => {
                    warn!("agent step {} returned an unusable action: {}", step + 1, e);
                    format!("Error: reply was not a valid action object ({})", e)
                }
            };
            history.push((raw, truncate_observation(observation)));
        }

        Err(EngineError::Synthesis(format!(
            "Agent did not finish within {} steps",
            ctx.agent_max_steps
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::censor::{CensoringMapping, CensoringService, MaskRule};
    use crate::context::QuestionContext;
    use crate::dataset::Dataset;
    use crate::executor::QueryExecutor;
    use crate::llm::{GenerateOptions, ProviderConfig, ScriptedProvider};
    use polars::prelude::*;
    use std::sync::Arc;

    struct Fixture {
        dataset: Dataset,
        censor: Arc<CensoringService>,
        executor: QueryExecutor,
        question: QuestionContext,
    }

    fn fixture() -> Fixture {
        let df = df! {
            "customer_id" => ["C-1", "C-2", "C-3"],
            "region" => ["north", "south", "northeast"],
            "value" => [100i64, 200, 150],
        }
        .unwrap();
        let dataset = Dataset::with_inferred_schema(df).unwrap();
        let censor = Arc::new(CensoringService::new(
            CensoringMapping::new().with_rule("customer_id", MaskRule::customer_id()),
        ));
        censor.rebuild(&dataset).unwrap();
        let executor = QueryExecutor::new(100, 500).with_censor(censor.clone());
        let question = QuestionContext::new(
            "Which region has the highest value?",
            dataset.schema().clone(),
            vec![],
            ProviderConfig::new("openai", "gpt-4o"),
        );
        Fixture { dataset, censor, executor, question }
    }

    fn ctx<'a>(f: &'a Fixture, provider: &'a ScriptedProvider, max_steps: usize) -> SynthesisContext<'a> {
        SynthesisContext {
            question: &f.question,
            provider,
            dataset: &f.dataset,
            executor: &f.executor,
            censor: &f.censor,
            options: GenerateOptions::default(),
            max_limit: 500,
            agent_max_steps: max_steps,
        }
    }

    #[tokio::test]
    async fn tools_feed_observations_until_final_transform() {
        let f = fixture();
        let provider = ScriptedProvider::new()
            .then(r#"{"action": "schema_lookup"}"#)
            .then(r#"{"action": "sample_values", "column": "region", "query": "north"}"#)
            .then(r#"{"action": "run_transform", "code": "df.select(customer_id).head(1)"}"#)
            .then("```json\n{\"action\": \"final_transform\", \"code\": \"df.sort(value, desc=true).head(1)\"}\n```");

        let result = AgentSynthesizer.synthesize(&ctx(&f, &provider, 6)).await.unwrap();
        assert!(matches!(result.output, SynthesisOutput::Transform(ref t) if t.code.contains("sort")));
        assert_eq!(result.confidence, Some(Confidence::Medium));

        let prompts = provider.prompts();
        assert_eq!(prompts.len(), 4);
        assert!(prompts[1].contains("- value (numeric)"));
        assert!(prompts[2].contains("\"north\""));
        // the preview is censored before the model sees it
        assert!(!prompts[3].contains("C-1"));
        assert!(prompts[3].contains(&MaskRule::customer_id().mask("C-1")));
    }

    #[tokio::test]
    async fn tool_errors_are_observations() {
        let f = fixture();
        let provider = ScriptedProvider::new()
            .then(r#"{"action": "run_transform", "code": "df.select(score2)"}"#)
            .then("not json at all")
            .then(r#"{"action": "final_answer", "text": "North leads."}"#);

        let result = AgentSynthesizer.synthesize(&ctx(&f, &provider, 6)).await.unwrap();
        assert!(matches!(result.output, SynthesisOutput::DirectAnswer(ref t) if t == "North leads."));
        let prompts = provider.prompts();
        assert!(prompts[1].contains("score2"));
        assert!(prompts[2].contains("not a valid action"));
    }

    #[tokio::test]
    async fn step_budget_is_enforced() {
        let f = fixture();
        let provider = ScriptedProvider::new().on(prompts::AGENT_TASK, r#"{"action": "schema_lookup"}"#);
        let err = AgentSynthesizer.synthesize(&ctx(&f, &provider, 3)).await.unwrap_err();
        assert!(matches!(err, EngineError::Synthesis(_)));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn provider_failures_propagate() {
        let f = fixture();
        let provider = ScriptedProvider::new().then_fail("rate limited");
        let err = AgentSynthesizer.synthesize(&ctx(&f, &provider, 3)).await.unwrap_err();
        assert!(matches!(err, EngineError::Provider(_)));
    }
}
