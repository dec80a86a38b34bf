//! Orchestration: rank methods, try them in order through the fallback
//! handler, execute whatever the winning method produced, then build the
//! censored response.

use crate::censor::{CensoringMapping, CensoringService};
use crate::config::EngineConfig;
use crate::context::QuestionContext;
use crate::dataset::{Dataset, Row};
use crate::error::{EngineError, Result};
use crate::executor::{ExecutionResult, QueryExecutor};
use crate::fallback::FallbackHandler;
use crate::llm::{build_provider, LlmProvider, ProviderConfig};
use crate::performance::{MethodPerformance, PerformanceTracker};
use crate::profile::{validate_profile, Profile};
use crate::response::{Response, ResponseBuilder};
use crate::selector::{ComplexityClassifier, ComplexitySignals, MethodRanking, MethodSelector, SynthesisMethod};
use crate::synth::{default_synthesizers, SynthesisContext, SynthesisOutput, SynthesisResult, Synthesizer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub profile: String,
    pub provider: String,
    pub model: String,
    pub total_records: usize,
    pub columns: Vec<String>,
    pub censored_columns: Vec<String>,
    pub methods: BTreeMap<SynthesisMethod, MethodPerformance>,
    pub provider_failures: BTreeMap<String, u64>,
}

pub struct SynthesisEngine {
    profile_id: String,
    provider: Arc<dyn LlmProvider>,
    provider_config: ProviderConfig,
    dataset: RwLock<Arc<Dataset>>,
    censor: Arc<CensoringService>,
    performance: Arc<PerformanceTracker>,
    selector: MethodSelector,
    fallback: FallbackHandler,
    executor: QueryExecutor,
    responses: ResponseBuilder,
    synthesizers: BTreeMap<SynthesisMethod, Arc<dyn Synthesizer>>,
    hints: Option<String>,
    examples: Vec<String>,
    /// Raw sample supplied by the profile; dropped on reload
    profile_sample: RwLock<Option<Vec<Row>>>,
    config: EngineConfig,
}

impl SynthesisEngine {
    pub fn new(
        profile_id: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        provider_config: ProviderConfig,
        dataset: Arc<Dataset>,
        mapping: CensoringMapping,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        provider_config.validate()?;

        let censor = Arc::new(CensoringService::new(mapping));
        censor.rebuild(&dataset)?;

        let performance = Arc::new(PerformanceTracker::new());
        let fallback = FallbackHandler::new(config.max_attempts, performance.clone(), provider.name());
        let executor = QueryExecutor::new(config.default_limit, config.max_limit).with_censor(censor.clone());
        let responses = ResponseBuilder::new(&config, censor.clone());
        let synthesizers = default_synthesizers().into_iter().map(|s| (s.method(), s)).collect();

        let profile_id = profile_id.into();
        info!(
            "Engine ready for profile '{}': {} rows, {} columns, provider {} ({})",
            profile_id,
            dataset.height(),
            dataset.schema().len(),
            provider.name(),
            provider.model()
        );

        Ok(Self {
            profile_id,
            provider,
            provider_config,
            dataset: RwLock::new(dataset),
            censor,
            performance,
            selector: MethodSelector::default(),
            fallback,
            executor,
            responses,
            synthesizers,
            hints: None,
            examples: Vec::new(),
            profile_sample: RwLock::new(None),
            config,
        })
    }

    /// Build the provider backend named in the profile and wire everything up.
    pub fn from_profile(profile: &dyn Profile, config: EngineConfig) -> Result<Self> {
        validate_profile(profile)?;
        let provider = build_provider(profile.provider_config(), config.provider_timeout())?;
        Self::with_provider(profile, provider, config)
    }

    /// Same as [`from_profile`](Self::from_profile) with a caller-supplied provider.
    pub fn with_provider(profile: &dyn Profile, provider: Arc<dyn LlmProvider>, config: EngineConfig) -> Result<Self> {
        validate_profile(profile)?;
        let mut engine = Self::new(
            profile.id(),
            provider,
            profile.provider_config().clone(),
            profile.dataset(),
            profile.censoring_mappings().clone(),
            config,
        )?;
        engine.hints = profile.hints().map(str::to_string);
        engine.examples = profile.example_questions().to_vec();
        engine.profile_sample = RwLock::new(Some(profile.sample_data(engine.config.sample_rows)));
        Ok(engine)
    }

    pub fn with_complexity_signals(mut self, signals: ComplexitySignals) -> Self {
        self.selector = MethodSelector::new(ComplexityClassifier::new(signals));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn performance(&self) -> Arc<PerformanceTracker> {
        self.performance.clone()
    }

    pub fn censor(&self) -> Arc<CensoringService> {
        self.censor.clone()
    }

    pub fn dataset(&self) -> Arc<Dataset> {
        match self.dataset.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Context for `question` with a censored sample: the profile's own
    /// sample if there is one, otherwise the head of the current dataset.
    pub fn context_for(&self, question: &str) -> QuestionContext {
        let dataset = self.dataset();
        let profile_sample = match self.profile_sample.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let raw = profile_sample.unwrap_or_else(|| dataset.head_rows(self.config.sample_rows));
        let sample = self.censor.censor_rows(&raw);
        QuestionContext::new(question, dataset.schema().clone(), sample, self.provider_config.clone())
            .with_hints(self.hints.clone())
            .with_examples(self.examples.clone())
    }

    pub fn rank(&self, question: &str) -> MethodRanking {
        self.selector.rank(question, &self.performance)
    }

    /// Answer `question`. The context supplies schema, sample and hints; its
    /// own question text is replaced by `question`.
    pub async fn answer(&self, question: &str, context: &QuestionContext) -> Result<Response> {
        let request_id = Uuid::new_v4();
        let span = info_span!("answer", %request_id, profile = %self.profile_id);
        self.answer_inner(question, context).instrument(span).await
    }

    async fn answer_inner(&self, question: &str, context: &QuestionContext) -> Result<Response> {
        let question = question.trim();
        if question.is_empty() {
            return Err(EngineError::Synthesis("Question is empty".to_string()));
        }
        let started = Instant::now();
        let context = context.with_question(question);
        let dataset = self.dataset();

        let ranking = self.rank(question);
        info!(
            "Question classified {:?} (score {}), order: {:?}",
            ranking.complexity, ranking.score, ranking.order
        );
        for reason in &ranking.reasons {
            debug!("{}", reason);
        }

        let outcome = self
            .fallback
            .run(&ranking.order, |method| self.attempt(method, &context, &dataset))
            .await?;

        let (synthesis, execution) = outcome.value;
        let response = self
            .responses
            .build(&synthesis, execution.as_ref(), outcome.failures, started.elapsed());
        info!(
            "Answered with {} after {} attempt(s) in {} ms",
            response.method_used, outcome.attempts, response.execution_time_ms
        );
        Ok(response)
    }

    async fn attempt(
        &self,
        method: SynthesisMethod,
        question: &QuestionContext,
        dataset: &Dataset,
    ) -> Result<(SynthesisResult, Option<ExecutionResult>)> {
        let synthesizer = self
            .synthesizers
            .get(&method)
            .ok_or_else(|| EngineError::Configuration(format!("No synthesizer registered for {}", method)))?;

        let ctx = SynthesisContext {
            question,
            provider: self.provider.as_ref(),
            dataset,
            executor: &self.executor,
            censor: &self.censor,
            options: self.provider_config.generate_options(),
            max_limit: self.config.max_limit,
            agent_max_steps: self.config.agent_max_steps,
        };
        let synthesis = synthesizer.synthesize(&ctx).await?;

        let execution = match &synthesis.output {
            SynthesisOutput::Spec(spec) => Some(self.executor.execute_spec(dataset, spec)?),
            SynthesisOutput::Transform(transform) => Some(self.executor.execute_transform(dataset, transform)?),
            SynthesisOutput::DirectAnswer(_) => None,
        };
        if let Some(result) = &execution {
            debug!("{} produced {} row(s) in {} ms", method, result.row_count, result.execution_time_ms);
        }
        Ok((synthesis, execution))
    }

    /// Swap in a freshly loaded dataset. Censoring indexes are rebuilt, not migrated.
    pub fn reload_dataset(&self, dataset: Dataset) -> Result<()> {
        let dataset = Arc::new(dataset);
        self.censor.rebuild(&dataset)?;
        match self.dataset.write() {
            Ok(mut guard) => *guard = dataset,
            Err(poisoned) => *poisoned.into_inner() = dataset,
        }
        match self.profile_sample.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        info!("Dataset reloaded for profile '{}'", self.profile_id);
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        let dataset = self.dataset();
        EngineStats {
            profile: self.profile_id.clone(),
            provider: self.provider.name().to_string(),
            model: self.provider.model().to_string(),
            total_records: dataset.height(),
            columns: dataset.schema().names().into_iter().map(str::to_string).collect(),
            censored_columns: self.censor.mapping().columns().map(str::to_string).collect(),
            methods: self.performance.snapshot_all(),
            provider_failures: self.performance.provider_failures(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::censor::MaskRule;
    use crate::llm::ScriptedProvider;
    use crate::synth::prompts;
    use polars::prelude::*;

    fn engine(provider: ScriptedProvider) -> (SynthesisEngine, Arc<ScriptedProvider>) {
        let df = df! {
            "customer_id" => ["C-1001", "C-2002", "C-3003"],
            "value" => [100i64, 200, 150],
        }
        .unwrap();
        let dataset = Arc::new(Dataset::with_inferred_schema(df).unwrap());
        let provider = Arc::new(provider);
        let engine = SynthesisEngine::new(
            "test",
            provider.clone(),
            ProviderConfig::new("openai", "gpt-4o"),
            dataset,
            CensoringMapping::new().with_rule("customer_id", MaskRule::customer_id()),
            EngineConfig::default(),
        )
        .unwrap();
        (engine, provider)
    }

    #[tokio::test]
    async fn simple_question_uses_traditional_first() {
        let (engine, provider) = engine(
            ScriptedProvider::new().on(prompts::TRADITIONAL_TASK, r#"{"aggregations": [{"column": "value", "func": "mean"}]}"#),
        );
        let question = "What is the average value?";
        let response = engine.answer(question, &engine.context_for(question)).await.unwrap();

        assert_eq!(response.method_used, SynthesisMethod::Traditional);
        assert!(response.answer_text.contains("150"));
        assert_eq!(provider.calls(), 1);
        assert_eq!(engine.performance().snapshot(SynthesisMethod::Traditional).successes, 1);
    }

    #[tokio::test]
    async fn context_sample_is_censored() {
        let (engine, _) = engine(ScriptedProvider::new());
        let context = engine.context_for("anything");
        assert_eq!(context.sample_rows.len(), 3);
        assert!(!context.sample_text().contains("C-1001"));
    }

    struct SampledProfile {
        dataset: Arc<Dataset>,
        provider: ProviderConfig,
        mapping: CensoringMapping,
    }

    impl Profile for SampledProfile {
        fn id(&self) -> &str {
            "sampled"
        }

        fn schema(&self) -> &crate::schema::DatasetSchema {
            self.dataset.schema()
        }

        fn sample_data(&self, _n: usize) -> Vec<Row> {
            self.dataset.head_rows(3).into_iter().rev().take(1).collect()
        }

        fn provider_config(&self) -> &ProviderConfig {
            &self.provider
        }

        fn censoring_mappings(&self) -> &CensoringMapping {
            &self.mapping
        }

        fn dataset(&self) -> Arc<Dataset> {
            self.dataset.clone()
        }
    }

    #[tokio::test]
    async fn context_uses_profile_sample_until_reload() {
        let df = df! {
            "customer_id" => ["C-1001", "C-2002", "C-3003"],
            "value" => [100i64, 200, 150],
        }
        .unwrap();
        let profile = SampledProfile {
            dataset: Arc::new(Dataset::with_inferred_schema(df).unwrap()),
            provider: ProviderConfig::new("openai", "gpt-4o"),
            mapping: CensoringMapping::new().with_rule("customer_id", MaskRule::customer_id()),
        };
        let engine =
            SynthesisEngine::with_provider(&profile, Arc::new(ScriptedProvider::new()), EngineConfig::default()).unwrap();

        let context = engine.context_for("anything");
        assert_eq!(context.sample_rows.len(), 1);
        assert_eq!(context.sample_rows[0]["value"], 150);
        assert_eq!(context.sample_rows[0]["customer_id"], MaskRule::customer_id().mask("C-3003").as_str());

        let df = df! { "customer_id" => ["C-9", "C-8"], "value" => [1i64, 2] }.unwrap();
        engine.reload_dataset(Dataset::with_inferred_schema(df).unwrap()).unwrap();
        assert_eq!(engine.context_for("anything").sample_rows.len(), 2);
    }

    #[tokio::test]
    async fn reload_rebuilds_censor_index() {
        let (engine, _) = engine(ScriptedProvider::new());
        let before = engine.censor().generation();
        let df = df! { "customer_id" => ["C-9"], "value" => [1i64] }.unwrap();
        engine.reload_dataset(Dataset::with_inferred_schema(df).unwrap()).unwrap();

        assert_ne!(engine.censor().generation(), before);
        assert_eq!(engine.stats().total_records, 1);
        assert_eq!(engine.censor().censor_text("C-1001"), "C-1001");
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let (engine, provider) = engine(ScriptedProvider::new());
        let err = engine.answer("  ", &engine.context_for("")).await.unwrap_err();
        assert!(matches!(err, EngineError::Synthesis(_)));
        assert_eq!(provider.calls(), 0);
    }
}
