use crate::dataset::Row;
use crate::llm::ProviderConfig;
use crate::schema::DatasetSchema;
use serde::Serialize;

/// Everything a synthesizer may see about one question. Built once per
/// request; the sample rows are already censored.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionContext {
    pub question: String,
    pub schema: DatasetSchema,
    pub sample_rows: Vec<Row>,
    pub provider: ProviderConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hints: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub example_questions: Vec<String>,
}

impl QuestionContext {
    pub fn new(
        question: impl Into<String>,
        schema: DatasetSchema,
        sample_rows: Vec<Row>,
        provider: ProviderConfig,
    ) -> Self {
        Self {
            question: question.into(),
            schema,
            sample_rows,
            provider,
            hints: None,
            example_questions: Vec::new(),
        }
    }

    pub fn with_hints(mut self, hints: Option<String>) -> Self {
        self.hints = hints.filter(|h| !h.trim().is_empty());
        self
    }

    pub fn with_examples(mut self, examples: Vec<String>) -> Self {
        self.example_questions = examples;
        self
    }

    /// Same dataset view, different question.
    pub fn with_question(&self, question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..self.clone()
        }
    }

    /// Sample rows as one JSON object per line.
    pub fn sample_text(&self) -> String {
        self.sample_rows
            .iter()
            .filter_map(|row| serde_json::to_string(row).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
