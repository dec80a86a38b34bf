//! Final payload assembly. Rows are censored before any text is rendered
//! from them, so nothing leaves the engine with a raw sensitive value in it.

use crate::censor::CensoringService;
use crate::config::EngineConfig;
use crate::dataset::Row;
use crate::error::AttemptFailure;
use crate::executor::{ExecutionResult, ResultShape};
use crate::selector::SynthesisMethod;
use crate::synth::{Confidence, SynthesisOutput, SynthesisResult};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct ResponseStats {
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub synthesis_time_ms: u64,
    pub attempts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub answer_text: String,
    pub source_rows: Vec<Row>,
    pub stats: ResponseStats,
    pub method_used: SynthesisMethod,
    pub execution_time_ms: u64,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_spec: Option<Value>,
    /// Failed attempts that preceded the successful one
    pub attempts: Vec<AttemptFailure>,
    pub timestamp: DateTime<Utc>,
}

pub struct ResponseBuilder {
    max_display_rows: usize,
    max_display_chars: usize,
    sources_limit: usize,
    censor: Arc<CensoringService>,
}

impl ResponseBuilder {
    pub fn new(config: &EngineConfig, censor: Arc<CensoringService>) -> Self {
        Self {
            max_display_rows: config.max_display_rows,
            max_display_chars: config.max_display_chars,
            sources_limit: config.sources_limit,
            censor,
        }
    }

    pub fn build(
        &self,
        synthesis: &SynthesisResult,
        execution: Option<&ExecutionResult>,
        failures: Vec<AttemptFailure>,
        elapsed: Duration,
    ) -> Response {
        // censoring first; every rendered value comes from censored rows
        let rows = execution.map(|r| self.censor.censor_rows(&r.rows)).unwrap_or_default();
        let answer_text = match (&synthesis.output, execution) {
            (SynthesisOutput::DirectAnswer(text), _) => self.censor.censor_text(text.trim()),
            (_, Some(result)) => self.describe(result, &rows),
            (_, None) => "No result was produced.".to_string(),
        };

        let query_spec = match &synthesis.output {
            SynthesisOutput::Spec(spec) => serde_json::to_value(spec).ok(),
            SynthesisOutput::Transform(transform) => Some(serde_json::json!({ "transform": transform.code })),
            SynthesisOutput::DirectAnswer(_) => None,
        };

        let row_count = execution.map(|r| r.row_count).unwrap_or(0);

        let mut confidence = synthesis.confidence.unwrap_or(Confidence::Medium);
        if execution.is_some() && row_count == 0 {
            confidence = confidence.downgrade();
        }

        let execution_time_ms = execution.map(|r| r.execution_time_ms).unwrap_or(0);

        let mut source_rows = rows;
        source_rows.truncate(self.sources_limit);
        Response {
            answer_text,
            source_rows,
            stats: ResponseStats {
                row_count,
                execution_time_ms,
                synthesis_time_ms: synthesis.latency_ms,
                attempts: failures.len() + 1,
            },
            method_used: synthesis.method,
            execution_time_ms: elapsed.as_millis() as u64,
            confidence,
            query_spec: query_spec.map(|v| self.censor.censor_json(&v)),
            attempts: failures
                .into_iter()
                .map(|f| AttemptFailure {
                    message: self.censor.censor_text(&f.message),
                    ..f
                })
                .collect(),
            timestamp: Utc::now(),
        }
    }

    /// Phrase `result`; `rows` are its rows after censoring.
    fn describe(&self, result: &ExecutionResult, rows: &[Row]) -> String {
        if let Some((agg, _)) = result.scalar() {
            let subject = if agg.column == "*" { "rows" } else { agg.column.as_str() };
            let value = rows.first().and_then(|row| row.get(&agg.output_name()));
            return format!(
                "The {} of {} is {}.",
                agg.func,
                subject,
                value.map(format_value).unwrap_or_else(|| "n/a".to_string())
            );
        }
        if rows.is_empty() {
            return "No rows matched the question.".to_string();
        }
        if let ResultShape::Aggregate { aggregations } = &result.shape {
            if rows.len() == 1 {
                let parts = aggregations
                    .iter()
                    .map(|a| {
                        let name = a.output_name();
                        let value = rows[0].get(&name).map(format_value).unwrap_or_default();
                        format!("{} = {}", name, value)
                    })
                    .join(", ");
                return format!("Results: {}.", parts);
            }
        }

        let mut text = format!("Found {} row(s).", result.row_count);
        let shown = rows.len().min(self.max_display_rows);
        if shown < rows.len() {
            text.push_str(&format!(" Showing the first {}.", shown));
        }
        text.push('\n');
        text.push_str(&render_table(&result.columns, &rows[..shown]));
        truncate_chars(text, self.max_display_chars)
    }
}

/// Integral floats print without a fraction; others are rounded to two places.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "n/a".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return i.to_string();
            }
            if let Some(u) = n.as_u64() {
                return u.to_string();
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
                Some(f) => {
                    let text = format!("{:.2}", f);
                    text.trim_end_matches('0').trim_end_matches('.').to_string()
                }
                None => n.to_string(),
            }
        }
        other => other.to_string(),
    }
}

fn render_table(columns: &[String], rows: &[Row]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(columns.join(" | "));
    for row in rows {
        lines.push(
            columns
                .iter()
                .map(|c| row.get(c).map(format_value).unwrap_or_default())
                .join(" | "),
        );
    }
    lines.join("\n")
}

fn truncate_chars(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("\n... (truncated)");
    cut
}
