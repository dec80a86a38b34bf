//! Prompt text shared by the synthesizers.
//!
//! The task lines double as stable markers for scripted providers in tests.

use crate::context::QuestionContext;
use crate::transform::AllowedOperation;
use itertools::Itertools;
use std::collections::BTreeSet;

pub const TRADITIONAL_TASK: &str = "Task: write a QuerySpec JSON object";
pub const DIRECT_TASK: &str = "Task: write a df pipeline";
pub const AGENT_TASK: &str = "Task: answer by taking tool actions";

/// Dataset description every method starts from.
pub fn system_instruction(ctx: &QuestionContext, max_limit: usize) -> String {
    let mut prompt = String::new();
    prompt.push_str("You answer questions about a single tabular dataset.\n\n");
    prompt.push_str("Columns:\n");
    prompt.push_str(&ctx.schema.describe());
    prompt.push_str("\n\n");

    if !ctx.sample_rows.is_empty() {
        prompt.push_str("Sample rows (sensitive values are masked; use masked values as-is):\n");
        prompt.push_str(&ctx.sample_text());
        prompt.push_str("\n\n");
    }
    if let Some(hints) = &ctx.hints {
        prompt.push_str("Hints:\n");
        prompt.push_str(hints.trim());
        prompt.push_str("\n\n");
    }
    if !ctx.example_questions.is_empty() {
        prompt.push_str("Questions this dataset usually gets:\n");
        for example in &ctx.example_questions {
            prompt.push_str("- ");
            prompt.push_str(example);
            prompt.push('\n');
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!("Never return more than {} rows.\n", max_limit));
    prompt
}

pub fn traditional_prompt(ctx: &QuestionContext, max_limit: usize) -> String {
    format!(
        r#"{system}
{task}.
Allowed keys: select, filters, group_by, aggregations, sort, limit.
- filters: [{{"column": "...", "op": "eq|neq|gt|gte|lt|lte|in|contains|date_range", "value": ...}}]
  "in" takes a list, "date_range" takes ["YYYY-MM-DD", "YYYY-MM-DD"].
- aggregations: [{{"column": "...", "func": "count|sum|mean|min|max", "alias": "..."}}]
- sort: [{{"by": "...", "order": "asc|desc"}}]
- limit: default 100, at most {max_limit}.
Output only the JSON object. No prose. No markdown.

Question: {question}
"#,
        system = system_instruction(ctx, max_limit),
        task = TRADITIONAL_TASK,
        max_limit = max_limit,
        question = ctx.question,
    )
}

pub fn operations_list(allowed: &BTreeSet<AllowedOperation>) -> String {
    allowed.iter().map(|op| op.method_name()).join(", ")
}

const PIPELINE_GRAMMAR: &str = r#"Pipeline grammar:
  df.method(...).method(...)
  filter(cond)            cond: col == 1 & col2 != "x", contains(col, "text"), col in ["a", "b"]
  select(col, ...)        group_by(col, ...) followed by agg(alias = reducer(col), ...) or a reducer
  sort(col, desc=true)    head(n)
  count() | sum(col) | mean(col) | min(col) | max(col)
Comparison operators: == != > >= < <=. Combine conditions with & only."#;

pub fn direct_prompt(ctx: &QuestionContext, max_limit: usize, allowed: &BTreeSet<AllowedOperation>) -> String {
    format!(
        "{system}\n{task}.\n{grammar}\nAllowed methods: {ops}.\nOutput only the pipeline on one line. No prose. No markdown.\n\nQuestion: {question}\n",
        system = system_instruction(ctx, max_limit),
        task = DIRECT_TASK,
        grammar = PIPELINE_GRAMMAR,
        ops = operations_list(allowed),
        question = ctx.question,
    )
}

pub fn agent_prompt(
    ctx: &QuestionContext,
    max_limit: usize,
    allowed: &BTreeSet<AllowedOperation>,
    history: &[(String, String)],
    steps_left: usize,
) -> String {
    let mut prompt = format!(
        r#"{system}
{task}.
Reply with exactly one JSON object per turn, one of:
  {{"action": "schema_lookup"}}
  {{"action": "sample_values", "column": "...", "query": "optional text"}}
  {{"action": "run_transform", "code": "df...."}}
  {{"action": "final_transform", "code": "df...."}}
  {{"action": "final_answer", "text": "..."}}
{grammar}
Allowed methods: {ops}.
Finish with final_transform when the answer is a table or number from the data.
You have {steps_left} step(s) left.

Question: {question}
"#,
        system = system_instruction(ctx, max_limit),
        task = AGENT_TASK,
        grammar = PIPELINE_GRAMMAR,
        ops = operations_list(allowed),
        steps_left = steps_left,
        question = ctx.question,
    );

    if !history.is_empty() {
        prompt.push_str("\nPrevious steps:\n");
        for (i, (action, observation)) in history.iter().enumerate() {
            prompt.push_str(&format!("{}. Action: {}\n   Observation: {}\n", i + 1, action, observation));
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ProviderConfig;
    use crate::schema::{ColumnDef, ColumnType, DatasetSchema};
    use serde_json::json;

    fn context() -> QuestionContext {
        let schema = DatasetSchema::new(vec![
            ColumnDef::new("customer_id", ColumnType::Text),
            ColumnDef::new("value", ColumnType::Numeric),
        ]);
        let mut row = crate::dataset::Row::new();
        row.insert("customer_id".into(), json!("DEALER_abc123"));
        row.insert("value".into(), json!(100));
        QuestionContext::new("What is the average value?", schema, vec![row], ProviderConfig::new("openai", "gpt-4o"))
            .with_hints(Some("value is in euros".into()))
            .with_examples(vec!["How many orders?".into()])
    }

    #[test]
    fn system_instruction_carries_schema_sample_and_hints() {
        let text = system_instruction(&context(), 500);
        assert!(text.contains("- value (numeric)"));
        assert!(text.contains("DEALER_abc123"));
        assert!(text.contains("value is in euros"));
        assert!(text.contains("- How many orders?"));
        assert!(text.contains("500 rows"));
    }

    #[test]
    fn each_prompt_has_its_task_marker() {
        let ctx = context();
        let ops = AllowedOperation::default_set();
        assert!(traditional_prompt(&ctx, 500).contains(TRADITIONAL_TASK));
        assert!(direct_prompt(&ctx, 500, &ops).contains(DIRECT_TASK));
        let agent = agent_prompt(&ctx, 500, &ops, &[("{\"action\":\"schema_lookup\"}".into(), "cols".into())], 3);
        assert!(agent.contains(AGENT_TASK));
        assert!(agent.contains("1. Action: {\"action\":\"schema_lookup\"}"));
        assert!(!agent.contains(TRADITIONAL_TASK));
    }
}
