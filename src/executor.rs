//! Query executor
//!
//! Both synthesized forms (a [`QuerySpec`] and an [`ExecutableTransform`]) are
//! lowered to the same [`PlanStep`] list, which is applied to a lazy clone of
//! the dataset. The source frame is never mutated.

use crate::censor::CensoringService;
use crate::dataset::{frame_to_rows, Dataset, Row};
use crate::error::{EngineError, Result};
use crate::query_spec::{date_bounds, Aggregation, Filter, FilterOp, QuerySpec, Reducer, SortKey, SortOrder};
use crate::schema::{ColumnType, DatasetSchema};
use crate::transform::ExecutableTransform;
use polars::prelude::*;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    Filter(Vec<Filter>),
    Select(Vec<String>),
    GroupAggregate {
        keys: Vec<String>,
        aggregations: Vec<Aggregation>,
    },
    Aggregate(Vec<Aggregation>),
    Sort(Vec<SortKey>),
    Limit(usize),
}

impl PlanStep {
    fn describe(&self) -> String {
        match self {
            PlanStep::Filter(filters) => format!("filter ({} predicates)", filters.len()),
            PlanStep::Select(columns) => format!("select {}", columns.join(", ")),
            PlanStep::GroupAggregate { keys, aggregations } => format!(
                "group by {} with {} aggregations",
                keys.join(", "),
                aggregations.len()
            ),
            PlanStep::Aggregate(aggs) => format!(
                "aggregate {}",
                aggs.iter().map(|a| a.output_name()).collect::<Vec<_>>().join(", ")
            ),
            PlanStep::Sort(keys) => format!(
                "sort by {}",
                keys.iter().map(|k| k.by.as_str()).collect::<Vec<_>>().join(", ")
            ),
            PlanStep::Limit(n) => format!("limit {}", n),
        }
    }
}

/// How the result rows came about; the response builder phrases answers from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ResultShape {
    Rows,
    Aggregate { aggregations: Vec<Aggregation> },
    Grouped { keys: Vec<String>, aggregations: Vec<Aggregation> },
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub columns: Vec<String>,
    pub shape: ResultShape,
    pub diagnostics: Vec<String>,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    /// The single value of a one-row, one-aggregation result.
    pub fn scalar(&self) -> Option<(&Aggregation, &Value)> {
        match &self.shape {
            ResultShape::Aggregate { aggregations } if aggregations.len() == 1 && self.rows.len() == 1 => {
                let agg = &aggregations[0];
                self.rows[0].get(&agg.output_name()).map(|v| (agg, v))
            }
            _ => None,
        }
    }
}

pub struct QueryExecutor {
    default_limit: usize,
    max_limit: usize,
    censor: Option<Arc<CensoringService>>,
}

impl QueryExecutor {
    pub fn new(default_limit: usize, max_limit: usize) -> Self {
        Self {
            default_limit,
            max_limit,
            censor: None,
        }
    }

    /// Reveal censored tokens in literal values before they are compared.
    pub fn with_censor(mut self, censor: Arc<CensoringService>) -> Self {
        self.censor = Some(censor);
        self
    }

    pub fn execute_spec(&self, dataset: &Dataset, spec: &QuerySpec) -> Result<ExecutionResult> {
        let schema = dataset.schema();
        for column in spec.referenced_columns() {
            if !schema.contains(column) {
                return Err(EngineError::Execution(format!(
                    "Column '{}' does not exist in the dataset",
                    column
                )));
            }
        }
        self.run_plan(dataset, self.plan_for_spec(spec))
    }

    pub fn execute_transform(&self, dataset: &Dataset, transform: &ExecutableTransform) -> Result<ExecutionResult> {
        let steps = transform.lower(dataset.schema())?;
        self.run_plan(dataset, steps)
    }

    pub fn plan_for_spec(&self, spec: &QuerySpec) -> Vec<PlanStep> {
        let mut steps = Vec::new();
        if !spec.filters.is_empty() {
            steps.push(PlanStep::Filter(spec.filters.clone()));
        }
        let aggregated = if !spec.group_by.is_empty() {
            let aggregations = if spec.aggregations.is_empty() {
                vec![Aggregation {
                    column: "*".to_string(),
                    func: Reducer::Count,
                    alias: None,
                }]
            } else {
                spec.aggregations.clone()
            };
            steps.push(PlanStep::GroupAggregate {
                keys: spec.group_by.clone(),
                aggregations,
            });
            true
        } else if !spec.aggregations.is_empty() {
            steps.push(PlanStep::Aggregate(spec.aggregations.clone()));
            true
        } else {
            false
        };
        if !spec.sort.is_empty() {
            steps.push(PlanStep::Sort(spec.sort.clone()));
        }
        if !aggregated && !spec.select.is_empty() {
            steps.push(PlanStep::Select(spec.select.clone()));
        }
        steps.push(PlanStep::Limit(spec.limit.unwrap_or(self.default_limit)));
        steps
    }

    /// Apply `steps` to a lazy view of the dataset.
    pub fn run_plan(&self, dataset: &Dataset, steps: Vec<PlanStep>) -> Result<ExecutionResult> {
        let started = Instant::now();
        let schema = dataset.schema();
        let frame = dataset.frame();
        let mut lf = frame.clone().lazy();
        let mut shape = ResultShape::Rows;
        let mut diagnostics = Vec::with_capacity(steps.len() + 1);
        let mut limited = false;

        for step in steps {
            diagnostics.push(step.describe());
            match step {
                PlanStep::Filter(filters) => {
                    let mut predicates = Vec::with_capacity(filters.len());
                    for filter in &filters {
                        predicates.push(self.filter_expr(schema, filter)?);
                    }
                    if let Some(predicate) = predicates.into_iter().reduce(|a, b| a.and(b)) {
                        lf = lf.filter(predicate);
                    }
                }
                PlanStep::Select(columns) => {
                    let exprs: Vec<Expr> = columns.iter().map(|c| col(c)).collect();
                    lf = lf.select(exprs);
                }
                PlanStep::GroupAggregate { keys, aggregations } => {
                    let by: Vec<Expr> = keys.iter().map(|k| col(k)).collect();
                    let exprs = aggregation_exprs(frame, &aggregations)?;
                    lf = lf.group_by_stable(by).agg(exprs);
                    shape = ResultShape::Grouped { keys, aggregations };
                }
                PlanStep::Aggregate(aggregations) => {
                    let exprs = aggregation_exprs(frame, &aggregations)?;
                    lf = lf.select(exprs);
                    shape = ResultShape::Aggregate { aggregations };
                }
                PlanStep::Sort(keys) => {
                    if !keys.is_empty() {
                        let exprs: Vec<Expr> = keys.iter().map(|k| col(&k.by)).collect();
                        let descending: Vec<bool> = keys.iter().map(|k| k.order == SortOrder::Desc).collect();
                        lf = lf.sort_by_exprs(
                            exprs,
                            SortMultipleOptions::default()
                                .with_order_descendings(descending)
                                .with_nulls_last(true)
                                .with_maintain_order(true),
                        );
                    }
                }
                PlanStep::Limit(n) => {
                    let n = n.clamp(1, self.max_limit);
                    lf = lf.limit(n as IdxSize);
                    limited = true;
                }
            }
        }
        if !limited {
            lf = lf.limit(self.default_limit as IdxSize);
            diagnostics.push(format!("limit {} (default)", self.default_limit));
        }

        let df = lf.collect()?;
        let rows = frame_to_rows(&df, df.height());
        let columns = df.get_column_names().iter().map(|c| c.to_string()).collect();
        let execution_time_ms = started.elapsed().as_millis() as u64;
        debug!("Executed plan [{}] in {}ms", diagnostics.join(" -> "), execution_time_ms);

        Ok(ExecutionResult {
            row_count: rows.len(),
            rows,
            columns,
            shape,
            diagnostics,
            execution_time_ms,
        })
    }

    fn filter_expr(&self, schema: &DatasetSchema, filter: &Filter) -> Result<Expr> {
        let column_type = schema.column_type(&filter.column).ok_or_else(|| {
            EngineError::Execution(format!("Column '{}' does not exist in the dataset", filter.column))
        })?;
        let value = match &self.censor {
            Some(censor) => censor.reveal_value(&filter.value),
            None => filter.value.clone(),
        };
        let column = filter.column.as_str();

        let expr = match filter.op {
            FilterOp::Eq | FilterOp::Neq | FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
                compare_expr(column, column_type, filter.op, &value)?
            }
            FilterOp::In => {
                let items = match &value {
                    Value::Array(items) if !items.is_empty() => items,
                    _ => {
                        return Err(EngineError::Execution(format!(
                            "'in' filter on '{}' needs a non-empty list",
                            column
                        )))
                    }
                };
                let mut any: Option<Expr> = None;
                for item in items {
                    let eq = compare_expr(column, column_type, FilterOp::Eq, item)?;
                    any = Some(match any {
                        Some(prev) => prev.or(eq),
                        None => eq,
                    });
                }
                any.unwrap_or_else(|| lit(false))
            }
            FilterOp::Contains => {
                let needle = match &value {
                    Value::String(s) => match &self.censor {
                        Some(censor) => censor.reveal_text(s).to_lowercase(),
                        None => s.to_lowercase(),
                    },
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                col(column)
                    .cast(DataType::String)
                    .str()
                    .to_lowercase()
                    .str()
                    .contains_literal(lit(needle))
            }
            FilterOp::DateRange => {
                let (start, end) = date_bounds(&value).ok_or_else(|| {
                    EngineError::Execution(format!("Invalid date_range value for '{}'", column))
                })?;
                let as_text = col(column).cast(DataType::String);
                let mut range: Option<Expr> = None;
                if let Some(start) = start {
                    range = Some(as_text.clone().gt_eq(lit(start)));
                }
                if let Some(end) = end {
                    // a bare date includes the whole day
                    let upper = if end.len() == 10 { format!("{}~", end) } else { end };
                    let cond = as_text.lt_eq(lit(upper));
                    range = Some(match range {
                        Some(prev) => prev.and(cond),
                        None => cond,
                    });
                }
                range.ok_or_else(|| {
                    EngineError::Execution(format!("date_range on '{}' has no bounds", column))
                })?
            }
        };
        Ok(expr)
    }
}

fn compare_expr(column: &str, column_type: ColumnType, op: FilterOp, value: &Value) -> Result<Expr> {
    if value.is_null() {
        return match op {
            FilterOp::Eq => Ok(col(column).is_null()),
            FilterOp::Neq => Ok(col(column).is_not_null()),
            _ => Err(EngineError::Execution(format!(
                "Cannot compare '{}' with null using {:?}",
                column, op
            ))),
        };
    }

    let (lhs, rhs) = match column_type {
        ColumnType::Numeric => {
            let number = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            }
            .ok_or_else(|| {
                EngineError::Execution(format!("'{}' is numeric but got {}", column, value))
            })?;
            (col(column).cast(DataType::Float64), lit(number))
        }
        _ => {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (col(column).cast(DataType::String), lit(text))
        }
    };

    Ok(match op {
        FilterOp::Eq => lhs.eq(rhs),
        FilterOp::Neq => lhs.neq(rhs),
        FilterOp::Gt => lhs.gt(rhs),
        FilterOp::Gte => lhs.gt_eq(rhs),
        FilterOp::Lt => lhs.lt(rhs),
        FilterOp::Lte => lhs.lt_eq(rhs),
        other => {
            return Err(EngineError::Execution(format!("{:?} is not a comparison", other)));
        }
    })
}

fn aggregation_exprs(frame: &DataFrame, aggregations: &[Aggregation]) -> Result<Vec<Expr>> {
    let mut exprs = Vec::with_capacity(aggregations.len());
    for agg in aggregations {
        let output = agg.output_name();
        if agg.column == "*" {
            exprs.push(len().alias(&output));
            continue;
        }
        let series = frame.column(&agg.column)?;
        let input = if series.dtype().is_numeric() || !matches!(agg.func, Reducer::Sum | Reducer::Mean) {
            col(&agg.column)
        } else {
            col(&agg.column).cast(DataType::Float64)
        };
        let expr = match agg.func {
            Reducer::Count => input.count(),
            Reducer::Sum => input.sum(),
            Reducer::Mean => input.mean(),
            Reducer::Min => input.min(),
            Reducer::Max => input.max(),
        };
        exprs.push(expr.alias(&output));
    }
    Ok(exprs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::censor::{CensoringMapping, MaskRule};
    use crate::schema::ColumnDef;
    use serde_json::json;

    fn dataset() -> Dataset {
        let df = df! {
            "customer_id" => ["C-1", "C-2", "C-3", "C-1"],
            "region" => ["north", "south", "north", "east"],
            "value" => [100i64, 200, 150, 50],
            "order_date" => ["2024-01-05", "2024-01-31", "2024-02-10", "2023-12-30"],
            "note" => ["Fast Delivery", "late", "fast", "ok"],
        }
        .unwrap();
        let schema = DatasetSchema::new(vec![
            ColumnDef::new("customer_id", ColumnType::Text),
            ColumnDef::new("region", ColumnType::Categorical),
            ColumnDef::new("value", ColumnType::Numeric),
            ColumnDef::new("order_date", ColumnType::Date),
            ColumnDef::new("note", ColumnType::Text),
        ]);
        Dataset::new(df, schema).unwrap()
    }

    fn spec(value: serde_json::Value) -> QuerySpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn mean_without_grouping_yields_one_row() {
        let executor = QueryExecutor::new(100, 500);
        let df = df! { "value" => [100i64, 200, 150] }.unwrap();
        let dataset = Dataset::with_inferred_schema(df).unwrap();
        let result = executor
            .execute_spec(&dataset, &spec(json!({"aggregations": [{"column": "value", "func": "mean"}]})))
            .unwrap();
        assert_eq!(result.row_count, 1);
        let (agg, value) = result.scalar().unwrap();
        assert_eq!(agg.func, Reducer::Mean);
        assert_eq!(value.as_f64(), Some(150.0));
    }

    #[test]
    fn filters_cover_every_op() {
        let executor = QueryExecutor::new(100, 500);
        let data = dataset();
        let count = |filter: serde_json::Value| {
            executor
                .execute_spec(&data, &spec(json!({ "filters": [filter] })))
                .unwrap()
                .row_count
        };
        assert_eq!(count(json!({"column": "region", "op": "eq", "value": "north"})), 2);
        assert_eq!(count(json!({"column": "region", "op": "neq", "value": "north"})), 2);
        assert_eq!(count(json!({"column": "value", "op": "gt", "value": 100})), 2);
        assert_eq!(count(json!({"column": "value", "op": "gte", "value": "100"})), 3);
        assert_eq!(count(json!({"column": "value", "op": "lt", "value": 100})), 1);
        assert_eq!(count(json!({"column": "value", "op": "lte", "value": 100.0})), 2);
        assert_eq!(count(json!({"column": "region", "op": "in", "value": ["east", "south"]})), 2);
        assert_eq!(count(json!({"column": "note", "op": "contains", "value": "FAST"})), 2);
        assert_eq!(
            count(json!({"column": "order_date", "op": "date_range", "value": ["2024-01-01", "2024-01-31"]})),
            2
        );
    }

    #[test]
    fn grouping_keeps_first_seen_order_and_sorts() {
        let executor = QueryExecutor::new(100, 500);
        let data = dataset();
        let grouped = executor
            .execute_spec(
                &data,
                &spec(json!({
                    "group_by": ["region"],
                    "aggregations": [{"column": "value", "func": "sum", "alias": "total"}]
                })),
            )
            .unwrap();
        let regions: Vec<&Value> = grouped.rows.iter().map(|r| &r["region"]).collect();
        assert_eq!(regions, vec![&json!("north"), &json!("south"), &json!("east")]);
        assert_eq!(grouped.rows[0]["total"], json!(250));
        assert!(matches!(grouped.shape, ResultShape::Grouped { .. }));

        let sorted = executor
            .execute_spec(
                &data,
                &spec(json!({
                    "group_by": ["region"],
                    "aggregations": [{"column": "value", "func": "sum", "alias": "total"}],
                    "sort": [{"by": "total", "order": "desc"}],
                    "limit": 1
                })),
            )
            .unwrap();
        assert_eq!(sorted.row_count, 1);
        assert_eq!(sorted.rows[0]["region"], json!("north"));
    }

    #[test]
    fn select_and_limit_apply_after_sort() {
        let executor = QueryExecutor::new(2, 500);
        let result = executor
            .execute_spec(
                &dataset(),
                &spec(json!({"select": ["customer_id"], "sort": [{"by": "value"}]})),
            )
            .unwrap();
        assert_eq!(result.columns, vec!["customer_id"]);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[0]["customer_id"], json!("C-1"));
    }

    #[test]
    fn unknown_columns_never_reach_polars() {
        let executor = QueryExecutor::new(100, 500);
        let err = executor
            .execute_spec(&dataset(), &spec(json!({"select": ["score2"]})))
            .unwrap_err();
        assert!(matches!(err, EngineError::Execution(ref m) if m.contains("score2")));
    }

    #[test]
    fn censored_tokens_are_revealed_for_filtering() {
        let data = dataset();
        let censor = Arc::new(CensoringService::new(
            CensoringMapping::new().with_rule("customer_id", MaskRule::customer_id()),
        ));
        censor.rebuild(&data).unwrap();
        let token = MaskRule::customer_id().mask("C-1");

        let executor = QueryExecutor::new(100, 500).with_censor(censor);
        let result = executor
            .execute_spec(&data, &spec(json!({"filters": [{"column": "customer_id", "op": "eq", "value": token}]})))
            .unwrap();
        assert_eq!(result.row_count, 2);
    }

    #[test]
    fn tokens_inside_contains_needles_are_revealed() {
        let df = df! {
            "customer_id" => ["C-1", "C-2"],
            "note" => ["Paid by C-1 / north", "pending"],
        }
        .unwrap();
        let data = Dataset::with_inferred_schema(df).unwrap();
        let censor = Arc::new(CensoringService::new(
            CensoringMapping::new().with_rule("customer_id", MaskRule::customer_id()),
        ));
        censor.rebuild(&data).unwrap();
        let needle = format!("{} / north", MaskRule::customer_id().mask("C-1"));

        let executor = QueryExecutor::new(100, 500).with_censor(censor);
        let result = executor
            .execute_spec(&data, &spec(json!({"filters": [{"column": "note", "op": "contains", "value": needle}]})))
            .unwrap();
        assert_eq!(result.row_count, 1);
    }

    #[test]
    fn source_frame_is_untouched() {
        let executor = QueryExecutor::new(100, 500);
        let data = dataset();
        let before = data.frame().clone();
        executor
            .execute_spec(&data, &spec(json!({"filters": [{"column": "value", "op": "gt", "value": 120}], "select": ["value"]})))
            .unwrap();
        assert!(data.frame().equals(&before));
    }
}
