//! Provider-independent query description emitted by the traditional method.

use crate::error::{EngineError, Result};
use crate::schema::{ColumnType, DatasetSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
    DateRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reducer {
    Count,
    Sum,
    #[serde(alias = "avg", alias = "average")]
    Mean,
    Min,
    Max,
}

impl Reducer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reducer::Count => "count",
            Reducer::Sum => "sum",
            Reducer::Mean => "mean",
            Reducer::Min => "min",
            Reducer::Max => "max",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "count" | "len" => Some(Reducer::Count),
            "sum" => Some(Reducer::Sum),
            "mean" | "avg" | "average" => Some(Reducer::Mean),
            "min" => Some(Reducer::Min),
            "max" => Some(Reducer::Max),
            _ => None,
        }
    }

    fn needs_numeric(&self) -> bool {
        matches!(self, Reducer::Sum | Reducer::Mean)
    }
}

impl fmt::Display for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Aggregation {
    pub column: String,
    #[serde(alias = "op")]
    pub func: Reducer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Aggregation {
    /// Output column name: the alias, or `<column>_<reducer>`.
    pub fn output_name(&self) -> String {
        match &self.alias {
            Some(alias) if !alias.trim().is_empty() => alias.trim().to_string(),
            _ if self.column == "*" => "count".to_string(),
            _ => format!("{}_{}", self.column, self.func),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SortKey {
    pub by: String,
    #[serde(default)]
    pub order: SortOrder,
}

/// What a spec mainly does; drives how the answer text is phrased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Filter,
    Aggregate,
    Sort,
    Group,
    Select,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuerySpec {
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    #[serde(default)]
    pub sort: Vec<SortKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl QuerySpec {
    /// Parse model output. Anything that is not a well-formed spec is a synthesis failure.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| EngineError::Synthesis(format!("Invalid QuerySpec JSON: {}", e)))
    }

    pub fn operation_kind(&self) -> OperationKind {
        if !self.group_by.is_empty() {
            OperationKind::Group
        } else if !self.aggregations.is_empty() {
            OperationKind::Aggregate
        } else if !self.sort.is_empty() {
            OperationKind::Sort
        } else if !self.filters.is_empty() {
            OperationKind::Filter
        } else {
            OperationKind::Select
        }
    }

    /// Check every reference against the schema and normalise names to their
    /// canonical spelling. The limit is clamped to `max_limit`.
    pub fn validate(mut self, schema: &DatasetSchema, max_limit: usize) -> Result<Self> {
        let resolve = |name: &str, role: &str| -> Result<String> {
            schema.resolve(name).map(str::to_string).ok_or_else(|| {
                EngineError::Synthesis(format!(
                    "Unknown column '{}' in {} (available: {})",
                    name,
                    role,
                    schema.names().join(", ")
                ))
            })
        };

        for column in self.select.iter_mut() {
            *column = resolve(column, "select")?;
        }
        for column in self.group_by.iter_mut() {
            *column = resolve(column, "group_by")?;
        }

        for filter in self.filters.iter_mut() {
            filter.column = resolve(&filter.column, "filters")?;
            let column_type = schema.column_type(&filter.column);
            validate_filter_value(filter, column_type)?;
        }

        for agg in self.aggregations.iter_mut() {
            if agg.column.trim() == "*" {
                if agg.func != Reducer::Count {
                    return Err(EngineError::Synthesis(format!(
                        "'*' is only valid with count, not {}",
                        agg.func
                    )));
                }
                agg.column = "*".to_string();
                continue;
            }
            agg.column = resolve(&agg.column, "aggregations")?;
            if agg.func.needs_numeric() && schema.column_type(&agg.column) != Some(ColumnType::Numeric) {
                return Err(EngineError::Synthesis(format!(
                    "Cannot {} non-numeric column '{}'",
                    agg.func, agg.column
                )));
            }
        }

        let outputs: Vec<String> = self.aggregations.iter().map(|a| a.output_name()).collect();
        for key in self.sort.iter_mut() {
            if outputs.iter().any(|o| o == key.by.trim()) {
                key.by = key.by.trim().to_string();
                continue;
            }
            key.by = resolve(&key.by, "sort")?;
        }

        if !self.group_by.is_empty() && !self.select.is_empty() {
            for column in &self.select {
                if !self.group_by.contains(column) {
                    return Err(EngineError::Synthesis(format!(
                        "Selected column '{}' is neither grouped nor aggregated",
                        column
                    )));
                }
            }
        }

        if let Some(limit) = self.limit {
            if limit == 0 {
                return Err(EngineError::Synthesis("limit must be positive".to_string()));
            }
            self.limit = Some(limit.min(max_limit));
        }
        Ok(self)
    }

    /// Every column name the spec reads from the dataset.
    pub fn referenced_columns(&self) -> Vec<&str> {
        let names = self
            .select
            .iter()
            .map(String::as_str)
            .chain(self.filters.iter().map(|f| f.column.as_str()))
            .chain(self.group_by.iter().map(String::as_str))
            .chain(self.aggregations.iter().map(|a| a.column.as_str()));
        let mut columns: Vec<&str> = Vec::new();
        for name in names {
            if name != "*" && !columns.contains(&name) {
                columns.push(name);
            }
        }
        columns
    }
}

fn validate_filter_value(filter: &Filter, column_type: Option<ColumnType>) -> Result<()> {
    let bad = |msg: &str| {
        Err(EngineError::Synthesis(format!(
            "Filter on '{}' with op {:?}: {}",
            filter.column, filter.op, msg
        )))
    };
    match filter.op {
        FilterOp::In => match &filter.value {
            Value::Array(items) if !items.is_empty() => Ok(()),
            _ => bad("value must be a non-empty list"),
        },
        FilterOp::Contains => match &filter.value {
            Value::String(s) if !s.is_empty() => Ok(()),
            _ => bad("value must be a non-empty string"),
        },
        FilterOp::DateRange => {
            if column_type == Some(ColumnType::Numeric) {
                return bad("column is not a date");
            }
            match date_bounds(&filter.value) {
                Some((None, None)) | None => bad("value must be [start, end] or {start, end}"),
                Some(_) => Ok(()),
            }
        }
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => match &filter.value {
            Value::Number(_) | Value::String(_) => Ok(()),
            _ => bad("value must be a number or string"),
        },
        FilterOp::Eq | FilterOp::Neq => match &filter.value {
            Value::Array(_) | Value::Object(_) => bad("value must be a scalar"),
            _ => Ok(()),
        },
    }
}

/// Start and end of a `date_range` value, either bound optional.
pub(crate) fn date_bounds(value: &Value) -> Option<(Option<String>, Option<String>)> {
    let text = |v: Option<&Value>| -> Option<String> {
        match v {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    };
    match value {
        Value::Array(items) if items.len() == 2 => Some((text(items.first()), text(items.get(1)))),
        Value::Object(map) => Some((
            text(map.get("start").or_else(|| map.get("from"))),
            text(map.get("end").or_else(|| map.get("to"))),
        )),
        _ => None,
    }
}
