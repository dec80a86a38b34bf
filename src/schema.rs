//! Dataset schema: column names mapped to semantic types.

use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic column type used by prompts, validation and the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Numeric,
    Date,
    Categorical,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Text => "text",
            ColumnType::Numeric => "numeric",
            ColumnType::Date => "date",
            ColumnType::Categorical => "categorical",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Ordered list of columns. Order follows the source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub columns: Vec<ColumnDef>,
}

const CATEGORICAL_MAX_DISTINCT: usize = 20;
const DATE_PROBE_ROWS: usize = 50;

impl DatasetSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Resolve a column reference to its canonical name.
    ///
    /// Exact match wins; otherwise a case-insensitive match is accepted only
    /// when it is unambiguous.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        let name = name.trim();
        if let Some(def) = self.columns.iter().find(|c| c.name == name) {
            return Some(def.name.as_str());
        }
        let lower = name.to_lowercase();
        let mut matches = self
            .columns
            .iter()
            .filter(|c| c.name.to_lowercase() == lower);
        match (matches.next(), matches.next()) {
            (Some(def), None) => Some(def.name.as_str()),
            _ => None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.column(name).map(|c| c.column_type)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// One line per column, for prompts.
    pub fn describe(&self) -> String {
        self.columns
            .iter()
            .map(|c| match &c.description {
                Some(desc) => format!("- {} ({}): {}", c.name, c.column_type, desc),
                None => format!("- {} ({})", c.name, c.column_type),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Infer semantic types from a loaded frame.
    pub fn infer_from_frame(df: &DataFrame) -> Self {
        let columns = df
            .get_columns()
            .iter()
            .map(|series| ColumnDef::new(series.name(), infer_column_type(series, df.height())))
            .collect();
        Self { columns }
    }
}

fn infer_column_type(series: &Series, height: usize) -> ColumnType {
    let dtype = series.dtype();
    if dtype.is_numeric() {
        return ColumnType::Numeric;
    }
    if matches!(dtype, DataType::Date | DataType::Datetime(_, _)) {
        return ColumnType::Date;
    }
    if let Ok(values) = series.str() {
        let probe: Vec<&str> = values.into_iter().flatten().take(DATE_PROBE_ROWS).collect();
        if !probe.is_empty() && probe.iter().all(|v| looks_like_date(v)) {
            return ColumnType::Date;
        }
    }
    let distinct = series.n_unique().unwrap_or(height);
    if height > 0 && distinct <= CATEGORICAL_MAX_DISTINCT && distinct * 2 <= height {
        ColumnType::Categorical
    } else {
        ColumnType::Text
    }
}

/// ISO date prefix (`YYYY-MM-DD`, optionally followed by a time part).
pub(crate) fn looks_like_date(value: &str) -> bool {
    let value = value.trim();
    value.len() >= 10
        && value.is_char_boundary(10)
        && NaiveDate::parse_from_str(&value[..10], "%Y-%m-%d").is_ok()
}
