//! Loaded dataset plus the helpers that turn polars frames into JSON rows.

use crate::error::{EngineError, Result};
use crate::schema::DatasetSchema;
use polars::prelude::*;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Column-ordered row as returned to callers.
pub type Row = serde_json::Map<String, Value>;

static LOAD_COUNTER: AtomicU64 = AtomicU64::new(1);

/// An immutable table and its schema. Every construction gets a fresh load id,
/// which scopes the censoring indexes built over it.
#[derive(Debug, Clone)]
pub struct Dataset {
    frame: DataFrame,
    schema: DatasetSchema,
    load_id: u64,
}

impl Dataset {
    /// Wrap a frame with a declared schema. Every schema column must exist in the frame.
    pub fn new(frame: DataFrame, schema: DatasetSchema) -> Result<Self> {
        if schema.is_empty() {
            return Err(EngineError::Configuration("Dataset schema has no columns".to_string()));
        }
        let present = frame.get_column_names();
        let missing: Vec<&str> = schema
            .names()
            .into_iter()
            .filter(|name| !present.contains(name))
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::Configuration(format!(
                "Schema columns not found in data: {}",
                missing.join(", ")
            )));
        }
        Ok(Self {
            frame,
            schema,
            load_id: LOAD_COUNTER.fetch_add(1, Ordering::SeqCst),
        })
    }

    pub fn with_inferred_schema(frame: DataFrame) -> Result<Self> {
        let schema = DatasetSchema::infer_from_frame(&frame);
        Self::new(frame, schema)
    }

    /// Load a CSV file. A missing file is a configuration problem, not an execution one.
    pub fn from_csv(path: impl AsRef<Path>, schema: Option<DatasetSchema>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EngineError::Configuration(format!(
                "Data file not found: {}",
                path.display()
            )));
        }

        let frame = LazyCsvReader::new(path)
            .with_infer_schema_length(Some(1000))
            .finish()
            .and_then(|lf| lf.collect())
            .map_err(|e| {
                EngineError::Configuration(format!("Failed to read {}: {}", path.display(), e))
            })?;

        info!("Loaded {} rows x {} columns from {}", frame.height(), frame.width(), path.display());

        match schema {
            Some(schema) => Self::new(frame, schema),
            None => Self::with_inferred_schema(frame),
        }
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn schema(&self) -> &DatasetSchema {
        &self.schema
    }

    pub fn load_id(&self) -> u64 {
        self.load_id
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    pub fn head_rows(&self, n: usize) -> Vec<Row> {
        frame_to_rows(&self.frame.head(Some(n)), n)
    }

    /// Distinct non-null values of a column as display strings, in first-seen order.
    pub fn distinct_values(&self, column: &str, limit: usize) -> Result<Vec<String>> {
        let series = self.frame.column(column)?;
        let unique = series.unique_stable()?;
        let mut values = Vec::new();
        for i in 0..unique.len() {
            if values.len() >= limit {
                break;
            }
            match any_value_to_json(unique.get(i)?) {
                Value::Null => {}
                Value::String(s) => values.push(s),
                other => values.push(other.to_string()),
            }
        }
        Ok(values)
    }
}

/// Convert up to `max_rows` rows of a frame into column-ordered JSON maps.
pub fn frame_to_rows(df: &DataFrame, max_rows: usize) -> Vec<Row> {
    let height = df.height().min(max_rows);
    let columns = df.get_columns();
    let mut rows = Vec::with_capacity(height);
    for i in 0..height {
        let mut row = Row::new();
        for series in columns {
            let value = series.get(i).map(any_value_to_json).unwrap_or(Value::Null);
            row.insert(series.name().to_string(), value);
        }
        rows.push(row);
    }
    rows
}

pub fn any_value_to_json(value: AnyValue) -> Value {
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::StringOwned(s) => Value::String(s.to_string()),
        AnyValue::Int8(i) => Value::from(i),
        AnyValue::Int16(i) => Value::from(i),
        AnyValue::Int32(i) => Value::from(i),
        AnyValue::Int64(i) => Value::from(i),
        AnyValue::UInt8(u) => Value::from(u),
        AnyValue::UInt16(u) => Value::from(u),
        AnyValue::UInt32(u) => Value::from(u),
        AnyValue::UInt64(u) => Value::from(u),
        AnyValue::Float32(f) => float_to_json(f as f64),
        AnyValue::Float64(f) => float_to_json(f),
        other => Value::String(other.to_string()),
    }
}

fn float_to_json(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType};

    #[test]
    fn rejects_schema_columns_missing_from_frame() {
        let df = df! { "value" => [1i64, 2, 3] }.unwrap();
        let schema = DatasetSchema::new(vec![
            ColumnDef::new("value", ColumnType::Numeric),
            ColumnDef::new("score2", ColumnType::Numeric),
        ]);
        let err = Dataset::new(df, schema).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(ref m) if m.contains("score2")));
    }

    #[test]
    fn each_load_gets_a_new_id() {
        let df = df! { "value" => [1i64] }.unwrap();
        let a = Dataset::with_inferred_schema(df.clone()).unwrap();
        let b = Dataset::with_inferred_schema(df).unwrap();
        assert_ne!(a.load_id(), b.load_id());
    }

    #[test]
    fn rows_keep_column_order_and_types() {
        let df = df! {
            "name" => ["a", "b"],
            "value" => [1.5, f64::NAN],
            "n" => [1i64, 2],
        }
        .unwrap();
        let rows = frame_to_rows(&df, 10);
        assert_eq!(rows.len(), 2);
        let keys: Vec<&String> = rows[0].keys().collect();
        assert_eq!(keys, ["name", "value", "n"]);
        assert_eq!(rows[0]["name"], Value::String("a".into()));
        assert_eq!(rows[0]["value"], serde_json::json!(1.5));
        assert_eq!(rows[1]["value"], Value::Null);
        assert_eq!(rows[1]["n"], serde_json::json!(2));
    }

    #[test]
    fn distinct_values_are_first_seen() {
        let df = df! { "region" => ["south", "north", "south", "east"] }.unwrap();
        let dataset = Dataset::with_inferred_schema(df).unwrap();
        let values = dataset.distinct_values("region", 10).unwrap();
        assert_eq!(values, vec!["south", "north", "east"]);
        assert_eq!(dataset.distinct_values("region", 2).unwrap().len(), 2);
    }

    #[test]
    fn missing_csv_is_configuration_error() {
        let err = Dataset::from_csv("/nonexistent/data.csv", None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }
}
