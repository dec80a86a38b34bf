//! Reversible masking of sensitive values.
//!
//! Each sensitive column has a [`MaskRule`]; a raw value always maps to the
//! same token (`PREFIX_` + leading hex chars of its MD5). The service keeps a
//! forward index (raw -> token) and a reverse index (token -> raw) for the
//! active dataset load only. The reverse index never leaves the crate.

use crate::dataset::{Dataset, Row};
use crate::error::{EngineError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskRule {
    pub prefix: String,
    pub hash_len: usize,
    #[serde(default)]
    pub uppercase: bool,
}

impl MaskRule {
    pub fn new(prefix: impl Into<String>, hash_len: usize, uppercase: bool) -> Self {
        Self {
            prefix: prefix.into(),
            hash_len,
            uppercase,
        }
    }

    pub fn customer_id() -> Self {
        Self::new("DEALER", 6, false)
    }

    pub fn address() -> Self {
        Self::new("ADDR", 8, true)
    }

    /// Named preset used by profile files ("customer_id", "address").
    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "customer_id" | "dealer" | "dealer_code" => Some(Self::customer_id()),
            "address" => Some(Self::address()),
            _ => None,
        }
    }

    /// Mask one raw value. Blank input masks to the empty string.
    pub fn mask(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return String::new();
        }
        let digest = format!("{:x}", md5::compute(trimmed.as_bytes()));
        let len = self.hash_len.clamp(1, digest.len());
        let hash = &digest[..len];
        if self.uppercase {
            format!("{}_{}", self.prefix, hash.to_uppercase())
        } else {
            format!("{}_{}", self.prefix, hash)
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.prefix.trim().is_empty() {
            return Err(EngineError::Configuration("Mask prefix must not be empty".to_string()));
        }
        if self.hash_len == 0 || self.hash_len > 32 {
            return Err(EngineError::Configuration(format!(
                "Mask hash length {} must be between 1 and 32",
                self.hash_len
            )));
        }
        Ok(())
    }
}

/// Sensitive column name -> masking rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CensoringMapping {
    pub rules: BTreeMap<String, MaskRule>,
}

impl CensoringMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, column: impl Into<String>, rule: MaskRule) -> Self {
        self.rules.insert(column.into(), rule);
        self
    }

    pub fn rule_for(&self, column: &str) -> Option<&MaskRule> {
        self.rules.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(|k| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Forward and reverse indexes for one dataset load.
#[derive(Default)]
struct Indexes {
    load_id: u64,
    forward: DashMap<String, String>,
    reverse: DashMap<String, String>,
}

impl Indexes {
    fn insert(&self, raw: String, token: String) {
        self.forward.insert(raw.clone(), token.clone());
        self.reverse.insert(token, raw);
    }
}

pub struct CensoringService {
    mapping: CensoringMapping,
    indexes: RwLock<Arc<Indexes>>,
}

impl CensoringService {
    pub fn new(mapping: CensoringMapping) -> Self {
        Self {
            mapping,
            indexes: RwLock::new(Arc::new(Indexes::default())),
        }
    }

    pub fn mapping(&self) -> &CensoringMapping {
        &self.mapping
    }

    fn current(&self) -> Arc<Indexes> {
        match self.indexes.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Load id of the dataset the indexes were built for.
    pub fn generation(&self) -> u64 {
        self.current().load_id
    }

    pub fn indexed_values(&self) -> usize {
        self.current().forward.len()
    }

    /// Index every sensitive value of `dataset` into fresh maps, then swap
    /// them in. Readers see either the old load or the new one, never a
    /// partially filled index.
    pub fn rebuild(&self, dataset: &Dataset) -> Result<()> {
        let fresh = Indexes {
            load_id: dataset.load_id(),
            ..Indexes::default()
        };
        for (column, rule) in &self.mapping.rules {
            if !dataset.schema().contains(column) {
                return Err(EngineError::Configuration(format!(
                    "Sensitive column '{}' is not in the dataset schema",
                    column
                )));
            }
            for raw in dataset.distinct_values(column, usize::MAX)? {
                let token = rule.mask(&raw);
                if !token.is_empty() {
                    fresh.insert(raw.trim().to_string(), token);
                }
            }
        }

        let count = fresh.forward.len();
        match self.indexes.write() {
            Ok(mut guard) => *guard = Arc::new(fresh),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(fresh),
        }
        info!("Censoring index rebuilt for load {} ({} values)", dataset.load_id(), count);
        Ok(())
    }

    fn index(&self, rule: &MaskRule, raw: &str) -> String {
        let token = rule.mask(raw);
        if !token.is_empty() {
            self.current().insert(raw.trim().to_string(), token.clone());
        }
        token
    }

    /// Mask a value of a sensitive column, indexing it if it is new.
    pub fn mask(&self, column: &str, raw: &str) -> Option<String> {
        self.mapping.rule_for(column).map(|rule| self.index(rule, raw))
    }

    pub fn censor_value(&self, column: &str, value: &Value) -> Value {
        if let Some(rule) = self.mapping.rule_for(column) {
            return match value {
                Value::Null => Value::String(String::new()),
                Value::String(s) => Value::String(self.index(rule, s)),
                other => Value::String(self.index(rule, &other.to_string())),
            };
        }
        self.censor_json(value)
    }

    /// Replace any string that equals a known raw value, at any depth.
    pub fn censor_json(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                let known = self.current().forward.get(s.trim()).map(|t| t.value().clone());
                match known {
                    Some(token) => Value::String(token),
                    None => Value::String(self.censor_text(s)),
                }
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.censor_json(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.censor_value(k, v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn censor_row(&self, row: &Row) -> Row {
        row.iter()
            .map(|(column, value)| (column.clone(), self.censor_value(column, value)))
            .collect()
    }

    pub fn censor_rows(&self, rows: &[Row]) -> Vec<Row> {
        rows.iter().map(|row| self.censor_row(row)).collect()
    }

    /// Replace known raw values inside free text. Only whole words match, so
    /// `100` does not touch `1000`.
    pub fn censor_text(&self, text: &str) -> String {
        substitute(text, &self.current().forward)
    }

    pub(crate) fn reveal_token(&self, token: &str) -> Option<String> {
        self.current().reverse.get(token.trim()).map(|raw| raw.value().clone())
    }

    /// Swap every known token inside `text` back to its raw value.
    pub(crate) fn reveal_text(&self, text: &str) -> String {
        substitute(text, &self.current().reverse)
    }

    /// Swap tokens back to raw values so synthesized filters match the data.
    pub(crate) fn reveal_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => match self.reveal_token(s) {
                Some(raw) => {
                    debug!("Revealed censored literal for execution");
                    Value::String(raw)
                }
                None => value.clone(),
            },
            Value::Array(items) => Value::Array(items.iter().map(|v| self.reveal_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.reveal_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Single left-to-right pass over `text`, longest key first at each position.
/// Keys that start or end with a word character only match at word boundaries.
fn substitute(text: &str, index: &DashMap<String, String>) -> String {
    if index.is_empty() || text.is_empty() {
        return text.to_string();
    }
    let mut pairs: Vec<(String, String)> = index
        .iter()
        .filter(|entry| !entry.key().is_empty() && text.contains(entry.key().as_str()))
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();
    if pairs.is_empty() {
        return text.to_string();
    }
    pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

    let mut out = String::with_capacity(text.len());
    let mut prev: Option<char> = None;
    let mut rest = text;
    while let Some(c) = rest.chars().next() {
        let hit = pairs.iter().find(|(key, _)| {
            if !rest.starts_with(key.as_str()) {
                return false;
            }
            let left_ok = !key.starts_with(is_word) || !prev.is_some_and(is_word);
            let right_ok =
                !key.ends_with(is_word) || !rest[key.len()..].chars().next().is_some_and(is_word);
            left_ok && right_ok
        });
        match hit {
            Some((key, value)) => {
                out.push_str(value);
                prev = key.chars().last();
                rest = &rest[key.len()..];
            }
            None => {
                out.push(c);
                prev = Some(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;
    use serde_json::json;

    fn service() -> (CensoringService, Dataset) {
        let df = df! {
            "customer_id" => ["C-1001", "C-2002", "C-1001"],
            "address" => ["12 High Street", "  ", "9 Low Road"],
            "value" => [100i64, 200, 150],
        }
        .unwrap();
        let dataset = Dataset::with_inferred_schema(df).unwrap();
        let mapping = CensoringMapping::new()
            .with_rule("customer_id", MaskRule::customer_id())
            .with_rule("address", MaskRule::address());
        let service = CensoringService::new(mapping);
        service.rebuild(&dataset).unwrap();
        (service, dataset)
    }

    #[test]
    fn masks_follow_prefix_and_hash_rules() {
        let id = MaskRule::customer_id().mask("C-1001");
        assert!(id.starts_with("DEALER_"));
        assert_eq!(id.len(), "DEALER_".len() + 6);
        assert!(id["DEALER_".len()..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let addr = MaskRule::address().mask(" 12 High Street ");
        assert_eq!(addr, MaskRule::address().mask("12 High Street"));
        assert_eq!(addr.len(), "ADDR_".len() + 8);
        assert_eq!(addr, addr.to_uppercase());

        assert_eq!(MaskRule::address().mask("   "), "");
        assert_eq!(MaskRule::address().mask(""), "");
    }

    #[test]
    fn same_raw_value_always_gets_same_token() {
        let (service, dataset) = service();
        let rows = service.censor_rows(&dataset.head_rows(3));
        assert_eq!(rows[0]["customer_id"], rows[2]["customer_id"]);
        assert_ne!(rows[0]["customer_id"], rows[1]["customer_id"]);
        assert_eq!(rows[1]["address"], json!(""));
        assert_eq!(rows[0]["value"], json!(100));
    }

    #[test]
    fn tokens_reveal_internally() {
        let (service, _) = service();
        let token = service.mask("customer_id", "C-2002").unwrap();
        assert_eq!(service.reveal_token(&token).as_deref(), Some("C-2002"));
        assert_eq!(
            service.reveal_value(&json!([token.clone(), "other"])),
            json!(["C-2002", "other"])
        );
        assert!(service.mask("value", "100").is_none());
    }

    #[test]
    fn raw_values_in_other_columns_and_text_are_masked() {
        let (service, _) = service();
        let token = service.mask("customer_id", "C-1001").unwrap();

        let mut row = Row::new();
        row.insert("top_customer".into(), json!("C-1001"));
        let censored = service.censor_row(&row);
        assert_eq!(censored["top_customer"], json!(token.clone()));

        let text = service.censor_text("Customer C-1001 lives at 12 High Street.");
        assert!(!text.contains("C-1001"));
        assert!(!text.contains("High Street"));
        assert!(text.contains(&token));
    }

    #[test]
    fn censored_text_reveals_back_to_the_original() {
        let (service, _) = service();
        let original = "C-2002 moved from 12 High Street; C-1001 stayed.";
        let censored = service.censor_text(original);
        assert!(!censored.contains("C-2002"));
        assert!(!censored.contains("High Street"));
        assert_eq!(service.reveal_text(&censored), original);
    }

    #[test]
    fn text_matches_whole_words_only() {
        let df = df! { "customer_id" => ["A1", "100"] }.unwrap();
        let dataset = Dataset::with_inferred_schema(df).unwrap();
        let service = CensoringService::new(
            CensoringMapping::new().with_rule("customer_id", MaskRule::customer_id()),
        );
        service.rebuild(&dataset).unwrap();

        let text = service.censor_text("A1 spent 1000, not 100. BA12 is unrelated.");
        assert!(!text.starts_with("A1"));
        assert!(text.contains("spent 1000, not DEALER_"));
        assert!(text.contains("BA12 is unrelated."));
    }

    #[test]
    fn rebuild_resets_indexes_per_load() {
        let (service, first) = service();
        assert_eq!(service.generation(), first.load_id());

        let df = df! { "customer_id" => ["Z-9"], "address" => ["1 New Lane"] }.unwrap();
        let second = Dataset::with_inferred_schema(df).unwrap();
        service.rebuild(&second).unwrap();

        assert_eq!(service.generation(), second.load_id());
        let old = MaskRule::customer_id().mask("C-1001");
        assert!(service.reveal_token(&old).is_none());
        assert_eq!(service.indexed_values(), 2);
    }

    #[test]
    fn readers_never_see_a_half_built_index() {
        let (service, dataset) = service();
        let service = Arc::new(service);
        let dataset = Arc::new(dataset);
        let token = MaskRule::customer_id().mask("C-2002");

        let writer = {
            let (service, dataset) = (service.clone(), dataset.clone());
            std::thread::spawn(move || {
                for _ in 0..200 {
                    service.rebuild(&dataset).unwrap();
                }
            })
        };
        for _ in 0..2000 {
            assert_eq!(service.censor_text("paid by C-2002"), format!("paid by {}", token));
            assert_eq!(service.reveal_token(&token).as_deref(), Some("C-2002"));
        }
        writer.join().unwrap();
    }

    #[test]
    fn rebuild_rejects_unknown_sensitive_column() {
        let df = df! { "value" => [1i64] }.unwrap();
        let dataset = Dataset::with_inferred_schema(df).unwrap();
        let service = CensoringService::new(
            CensoringMapping::new().with_rule("customer_id", MaskRule::customer_id()),
        );
        assert!(matches!(service.rebuild(&dataset), Err(EngineError::Configuration(_))));
    }
}
