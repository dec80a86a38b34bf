//! Dataset profiles
//!
//! A profile bundles everything the engine needs for one dataset: schema,
//! data, provider configuration and censoring rules. Profiles are registered
//! explicitly by id at startup; [`CsvProfile`] loads one from a JSON file.

use crate::censor::{CensoringMapping, MaskRule};
use crate::dataset::{Dataset, Row};
use crate::error::{EngineError, Result};
use crate::llm::ProviderConfig;
use crate::schema::{ColumnDef, DatasetSchema};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub trait Profile: Send + Sync {
    fn id(&self) -> &str;

    fn schema(&self) -> &DatasetSchema;

    /// Raw (uncensored) leading rows.
    fn sample_data(&self, n: usize) -> Vec<Row>;

    fn provider_config(&self) -> &ProviderConfig;

    fn censoring_mappings(&self) -> &CensoringMapping;

    fn dataset(&self) -> Arc<Dataset>;

    fn hints(&self) -> Option<&str> {
        None
    }

    fn example_questions(&self) -> &[String] {
        &[]
    }
}

/// Capability check every profile has to pass before an engine is built on it.
pub fn validate_profile(profile: &dyn Profile) -> Result<()> {
    let schema = profile.schema();
    if schema.is_empty() {
        return Err(EngineError::Configuration(format!(
            "Profile '{}' has an empty schema",
            profile.id()
        )));
    }
    let mapping = profile.censoring_mappings();
    for column in mapping.columns() {
        if !schema.contains(column) {
            return Err(EngineError::Configuration(format!(
                "Profile '{}' marks '{}' as sensitive but the schema has no such column",
                profile.id(),
                column
            )));
        }
        if let Some(rule) = mapping.rule_for(column) {
            rule.validate()?;
        }
    }
    profile.provider_config().validate()
}

pub type ProfileFactory = Box<dyn Fn() -> Result<Arc<dyn Profile>> + Send + Sync>;

#[derive(Default)]
pub struct ProfileRegistry {
    factories: BTreeMap<String, ProfileFactory>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn() -> Result<Arc<dyn Profile>> + Send + Sync + 'static,
    {
        let id = id.into();
        if self.factories.contains_key(&id) {
            return Err(EngineError::Configuration(format!("Profile '{}' is already registered", id)));
        }
        debug!("Registered profile '{}'", id);
        self.factories.insert(id, Box::new(factory));
        Ok(())
    }

    /// Register a JSON profile file; the profile is loaded lazily on `create`.
    pub fn register_file(&mut self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref().to_path_buf();
        let id = ProfileFile::read(&path)?.id;
        let loader = path.clone();
        self.register(id.clone(), move || {
            let profile: Arc<dyn Profile> = Arc::new(CsvProfile::load(&loader)?);
            Ok(profile)
        })?;
        Ok(id)
    }

    /// Register every `*.json` profile file in `dir`. Unreadable files are skipped.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let mut registry = Self::new();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();
        for path in paths {
            if let Err(e) = registry.register_file(&path) {
                warn!("Skipping profile file {}: {}", path.display(), e);
            }
        }
        info!("Loaded {} profile(s) from {}", registry.len(), dir.as_ref().display());
        Ok(registry)
    }

    pub fn create(&self, id: &str) -> Result<Arc<dyn Profile>> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| EngineError::Configuration(format!("Unknown profile '{}'", id)))?;
        let profile = factory()?;
        if profile.id() != id {
            return Err(EngineError::Configuration(format!(
                "Profile factory for '{}' produced profile '{}'",
                id,
                profile.id()
            )));
        }
        validate_profile(profile.as_ref())?;
        Ok(profile)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// A preset name (`customer_id`, `address`) or an explicit rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensitiveRule {
    Preset(String),
    Custom(MaskRule),
}

impl SensitiveRule {
    fn into_rule(self) -> Result<MaskRule> {
        match self {
            SensitiveRule::Custom(rule) => Ok(rule),
            SensitiveRule::Preset(name) => MaskRule::preset(&name)
                .ok_or_else(|| EngineError::Configuration(format!("Unknown masking preset '{}'", name))),
        }
    }
}

/// On-disk profile description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileFile {
    pub id: String,
    /// Relative paths resolve against the profile file's directory
    pub csv_path: PathBuf,
    /// Omit to infer column types from the data
    #[serde(default)]
    pub columns: Option<Vec<ColumnDef>>,
    #[serde(default)]
    pub sensitive_columns: BTreeMap<String, SensitiveRule>,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub hints: Option<String>,
    #[serde(default)]
    pub example_questions: Vec<String>,
}

impl ProfileFile {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            EngineError::Configuration(format!("Invalid profile file {}: {}", path.display(), e))
        })
    }
}

pub struct CsvProfile {
    id: String,
    dataset: Arc<Dataset>,
    provider: ProviderConfig,
    mapping: CensoringMapping,
    hints: Option<String>,
    examples: Vec<String>,
}

impl CsvProfile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = ProfileFile::read(path)?;

        let csv_path = if file.csv_path.is_absolute() {
            file.csv_path.clone()
        } else {
            path.parent().unwrap_or_else(|| Path::new(".")).join(&file.csv_path)
        };
        let dataset = Dataset::from_csv(&csv_path, file.columns.map(DatasetSchema::new))?;

        let mut mapping = CensoringMapping::new();
        for (column, rule) in file.sensitive_columns {
            mapping = mapping.with_rule(column, rule.into_rule()?);
        }

        info!(
            "Loaded profile '{}' from {} ({} rows)",
            file.id,
            csv_path.display(),
            dataset.height()
        );
        Ok(Self {
            id: file.id,
            dataset: Arc::new(dataset),
            provider: file.provider,
            mapping,
            hints: file.hints,
            examples: file.example_questions,
        })
    }

    /// In-memory profile, mostly for tests and embedding.
    pub fn from_parts(
        id: impl Into<String>,
        dataset: Dataset,
        provider: ProviderConfig,
        mapping: CensoringMapping,
    ) -> Self {
        Self {
            id: id.into(),
            dataset: Arc::new(dataset),
            provider,
            mapping,
            hints: None,
            examples: Vec::new(),
        }
    }

    pub fn with_hints(mut self, hints: impl Into<String>) -> Self {
        self.hints = Some(hints.into());
        self
    }

    pub fn with_examples(mut self, examples: Vec<String>) -> Self {
        self.examples = examples;
        self
    }
}

impl Profile for CsvProfile {
    fn id(&self) -> &str {
        &self.id
    }

    fn schema(&self) -> &DatasetSchema {
        self.dataset.schema()
    }

    fn sample_data(&self, n: usize) -> Vec<Row> {
        self.dataset.head_rows(n)
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

    fn hints(&self) -> Option<&str> {
        self.hints.as_deref()
    }

    fn example_questions(&self) -> &[String] {
        &self.examples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;
    use polars::prelude::*;
    use std::io::Write;

    fn write_fixture(dir: &Path, profile_json: &str) -> PathBuf {
        let mut csv = std::fs::File::create(dir.join("sales.csv")).unwrap();
        writeln!(csv, "customer_id,region,value").unwrap();
        writeln!(csv, "C-1,north,100").unwrap();
        writeln!(csv, "C-2,south,200").unwrap();
        writeln!(csv, "C-3,north,150").unwrap();

        let path = dir.join("sales.json");
        std::fs::write(&path, profile_json).unwrap();
        path
    }

    const PROFILE: &str = r#"{
        "id": "sales",
        "csv_path": "sales.csv",
        "sensitive_columns": {"customer_id": "customer_id"},
        "provider": {"provider": "openai", "model": "gpt-4o"},
        "hints": "value is in euros",
        "example_questions": ["What is the average value?"]
    }"#;

    #[test]
    fn loads_csv_profile_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), PROFILE);
        let profile = CsvProfile::load(&path).unwrap();

        assert_eq!(profile.id(), "sales");
        assert_eq!(profile.dataset().height(), 3);
        assert_eq!(profile.schema().column_type("value"), Some(ColumnType::Numeric));
        assert!(profile.censoring_mappings().rule_for("customer_id").is_some());
        assert_eq!(profile.hints(), Some("value is in euros"));
        assert_eq!(profile.sample_data(2).len(), 2);
        assert!(validate_profile(&profile).is_ok());
    }

    #[test]
    fn registry_creates_by_id_and_rejects_unknown() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), PROFILE);
        let registry = ProfileRegistry::from_dir(dir.path()).unwrap();

        assert_eq!(registry.ids(), vec!["sales"]);
        assert_eq!(registry.create("sales").unwrap().id(), "sales");
        assert!(matches!(registry.create("hr"), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn sensitive_column_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(
            dir.path(),
            r#"{
                "id": "sales",
                "csv_path": "sales.csv",
                "sensitive_columns": {"address": "address"},
                "provider": {"provider": "openai", "model": "gpt-4o"}
            }"#,
        );
        let mut registry = ProfileRegistry::new();
        registry.register_file(&path).unwrap();
        let err = registry.create("sales").err().unwrap();
        assert!(err.to_string().contains("address"));
    }

    #[test]
    fn duplicate_ids_and_bad_presets_are_configuration_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), PROFILE);
        let mut registry = ProfileRegistry::new();
        registry.register_file(&path).unwrap();
        assert!(registry.register_file(&path).is_err());

        let bad = write_fixture(
            dir.path(),
            r#"{
                "id": "sales",
                "csv_path": "sales.csv",
                "sensitive_columns": {"customer_id": "phone"},
                "provider": {"provider": "openai", "model": "gpt-4o"}
            }"#,
        );
        assert!(matches!(CsvProfile::load(&bad), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn unknown_provider_fails_validation() {
        let df = df! { "value" => [1i64, 2] }.unwrap();
        let profile = CsvProfile::from_parts(
            "tiny",
            Dataset::with_inferred_schema(df).unwrap(),
            ProviderConfig::new("cohere", "command"),
            CensoringMapping::new(),
        );
        assert!(matches!(validate_profile(&profile), Err(EngineError::Configuration(_))));
    }
}
