//! Natural-language questions over a tabular dataset, answered by an LLM
//! synthesizing a structured query that is then executed locally.
//!
//! Three synthesis methods compete for each question; a selector ranks them,
//! a fallback handler tries them in order, and every outward payload passes
//! through the censoring layer last.

pub mod censor;
pub mod config;
pub mod context;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod llm;
pub mod logging;
pub mod performance;
pub mod profile;
pub mod query_spec;
pub mod response;
pub mod schema;
pub mod selector;
pub mod synth;
pub mod transform;

pub use censor::{CensoringMapping, CensoringService, MaskRule};
pub use config::EngineConfig;
pub use context::QuestionContext;
pub use dataset::{Dataset, Row};
pub use engine::{EngineStats, SynthesisEngine};
pub use error::{AttemptFailure, EngineError, ErrorKind, Result};
pub use executor::{ExecutionResult, QueryExecutor};
pub use llm::{LlmProvider, ProviderConfig, ScriptedProvider};
pub use profile::{CsvProfile, Profile, ProfileRegistry};
pub use query_spec::QuerySpec;
pub use response::Response;
pub use schema::{ColumnDef, ColumnType, DatasetSchema};
pub use selector::SynthesisMethod;
pub use synth::Confidence;
pub use transform::ExecutableTransform;
