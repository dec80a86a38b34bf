//! Method selection
//!
//! Classifies the question's complexity from surface signals, then ranks the
//! three synthesis methods by suitability for that complexity, breaking ties
//! with historical performance and finally a fixed canonical order. The result
//! is always a permutation of all three methods.

use crate::error::EngineError;
use crate::performance::{MethodPerformance, PerformanceTracker};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SynthesisMethod {
    #[serde(rename = "traditional")]
    Traditional,
    #[serde(rename = "langchain_direct")]
    LangChainDirect,
    #[serde(rename = "langchain_agent")]
    LangChainAgent,
}

impl SynthesisMethod {
    /// Canonical order, used as the last tie-breaker.
    pub const ALL: [SynthesisMethod; 3] = [
        SynthesisMethod::Traditional,
        SynthesisMethod::LangChainDirect,
        SynthesisMethod::LangChainAgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisMethod::Traditional => "traditional",
            SynthesisMethod::LangChainDirect => "langchain_direct",
            SynthesisMethod::LangChainAgent => "langchain_agent",
        }
    }

    fn canonical_index(&self) -> usize {
        match self {
            SynthesisMethod::Traditional => 0,
            SynthesisMethod::LangChainDirect => 1,
            SynthesisMethod::LangChainAgent => 2,
        }
    }
}

impl fmt::Display for SynthesisMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SynthesisMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "traditional" => Ok(SynthesisMethod::Traditional),
            "langchain_direct" | "direct" => Ok(SynthesisMethod::LangChainDirect),
            "langchain_agent" | "agent" => Ok(SynthesisMethod::LangChainAgent),
            other => Err(EngineError::Configuration(format!("Unknown synthesis method '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    /// Suitability of `method` for this complexity; higher is better.
    pub fn suitability(&self, method: SynthesisMethod) -> u8 {
        use SynthesisMethod::*;
        match (self, method) {
            (Complexity::Simple, Traditional) => 3,
            (Complexity::Simple, LangChainDirect) => 1,
            (Complexity::Simple, LangChainAgent) => 1,
            (Complexity::Moderate, Traditional) => 3,
            (Complexity::Moderate, LangChainDirect) => 2,
            (Complexity::Moderate, LangChainAgent) => 1,
            (Complexity::Complex, Traditional) => 0,
            (Complexity::Complex, LangChainDirect) => 2,
            (Complexity::Complex, LangChainAgent) => 3,
        }
    }
}

/// Terms and weights the classifier looks for. Multi-word terms are allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexitySignals {
    pub aggregation_terms: Vec<String>,
    pub conjunction_terms: Vec<String>,
    pub comparison_terms: Vec<String>,
    pub multi_step_terms: Vec<String>,
    pub grouping_terms: Vec<String>,
    pub long_question_words: usize,
    /// Score at or below which a question is simple
    pub simple_max: u32,
    /// Score at or below which a question is moderate
    pub moderate_max: u32,
}

fn terms(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for ComplexitySignals {
    fn default() -> Self {
        Self {
            aggregation_terms: terms(&[
                "average", "avg", "mean", "sum", "total", "count", "how many", "number of",
                "maximum", "max", "minimum", "min", "highest", "lowest", "median",
            ]),
            conjunction_terms: terms(&["and", "or", "but", "also", "then", "as well as", "while"]),
            comparison_terms: terms(&[
                "greater than", "more than", "less than", "fewer than", "above", "below",
                "between", "at least", "at most", "exceeds", "exceeding",
            ]),
            multi_step_terms: terms(&[
                "why", "trend", "trends", "compare", "comparison", "versus", "vs", "correlation",
                "correlate", "ratio", "percentage", "growth", "change over", "relationship",
                "distribution", "explain", "breakdown",
            ]),
            grouping_terms: terms(&["by", "per", "for each", "each"]),
            long_question_words: 25,
            simple_max: 1,
            moderate_max: 3,
        }
    }
}

lazy_static! {
    static ref WORD: Regex = Regex::new(r"[a-z0-9_]+").unwrap();
    static ref COMPARISON_SYMBOL: Regex = Regex::new(r"[<>!=]=?").unwrap();
}

#[derive(Debug, Clone, Default)]
pub struct ComplexityClassifier {
    signals: ComplexitySignals,
}

impl ComplexityClassifier {
    pub fn new(signals: ComplexitySignals) -> Self {
        Self { signals }
    }

    pub fn signals(&self) -> &ComplexitySignals {
        &self.signals
    }

    pub fn score(&self, question: &str) -> u32 {
        let lower = question.to_lowercase();
        let words: Vec<&str> = WORD.find_iter(&lower).map(|m| m.as_str()).collect();
        // padded so every term can be matched on word boundaries
        let normalized = format!(" {} ", words.join(" "));
        let hits = |list: &[String]| -> u32 {
            list.iter()
                .map(|term| normalized.matches(&format!(" {} ", term)).count() as u32)
                .sum()
        };

        let s = &self.signals;
        let mut score = 0;
        score += hits(&s.aggregation_terms).min(2);
        score += hits(&s.conjunction_terms).min(3);
        let comparisons = hits(&s.comparison_terms) + COMPARISON_SYMBOL.find_iter(question).count() as u32;
        score += comparisons.min(2);
        score += (hits(&s.multi_step_terms) * 2).min(4);
        if hits(&s.grouping_terms) > 0 {
            score += 1;
        }
        if words.len() > s.long_question_words {
            score += 1;
        }
        score
    }

    pub fn classify(&self, question: &str) -> (Complexity, u32) {
        let score = self.score(question);
        let complexity = if score <= self.signals.simple_max {
            Complexity::Simple
        } else if score <= self.signals.moderate_max {
            Complexity::Moderate
        } else {
            Complexity::Complex
        };
        (complexity, score)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodRanking {
    pub complexity: Complexity,
    pub score: u32,
    pub order: Vec<SynthesisMethod>,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MethodSelector {
    classifier: ComplexityClassifier,
}

impl MethodSelector {
    pub fn new(classifier: ComplexityClassifier) -> Self {
        Self { classifier }
    }

    pub fn rank(&self, question: &str, performance: &PerformanceTracker) -> MethodRanking {
        let (complexity, score) = self.classifier.classify(question);
        let history: Vec<(SynthesisMethod, MethodPerformance)> = SynthesisMethod::ALL
            .iter()
            .map(|m| (*m, performance.snapshot(*m)))
            .collect();

        let mut order = history.clone();
        order.sort_by(|(a, pa), (b, pb)| {
            complexity
                .suitability(*b)
                .cmp(&complexity.suitability(*a))
                .then_with(|| {
                    pb.success_rate()
                        .partial_cmp(&pa.success_rate())
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| {
                    let la = pa.mean_latency_ms().unwrap_or(f64::INFINITY);
                    let lb = pb.mean_latency_ms().unwrap_or(f64::INFINITY);
                    la.partial_cmp(&lb).unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.canonical_index().cmp(&b.canonical_index()))
        });

        let reasons = order
            .iter()
            .map(|(method, perf)| {
                format!(
                    "{}: suitability {} for {:?} question, success rate {:.2}",
                    method,
                    complexity.suitability(*method),
                    complexity,
                    perf.success_rate()
                )
            })
            .collect();

        MethodRanking {
            complexity,
            score,
            order: order.into_iter().map(|(m, _)| m).collect(),
            reasons,
        }
    }
}
