//! Per-method success/failure counters.
//!
//! Process-lifetime only. Counters are monotonic; readers take a snapshot.

use crate::selector::SynthesisMethod;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct MethodCounters {
    successes: AtomicU64,
    failures: AtomicU64,
    total_latency_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MethodPerformance {
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
}

impl MethodPerformance {
    pub fn attempts(&self) -> u64 {
        self.successes + self.failures
    }

    /// Laplace-smoothed: an unused method sits at 0.5.
    pub fn success_rate(&self) -> f64 {
        (self.successes as f64 + 1.0) / (self.attempts() as f64 + 2.0)
    }

    /// Mean latency over all attempts, `None` before the first one.
    pub fn mean_latency_ms(&self) -> Option<f64> {
        match self.attempts() {
            0 => None,
            n => Some(self.total_latency_ms as f64 / n as f64),
        }
    }
}

#[derive(Debug, Default)]
pub struct PerformanceTracker {
    traditional: MethodCounters,
    langchain_direct: MethodCounters,
    langchain_agent: MethodCounters,
    provider_failures: DashMap<String, AtomicU64>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, method: SynthesisMethod) -> &MethodCounters {
        match method {
            SynthesisMethod::Traditional => &self.traditional,
            SynthesisMethod::LangChainDirect => &self.langchain_direct,
            SynthesisMethod::LangChainAgent => &self.langchain_agent,
        }
    }

    pub fn record_success(&self, method: SynthesisMethod, latency: Duration) {
        let counters = self.counters(method);
        counters.successes.fetch_add(1, Ordering::Relaxed);
        counters
            .total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, method: SynthesisMethod, latency: Duration) {
        let counters = self.counters(method);
        counters.failures.fetch_add(1, Ordering::Relaxed);
        counters
            .total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_provider_failure(&self, provider: &str) {
        self.provider_failures
            .entry(provider.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, method: SynthesisMethod) -> MethodPerformance {
        let counters = self.counters(method);
        MethodPerformance {
            successes: counters.successes.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            total_latency_ms: counters.total_latency_ms.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot_all(&self) -> BTreeMap<SynthesisMethod, MethodPerformance> {
        SynthesisMethod::ALL
            .iter()
            .map(|m| (*m, self.snapshot(*m)))
            .collect()
    }

    pub fn provider_failures(&self) -> BTreeMap<String, u64> {
        self.provider_failures
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_recording_loses_no_counts() {
        let tracker = std::sync::Arc::new(PerformanceTracker::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        tracker.record_success(SynthesisMethod::Traditional, Duration::from_millis(2));
                        tracker.record_failure(SynthesisMethod::LangChainAgent, Duration::from_millis(1));
                        tracker.record_provider_failure("openai");
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let traditional = tracker.snapshot(SynthesisMethod::Traditional);
        assert_eq!(traditional.successes, 2000);
        assert_eq!(traditional.total_latency_ms, 4000);
        assert_eq!(tracker.snapshot(SynthesisMethod::LangChainAgent).failures, 2000);
        assert_eq!(tracker.provider_failures().get("openai"), Some(&2000));
    }

    #[test]
    fn unused_method_has_neutral_rate() {
        let tracker = PerformanceTracker::new();
        let perf = tracker.snapshot(SynthesisMethod::LangChainAgent);
        assert_eq!(perf.success_rate(), 0.5);
        assert_eq!(perf.mean_latency_ms(), None);
    }

    #[test]
    fn counters_accumulate() {
        let tracker = PerformanceTracker::new();
        tracker.record_success(SynthesisMethod::Traditional, Duration::from_millis(30));
        tracker.record_failure(SynthesisMethod::Traditional, Duration::from_millis(10));
        tracker.record_success(SynthesisMethod::Traditional, Duration::from_millis(20));
        tracker.record_provider_failure("openai");
        tracker.record_provider_failure("openai");

        let perf = tracker.snapshot(SynthesisMethod::Traditional);
        assert_eq!(perf.successes, 2);
        assert_eq!(perf.failures, 1);
        assert_eq!(perf.mean_latency_ms(), Some(20.0));
        assert!((perf.success_rate() - 0.6).abs() < 1e-9);
        assert_eq!(tracker.provider_failures().get("openai"), Some(&2));
        assert_eq!(tracker.snapshot(SynthesisMethod::LangChainDirect).attempts(), 0);
    }
}
