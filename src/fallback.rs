//! Sequential fallback over the ranked synthesis methods.

use crate::error::{AttemptFailure, EngineError, ErrorKind, Result};
use crate::performance::PerformanceTracker;
use crate::selector::SynthesisMethod;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FallbackState {
    Trying { index: usize },
    Succeeded { method: SynthesisMethod },
    Exhausted,
}

#[derive(Debug)]
pub struct FallbackOutcome<T> {
    pub value: T,
    pub method: SynthesisMethod,
    /// Failures that preceded the successful attempt, in order
    pub failures: Vec<AttemptFailure>,
    pub attempts: usize,
    pub latency: Duration,
}

pub struct FallbackHandler {
    max_attempts: usize,
    performance: Arc<PerformanceTracker>,
    provider_name: String,
}

impl FallbackHandler {
    pub fn new(max_attempts: usize, performance: Arc<PerformanceTracker>, provider_name: impl Into<String>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            performance,
            provider_name: provider_name.into(),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Truncate the ranking to the attempt budget, keeping traditional reachable
    /// as the last fallback.
    pub fn plan(&self, ranked: &[SynthesisMethod]) -> Vec<SynthesisMethod> {
        let mut plan: Vec<SynthesisMethod> = Vec::with_capacity(self.max_attempts);
        for method in ranked {
            if plan.len() == self.max_attempts {
                break;
            }
            if !plan.contains(method) {
                plan.push(*method);
            }
        }
        if !plan.contains(&SynthesisMethod::Traditional) {
            if plan.len() < self.max_attempts {
                plan.push(SynthesisMethod::Traditional);
            } else if let Some(last) = plan.last_mut() {
                *last = SynthesisMethod::Traditional;
            }
        }
        plan
    }

    /// Try each planned method until one succeeds.
    ///
    /// Recoverable errors are recorded and the next method is tried; anything
    /// else (configuration problems) is returned as-is.
    pub async fn run<T, F, Fut>(&self, ranked: &[SynthesisMethod], mut attempt: F) -> Result<FallbackOutcome<T>>
    where
        F: FnMut(SynthesisMethod) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let plan = self.plan(ranked);
        let started = Instant::now();
        let mut failures = Vec::new();
        let mut state = FallbackState::Trying { index: 0 };

        for (index, method) in plan.iter().copied().enumerate() {
            info!("Attempt {}/{} with {} ({:?})", index + 1, plan.len(), method, state);

            let attempt_started = Instant::now();
            match attempt(method).await {
                Ok(value) => {
                    let latency = attempt_started.elapsed();
                    self.performance.record_success(method, latency);
                    state = FallbackState::Succeeded { method };
                    info!("{} succeeded in {:?} ({:?})", method, latency, state);
                    return Ok(FallbackOutcome {
                        value,
                        method,
                        failures,
                        attempts: index + 1,
                        latency: started.elapsed(),
                    });
                }
                Err(err) if err.is_recoverable() => {
                    self.performance.record_failure(method, attempt_started.elapsed());
                    if err.kind() == ErrorKind::Provider {
                        self.performance.record_provider_failure(&self.provider_name);
                    }
                    warn!("{} failed: {}", method, err);
                    failures.push(AttemptFailure {
                        method,
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                    state = FallbackState::Trying { index: index + 1 };
                }
                Err(err) => {
                    warn!("{} aborted the fallback chain: {}", method, err);
                    return Err(err);
                }
            }
        }

        state = FallbackState::Exhausted;
        warn!("All {} planned methods failed ({:?})", plan.len(), state);
        Err(EngineError::Exhausted(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SynthesisMethod::*;

    fn handler(max_attempts: usize) -> (FallbackHandler, Arc<PerformanceTracker>) {
        let perf = Arc::new(PerformanceTracker::new());
        (FallbackHandler::new(max_attempts, perf.clone(), "scripted"), perf)
    }

    #[test]
    fn truncation_keeps_traditional_last() {
        let (pair, _) = handler(2);
        assert_eq!(pair.plan(&[LangChainAgent, LangChainDirect, Traditional]), vec![LangChainAgent, Traditional]);
        assert_eq!(pair.plan(&[Traditional, LangChainDirect, LangChainAgent]), vec![Traditional, LangChainDirect]);

        let (single, _) = handler(1);
        assert_eq!(single.plan(&[LangChainAgent, LangChainDirect, Traditional]), vec![Traditional]);
    }

    #[tokio::test]
    async fn later_method_succeeds_after_failures() {
        let (handler, perf) = handler(3);
        let outcome = handler
            .run(&[LangChainAgent, LangChainDirect, Traditional], |method| async move {
                match method {
                    LangChainAgent => Err(EngineError::Provider("timeout".into())),
                    LangChainDirect => Err(EngineError::Execution("bad transform".into())),
                    Traditional => Ok(42),
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.method, Traditional);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.failures[0].kind, ErrorKind::Provider);
        assert_eq!(perf.snapshot(Traditional).successes, 1);
        assert_eq!(perf.snapshot(LangChainAgent).failures, 1);
        assert_eq!(perf.snapshot(LangChainDirect).failures, 1);
        assert_eq!(perf.provider_failures().get("scripted"), Some(&1));
    }

    #[tokio::test]
    async fn all_failures_exhaust_with_every_cause() {
        let (handler, _) = handler(3);
        let err = handler
            .run(&[Traditional, LangChainDirect, LangChainAgent], |method| async move {
                Err::<(), _>(EngineError::Synthesis(format!("{} gave nothing", method)))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Exhausted);
        let methods: Vec<_> = err.attempts().iter().map(|a| a.method).collect();
        assert_eq!(methods, vec![Traditional, LangChainDirect, LangChainAgent]);
    }

    #[tokio::test]
    async fn configuration_errors_abort_immediately() {
        let (handler, perf) = handler(3);
        let mut calls = 0;
        let err = handler
            .run(&[Traditional, LangChainDirect, LangChainAgent], |_| {
                calls += 1;
                async { Err::<(), _>(EngineError::Configuration("no key".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(calls, 1);
        assert_eq!(perf.snapshot(Traditional).attempts(), 0);
    }
}
