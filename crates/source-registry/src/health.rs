use std::sync::Mutex;

use serde::Serialize;

use crate::circuit_breaker::BreakerState;

/// Rolling per-source health counters, shown on the health endpoint.
#[derive(Debug, Default)]
pub struct SourceHealth {
    inner: Mutex<HealthInner>,
}

#[derive(Debug, Default)]
struct HealthInner {
    requests: u64,
    successes: u64,
    consecutive_failures: u64,
    last_error: Option<String>,
}

/// Serializable point-in-time view.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealthSnapshot {
    pub source_id: String,
    pub requests: u64,
    pub successes: u64,
    pub consecutive_failures: u64,
    pub success_rate: f64,
    pub last_error: Option<String>,
    pub breaker: BreakerState,
}

impl SourceHealth {
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("health lock poisoned");
        inner.requests += 1;
        inner.successes += 1;
        inner.consecutive_failures = 0;
    }

    pub fn record_failure(&self, error: &str) {
        let mut inner = self.inner.lock().expect("health lock poisoned");
        inner.requests += 1;
        inner.consecutive_failures += 1;
        inner.last_error = Some(error.to_string());
    }

    pub fn snapshot(&self, source_id: &str, breaker: BreakerState) -> SourceHealthSnapshot {
        let inner = self.inner.lock().expect("health lock poisoned");
        let success_rate = if inner.requests == 0 {
            1.0
        } else {
            inner.successes as f64 / inner.requests as f64
        };
        SourceHealthSnapshot {
            source_id: source_id.to_string(),
            requests: inner.requests,
            successes: inner.successes,
            consecutive_failures: inner.consecutive_failures,
            success_rate,
            last_error: inner.last_error.clone(),
            breaker,
        }
    }
}
