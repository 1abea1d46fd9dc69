pub mod integrity;

pub use integrity::{IntegritySweeper, IntegrityStatus};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Where alerts go (webhook notifier in production, tracing in tests).
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, level: AlertLevel, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// Sink that only logs. The process root swaps in the webhook sink.
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, level: AlertLevel, message: &str) {
        match level {
            AlertLevel::Warning => tracing::warn!(alert = true, "{message}"),
            AlertLevel::Critical => tracing::error!(alert = true, "{message}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: DateTime<Utc>,
    latency_ms: u64,
}

const WINDOW_MINUTES: i64 = 5;
const MAX_SAMPLES: usize = 10_000;
const ALERT_COOLDOWN_SECONDS: i64 = 60;

/// Per-signal end-to-end latency (generation to first accept or enqueue)
/// over a rolling five-minute window, plus the pipeline's error counters.
pub struct LatencyMonitor {
    samples: Mutex<VecDeque<Sample>>,
    p95_alert_threshold_ms: u64,
    last_alert_at: Mutex<Option<DateTime<Utc>>>,
    alert: std::sync::Arc<dyn AlertSink>,

    pub cycles_run: AtomicU64,
    pub signals_emitted: AtomicU64,
    pub cycles_aborted: AtomicU64,
    pub cycle_errors: AtomicU64,
    pub cycles_exhausted_sources: AtomicU64,
}

impl LatencyMonitor {
    pub fn new(p95_alert_threshold_ms: u64, alert: std::sync::Arc<dyn AlertSink>) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            p95_alert_threshold_ms,
            last_alert_at: Mutex::new(None),
            alert,
            cycles_run: AtomicU64::new(0),
            signals_emitted: AtomicU64::new(0),
            cycles_aborted: AtomicU64::new(0),
            cycle_errors: AtomicU64::new(0),
            cycles_exhausted_sources: AtomicU64::new(0),
        }
    }

    /// Record one signal's generation-to-distribution latency and alert if
    /// the rolling p95 breaches the threshold.
    pub async fn record_distribution(
        &self,
        signal_id: &str,
        generated_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) {
        let latency_ms = (completed_at - generated_at).num_milliseconds().max(0) as u64;
        {
            let mut samples = self.samples.lock().expect("latency samples lock poisoned");
            samples.push_back(Sample {
                at: completed_at,
                latency_ms,
            });
            while samples.len() > MAX_SAMPLES {
                samples.pop_front();
            }
        }
        tracing::debug!(signal_id, latency_ms, "distribution latency recorded");

        let summary = self.summary();
        if summary.samples >= 5 && summary.p95_ms > self.p95_alert_threshold_ms {
            let should_alert = {
                let mut last = self.last_alert_at.lock().expect("alert lock poisoned");
                let now = Utc::now();
                let due = last
                    .map(|t| (now - t).num_seconds() >= ALERT_COOLDOWN_SECONDS)
                    .unwrap_or(true);
                if due {
                    *last = Some(now);
                }
                due
            };
            if should_alert {
                self.alert
                    .send(
                        AlertLevel::Warning,
                        &format!(
                            "signal latency p95 {}ms over {}ms target ({} samples / 5m)",
                            summary.p95_ms, self.p95_alert_threshold_ms, summary.samples
                        ),
                    )
                    .await;
            }
        }
    }

    /// Percentiles over the five-minute window.
    pub fn summary(&self) -> LatencySummary {
        let cutoff = Utc::now() - Duration::minutes(WINDOW_MINUTES);
        let mut window: Vec<u64> = {
            let mut samples = self.samples.lock().expect("latency samples lock poisoned");
            while samples.front().map(|s| s.at < cutoff).unwrap_or(false) {
                samples.pop_front();
            }
            samples.iter().map(|s| s.latency_ms).collect()
        };
        window.sort_unstable();

        LatencySummary {
            samples: window.len(),
            p50_ms: percentile(&window, 0.50),
            p95_ms: percentile(&window, 0.95),
            p99_ms: percentile(&window, 0.99),
        }
    }

    /// Counter view for the status endpoint and periodic summaries.
    pub fn counters(&self) -> serde_json::Value {
        serde_json::json!({
            "cycles_run": self.cycles_run.load(Ordering::Relaxed),
            "signals_emitted": self.signals_emitted.load(Ordering::Relaxed),
            "cycles_aborted": self.cycles_aborted.load(Ordering::Relaxed),
            "cycle_errors": self.cycle_errors.load(Ordering::Relaxed),
            "cycles_exhausted_sources": self.cycles_exhausted_sources.load(Ordering::Relaxed),
        })
    }

    pub fn log_summary(&self) {
        let latency = self.summary();
        tracing::info!(
            cycles = self.cycles_run.load(Ordering::Relaxed),
            signals = self.signals_emitted.load(Ordering::Relaxed),
            aborted = self.cycles_aborted.load(Ordering::Relaxed),
            errors = self.cycle_errors.load(Ordering::Relaxed),
            p50_ms = latency.p50_ms,
            p95_ms = latency.p95_ms,
            p99_ms = latency.p99_ms,
            "pipeline metrics summary"
        );
    }
}

fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}
