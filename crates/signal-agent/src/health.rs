use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;

use account_monitor::SnapshotStore;
use latency_monitor::{IntegritySweeper, LatencyMonitor};
use signal_generator::SignalGenerator;
use signal_queue::SignalQueue;
use source_registry::SourceRegistry;

/// Everything the health endpoints report on.
pub struct AppState {
    pub generator: Arc<SignalGenerator>,
    pub registry: Arc<SourceRegistry>,
    pub queue: Arc<SignalQueue>,
    pub store: Arc<SnapshotStore>,
    pub monitor: Arc<LatencyMonitor>,
    pub sweeper: Arc<IntegritySweeper>,
    pub executor_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

/// Liveness plus the two conditions that make the process unhealthy: a
/// latched integrity failure or a degraded executor.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let integrity = state.sweeper.status();
    let degraded: Vec<&String> = state
        .executor_ids
        .iter()
        .filter(|id| state.store.is_degraded(id))
        .collect();

    let healthy = integrity.healthy && degraded.is_empty();
    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "integrity_healthy": integrity.healthy,
        "degraded_executors": degraded,
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
    });
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// Full operational view: scheduler, source health, breaker states, queue
/// depths, latency percentiles, integrity checkpoint.
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut queues = serde_json::Map::new();
    for executor_id in &state.executor_ids {
        let depths = state
            .queue
            .depth_for(executor_id)
            .await
            .unwrap_or_default();
        let by_status: serde_json::Map<String, serde_json::Value> =
            depths.into_iter().map(|(status, n)| (status, json!(n))).collect();
        queues.insert(executor_id.clone(), serde_json::Value::Object(by_status));
    }

    Json(json!({
        "generator": state.generator.status().await,
        "sources": state.registry.health_snapshots(),
        "queues": queues,
        "latency": state.monitor.summary(),
        "integrity": state.sweeper.status(),
    }))
}
