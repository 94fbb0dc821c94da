use axum::{Json, extract::State};
use driftwatch_core::actions::ActionStatus;
use serde::Serialize;

use crate::errors::{ApiError, ApiResult};
use crate::infra::app_state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Seconds since the server came up.
    pub uptime: i64,
    pub backends: BackendHealth,
}

#[derive(Debug, Serialize)]
pub struct BackendHealth {
    pub metrics: bool,
    pub logs: bool,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (metrics, logs) = tokio::join!(
        state.metrics_client.healthy(),
        state.logs_client.healthy()
    );
    Json(HealthResponse {
        status: "ok",
        uptime: state.uptime_secs(),
        backends: BackendHealth { metrics, logs },
    })
}

/// GET /metrics, Prometheus exposition sampled from live state.
pub async fn metrics(State(state): State<AppState>) -> ApiResult<String> {
    let snapshots = state.store.list(None, None).await;
    let metrics = &state.metrics;

    metrics.detectors.set(snapshots.len() as i64);
    metrics.detections_total.set(
        snapshots
            .iter()
            .map(|s| s.metrics.total_detections as i64)
            .sum(),
    );
    metrics.anomalies_total.set(
        snapshots
            .iter()
            .map(|s| s.metrics.anomalies_found as i64)
            .sum(),
    );
    metrics
        .events_dropped_total
        .set(state.events.dropped_count() as i64);
    metrics
        .ws_connections
        .set(state.gateway.connection_count() as i64);

    let actions = state.orchestrator.list_actions().await;
    metrics.actions_total.set(actions.len() as i64);
    metrics.actions_failed_total.set(
        actions
            .iter()
            .filter(|a| a.status == ActionStatus::Failed)
            .count() as i64,
    );

    metrics
        .render()
        .map_err(|e| ApiError::internal(e.to_string()))
}
