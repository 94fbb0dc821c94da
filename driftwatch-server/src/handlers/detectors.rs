use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use driftwatch_core::detect::{DetectorHealth, DetectorKind, DetectorParams};
use driftwatch_core::store::{
    DetectorSnapshot, DetectorStatus, DetectorUpdate, NewDetector, TrainReport,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{ApiError, ApiResult};
use crate::infra::app_state::AppState;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

/// Deserialize a request body, mapping serde failures (including unknown
/// parameter keys) onto the API's 400 shape.
fn parse_body<T: serde::de::DeserializeOwned>(body: serde_json::Value) -> ApiResult<T> {
    serde_json::from_value(body).map_err(|e| ApiError::bad_request(e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DetectorListResponse {
    pub detectors: Vec<DetectorSnapshot>,
    pub total: usize,
    pub page: usize,
    #[serde(rename = "totalPages")]
    pub total_pages: usize,
}

/// GET /api/detectors
pub async fn list_detectors(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<DetectorListResponse>> {
    let kind = params
        .kind
        .as_deref()
        .map(str::parse::<DetectorKind>)
        .transpose()
        .map_err(ApiError::from)?;
    let status = params
        .status
        .as_deref()
        .map(str::parse::<DetectorStatus>)
        .transpose()
        .map_err(ApiError::from)?;

    let page = params.page.unwrap_or(1).max(1);
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let all = state.store.list(kind, status).await;
    let total = all.len();
    let total_pages = total.div_ceil(limit).max(1);
    let detectors = all
        .into_iter()
        .skip((page - 1) * limit)
        .take(limit)
        .collect();

    Ok(Json(DetectorListResponse {
        detectors,
        total,
        page,
        total_pages,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateDetectorRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DetectorKind,
    #[serde(default)]
    pub config: DetectorConfigBody,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DetectorConfigBody {
    #[serde(default)]
    pub data_type: Option<String>,
    pub threshold: Option<f64>,
    #[serde(default)]
    pub parameters: DetectorParams,
}

/// POST /api/detectors
pub async fn create_detector(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<(StatusCode, Json<DetectorSnapshot>)> {
    let request: CreateDetectorRequest = parse_body(body)?;
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("detector name must not be empty"));
    }
    let threshold = request
        .config
        .threshold
        .ok_or_else(|| ApiError::bad_request("config.threshold is required"))?;

    let snapshot = state
        .store
        .create(NewDetector {
            id: None,
            name: request.name,
            kind: request.kind,
            data_type: request.config.data_type.unwrap_or_else(|| "metric".to_string()),
            threshold,
            parameters: request.config.parameters,
            description: request.description,
        })
        .await?;

    info!(id = %snapshot.config.id, kind = %snapshot.config.kind, "detector created");
    state.publish_detector_event("detector_created", &snapshot).await;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

#[derive(Debug, Deserialize)]
pub struct GetParams {
    #[serde(default, alias = "includeHealth")]
    include_health: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct DetectorResponse {
    #[serde(flatten)]
    pub snapshot: DetectorSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<DetectorHealth>,
}

/// GET /api/detectors/{id}
pub async fn get_detector(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<GetParams>,
) -> ApiResult<Json<DetectorResponse>> {
    let snapshot = state.store.get(&id).await?;
    let health = if params.include_health.unwrap_or(false) {
        Some(state.store.health(&id).await?)
    } else {
        None
    };
    Ok(Json(DetectorResponse { snapshot, health }))
}

/// PUT /api/detectors/{id}
pub async fn update_detector(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<DetectorSnapshot>> {
    let update: DetectorUpdate = parse_body(body)?;
    let snapshot = state.store.update(&id, update).await?;
    info!(%id, "detector updated");
    state.publish_detector_event("detector_updated", &snapshot).await;
    Ok(Json(snapshot))
}

/// DELETE /api/detectors/{id}
pub async fn delete_detector(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let snapshot = state.store.get(&id).await?;
    state.store.delete(&id).await?;
    info!(%id, "detector deleted");
    state.publish_detector_event("detector_deleted", &snapshot).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct LifecycleResponse {
    pub status: DetectorStatus,
    pub message: String,
}

/// POST /api/detectors/{id}/start
pub async fn start_detector(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<LifecycleResponse>> {
    let status = state.store.start(&id).await?;
    let snapshot = state.store.get(&id).await?;
    info!(%id, "detector started");
    state.publish_detector_event("detector_started", &snapshot).await;
    Ok(Json(LifecycleResponse {
        status,
        message: format!("detector '{id}' is warming up"),
    }))
}

/// POST /api/detectors/{id}/stop
pub async fn stop_detector(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<LifecycleResponse>> {
    let status = state.store.stop(&id).await?;
    let snapshot = state.store.get(&id).await?;
    info!(%id, "detector stopped");
    state.publish_detector_event("detector_stopped", &snapshot).await;
    Ok(Json(LifecycleResponse {
        status,
        message: format!("detector '{id}' stopped"),
    }))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub id: String,
    pub status: DetectorStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<chrono::DateTime<chrono::Utc>>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// GET /api/detectors/{id}/status
pub async fn detector_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let snapshot = state.store.get(&id).await?;
    Ok(Json(StatusResponse {
        id: snapshot.config.id,
        status: snapshot.status,
        last_run_at: snapshot.config.last_run_at,
        updated_at: snapshot.config.updated_at,
    }))
}

/// GET /api/detectors/{id}/health
pub async fn detector_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DetectorHealth>> {
    Ok(Json(state.store.health(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct DetectRequest {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub values: Option<Vec<f64>>,
}

#[derive(Debug, Serialize)]
pub struct DetectionResult {
    pub is_anomaly: bool,
    pub score: f64,
}

/// POST /api/detectors/{id}/detect
pub async fn run_detection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<DetectionResult>> {
    let request: DetectRequest = parse_body(body)?;
    let values = match (request.value, request.values) {
        (Some(value), None) => vec![value],
        (None, Some(values)) => values,
        (Some(_), Some(_)) => {
            return Err(ApiError::bad_request(
                "provide either 'value' or 'values', not both",
            ));
        }
        (None, None) => {
            return Err(ApiError::bad_request("'value' or 'values' is required"));
        }
    };
    if values.is_empty() {
        return Err(ApiError::bad_request("'values' must not be empty"));
    }

    let (is_anomaly, score) = state.store.is_anomaly(&id, &values).await?;
    Ok(Json(DetectionResult { is_anomaly, score }))
}

#[derive(Debug, Deserialize)]
pub struct TrainRequest {
    pub values: Vec<f64>,
}

/// POST /api/detectors/{id}/train
pub async fn train_detector(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<TrainReport>> {
    let request: TrainRequest = parse_body(body)?;
    let report = state.store.train(&id, &request.values).await?;
    info!(%id, samples = report.sample_count, "detector trained");
    Ok(Json(report))
}
