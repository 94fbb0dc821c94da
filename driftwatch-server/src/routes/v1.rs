use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::{
    detectors::{
        create_detector, delete_detector, detector_health, detector_status, get_detector,
        list_detectors, run_detection, start_detector, stop_detector, train_detector,
        update_detector,
    },
    handle_gateway::gateway_handler,
    health::{health, metrics},
    orchestrator::{execute_action, execute_plan, get_action, list_actions},
};
use crate::infra::app_state::AppState;

/// Route paths, kept in one place so handlers and tests agree.
pub mod paths {
    pub const HEALTH: &str = "/health";
    pub const METRICS: &str = "/metrics";
    pub const DETECTORS: &str = "/api/detectors";
    pub const DETECTOR: &str = "/api/detectors/{id}";
    pub const DETECTOR_START: &str = "/api/detectors/{id}/start";
    pub const DETECTOR_STOP: &str = "/api/detectors/{id}/stop";
    pub const DETECTOR_STATUS: &str = "/api/detectors/{id}/status";
    pub const DETECTOR_HEALTH: &str = "/api/detectors/{id}/health";
    pub const DETECTOR_DETECT: &str = "/api/detectors/{id}/detect";
    pub const DETECTOR_TRAIN: &str = "/api/detectors/{id}/train";
    pub const ORCHESTRATOR: &str = "/api/orchestrator";
    pub const ORCHESTRATOR_ACTION: &str = "/api/orchestrator/action";
    pub const ORCHESTRATOR_ACTION_BY_TARGET: &str = "/api/orchestrator/action/{target}";
    pub const WS: &str = "/api/ws";
}

/// Assemble the full API surface.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(paths::HEALTH, get(health))
        .route(paths::METRICS, get(metrics))
        .route(paths::DETECTORS, get(list_detectors).post(create_detector))
        .route(
            paths::DETECTOR,
            get(get_detector)
                .put(update_detector)
                .delete(delete_detector),
        )
        .route(paths::DETECTOR_START, post(start_detector))
        .route(paths::DETECTOR_STOP, post(stop_detector))
        .route(paths::DETECTOR_STATUS, get(detector_status))
        .route(paths::DETECTOR_HEALTH, get(detector_health))
        .route(paths::DETECTOR_DETECT, post(run_detection))
        .route(paths::DETECTOR_TRAIN, post(train_detector))
        .route(
            paths::ORCHESTRATOR,
            get(list_actions).post(execute_plan),
        )
        .route(paths::ORCHESTRATOR_ACTION, post(execute_action))
        .route(paths::ORCHESTRATOR_ACTION_BY_TARGET, get(get_action))
        .route(paths::WS, get(gateway_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
