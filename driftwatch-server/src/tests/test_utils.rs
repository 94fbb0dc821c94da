use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header::CONTENT_TYPE};
use driftwatch_config::Config;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

use crate::infra::app_state::AppState;
use crate::infra::startup::build_state;
use crate::routes::create_router;

/// Build a full application state backed by a temp directory. The temp dir
/// must outlive the state.
pub async fn test_state() -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.store.path = dir.path().join("detectors.json");
    config.actions.scripts_root = dir.path().to_path_buf();
    let state = build_state(Arc::new(config), CancellationToken::new())
        .await
        .unwrap();
    (state, dir)
}

pub async fn test_router() -> (Router, AppState, tempfile::TempDir) {
    let (state, dir) = test_state().await;
    (create_router(state.clone()), state, dir)
}

/// Fire one request and decode the response body (JSON where possible,
/// plain text otherwise).
pub async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}
