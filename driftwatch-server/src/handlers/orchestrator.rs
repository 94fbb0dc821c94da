use axum::{
    Json,
    extract::{Path, State},
};
use driftwatch_core::actions::{Action, ActionRequest, ActionResult};
use serde::Serialize;
use tracing::info;

use crate::errors::{ApiError, ApiResult};
use crate::infra::app_state::AppState;

#[derive(Debug, Serialize)]
pub struct ActionsResponse {
    pub actions: Vec<Action>,
}

/// GET /api/orchestrator
pub async fn list_actions(State(state): State<AppState>) -> Json<ActionsResponse> {
    Json(ActionsResponse {
        actions: state.orchestrator.list_actions().await,
    })
}

#[derive(Debug, Serialize)]
pub struct ActionOutcome {
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
}

/// POST /api/orchestrator/action
pub async fn execute_action(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<ActionOutcome>> {
    let request: ActionRequest = serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let action = request.into_action()?;
    info!(target = %action.target, kind = %action.kind, "action submitted");
    let done = state
        .orchestrator
        .execute_action(&state.shutdown, action)
        .await;
    let result = done.result.clone();
    Ok(Json(ActionOutcome {
        action: done,
        result,
    }))
}

/// POST /api/orchestrator
pub async fn execute_plan(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<ActionsResponse>> {
    let requests: Vec<ActionRequest> = serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let actions = requests
        .into_iter()
        .map(ActionRequest::into_action)
        .collect::<Result<Vec<Action>, _>>()?;
    info!(actions = actions.len(), "plan submitted");
    let done = state
        .orchestrator
        .execute_plan(&state.shutdown, actions)
        .await?;
    Ok(Json(ActionsResponse { actions: done }))
}

/// GET /api/orchestrator/action/{target}
pub async fn get_action(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> ApiResult<Json<Action>> {
    state
        .orchestrator
        .get_action(&target)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no action recorded for target '{target}'")))
}
