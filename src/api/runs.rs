/// Run management REST API endpoints
///
/// Start runs manually, inspect live and archived runs, and cancel in-flight
/// runs. Live state comes from the metadata store; terminal runs fall back
/// to the SQLite archive, so a run stays inspectable after its live state is
/// dropped.

use crate::api::workflows::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Request body for manual run invocation
#[derive(Debug, Default, Deserialize)]
pub struct StartRunRequest {
    /// Parameters overlaid onto the workflow's declared defaults
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

/// Create run management routes
pub fn create_run_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows/{id}/runs", post(start_run))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
}

/// Manually start a run of a registered workflow
///
/// POST /api/workflows/{id}/runs
async fn start_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let Some(definition) = state.registry.get_workflow(&id) else {
        return Err(StatusCode::NOT_FOUND);
    };

    match state
        .scheduler
        .start_run(definition, request.parameters)
        .await
    {
        Ok(run_id) => Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": run_id })))),
        Err(e) => {
            tracing::error!("❌ Failed to start run for workflow {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// List live runs plus recently archived ones
///
/// GET /api/runs
async fn list_runs(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let live = state.store.list_runs().await;
    let archived = match state.storage.list_archived_runs(50).await {
        Ok(runs) => runs,
        Err(e) => {
            tracing::error!("❌ Failed to list archived runs: {}", e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    Ok(Json(json!({ "live": live, "archived": archived })))
}

/// Get one run, live or archived
///
/// GET /api/runs/{id}
async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, StatusCode> {
    if let Some(run) = state.store.snapshot(id).await {
        return Ok(Json(json!(run)));
    }
    match state.storage.get_archived_run(id).await {
        Ok(Some(run)) => Ok(Json(json!(run))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("❌ Failed to read archived run {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Cancel a live run
///
/// POST /api/runs/{id}/cancel
async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    if state.scheduler.cancel_run(id).await {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
