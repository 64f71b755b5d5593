/// Container-facing metadata HTTP API
///
/// The only protocol step containers speak to the platform. Every request
/// carries the per-step bearer token injected at launch; the token scopes the
/// caller to its own step identity within its own run. Missing outputs and
/// secrets are 404 responses, not failures, so a container can check for
/// optional values without aborting its step.

use crate::metadata::store::{MetadataStore, StepIdentity};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared state for the metadata API routes
#[derive(Clone)]
pub struct MetadataApiState {
    pub store: Arc<MetadataStore>,
}

/// Request body for log appends
#[derive(Debug, Deserialize)]
pub struct LogRequest {
    #[serde(default = "default_level")]
    pub level: String,
    pub message: String,
}

fn default_level() -> String {
    "info".to_string()
}

/// Create the metadata API routes consumed by step containers
pub fn create_metadata_routes() -> Router<MetadataApiState> {
    Router::new()
        .route("/v1/spec", get(get_spec))
        .route("/v1/output/{step}/{key}", get(get_output))
        .route("/v1/secret/{name}", get(get_secret))
        .route("/v1/output/{key}", post(set_output))
        .route("/v1/log", post(append_log))
}

/// Resolve the caller's bearer token to its step identity
async fn authenticate(
    store: &MetadataStore,
    headers: &HeaderMap,
) -> Result<StepIdentity, StatusCode> {
    let token = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    store
        .resolve_token(token)
        .await
        .ok_or(StatusCode::UNAUTHORIZED)
}

/// GET /v1/spec - the caller's own resolved spec
async fn get_spec(
    State(state): State<MetadataApiState>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    let identity = authenticate(&state.store, &headers).await?;
    match state.store.get_spec(&identity).await {
        Ok(spec) => Ok(Json(json!(spec))),
        Err(e) => {
            tracing::error!("❌ Spec read failed for step '{}': {}", identity.step, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /v1/output/{step}/{key} - an output committed by any step in the run
async fn get_output(
    State(state): State<MetadataApiState>,
    headers: HeaderMap,
    Path((step, key)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let identity = authenticate(&state.store, &headers).await?;
    match state.store.get_output(&identity, &step, &key).await {
        Ok(Some(value)) => Ok(Json(value)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("❌ Output read failed for step '{}': {}", identity.step, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /v1/secret/{name} - a run-scoped secret, audited
async fn get_secret(
    State(state): State<MetadataApiState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let identity = authenticate(&state.store, &headers).await?;
    match state.store.get_secret(&identity, &name).await {
        Ok(Some(value)) => Ok(Json(Value::String(value))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("❌ Secret read failed for step '{}': {}", identity.step, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /v1/output/{key} - write an output under the caller's own identity
async fn set_output(
    State(state): State<MetadataApiState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(value): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let identity = authenticate(&state.store, &headers).await?;
    match state.store.set_output(&identity, &key, value).await {
        Ok(write) => Ok(Json(json!({ "result": format!("{:?}", write) }))),
        Err(e) => {
            tracing::error!("❌ Output write failed for step '{}': {}", identity.step, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /v1/log - append a log line, secret-scrubbed server side
async fn append_log(
    State(state): State<MetadataApiState>,
    headers: HeaderMap,
    Json(request): Json<LogRequest>,
) -> Result<StatusCode, StatusCode> {
    let identity = authenticate(&state.store, &headers).await?;
    match state
        .store
        .append_log(&identity, &request.level, &request.message)
        .await
    {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(e) => {
            tracing::error!("❌ Log append failed for step '{}': {}", identity.step, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
