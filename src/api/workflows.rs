/// Workflow management REST API endpoints
///
/// CRUD for workflow definitions with hot-reload and trigger lifecycle
/// management. Saving a definition validates its dependency graph, swaps it
/// into the registry, and (re)activates its trigger containers, so changes
/// take effect with zero downtime. Secrets are write-only: names can be
/// listed, values never come back out.

use crate::{
    metadata::store::MetadataStore,
    runtime::{dispatcher::TriggerDispatcher, scheduler::SchedulerService},
    workflow::{
        graph::StepGraph, registry::WorkflowRegistry, storage::WorkflowStorage,
        types::WorkflowDefinition,
    },
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Workflow and run persistence
    pub storage: WorkflowStorage,
    /// Hot-reload registry of active definitions
    pub registry: Arc<WorkflowRegistry>,
    /// Run coordination service
    pub scheduler: Arc<SchedulerService>,
    /// Trigger container lifecycle and event routing
    pub dispatcher: Arc<TriggerDispatcher>,
    /// Live run state
    pub store: Arc<MetadataStore>,
}

/// Response for workflow creation/update operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub message: String,
    /// Registration tokens for the workflow's activated triggers; the webhook
    /// URL for each is `POST /webhooks/{token}`
    pub trigger_tokens: Vec<String>,
}

/// Request body for secret writes
#[derive(Debug, Deserialize)]
pub struct SecretRequest {
    pub value: String,
}

/// Create workflow management routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow))
        .route("/api/workflows", get(list_workflows))
        .route("/api/workflows/{id}", get(get_workflow))
        .route("/api/workflows/{id}", put(update_workflow))
        .route("/api/workflows/{id}", delete(delete_workflow))
        .route("/api/workflows/{id}/secrets", get(list_secrets))
        .route("/api/workflows/{id}/secrets/{name}", put(put_secret))
        .route("/api/workflows/{id}/secrets/{name}", delete(delete_secret))
}

/// Create a new workflow
///
/// POST /api/workflows
async fn create_workflow(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    if definition.id.is_empty() || definition.name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    match state.storage.get_workflow(&definition.id).await {
        Ok(Some(_)) => return Err(StatusCode::CONFLICT),
        Ok(None) => {}
        Err(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    }

    admit_workflow(&state, definition, "created").await
}

/// Update an existing workflow
///
/// PUT /api/workflows/{id}
async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    if definition.id != id {
        return Err(StatusCode::BAD_REQUEST);
    }
    match state.storage.get_workflow(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    }

    // Validate before touching live state: a rejected update must leave the
    // current registration and its trigger containers exactly as they were
    if let Err(e) = StepGraph::build(&definition) {
        tracing::warn!("❌ Rejected workflow '{}': {}", definition.id, e);
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    // Old trigger containers go down before the replacement comes up
    state.dispatcher.deactivate_workflow(&id).await;
    admit_workflow(&state, definition, "updated").await
}

/// Validate, persist, hot-reload, and activate a definition
async fn admit_workflow(
    state: &AppState,
    definition: WorkflowDefinition,
    verb: &str,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    if let Err(e) = StepGraph::build(&definition) {
        tracing::warn!("❌ Rejected workflow '{}': {}", definition.id, e);
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    if let Err(e) = state.storage.save_workflow(&definition).await {
        tracing::error!("❌ Failed to save workflow: {}", e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    if let Err(e) = state.registry.reload_workflow(&definition.id).await {
        tracing::error!("❌ Failed to reload workflow into registry: {}", e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let trigger_tokens = match state.dispatcher.activate_workflow(&definition).await {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::error!(
                "❌ Failed to activate triggers for workflow '{}': {}",
                definition.id,
                e
            );
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    tracing::info!("🔥 Workflow {}: {} ({})", verb, definition.id, definition.name);
    Ok(Json(WorkflowResponse {
        id: definition.id.clone(),
        message: format!("Workflow '{}' {} successfully", definition.name, verb),
        trigger_tokens,
    }))
}

/// List all workflows
///
/// GET /api/workflows
async fn list_workflows(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.storage.list_workflows().await {
        Ok(workflows) => Ok(Json(json!({ "workflows": workflows }))),
        Err(e) => {
            tracing::error!("❌ Failed to list workflows: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Get a specific workflow by ID
///
/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowDefinition>, StatusCode> {
    match state.storage.get_workflow(&id).await {
        Ok(Some(definition)) => Ok(Json(definition)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("❌ Failed to get workflow {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Delete a workflow, its secrets, and its trigger containers
///
/// DELETE /api/workflows/{id}
async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    state.dispatcher.deactivate_workflow(&id).await;
    state.registry.remove_workflow(&id);

    match state.storage.delete_workflow(&id).await {
        Ok(true) => {
            tracing::info!("🗑️ Deleted workflow: {}", id);
            Ok(StatusCode::NO_CONTENT)
        }
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("❌ Failed to delete workflow {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// List secret names for a workflow (never values)
///
/// GET /api/workflows/{id}/secrets
async fn list_secrets(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.storage.list_secret_names(&id).await {
        Ok(names) => Ok(Json(json!({ "secrets": names }))),
        Err(e) => {
            tracing::error!("❌ Failed to list secrets for {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Store or replace a secret value
///
/// PUT /api/workflows/{id}/secrets/{name}
async fn put_secret(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    Json(request): Json<SecretRequest>,
) -> Result<StatusCode, StatusCode> {
    match state.storage.put_secret(&id, &name, &request.value).await {
        Ok(()) => {
            tracing::info!("🔐 Secret '{}' set for workflow {}", name, id);
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) => {
            tracing::error!("❌ Failed to store secret for {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Delete a secret
///
/// DELETE /api/workflows/{id}/secrets/{name}
async fn delete_secret(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<StatusCode, StatusCode> {
    match state.storage.delete_secret(&id, &name).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("❌ Failed to delete secret for {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::store::MetadataStore;
    use crate::runtime::container::ContainerRuntime;
    use crate::runtime::executor::StepExecutor;
    use crate::runtime::testing::FakeRuntime;
    use crate::workflow::types::{StepDef, TriggerDef};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn management_app() -> (Router, AppState) {
        let store = Arc::new(MetadataStore::new());
        let runtime = Arc::new(FakeRuntime::new());
        runtime.attach_store(Arc::clone(&store)).await;

        let executor = Arc::new(StepExecutor::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            "http://127.0.0.1:3004",
            Duration::from_secs(5),
        ));

        // One connection keeps the in-memory database alive for the whole test
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let storage = WorkflowStorage::new(pool);
        storage.init_schema().await.unwrap();

        let registry = Arc::new(WorkflowRegistry::new(storage.clone()));
        let scheduler = Arc::new(SchedulerService::new(
            Arc::clone(&store),
            executor,
            storage.clone(),
            30,
        ));
        let dispatcher = Arc::new(TriggerDispatcher::new(
            runtime as Arc<dyn ContainerRuntime>,
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            storage.clone(),
            "http://127.0.0.1:3004",
            19200,
            Duration::from_millis(200),
        ));

        let state = AppState {
            storage,
            registry,
            scheduler,
            dispatcher,
            store,
        };
        let app = create_workflow_routes().with_state(state.clone());
        (app, state)
    }

    fn step(name: &str, spec: &[(&str, serde_json::Value)]) -> StepDef {
        StepDef {
            name: name.to_string(),
            image: "alpine:3".to_string(),
            input: vec![],
            spec: spec
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            timeout_seconds: None,
        }
    }

    fn triggered_workflow(steps: Vec<StepDef>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf-hooked".to_string(),
            name: "Hooked".to_string(),
            parameters: HashMap::new(),
            steps,
            triggers: vec![TriggerDef {
                name: "on-push".to_string(),
                image: "trigger-image".to_string(),
                events: vec![],
                spec: HashMap::new(),
            }],
        }
    }

    fn json_request(method: &str, uri: &str, body: &WorkflowDefinition) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rejected_update_leaves_existing_triggers_routed() {
        let (app, state) = management_app().await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/workflows",
                &triggered_workflow(vec![step("a", &[])]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let token = body["trigger_tokens"][0].as_str().unwrap().to_string();
        assert!(state.dispatcher.lookup(&token).is_some());

        // A cyclic replacement must be rejected without touching live state
        let cyclic = triggered_workflow(vec![
            step("a", &[("in", json!("${outputs.b.out}"))]),
            step("b", &[("in", json!("${outputs.a.out}"))]),
        ]);
        let response = app
            .oneshot(json_request("PUT", "/api/workflows/wf-hooked", &cyclic))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        // The original trigger registration survives and the definition is intact
        assert!(state.dispatcher.lookup(&token).is_some());
        assert!(state.registry.get_workflow("wf-hooked").is_some());
    }

    #[tokio::test]
    async fn valid_update_replaces_trigger_registration() {
        let (app, state) = management_app().await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/workflows",
                &triggered_workflow(vec![step("a", &[])]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let old_token = body_json(response).await["trigger_tokens"][0]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .oneshot(json_request(
                "PUT",
                "/api/workflows/wf-hooked",
                &triggered_workflow(vec![step("a", &[]), step("b", &[])]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let new_token = body_json(response).await["trigger_tokens"][0]
            .as_str()
            .unwrap()
            .to_string();

        assert!(state.dispatcher.lookup(&old_token).is_none());
        assert!(state.dispatcher.lookup(&new_token).is_some());
    }
}
