/// Event gateway HTTP surface
///
/// Two endpoints: the public webhook front door that forwards third-party
/// deliveries to trigger containers, and the emit endpoint trigger containers
/// call back into with typed events. Unroutable deliveries return a client
/// error without touching any container; container failures surface as 502
/// with no run side effects.

use crate::runtime::dispatcher::{DeliveryOutcome, EventError, TriggerDispatcher};
use crate::workflow::types::Event;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::post,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared state for the gateway routes
#[derive(Clone)]
pub struct WebhookState {
    pub dispatcher: Arc<TriggerDispatcher>,
}

/// Create the event gateway routes
pub fn create_webhook_routes() -> Router<WebhookState> {
    Router::new()
        .route("/webhooks/{token}", post(receive_webhook))
        .route("/v1/events", post(emit_event))
}

/// POST /webhooks/{token} - inbound third-party webhook delivery
///
/// 202 on accepted delivery, 404 on unknown token, 502 when the trigger
/// container is unreachable or rejects the payload.
async fn receive_webhook(
    State(state): State<WebhookState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let content_type = headers
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    match state
        .dispatcher
        .deliver(&token, content_type, body.to_vec())
        .await
    {
        DeliveryOutcome::Accepted => StatusCode::ACCEPTED,
        DeliveryOutcome::UnknownToken => StatusCode::NOT_FOUND,
        DeliveryOutcome::Failed(reason) => {
            tracing::warn!("❌ Webhook delivery failed: {}", reason);
            StatusCode::BAD_GATEWAY
        }
    }
}

/// POST /v1/events - event emitted by a trigger container
///
/// Authenticated with the trigger's registration token; a successful emit
/// returns the id of the run it started.
async fn emit_event(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(event): Json<Event>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let token = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    match state.dispatcher.handle_event(token, event).await {
        Ok(run_id) => Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": run_id })))),
        Err(EventError::UnknownToken) => Err(StatusCode::UNAUTHORIZED),
        Err(EventError::NotBound(name)) => {
            tracing::debug!("⚡ Event '{}' not bound; no run created", name);
            Err(StatusCode::UNPROCESSABLE_ENTITY)
        }
        Err(EventError::WorkflowGone(_)) => Err(StatusCode::NOT_FOUND),
        Err(EventError::Start(e)) => {
            tracing::error!("❌ Failed to start run from event: {}", e);
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
    use crate::runtime::scheduler::SchedulerService;
    use crate::runtime::testing::FakeRuntime;
    use crate::workflow::registry::WorkflowRegistry;
    use crate::workflow::storage::WorkflowStorage;
    use axum::body::Body;
    use axum::http::Request;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn gateway() -> Router {
        let store = Arc::new(MetadataStore::new());
        let runtime = Arc::new(FakeRuntime::new());
        let executor = Arc::new(StepExecutor::new(
            runtime.clone() as Arc<dyn ContainerRuntime>,
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
        let scheduler = Arc::new(SchedulerService::new(store, executor, storage.clone(), 30));

        let dispatcher = Arc::new(TriggerDispatcher::new(
            runtime as Arc<dyn ContainerRuntime>,
            registry,
            scheduler,
            storage,
            "http://127.0.0.1:3004",
            19100,
            Duration::from_millis(200),
        ));
        create_webhook_routes().with_state(WebhookState { dispatcher })
    }

    #[tokio::test]
    async fn unknown_registration_token_is_404() {
        let app = gateway().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/no-such-token")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn emit_without_token_is_unauthorized() {
        let app = gateway().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/events")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name": "image-pushed"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn emit_with_bogus_token_is_unauthorized() {
        let app = gateway().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/events")
                    .header("authorization", "Bearer bogus")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name": "image-pushed"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
