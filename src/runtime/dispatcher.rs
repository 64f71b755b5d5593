/// Trigger dispatcher and event routing
///
/// Manages long-lived trigger containers and the routing table the event
/// gateway consults. Each activated trigger declaration gets its own
/// container, listening on an allocated host port, plus an unforgeable
/// registration token. Inbound webhook deliveries are forwarded to the bound
/// container verbatim; the container alone decides accept/reject and emits a
/// typed event back into the platform, which starts a new workflow run.
///
/// The routing table is read on every delivery and updated only on trigger
/// (de)activation, so it uses the same copy-on-update ArcSwap pattern as the
/// workflow registry: in-flight deliveries keep their own snapshot and never
/// race a swap.

use crate::runtime::container::{ContainerHandle, ContainerRuntime, LaunchSpec};
use crate::runtime::scheduler::SchedulerService;
use crate::workflow::expr::{self, Bindings};
use crate::workflow::registry::WorkflowRegistry;
use crate::workflow::storage::WorkflowStorage;
use crate::workflow::types::{Event, TriggerDef, WorkflowDefinition};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Environment variable carrying the platform's event emit endpoint
pub const ENV_EMIT_URL: &str = "RELAY_EMIT_URL";
/// Environment variable carrying the trigger's registration token
pub const ENV_TRIGGER_TOKEN: &str = "RELAY_TRIGGER_TOKEN";
/// Environment variable telling the trigger container which port to listen on
pub const ENV_LISTEN_PORT: &str = "RELAY_LISTEN_PORT";
/// Environment variable carrying the trigger's resolved spec as JSON
pub const ENV_TRIGGER_SPEC: &str = "RELAY_TRIGGER_SPEC";

/// Fixed in-container listener port; published to a per-trigger host port
const TRIGGER_CONTAINER_PORT: u16 = 8000;

/// One live trigger container and its binding
#[derive(Debug, Clone)]
pub struct TriggerBinding {
    pub workflow_id: String,
    pub trigger_name: String,
    /// Event names that start a run; empty accepts any event
    pub events: Vec<String>,
    /// Host port the container's listener is published on
    pub port: u16,
    pub container: ContainerHandle,
}

/// Result of forwarding a webhook delivery to a trigger container
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// The trigger container took the payload (2xx from its listener)
    Accepted,
    /// No trigger is registered under this token
    UnknownToken,
    /// The container is unreachable, timed out, or rejected the delivery
    Failed(String),
}

/// Errors while handling an emitted event
#[derive(Debug, Error)]
pub enum EventError {
    #[error("unknown or revoked trigger token")]
    UnknownToken,
    #[error("event '{0}' is not bound by this trigger")]
    NotBound(String),
    #[error("workflow '{0}' is no longer registered")]
    WorkflowGone(String),
    #[error("failed to start run: {0}")]
    Start(#[from] anyhow::Error),
}

/// Launches trigger containers and routes deliveries and events
#[derive(Debug)]
pub struct TriggerDispatcher {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<WorkflowRegistry>,
    scheduler: Arc<SchedulerService>,
    storage: WorkflowStorage,
    /// Registration token -> live trigger binding
    routes: ArcSwap<HashMap<String, Arc<TriggerBinding>>>,
    http: reqwest::Client,
    /// Public base URL advertised to trigger containers for the emit endpoint
    public_url: String,
    /// Next host port to hand out for a trigger listener
    next_port: AtomicU16,
    delivery_timeout: Duration,
}

impl TriggerDispatcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<WorkflowRegistry>,
        scheduler: Arc<SchedulerService>,
        storage: WorkflowStorage,
        public_url: impl Into<String>,
        port_range_start: u16,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            registry,
            scheduler,
            storage,
            routes: ArcSwap::new(Arc::new(HashMap::new())),
            http: reqwest::Client::new(),
            public_url: public_url.into(),
            next_port: AtomicU16::new(port_range_start),
            delivery_timeout,
        }
    }

    /// Launch trigger containers for every trigger a workflow declares
    ///
    /// Each container gets the emit endpoint, its registration token, its
    /// listen port, and its resolved spec in the environment. Returns the
    /// registration tokens so callers can surface webhook URLs.
    ///
    /// Activation is all-or-nothing: if any trigger fails to launch, the
    /// ones already up are torn down and unrouted before the error returns.
    pub async fn activate_workflow(&self, definition: &WorkflowDefinition) -> Result<Vec<String>> {
        let secrets = self.storage.load_secrets(&definition.id).await?;
        let mut tokens = Vec::with_capacity(definition.triggers.len());

        for trigger in &definition.triggers {
            match self.launch_trigger(definition, trigger, &secrets).await {
                Ok(token) => tokens.push(token),
                Err(e) => {
                    self.rollback_activation(&tokens).await;
                    return Err(e.context(format!(
                        "failed to activate trigger '{}' for workflow '{}'",
                        trigger.name, definition.id
                    )));
                }
            }
        }
        Ok(tokens)
    }

    /// Unroute and kill triggers launched by a failed activation
    async fn rollback_activation(&self, tokens: &[String]) {
        let current = self.routes.load();
        let mut next = (**current).clone();
        let removed: Vec<Arc<TriggerBinding>> = tokens
            .iter()
            .filter_map(|token| next.remove(token))
            .collect();
        self.routes.store(Arc::new(next));

        for binding in removed {
            if let Err(e) = self.runtime.kill(&binding.container).await {
                tracing::warn!(
                    "⚠️ Failed to stop trigger container '{}' during rollback: {}",
                    binding.trigger_name,
                    e
                );
            }
        }
    }

    async fn launch_trigger(
        &self,
        definition: &WorkflowDefinition,
        trigger: &TriggerDef,
        secrets: &HashMap<String, String>,
    ) -> Result<String> {
        let bindings = Bindings {
            parameters: definition.parameters.clone(),
            outputs: HashMap::new(),
            secrets: secrets.clone(),
        };
        let resolved = expr::resolve_spec(&trigger.spec, &bindings)?;

        let token = Uuid::new_v4().to_string();
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);

        let mut env = HashMap::new();
        env.insert(
            ENV_EMIT_URL.to_string(),
            format!("{}/v1/events", self.public_url),
        );
        env.insert(ENV_TRIGGER_TOKEN.to_string(), token.clone());
        env.insert(
            ENV_LISTEN_PORT.to_string(),
            TRIGGER_CONTAINER_PORT.to_string(),
        );
        env.insert(
            ENV_TRIGGER_SPEC.to_string(),
            serde_json::to_string(&resolved.values)?,
        );

        let container = self
            .runtime
            .launch(LaunchSpec {
                image: trigger.image.clone(),
                env,
                command: None,
                ports: vec![(port, TRIGGER_CONTAINER_PORT)],
            })
            .await?;

        let binding = Arc::new(TriggerBinding {
            workflow_id: definition.id.clone(),
            trigger_name: trigger.name.clone(),
            events: trigger.events.clone(),
            port,
            container,
        });
        self.insert_route(token.clone(), binding);

        tracing::info!(
            "📡 Activated trigger '{}' for workflow '{}' on port {}",
            trigger.name,
            definition.id,
            port
        );
        Ok(token)
    }

    /// Tear down every trigger container bound to a workflow
    pub async fn deactivate_workflow(&self, workflow_id: &str) {
        let current = self.routes.load();
        let mut next = (**current).clone();
        let removed: Vec<Arc<TriggerBinding>> = {
            let doomed: Vec<String> = next
                .iter()
                .filter(|(_, b)| b.workflow_id == workflow_id)
                .map(|(token, _)| token.clone())
                .collect();
            doomed
                .into_iter()
                .filter_map(|token| next.remove(&token))
                .collect()
        };
        self.routes.store(Arc::new(next));

        for binding in removed {
            if let Err(e) = self.runtime.kill(&binding.container).await {
                tracing::warn!(
                    "⚠️ Failed to stop trigger container '{}': {}",
                    binding.trigger_name,
                    e
                );
            } else {
                tracing::info!(
                    "🛑 Deactivated trigger '{}' for workflow '{}'",
                    binding.trigger_name,
                    workflow_id
                );
            }
        }
    }

    /// Forward a raw webhook payload to the trigger registered under a token
    ///
    /// A container failure or timeout never crashes the gateway; it surfaces
    /// as a delivery failure and no run is created.
    pub async fn deliver(
        &self,
        token: &str,
        content_type: Option<String>,
        body: Vec<u8>,
    ) -> DeliveryOutcome {
        let Some(binding) = self.routes.load().get(token).cloned() else {
            return DeliveryOutcome::UnknownToken;
        };

        let url = format!("http://127.0.0.1:{}/", binding.port);
        let mut request = self
            .http
            .post(&url)
            .timeout(self.delivery_timeout)
            .body(body);
        if let Some(content_type) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(
                    "📨 Delivered webhook to trigger '{}' ({})",
                    binding.trigger_name,
                    response.status()
                );
                DeliveryOutcome::Accepted
            }
            Ok(response) => DeliveryOutcome::Failed(format!(
                "trigger listener returned {}",
                response.status()
            )),
            Err(e) => {
                tracing::warn!(
                    "❌ Webhook delivery to trigger '{}' failed: {}",
                    binding.trigger_name,
                    e
                );
                DeliveryOutcome::Failed(e.to_string())
            }
        }
    }

    /// Handle an event emitted by a trigger container
    ///
    /// Resolves the token to its binding, applies the event-name filter, and
    /// starts a new run with the event's parameters overlaid on the workflow
    /// defaults. Every emitted event creates its own independent run; the
    /// platform performs no deduplication.
    pub async fn handle_event(&self, token: &str, event: Event) -> Result<Uuid, EventError> {
        let Some(binding) = self.routes.load().get(token).cloned() else {
            return Err(EventError::UnknownToken);
        };

        if !binding.events.is_empty() && !binding.events.contains(&event.name) {
            return Err(EventError::NotBound(event.name));
        }

        let definition = self
            .registry
            .get_workflow(&binding.workflow_id)
            .ok_or_else(|| EventError::WorkflowGone(binding.workflow_id.clone()))?;

        tracing::info!(
            "⚡ Event '{}' from trigger '{}' starting workflow '{}'",
            event.name,
            binding.trigger_name,
            binding.workflow_id
        );
        let run_id = self
            .scheduler
            .start_run(definition, event.parameters)
            .await?;
        Ok(run_id)
    }

    fn insert_route(&self, token: String, binding: Arc<TriggerBinding>) {
        let current = self.routes.load();
        let mut next = (**current).clone();
        next.insert(token, binding);
        self.routes.store(Arc::new(next));
    }

    /// The binding registered under a token, if any
    pub fn lookup(&self, token: &str) -> Option<Arc<TriggerBinding>> {
        self.routes.load().get(token).cloned()
    }
}
