/// Server setup and initialization
///
/// Wires together all components: storage, metadata store, registry, step
/// executor, scheduler, trigger dispatcher, and HTTP routes. Provides the
/// main application factory function for creating the Axum app.

use crate::{
    api::{
        runs::create_run_routes,
        webhooks::{create_webhook_routes, WebhookState},
        workflows::{create_workflow_routes, AppState},
    },
    config::Config,
    metadata::{api::{create_metadata_routes, MetadataApiState}, store::MetadataStore},
    runtime::{
        container::{ContainerRuntime, DockerCliRuntime},
        dispatcher::TriggerDispatcher,
        executor::StepExecutor,
        scheduler::SchedulerService,
    },
    workflow::{registry::WorkflowRegistry, storage::WorkflowStorage},
};
use anyhow::Result;
use axum::{routing::get, Router};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Create the main Axum application with all routes and shared state
pub async fn create_app(config: Config) -> Result<Router> {
    tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
    std::fs::create_dir_all(&config.database.data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data directory: {}", e))?;

    tracing::info!("📋 Initializing workflow storage");
    let database_url = format!("sqlite://{}/relay.db?mode=rwc", config.database.data_dir);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database {}: {}", database_url, e))?;
    let storage = WorkflowStorage::new(pool);
    storage.init_schema().await?;

    tracing::info!("📦 Initializing metadata store");
    let store = Arc::new(MetadataStore::new());

    tracing::info!("🐳 Initializing container runtime ({})", config.runtime.docker_bin);
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerCliRuntime::new(config.runtime.docker_bin.clone()));

    let executor = Arc::new(StepExecutor::new(
        Arc::clone(&runtime),
        config.server.public_url.clone(),
        Duration::from_secs(config.runtime.default_step_timeout_secs),
    ));

    let scheduler = Arc::new(SchedulerService::new(
        Arc::clone(&store),
        executor,
        storage.clone(),
        config.database.retention_days,
    ));

    tracing::info!("📊 Initializing workflow registry");
    let registry = Arc::new(WorkflowRegistry::new(storage.clone()));
    registry.init_from_storage().await?;

    tracing::info!("📡 Initializing trigger dispatcher");
    let dispatcher = Arc::new(TriggerDispatcher::new(
        runtime,
        Arc::clone(&registry),
        Arc::clone(&scheduler),
        storage.clone(),
        config.server.public_url.clone(),
        config.triggers.port_range_start,
        Duration::from_secs(config.triggers.delivery_timeout_secs),
    ));

    // Bring up trigger containers for every workflow loaded from storage
    for definition in registry.all_workflows() {
        if let Err(e) = dispatcher.activate_workflow(&definition).await {
            tracing::error!(
                "❌ Failed to activate triggers for workflow '{}': {}",
                definition.id,
                e
            );
        }
    }

    // Expired archives are also pruned after every run; this catches idle periods
    let prune_storage = storage.clone();
    let retention_days = config.database.retention_days;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        loop {
            interval.tick().await;
            if let Err(e) = prune_storage.prune_archived(retention_days).await {
                tracing::warn!("⚠️ Archive pruning failed: {}", e);
            }
        }
    });

    let app_state = AppState {
        storage,
        registry,
        scheduler,
        dispatcher: Arc::clone(&dispatcher),
        store: Arc::clone(&store),
    };
    let webhook_state = WebhookState { dispatcher };
    let metadata_state = MetadataApiState { store };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes().with_state(app_state.clone()))
        .merge(create_run_routes().with_state(app_state))
        .merge(create_webhook_routes().with_state(webhook_state))
        .merge(create_metadata_routes().with_state(metadata_state));

    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Relay server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
