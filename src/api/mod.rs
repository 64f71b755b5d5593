/// HTTP API Layer
///
/// This module provides the REST endpoints for workflow and run management
/// plus the event gateway. It handles:
/// - Workflow CRUD and secret management
/// - Manual run invocation, inspection, and cancellation
/// - The public webhook front door and the trigger emit endpoint

// Workflow management endpoints (POST/GET/PUT/DELETE)
pub mod workflows;

// Run management endpoints
pub mod runs;

// Event gateway endpoints
pub mod webhooks;

// Re-export router builders
pub use runs::create_run_routes;
pub use webhooks::create_webhook_routes;
pub use workflows::create_workflow_routes;
