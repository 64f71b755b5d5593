/// Relay: container-native workflow orchestration engine
///
/// This library provides the core orchestration engine: dependency-ordered
/// execution of containerized workflow steps, a run-scoped metadata service
/// for container state exchange, and a trigger subsystem that routes inbound
/// webhooks into workflow runs.

// Core configuration and setup
pub mod config;

// Workflow management layer - definitions, expressions, graphs, storage, registry
pub mod workflow;

// Metadata service layer - run state, credentials, container-facing API
pub mod metadata;

// Runtime execution layer - containers, steps, scheduling, triggers
pub mod runtime;

// HTTP API layer - REST endpoints for management and the event gateway
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use metadata::MetadataStore;
pub use runtime::{SchedulerService, TriggerDispatcher};
pub use server::start_server;
pub use workflow::{Event, WorkflowDefinition, WorkflowRun};
