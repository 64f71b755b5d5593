/// Workflow Management Layer
///
/// This module handles workflow definitions, validation, persistence, and the
/// hot-reload registry. It provides:
/// - Type definitions (WorkflowDefinition, StepDef, WorkflowRun)
/// - Value-expression resolution for step/trigger specs
/// - Implicit dependency-graph construction and validation with petgraph
/// - SQLite persistence with sqlx
/// - Lock-free hot-reload registry using ArcSwap

// Core workflow type definitions
pub mod types;

// Value-expression parsing and resolution
pub mod expr;

// Dependency-graph construction and validation
pub mod graph;

// SQLite persistence layer for definitions, secrets, and archived runs
pub mod storage;

// Hot-reload registry using ArcSwap for zero-downtime updates
pub mod registry;

// Re-export commonly used types
pub use types::{Event, RunStatus, StepDef, StepStatus, TriggerDef, WorkflowDefinition, WorkflowRun};
