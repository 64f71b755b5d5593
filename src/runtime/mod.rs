/// Runtime Execution Layer
///
/// This module runs containers and coordinates workflow runs. It handles:
/// - The container runtime boundary (launch/wait/kill) with a docker CLI default
/// - Single-step execution with timeout and cancellation
/// - Frontier-driven DAG scheduling with skip propagation
/// - Trigger container lifecycle and webhook/event routing

// Container runtime boundary and docker CLI implementation
pub mod container;

// Single-step container execution
pub mod executor;

// Frontier-driven run coordination
pub mod scheduler;

// Trigger container lifecycle and event routing
pub mod dispatcher;

// Scripted fake runtime for tests
#[cfg(test)]
pub mod testing;

// Re-export main types
pub use container::{ContainerRuntime, DockerCliRuntime};
pub use dispatcher::TriggerDispatcher;
pub use scheduler::SchedulerService;
