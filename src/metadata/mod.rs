/// Metadata Service Layer
///
/// The run-scoped state containers exchange parameters, outputs, secrets, and
/// logs through. It handles:
/// - Live run state partitioned per run id
/// - Per-step credential issuing and revocation
/// - Secret leak guards on output and log writes
/// - The container-facing HTTP API

// In-memory run state and credential index
pub mod store;

// Container-facing HTTP API
pub mod api;

// Re-export commonly used types
pub use store::{MetadataStore, StepIdentity};
