/// Core workflow type definitions
///
/// Defines the fundamental structures for workflow definitions, steps, triggers,
/// runs, and emitted events. These types are serialized/deserialized from JSON
/// for persistence and for the management API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// A complete workflow definition containing steps and trigger declarations
///
/// Definitions are stored as JSON in SQLite and validated into dependency DAGs
/// before activation. A definition is immutable once a run starts: runs hold
/// their own copy of the definition for the duration of execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique workflow identifier (e.g., "wf-deploy")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    /// Declared run parameters with default values.
    /// Event or manual-invocation parameters overlay these at run creation.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// Containerized steps forming the dependency DAG
    #[serde(default)]
    pub steps: Vec<StepDef>,
    /// Trigger containers that convert external webhooks into events
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
}

/// A single containerized step in the workflow DAG
///
/// Dependency edges are implicit: any `${outputs.<step>.<key>}` reference in
/// the step's spec makes this step depend on `<step>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    /// Unique step name within the workflow (e.g., "build", "push-image")
    pub name: String,
    /// OCI image reference to run (e.g., "relaysh/kubectl-step:latest")
    pub image: String,
    /// Command/script lines executed inside the container.
    /// Joined with newlines and run through the container shell.
    #[serde(default)]
    pub input: Vec<String>,
    /// Declared keys mapped to value-expressions; fully resolved before launch
    /// so the container only ever sees plain values
    #[serde(default)]
    pub spec: HashMap<String, Value>,
    /// Optional maximum duration budget in seconds; exceeding it fails the step
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// A trigger container declaration
///
/// Trigger containers run a web listener, decode inbound webhook payloads,
/// and emit typed events back into the platform. All accept/reject decision
/// logic lives inside the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDef {
    /// Unique trigger name within the workflow (e.g., "on-image-push")
    pub name: String,
    /// OCI image reference for the trigger container
    pub image: String,
    /// Event names this trigger binds to. Empty means any event emitted by
    /// this trigger instance starts a run.
    #[serde(default)]
    pub events: Vec<String>,
    /// Resolved configuration handed to the trigger container at launch
    #[serde(default)]
    pub spec: HashMap<String, Value>,
}

/// Overall status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Whether the run has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// Status of a single step execution within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Runnable,
    Running,
    Succeeded,
    Failed,
    /// An ancestor failed or was skipped; this step never ran
    Skipped,
    /// The run was canceled before this step completed
    Canceled,
}

impl StepStatus {
    /// Whether the step has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Canceled
        )
    }
}

/// One execution instance of a workflow definition
///
/// Holds resolved parameters bound at creation (from a trigger event or manual
/// invocation), per-step state, and the aggregate status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique run identifier
    pub id: Uuid,
    /// Definition this run was created from
    pub workflow_id: String,
    /// Resolved parameters (defaults overlaid with event/invocation values)
    pub parameters: HashMap<String, Value>,
    /// Aggregate run status
    pub status: RunStatus,
    /// Per-step execution state, keyed by step name
    pub steps: HashMap<String, StepRun>,
    /// Run creation timestamp
    pub created_at: DateTime<Utc>,
    /// Set when the run reaches a terminal status
    pub finished_at: Option<DateTime<Utc>>,
}

/// One container execution belonging to a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    /// Step name from the definition
    pub name: String,
    /// Current execution status
    pub status: StepStatus,
    /// Container exit code, when the container ran to termination
    pub exit_code: Option<i64>,
    /// Failure description for Failed/Canceled steps (launch error, timeout, exit code)
    pub failure: Option<String>,
    /// Spec with all value-expressions evaluated, recorded at launch time
    pub resolved_spec: Option<HashMap<String, Value>>,
    /// Outputs written by the step's own container via the metadata API
    pub outputs: HashMap<String, Value>,
    /// Ordered, append-only log lines
    pub logs: Vec<LogLine>,
    /// Secret values this step has observed (via spec resolution or GetSecret).
    /// Used by the leak guard; never serialized out of the store.
    #[serde(skip)]
    pub secrets_seen: HashSet<String>,
}

impl StepRun {
    /// Create a fresh pending step run
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Pending,
            exit_code: None,
            failure: None,
            resolved_spec: None,
            outputs: HashMap::new(),
            logs: Vec::new(),
            secrets_seen: HashSet::new(),
        }
    }
}

/// A single appended log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Log level reported by the container ("info", "warn", "error", ...)
    pub level: String,
    /// Log message, secret-redacted at append time
    pub message: String,
    /// Server-side timestamp of the append
    pub timestamp: DateTime<Utc>,
}

/// A typed payload emitted by a trigger container
///
/// Immutable once emitted; each binding produces exactly one new workflow run
/// with `parameters` populated from the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event name (e.g., "image-pushed")
    pub name: String,
    /// Parameters carried by the event, overlaid onto the workflow's defaults
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

impl WorkflowRun {
    /// Create a new pending run for a definition with resolved parameters
    ///
    /// Pre-creates a pending StepRun for every step so the scheduler and the
    /// management API observe a complete, consistent step set from the start.
    pub fn new(definition: &WorkflowDefinition, parameters: HashMap<String, Value>) -> Self {
        let steps = definition
            .steps
            .iter()
            .map(|s| (s.name.clone(), StepRun::new(&s.name)))
            .collect();

        Self {
            id: Uuid::new_v4(),
            workflow_id: definition.id.clone(),
            parameters,
            status: RunStatus::Pending,
            steps,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Derive the aggregate status from per-step terminal states
    ///
    /// Failed if at least one step failed; Canceled if any step was canceled
    /// (and none failed); otherwise Succeeded. Skipped steps without a failed
    /// ancestor do not exist, so Skipped never appears without Failed.
    pub fn derive_status(&self) -> RunStatus {
        let mut any_failed = false;
        let mut any_canceled = false;
        for step in self.steps.values() {
            match step.status {
                StepStatus::Failed => any_failed = true,
                StepStatus::Canceled => any_canceled = true,
                _ => {}
            }
        }
        if any_failed {
            RunStatus::Failed
        } else if any_canceled {
            RunStatus::Canceled
        } else {
            RunStatus::Succeeded
        }
    }
}
