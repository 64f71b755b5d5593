/// Run-scoped metadata store
///
/// Authoritative in-memory state for every live workflow run: resolved
/// parameters, per-step status, outputs, logs, and run-scoped secrets. The
/// key space is partitioned by run id: each run sits behind its own lock, so
/// operations on distinct runs never contend and critical sections are short,
/// non-awaiting mutations.
///
/// Containers never touch this store directly; they go through the metadata
/// HTTP API, which authenticates each call with an unforgeable per-step token
/// issued at launch and revoked at terminal transition.

use crate::workflow::expr::Bindings;
use crate::workflow::types::{
    LogLine, RunStatus, StepRun, StepStatus, WorkflowDefinition, WorkflowRun,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Errors surfaced by store operations
///
/// `Unauthorized` covers both bad tokens and attempts to operate outside the
/// caller's own step identity. Not-found lookups for outputs and secrets are
/// deliberately NOT errors; they are `Ok(None)` so a container can check for
/// optional values without aborting its step.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("unknown or revoked credential")]
    Unauthorized,
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("step '{0}' not found in run")]
    StepNotFound(String),
}

/// The scope a step credential resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepIdentity {
    pub run_id: Uuid,
    pub step: String,
}

/// Result of an output write, distinguishing the leak-guard path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputWrite {
    Stored,
    /// The value matched a secret this step obtained; a redaction marker was
    /// stored instead and a warning logged. The run continues.
    Redacted,
}

/// Marker stored in place of an output value that matched a secret
pub const REDACTED: &str = "[redacted]";

/// Per-run state: secrets bound at creation plus the mutable run snapshot
#[derive(Debug)]
struct RunHandle {
    secrets: HashMap<String, String>,
    state: RwLock<WorkflowRun>,
}

/// Partitioned, token-scoped metadata store
#[derive(Debug, Default)]
pub struct MetadataStore {
    /// Live runs keyed by run id; each run behind its own lock
    runs: RwLock<HashMap<Uuid, Arc<RunHandle>>>,
    /// Step credential index: token -> (run, step)
    tokens: RwLock<HashMap<String, StepIdentity>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create run state for a definition with resolved parameters and secrets
    ///
    /// Every step starts Pending; the returned run id is the partition key for
    /// all subsequent operations.
    pub async fn create_run(
        &self,
        definition: &WorkflowDefinition,
        parameters: HashMap<String, Value>,
        secrets: HashMap<String, String>,
    ) -> Uuid {
        let run = WorkflowRun::new(definition, parameters);
        let run_id = run.id;

        let handle = Arc::new(RunHandle {
            secrets,
            state: RwLock::new(run),
        });
        self.runs.write().await.insert(run_id, handle);

        tracing::debug!("📦 Created run state: {}", run_id);
        run_id
    }

    /// Drop a run's live state (called after the terminal snapshot is archived)
    pub async fn remove_run(&self, run_id: Uuid) {
        self.runs.write().await.remove(&run_id);
        self.tokens
            .write()
            .await
            .retain(|_, identity| identity.run_id != run_id);
        tracing::debug!("🗑️ Dropped run state: {}", run_id);
    }

    /// Issue an unforgeable credential scoped to one step of one run
    pub async fn issue_step_token(&self, run_id: Uuid, step: &str) -> String {
        let token = Uuid::new_v4().to_string();
        self.tokens.write().await.insert(
            token.clone(),
            StepIdentity {
                run_id,
                step: step.to_string(),
            },
        );
        token
    }

    /// Revoke every credential issued for a run
    pub async fn revoke_run_tokens(&self, run_id: Uuid) {
        self.tokens
            .write()
            .await
            .retain(|_, identity| identity.run_id != run_id);
    }

    /// Resolve a bearer token to its step identity
    pub async fn resolve_token(&self, token: &str) -> Option<StepIdentity> {
        self.tokens.read().await.get(token).cloned()
    }

    async fn handle(&self, run_id: Uuid) -> Result<Arc<RunHandle>, MetadataError> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(MetadataError::RunNotFound(run_id))
    }

    // ---- container-facing operations (identity-scoped) ----

    /// Read the caller's own resolved spec
    ///
    /// Values are fully resolved before the container starts; callers never
    /// see expression syntax. Empty until the step is launched.
    pub async fn get_spec(
        &self,
        identity: &StepIdentity,
    ) -> Result<HashMap<String, Value>, MetadataError> {
        let handle = self.handle(identity.run_id).await?;
        let state = handle.state.read().await;
        let step = state
            .steps
            .get(&identity.step)
            .ok_or_else(|| MetadataError::StepNotFound(identity.step.clone()))?;
        Ok(step.resolved_spec.clone().unwrap_or_default())
    }

    /// Read an output committed by any step in the caller's run
    pub async fn get_output(
        &self,
        identity: &StepIdentity,
        step: &str,
        key: &str,
    ) -> Result<Option<Value>, MetadataError> {
        let handle = self.handle(identity.run_id).await?;
        let state = handle.state.read().await;
        Ok(state
            .steps
            .get(step)
            .and_then(|s| s.outputs.get(key))
            .cloned())
    }

    /// Write an output under the caller's own identity
    ///
    /// Last write wins per key. The leak guard refuses to persist any value
    /// structurally equal to a secret the same step has obtained: the write
    /// is redacted with a warning rather than failing the run.
    pub async fn set_output(
        &self,
        identity: &StepIdentity,
        key: &str,
        value: Value,
    ) -> Result<OutputWrite, MetadataError> {
        let handle = self.handle(identity.run_id).await?;
        let mut state = handle.state.write().await;
        let step = state
            .steps
            .get_mut(&identity.step)
            .ok_or_else(|| MetadataError::StepNotFound(identity.step.clone()))?;

        let leaked = step
            .secrets_seen
            .iter()
            .any(|secret| value == Value::String(secret.clone()));
        if leaked {
            tracing::warn!(
                "🚨 Output '{}' from step '{}' in run {} matched a secret value - redacted",
                key,
                identity.step,
                identity.run_id
            );
            step.outputs
                .insert(key.to_string(), Value::String(REDACTED.to_string()));
            return Ok(OutputWrite::Redacted);
        }

        step.outputs.insert(key.to_string(), value);
        Ok(OutputWrite::Stored)
    }

    /// Read a run-scoped secret under the caller's identity
    ///
    /// Access is audited and the value is remembered for the leak guard, so a
    /// later attempt to echo it into outputs or logs gets redacted.
    pub async fn get_secret(
        &self,
        identity: &StepIdentity,
        name: &str,
    ) -> Result<Option<String>, MetadataError> {
        let handle = self.handle(identity.run_id).await?;
        let Some(value) = handle.secrets.get(name).cloned() else {
            return Ok(None);
        };

        tracing::info!(
            "🔐 Secret '{}' read by step '{}' in run {}",
            name,
            identity.step,
            identity.run_id
        );

        let mut state = handle.state.write().await;
        if let Some(step) = state.steps.get_mut(&identity.step) {
            step.secrets_seen.insert(value.clone());
        }
        Ok(Some(value))
    }

    /// Append a log line under the caller's identity
    ///
    /// Any occurrence of a secret value the step has obtained is replaced
    /// before the line is stored.
    pub async fn append_log(
        &self,
        identity: &StepIdentity,
        level: &str,
        message: &str,
    ) -> Result<(), MetadataError> {
        let handle = self.handle(identity.run_id).await?;
        let mut state = handle.state.write().await;
        let step = state
            .steps
            .get_mut(&identity.step)
            .ok_or_else(|| MetadataError::StepNotFound(identity.step.clone()))?;

        let mut scrubbed = message.to_string();
        for secret in &step.secrets_seen {
            if scrubbed.contains(secret.as_str()) {
                scrubbed = scrubbed.replace(secret.as_str(), REDACTED);
            }
        }

        step.logs.push(LogLine {
            level: level.to_string(),
            message: scrubbed,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    // ---- scheduler-facing operations ----

    /// Build the expression binding context from current run state
    ///
    /// Exposes parameters, the outputs of every step that has Succeeded, and
    /// the run's secrets. A step launched against these bindings observes all
    /// outputs of its transitive dependencies as already committed.
    pub async fn bindings(&self, run_id: Uuid) -> Result<Bindings, MetadataError> {
        let handle = self.handle(run_id).await?;
        let state = handle.state.read().await;

        let mut outputs = HashMap::new();
        for (name, step) in &state.steps {
            if step.status == StepStatus::Succeeded {
                outputs.insert(name.clone(), step.outputs.clone());
            }
        }

        Ok(Bindings {
            parameters: state.parameters.clone(),
            outputs,
            secrets: handle.secrets.clone(),
        })
    }

    /// Transition a step's status
    pub async fn set_step_status(
        &self,
        run_id: Uuid,
        step: &str,
        status: StepStatus,
    ) -> Result<(), MetadataError> {
        let handle = self.handle(run_id).await?;
        let mut state = handle.state.write().await;
        let step_run = state
            .steps
            .get_mut(step)
            .ok_or_else(|| MetadataError::StepNotFound(step.to_string()))?;
        step_run.status = status;
        Ok(())
    }

    /// Record launch-time state: resolved spec, secret taint, Running status
    pub async fn mark_step_launched(
        &self,
        run_id: Uuid,
        step: &str,
        resolved_spec: HashMap<String, Value>,
        secrets_used: impl IntoIterator<Item = String>,
    ) -> Result<(), MetadataError> {
        let handle = self.handle(run_id).await?;
        let mut state = handle.state.write().await;
        let step_run = state
            .steps
            .get_mut(step)
            .ok_or_else(|| MetadataError::StepNotFound(step.to_string()))?;
        step_run.resolved_spec = Some(resolved_spec);
        step_run.secrets_seen.extend(secrets_used);
        step_run.status = StepStatus::Running;
        Ok(())
    }

    /// Record a step's terminal result
    ///
    /// Outputs already written stay durable on both success and failure;
    /// nothing is rolled back.
    pub async fn set_step_terminal(
        &self,
        run_id: Uuid,
        step: &str,
        status: StepStatus,
        exit_code: Option<i64>,
        failure: Option<String>,
    ) -> Result<(), MetadataError> {
        let handle = self.handle(run_id).await?;
        let mut state = handle.state.write().await;
        let step_run = state
            .steps
            .get_mut(step)
            .ok_or_else(|| MetadataError::StepNotFound(step.to_string()))?;
        step_run.status = status;
        step_run.exit_code = exit_code;
        step_run.failure = failure;
        Ok(())
    }

    /// Set the aggregate run status
    pub async fn set_run_status(&self, run_id: Uuid, status: RunStatus) -> Result<(), MetadataError> {
        let handle = self.handle(run_id).await?;
        let mut state = handle.state.write().await;
        state.status = status;
        if status.is_terminal() {
            state.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Snapshot a run for API responses and archival
    pub async fn snapshot(&self, run_id: Uuid) -> Option<WorkflowRun> {
        let handle = self.runs.read().await.get(&run_id).cloned()?;
        let state = handle.state.read().await;
        Some(state.clone())
    }

    /// Snapshot a single step
    pub async fn step_snapshot(&self, run_id: Uuid, step: &str) -> Option<StepRun> {
        let handle = self.runs.read().await.get(&run_id).cloned()?;
        let state = handle.state.read().await;
        state.steps.get(step).cloned()
    }

    /// Snapshots of all live runs, newest first
    pub async fn list_runs(&self) -> Vec<WorkflowRun> {
        let handles: Vec<Arc<RunHandle>> = self.runs.read().await.values().cloned().collect();
        let mut runs = Vec::with_capacity(handles.len());
        for handle in handles {
            runs.push(handle.state.read().await.clone());
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{StepDef, WorkflowDefinition};
    use serde_json::json;

    fn two_step_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf-test".to_string(),
            name: "Test".to_string(),
            parameters: HashMap::new(),
            steps: vec![
                StepDef {
                    name: "a".to_string(),
                    image: "alpine:3".to_string(),
                    input: vec![],
                    spec: HashMap::new(),
                    timeout_seconds: None,
                },
                StepDef {
                    name: "b".to_string(),
                    image: "alpine:3".to_string(),
                    input: vec![],
                    spec: HashMap::new(),
                    timeout_seconds: None,
                },
            ],
            triggers: vec![],
        }
    }

    async fn store_with_run(secrets: HashMap<String, String>) -> (MetadataStore, Uuid) {
        let store = MetadataStore::new();
        let run_id = store
            .create_run(&two_step_definition(), HashMap::new(), secrets)
            .await;
        (store, run_id)
    }

    fn identity(run_id: Uuid, step: &str) -> StepIdentity {
        StepIdentity {
            run_id,
            step: step.to_string(),
        }
    }

    #[tokio::test]
    async fn output_round_trip_across_steps() {
        let (store, run_id) = store_with_run(HashMap::new()).await;
        let a = identity(run_id, "a");
        let b = identity(run_id, "b");

        store.set_output(&a, "k", json!("v")).await.unwrap();
        let read_back = store.get_output(&b, "a", "k").await.unwrap();
        assert_eq!(read_back, Some(json!("v")));
    }

    #[tokio::test]
    async fn missing_output_is_none_not_error() {
        let (store, run_id) = store_with_run(HashMap::new()).await;
        let a = identity(run_id, "a");
        assert_eq!(store.get_output(&a, "b", "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_writes_to_distinct_keys_both_persist() {
        let (store, run_id) = store_with_run(HashMap::new()).await;
        let store = Arc::new(store);
        let a1 = identity(run_id, "a");
        let a2 = identity(run_id, "a");

        let s1 = Arc::clone(&store);
        let s2 = Arc::clone(&store);
        let t1 = tokio::spawn(async move { s1.set_output(&a1, "k1", json!(1)).await });
        let t2 = tokio::spawn(async move { s2.set_output(&a2, "k2", json!(2)).await });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        let b = identity(run_id, "b");
        assert_eq!(store.get_output(&b, "a", "k1").await.unwrap(), Some(json!(1)));
        assert_eq!(store.get_output(&b, "a", "k2").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn secret_echo_into_output_is_redacted() {
        let mut secrets = HashMap::new();
        secrets.insert("token".to_string(), "s3cret".to_string());
        let (store, run_id) = store_with_run(secrets).await;
        let a = identity(run_id, "a");

        let value = store.get_secret(&a, "token").await.unwrap();
        assert_eq!(value, Some("s3cret".to_string()));

        let write = store.set_output(&a, "leak", json!("s3cret")).await.unwrap();
        assert_eq!(write, OutputWrite::Redacted);

        let b = identity(run_id, "b");
        let stored = store.get_output(&b, "a", "leak").await.unwrap();
        assert_eq!(stored, Some(json!(REDACTED)));
    }

    #[tokio::test]
    async fn secret_in_log_message_is_scrubbed() {
        let mut secrets = HashMap::new();
        secrets.insert("token".to_string(), "s3cret".to_string());
        let (store, run_id) = store_with_run(secrets).await;
        let a = identity(run_id, "a");

        store.get_secret(&a, "token").await.unwrap();
        store
            .append_log(&a, "info", "authenticating with s3cret now")
            .await
            .unwrap();

        let step = store.step_snapshot(run_id, "a").await.unwrap();
        assert_eq!(step.logs.len(), 1);
        assert!(!step.logs[0].message.contains("s3cret"));
        assert!(step.logs[0].message.contains(REDACTED));
    }

    #[tokio::test]
    async fn missing_secret_is_none_not_error() {
        let (store, run_id) = store_with_run(HashMap::new()).await;
        let a = identity(run_id, "a");
        assert_eq!(store.get_secret(&a, "ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn tokens_resolve_and_revoke_per_run() {
        let (store, run_id) = store_with_run(HashMap::new()).await;
        let token = store.issue_step_token(run_id, "a").await;

        let resolved = store.resolve_token(&token).await.unwrap();
        assert_eq!(resolved.run_id, run_id);
        assert_eq!(resolved.step, "a");

        store.revoke_run_tokens(run_id).await;
        assert!(store.resolve_token(&token).await.is_none());
    }

    #[tokio::test]
    async fn bindings_expose_only_succeeded_outputs() {
        let (store, run_id) = store_with_run(HashMap::new()).await;
        let a = identity(run_id, "a");
        store.set_output(&a, "k", json!("v")).await.unwrap();

        // Step a not yet terminal: output invisible to expression resolution
        let bindings = store.bindings(run_id).await.unwrap();
        assert!(bindings.outputs.get("a").is_none());

        store
            .set_step_terminal(run_id, "a", StepStatus::Succeeded, Some(0), None)
            .await
            .unwrap();
        let bindings = store.bindings(run_id).await.unwrap();
        assert_eq!(bindings.outputs["a"]["k"], json!("v"));
    }

    #[tokio::test]
    async fn overwrite_of_same_key_wins_last() {
        let (store, run_id) = store_with_run(HashMap::new()).await;
        let a = identity(run_id, "a");
        store.set_output(&a, "k", json!(1)).await.unwrap();
        store.set_output(&a, "k", json!(2)).await.unwrap();
        let b = identity(run_id, "b");
        assert_eq!(store.get_output(&b, "a", "k").await.unwrap(), Some(json!(2)));
    }
}
