/// Workflow scheduler: frontier-driven execution over the step DAG
///
/// Each run is coordinated by one async task. The coordinator maintains a
/// frontier of steps whose full dependency set has Succeeded, dispatches all
/// frontier members concurrently (independent steps run in parallel), and
/// consumes terminal transitions from an mpsc completion channel. On every
/// completion it recomputes the frontier and propagates Skipped to all
/// descendants of a failed or skipped step. There is no busy-waiting; the
/// run only advances on completion events.

use crate::metadata::store::MetadataStore;
use crate::runtime::executor::{PreparedStep, StepExecutor, StepFailure, StepOutcome};
use crate::workflow::expr;
use crate::workflow::graph::StepGraph;
use crate::workflow::storage::WorkflowStorage;
use crate::workflow::types::{RunStatus, StepDef, StepStatus, WorkflowDefinition};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;

/// Terminal transition reported by a spawned step task
#[derive(Debug)]
struct StepCompletion {
    step: String,
    outcome: StepOutcome,
}

/// Coordinates workflow runs and owns their cancellation signals
#[derive(Debug)]
pub struct SchedulerService {
    store: Arc<MetadataStore>,
    executor: Arc<StepExecutor>,
    storage: WorkflowStorage,
    /// Archived runs older than this many days get pruned on archive
    retention_days: u32,
    /// Per-run cancel signal senders
    cancels: RwLock<HashMap<Uuid, watch::Sender<bool>>>,
}

impl SchedulerService {
    pub fn new(
        store: Arc<MetadataStore>,
        executor: Arc<StepExecutor>,
        storage: WorkflowStorage,
        retention_days: u32,
    ) -> Self {
        Self {
            store,
            executor,
            storage,
            retention_days,
            cancels: RwLock::new(HashMap::new()),
        }
    }

    /// Create a run and coordinate it in the background
    ///
    /// Parameters overlay the definition's declared defaults; secrets are
    /// loaded into the run scope at creation. Returns the new run id as soon
    /// as the run exists.
    pub async fn start_run(
        self: &Arc<Self>,
        definition: Arc<WorkflowDefinition>,
        parameters: HashMap<String, Value>,
    ) -> Result<Uuid> {
        let run_id = self.create_run(&definition, parameters).await?;

        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service.execute_run(definition, run_id).await {
                tracing::error!("❌ Run {} coordination failed: {}", run_id, e);
            }
        });

        Ok(run_id)
    }

    /// Create run state without starting coordination (split out for tests
    /// and for callers that drive `execute_run` themselves)
    pub async fn create_run(
        &self,
        definition: &WorkflowDefinition,
        parameters: HashMap<String, Value>,
    ) -> Result<Uuid> {
        // Definitions are validated at save time; re-check so a stale or
        // hand-fed definition can never reach execution with a cycle
        StepGraph::build(definition)?;

        let mut resolved_parameters = definition.parameters.clone();
        resolved_parameters.extend(parameters);

        let secrets = self.storage.load_secrets(&definition.id).await?;
        let run_id = self
            .store
            .create_run(definition, resolved_parameters, secrets)
            .await;

        // Cancellation is accepted from the moment the run exists, even
        // before its coordinator task has started
        self.cancels
            .write()
            .await
            .insert(run_id, watch::channel(false).0);

        tracing::info!(
            "🚀 Created run {} for workflow '{}'",
            run_id,
            definition.id
        );
        Ok(run_id)
    }

    /// Request cancellation of a live run
    ///
    /// In-flight containers are killed, undispatched steps become Canceled,
    /// and already-succeeded outputs are retained. Returns false if the run
    /// is not live (unknown or already terminal).
    pub async fn cancel_run(&self, run_id: Uuid) -> bool {
        let cancels = self.cancels.read().await;
        match cancels.get(&run_id) {
            Some(sender) => {
                tracing::info!("🛑 Cancel requested for run {}", run_id);
                // send_replace records the signal even while no receiver
                // exists yet; the coordinator picks it up on subscribe
                sender.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Drive one run from Pending to a terminal status
    pub async fn execute_run(
        self: &Arc<Self>,
        definition: Arc<WorkflowDefinition>,
        run_id: Uuid,
    ) -> Result<RunStatus> {
        let graph = StepGraph::build(&definition)?;
        let steps_by_name: HashMap<String, StepDef> = definition
            .steps
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();

        let cancel_rx = {
            let mut cancels = self.cancels.write().await;
            cancels
                .entry(run_id)
                .or_insert_with(|| watch::channel(false).0)
                .subscribe()
        };

        self.store.set_run_status(run_id, RunStatus::Running).await?;

        let mut statuses: HashMap<String, StepStatus> = steps_by_name
            .keys()
            .map(|name| (name.clone(), StepStatus::Pending))
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel::<StepCompletion>();
        let mut in_flight = 0usize;

        loop {
            let canceled = *cancel_rx.borrow();
            if canceled {
                // Halt further dispatch; everything still pending is canceled
                for (name, status) in statuses.iter_mut() {
                    if *status == StepStatus::Pending {
                        *status = StepStatus::Canceled;
                        self.store
                            .set_step_terminal(
                                run_id,
                                name,
                                StepStatus::Canceled,
                                None,
                                Some("canceled before dispatch".to_string()),
                            )
                            .await?;
                    }
                }
            } else {
                let frontier = compute_frontier(&graph, &statuses);
                for name in frontier {
                    let step = &steps_by_name[&name];
                    let dispatched = self
                        .dispatch_step(run_id, step, &tx, cancel_rx.clone())
                        .await?;
                    if dispatched {
                        statuses.insert(name, StepStatus::Running);
                        in_flight += 1;
                    } else {
                        // Spec resolution failed; step is already terminal
                        statuses.insert(name.clone(), StepStatus::Failed);
                        propagate_skip(&graph, &mut statuses, &self.store, run_id, &name).await?;
                    }
                }
            }

            if in_flight == 0 {
                break;
            }

            let Some(completion) = rx.recv().await else {
                break;
            };
            in_flight -= 1;
            self.apply_completion(run_id, &graph, &mut statuses, completion)
                .await?;
        }

        // Every step is terminal in the store by now; derive the aggregate
        // from the recorded state so there is exactly one derivation rule
        let status = self
            .store
            .snapshot(run_id)
            .await
            .map(|run| run.derive_status())
            .ok_or_else(|| anyhow::anyhow!("run {} state missing at completion", run_id))?;
        self.store.set_run_status(run_id, status).await?;
        tracing::info!("🎉 Run {} finished with status {:?}", run_id, status);

        self.finalize_run(run_id).await?;
        Ok(status)
    }

    /// Resolve, credential, and launch one frontier step
    ///
    /// Returns false when the spec cannot be resolved against the current
    /// bindings (missing secret, missing output key); the step is marked
    /// Failed and never launches.
    async fn dispatch_step(
        &self,
        run_id: Uuid,
        step: &StepDef,
        tx: &mpsc::UnboundedSender<StepCompletion>,
        cancel: watch::Receiver<bool>,
    ) -> Result<bool> {
        let bindings = self.store.bindings(run_id).await?;
        let resolved = match expr::resolve_spec(&step.spec, &bindings) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!(
                    "❌ Step '{}' spec resolution failed in run {}: {}",
                    step.name,
                    run_id,
                    e
                );
                self.store
                    .set_step_terminal(
                        run_id,
                        &step.name,
                        StepStatus::Failed,
                        None,
                        Some(format!("spec resolution failed: {}", e)),
                    )
                    .await?;
                return Ok(false);
            }
        };

        self.store
            .set_step_status(run_id, &step.name, StepStatus::Runnable)
            .await?;

        let token = self.store.issue_step_token(run_id, &step.name).await;
        self.store
            .mark_step_launched(
                run_id,
                &step.name,
                resolved.values,
                resolved.secrets_used,
            )
            .await?;

        let prepared = PreparedStep {
            run_id,
            name: step.name.clone(),
            image: step.image.clone(),
            script: if step.input.is_empty() {
                None
            } else {
                Some(step.input.join("\n"))
            },
            timeout: step.timeout_seconds.map(Duration::from_secs),
            token,
        };

        let executor = Arc::clone(&self.executor);
        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = executor.execute(&prepared, cancel).await;
            // Receiver dropping means the coordinator is gone; nothing to do
            let _ = tx.send(StepCompletion {
                step: prepared.name,
                outcome,
            });
        });

        Ok(true)
    }

    /// Record a step's terminal transition and propagate skips
    async fn apply_completion(
        &self,
        run_id: Uuid,
        graph: &StepGraph,
        statuses: &mut HashMap<String, StepStatus>,
        completion: StepCompletion,
    ) -> Result<()> {
        let step = completion.step;
        match completion.outcome {
            StepOutcome::Succeeded { exit_code } => {
                statuses.insert(step.clone(), StepStatus::Succeeded);
                self.store
                    .set_step_terminal(run_id, &step, StepStatus::Succeeded, Some(exit_code), None)
                    .await?;
            }
            StepOutcome::Failed(failure) => {
                let exit_code = match &failure {
                    StepFailure::Exit(code) => Some(*code),
                    _ => None,
                };
                statuses.insert(step.clone(), StepStatus::Failed);
                self.store
                    .set_step_terminal(
                        run_id,
                        &step,
                        StepStatus::Failed,
                        exit_code,
                        Some(failure.to_string()),
                    )
                    .await?;
                propagate_skip(graph, statuses, &self.store, run_id, &step).await?;
            }
            StepOutcome::Canceled => {
                statuses.insert(step.clone(), StepStatus::Canceled);
                self.store
                    .set_step_terminal(
                        run_id,
                        &step,
                        StepStatus::Canceled,
                        None,
                        Some("canceled".to_string()),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Archive the terminal snapshot, drop live state, revoke credentials
    async fn finalize_run(&self, run_id: Uuid) -> Result<()> {
        if let Some(snapshot) = self.store.snapshot(run_id).await {
            self.storage.archive_run(&snapshot).await?;
            self.storage.prune_archived(self.retention_days).await?;
        }
        self.store.revoke_run_tokens(run_id).await;
        self.store.remove_run(run_id).await;
        self.cancels.write().await.remove(&run_id);
        Ok(())
    }
}

/// Pending steps whose full dependency set has Succeeded
fn compute_frontier(graph: &StepGraph, statuses: &HashMap<String, StepStatus>) -> Vec<String> {
    let mut frontier = Vec::new();
    for (name, status) in statuses {
        if *status != StepStatus::Pending {
            continue;
        }
        let ready = graph
            .dependencies(name)
            .iter()
            .all(|dep| statuses.get(dep) == Some(&StepStatus::Succeeded));
        if ready {
            frontier.push(name.clone());
        }
    }
    frontier
}

/// Mark every still-pending descendant of a failed/skipped step as Skipped
///
/// Re-running this over the same graph yields the same skipped set, so
/// overlapping failures converge instead of fighting.
async fn propagate_skip(
    graph: &StepGraph,
    statuses: &mut HashMap<String, StepStatus>,
    store: &MetadataStore,
    run_id: Uuid,
    from: &str,
) -> Result<()> {
    for descendant in graph.descendants(from) {
        if statuses.get(&descendant) == Some(&StepStatus::Pending) {
            statuses.insert(descendant.clone(), StepStatus::Skipped);
            store
                .set_step_status(run_id, &descendant, StepStatus::Skipped)
                .await?;
            tracing::debug!("⏭️ Step '{}' skipped in run {}", descendant, run_id);
        }
    }
    Ok(())
}
