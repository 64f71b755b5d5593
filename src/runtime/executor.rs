/// Step executor: runs exactly one container to completion
///
/// Launches the step container with the metadata endpoint and per-step
/// credential wired into its environment, then waits for termination. All
/// state exchange happens via metadata API calls made by the container
/// itself; the executor only reports the terminal result. Retries, if any,
/// are a scheduler policy, never an executor one.

use crate::runtime::container::{ContainerRuntime, LaunchError, LaunchSpec, RuntimeError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// Environment variable carrying the metadata API base URL
pub const ENV_METADATA_URL: &str = "RELAY_METADATA_URL";
/// Environment variable carrying the per-step credential
pub const ENV_STEP_TOKEN: &str = "RELAY_STEP_TOKEN";

/// Why a step failed, preserved as a distinct kind per failure class
#[derive(Debug, Clone, Error)]
pub enum StepFailure {
    #[error("launch: {0}")]
    Launch(#[from] LaunchError),
    #[error("exited with code {0}")]
    Exit(i64),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("runtime: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Terminal result of one step container execution
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Exit code 0
    Succeeded { exit_code: i64 },
    /// Launch error, nonzero exit, timeout, or runtime fault
    Failed(StepFailure),
    /// The run was canceled while this container was in flight
    Canceled,
}

/// A step with its spec resolved and credential issued, ready to launch
#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub run_id: Uuid,
    pub name: String,
    pub image: String,
    /// Script assembled from the step's input lines, run via the container shell
    pub script: Option<String>,
    /// Per-step duration budget; falls back to the configured default
    pub timeout: Option<Duration>,
    /// Metadata API credential scoped to this step run
    pub token: String,
}

/// Launches step containers and reports terminal results
#[derive(Debug)]
pub struct StepExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    /// Metadata API base URL advertised to containers
    metadata_url: String,
    default_timeout: Duration,
}

impl StepExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        metadata_url: impl Into<String>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            metadata_url: metadata_url.into(),
            default_timeout,
        }
    }

    /// Run one step container to termination
    ///
    /// Exit 0 maps to Succeeded, nonzero to Failed with the exit code.
    /// Exceeding the duration budget kills the container and fails with the
    /// timeout kind. A cancel signal kills the container and yields Canceled.
    /// Outputs the container already committed stay durable in every case.
    pub async fn execute(
        &self,
        step: &PreparedStep,
        cancel: watch::Receiver<bool>,
    ) -> StepOutcome {
        let mut env = HashMap::new();
        env.insert(ENV_METADATA_URL.to_string(), self.metadata_url.clone());
        env.insert(ENV_STEP_TOKEN.to_string(), step.token.clone());

        let command = step
            .script
            .as_ref()
            .map(|script| vec!["/bin/sh".to_string(), "-c".to_string(), script.clone()]);

        let spec = LaunchSpec {
            image: step.image.clone(),
            env,
            command,
            ports: vec![],
        };

        tracing::info!(
            "🚀 Launching step '{}' (image: {}) for run {}",
            step.name,
            step.image,
            step.run_id
        );

        let handle = match self.runtime.launch(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("❌ Step '{}' failed to launch: {}", step.name, e);
                return StepOutcome::Failed(StepFailure::Launch(e));
            }
        };

        let budget = step.timeout.unwrap_or(self.default_timeout);
        let timeout_secs = budget.as_secs();

        tokio::select! {
            result = self.runtime.wait(&handle) => match result {
                Ok(0) => {
                    tracing::info!("✅ Step '{}' succeeded", step.name);
                    StepOutcome::Succeeded { exit_code: 0 }
                }
                Ok(code) => {
                    tracing::warn!("❌ Step '{}' exited with code {}", step.name, code);
                    StepOutcome::Failed(StepFailure::Exit(code))
                }
                Err(e) => {
                    tracing::error!("❌ Step '{}' wait failed: {}", step.name, e);
                    StepOutcome::Failed(StepFailure::Runtime(e))
                }
            },
            _ = tokio::time::sleep(budget) => {
                tracing::warn!("⏱️ Step '{}' exceeded its {}s budget - killing", step.name, timeout_secs);
                if let Err(e) = self.runtime.kill(&handle).await {
                    tracing::warn!("⚠️ Failed to kill timed-out container: {}", e);
                }
                StepOutcome::Failed(StepFailure::Timeout(timeout_secs))
            },
            _ = wait_for_cancel(cancel) => {
                tracing::info!("🛑 Step '{}' canceled - killing container", step.name);
                if let Err(e) = self.runtime.kill(&handle).await {
                    tracing::warn!("⚠️ Failed to kill canceled container: {}", e);
                }
                StepOutcome::Canceled
            },
        }
    }
}

/// Resolves when the cancel flag flips to true; never resolves if the
/// sender goes away without canceling
async fn wait_for_cancel(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{FakeBehavior, FakeRuntime};

    fn prepared(image: &str, timeout: Option<Duration>) -> PreparedStep {
        PreparedStep {
            run_id: Uuid::new_v4(),
            name: "step".to_string(),
            image: image.to_string(),
            script: Some("echo hello".to_string()),
            timeout,
            token: "tok".to_string(),
        }
    }

    fn executor(runtime: Arc<FakeRuntime>) -> StepExecutor {
        StepExecutor::new(runtime, "http://127.0.0.1:3004", Duration::from_secs(60))
    }

    #[tokio::test]
    async fn zero_exit_succeeds() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.behave("ok", FakeBehavior::Exit(0)).await;
        let (_, cancel) = watch::channel(false);

        let outcome = executor(Arc::clone(&runtime))
            .execute(&prepared("ok", None), cancel)
            .await;
        assert!(matches!(outcome, StepOutcome::Succeeded { exit_code: 0 }));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_code() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.behave("boom", FakeBehavior::Exit(137)).await;
        let (_, cancel) = watch::channel(false);

        let outcome = executor(Arc::clone(&runtime))
            .execute(&prepared("boom", None), cancel)
            .await;
        match outcome {
            StepOutcome::Failed(StepFailure::Exit(code)) => assert_eq!(code, 137),
            other => panic!("expected exit failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn launch_error_is_a_distinct_kind() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime
            .behave(
                "ghost",
                FakeBehavior::FailLaunch(LaunchError::ImagePull("manifest unknown".to_string())),
            )
            .await;
        let (_, cancel) = watch::channel(false);

        let outcome = executor(Arc::clone(&runtime))
            .execute(&prepared("ghost", None), cancel)
            .await;
        assert!(matches!(
            outcome,
            StepOutcome::Failed(StepFailure::Launch(LaunchError::ImagePull(_)))
        ));
    }

    #[tokio::test]
    async fn exceeding_budget_times_out_and_kills() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.behave("slow", FakeBehavior::RunForever).await;
        let (_, cancel) = watch::channel(false);

        let outcome = executor(Arc::clone(&runtime))
            .execute(
                &prepared("slow", Some(Duration::from_millis(50))),
                cancel,
            )
            .await;
        assert!(matches!(
            outcome,
            StepOutcome::Failed(StepFailure::Timeout(_))
        ));
        assert_eq!(runtime.kill_count().await, 1);
    }

    #[tokio::test]
    async fn cancel_signal_kills_in_flight_container() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.behave("slow", FakeBehavior::RunForever).await;
        let (cancel_tx, cancel) = watch::channel(false);

        let exec = executor(Arc::clone(&runtime));
        let step = prepared("slow", None);
        let task = tokio::spawn(async move { exec.execute(&step, cancel).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_tx.send(true).unwrap();

        let outcome = task.await.unwrap();
        assert!(matches!(outcome, StepOutcome::Canceled));
        assert_eq!(runtime.kill_count().await, 1);
    }

    #[tokio::test]
    async fn container_env_carries_endpoint_and_token() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.behave("ok", FakeBehavior::Exit(0)).await;
        let (_, cancel) = watch::channel(false);

        executor(Arc::clone(&runtime))
            .execute(&prepared("ok", None), cancel)
            .await;

        let launches = runtime.launches().await;
        assert_eq!(launches.len(), 1);
        assert_eq!(
            launches[0].env.get(ENV_METADATA_URL).map(String::as_str),
            Some("http://127.0.0.1:3004")
        );
        assert_eq!(
            launches[0].env.get(ENV_STEP_TOKEN).map(String::as_str),
            Some("tok")
        );
    }
}
