/// Scripted container runtime for executor and scheduler tests
///
/// Behaviors are keyed by image name. A behavior can exit with a code,
/// hang until killed, fail to launch, or write outputs through the metadata
/// store exactly the way a real step container would (authenticating with
/// the credential injected into its environment).

use crate::metadata::store::MetadataStore;
use crate::runtime::container::{
    ContainerHandle, ContainerRuntime, LaunchError, LaunchSpec, RuntimeError,
};
use crate::runtime::executor::ENV_STEP_TOKEN;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum FakeBehavior {
    /// Terminate immediately with this exit code
    Exit(i64),
    /// Never terminate; only a kill ends it
    RunForever,
    /// Refuse to launch
    FailLaunch(LaunchError),
    /// Write outputs via the metadata store as the step's own identity, then exit 0
    WriteOutputs(Vec<(String, Value)>),
}

#[derive(Debug, Clone)]
struct ActiveContainer {
    behavior: FakeBehavior,
    env: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct FakeRuntime {
    store: Mutex<Option<Arc<MetadataStore>>>,
    behaviors: Mutex<HashMap<String, FakeBehavior>>,
    active: Mutex<HashMap<String, ActiveContainer>>,
    launches: Mutex<Vec<LaunchSpec>>,
    kills: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire in the store so WriteOutputs behaviors can act like real containers
    pub async fn attach_store(&self, store: Arc<MetadataStore>) {
        *self.store.lock().await = Some(store);
    }

    /// Script the behavior for an image
    pub async fn behave(&self, image: &str, behavior: FakeBehavior) {
        self.behaviors
            .lock()
            .await
            .insert(image.to_string(), behavior);
    }

    /// Every launch spec seen, in order
    pub async fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().await.clone()
    }

    pub async fn kill_count(&self) -> usize {
        self.kills.lock().await.len()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn launch(&self, spec: LaunchSpec) -> Result<ContainerHandle, LaunchError> {
        self.launches.lock().await.push(spec.clone());

        let behavior = self
            .behaviors
            .lock()
            .await
            .get(&spec.image)
            .cloned()
            .unwrap_or(FakeBehavior::Exit(0));

        if let FakeBehavior::FailLaunch(error) = behavior {
            return Err(error);
        }

        let id = Uuid::new_v4().to_string();
        self.active.lock().await.insert(
            id.clone(),
            ActiveContainer {
                behavior,
                env: spec.env,
            },
        );
        Ok(ContainerHandle { id })
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let container = self
            .active
            .lock()
            .await
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| RuntimeError::Operation("unknown container".to_string()))?;

        match container.behavior {
            FakeBehavior::Exit(code) => Ok(code),
            FakeBehavior::RunForever => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            FakeBehavior::WriteOutputs(outputs) => {
                let store = self.store.lock().await.clone();
                let store = store
                    .ok_or_else(|| RuntimeError::Operation("no store attached".to_string()))?;
                let token = container
                    .env
                    .get(ENV_STEP_TOKEN)
                    .ok_or_else(|| RuntimeError::Operation("no credential in env".to_string()))?;
                let identity = store
                    .resolve_token(token)
                    .await
                    .ok_or_else(|| RuntimeError::Operation("credential rejected".to_string()))?;
                for (key, value) in outputs {
                    store
                        .set_output(&identity, &key, value)
                        .await
                        .map_err(|e| RuntimeError::Operation(e.to_string()))?;
                }
                Ok(0)
            }
            FakeBehavior::FailLaunch(_) => unreachable!("rejected at launch"),
        }
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.kills.lock().await.push(handle.id.clone());
        self.active.lock().await.remove(&handle.id);
        Ok(())
    }
}
