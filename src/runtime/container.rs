/// Container runtime boundary
///
/// The orchestration core only needs three primitives from the underlying
/// runtime: launch an image with env/command, wait for its exit code, and
/// kill it. Everything else (node placement, resource limits) belongs to the
/// runtime itself. The default implementation shells out to the docker CLI;
/// tests substitute a scripted fake.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

/// Everything needed to start one container
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// OCI image reference
    pub image: String,
    /// Environment variables injected at launch (metadata endpoint, credential)
    pub env: HashMap<String, String>,
    /// Optional command override (e.g., ["/bin/sh", "-c", script])
    pub command: Option<Vec<String>>,
    /// Host-to-container port publications, used for trigger listeners
    pub ports: Vec<(u16, u16)>,
}

/// Opaque handle to a launched container
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
}

/// Launch failures, distinct from in-container execution failures
///
/// A step that fails to launch never runs and never makes a metadata call,
/// so these kinds surface separately from nonzero exits.
#[derive(Debug, Clone, Error)]
pub enum LaunchError {
    #[error("image pull failed: {0}")]
    ImagePull(String),
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("launch failed: {0}")]
    Other(String),
}

/// Failures while waiting on or killing a running container
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("runtime operation failed: {0}")]
    Operation(String),
}

/// The launch/wait/kill primitive the orchestrator builds on
#[async_trait]
pub trait ContainerRuntime: Send + Sync + fmt::Debug {
    /// Start a container; returns once the container is created and running
    async fn launch(&self, spec: LaunchSpec) -> Result<ContainerHandle, LaunchError>;

    /// Block until the container terminates; returns its exit code
    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError>;

    /// Force-stop and remove the container
    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;
}

/// Docker CLI-backed runtime
///
/// Launches detached containers with `docker run -d`, waits via `docker wait`,
/// and removes them after the fact. Pull errors reported on stderr map to the
/// distinct `ImagePull` kind.
#[derive(Debug, Clone)]
pub struct DockerCliRuntime {
    docker_bin: String,
}

impl DockerCliRuntime {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn launch(&self, spec: LaunchSpec) -> Result<ContainerHandle, LaunchError> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.arg("run").arg("-d");

        for (key, value) in &spec.env {
            cmd.arg("-e").arg(format!("{}={}", key, value));
        }
        for (host, container) in &spec.ports {
            cmd.arg("-p").arg(format!("{}:{}", host, container));
        }

        cmd.arg(&spec.image);
        if let Some(command) = &spec.command {
            cmd.args(command);
        }

        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        tracing::debug!("🐳 Launching container image: {}", spec.image);
        let output = cmd
            .output()
            .await
            .map_err(|e| LaunchError::RuntimeUnavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let lowered = stderr.to_lowercase();
            if lowered.contains("pull access denied")
                || lowered.contains("manifest unknown")
                || lowered.contains("not found")
                || lowered.contains("no such image")
            {
                return Err(LaunchError::ImagePull(stderr));
            }
            return Err(LaunchError::Other(stderr));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(LaunchError::Other("docker returned no container id".to_string()));
        }
        tracing::debug!("🐳 Container started: {}", id);
        Ok(ContainerHandle { id })
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let output = Command::new(&self.docker_bin)
            .arg("wait")
            .arg(&handle.id)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::Operation(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(RuntimeError::Operation(stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let exit_code = stdout
            .parse::<i64>()
            .map_err(|_| RuntimeError::Operation(format!("unparseable exit code: {}", stdout)))?;

        // Waited containers are done; remove them so they don't accumulate
        let _ = Command::new(&self.docker_bin)
            .arg("rm")
            .arg(&handle.id)
            .output()
            .await;

        Ok(exit_code)
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let output = Command::new(&self.docker_bin)
            .arg("rm")
            .arg("-f")
            .arg(&handle.id)
            .output()
            .await
            .map_err(|e| RuntimeError::Operation(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(RuntimeError::Operation(stderr));
        }
        tracing::debug!("🛑 Container removed: {}", handle.id);
        Ok(())
    }
}
