//! Container engine abstraction
//!
//! The orchestrator never runs containers or builds images itself. It drives
//! an engine through the two traits below; [`docker::DockerCli`] implements
//! both on top of the `docker` command line.

pub mod docker;
#[cfg(test)]
pub(crate) mod testing;

use crate::compose::model::PortMapping;
use crate::error::{ComposeError, Result};
use crate::network::NetworkSpec;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub use docker::DockerCli;

/// Label carrying the project name on every container
pub const PROJECT_LABEL: &str = "com.docker.compose.project";
/// Label carrying the service name on every container
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

/// Everything the engine needs to start one service container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Service the container belongs to
    pub service: String,
    /// Image reference
    pub image: String,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    /// Fully resolved environment
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<MountBinding>,
    pub ports: Vec<PortMapping>,
    /// Engine network names to join
    pub networks: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
}

/// A mount as the engine sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountBinding {
    /// Host path; `None` for an anonymous volume
    pub source: Option<PathBuf>,
    /// Path inside the container
    pub target: String,
    pub read_only: bool,
}

/// Reference to a started container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Engine identifier
    pub id: String,
    /// Container name
    pub name: String,
    /// Service the container belongs to
    pub service: String,
}

impl ContainerHandle {
    /// Handle addressing a container by name, for containers started by an earlier run
    pub fn named(name: &str, service: &str) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
            service: service.to_string(),
        }
    }
}

/// Image build request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Tag given to the built image
    pub tag: String,
    pub context: PathBuf,
    pub dockerfile: Option<PathBuf>,
    pub args: BTreeMap<String, String>,
    pub target: Option<String>,
}

/// Container runtime the orchestrator drives
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create `network` unless it already exists. Returns whether it was created.
    async fn ensure_network(&self, network: &NetworkSpec) -> Result<bool>;

    /// Whether an engine network called `name` exists
    async fn network_exists(&self, name: &str) -> Result<bool>;

    /// Remove the engine network called `name`
    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Create and start a container, replacing a leftover one with the same name
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Wait for the container to exit and return its exit code
    async fn wait(&self, handle: &ContainerHandle) -> Result<i32>;

    /// Ask the container to terminate
    async fn stop(&self, handle: &ContainerHandle) -> Result<()>;

    /// Terminate the container immediately
    async fn kill(&self, handle: &ContainerHandle) -> Result<()>;

    /// Remove a stopped container
    async fn remove(&self, handle: &ContainerHandle) -> Result<()>;
}

/// Image builder the orchestrator drives
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> Result<()>;
}

/// Ask a container to stop and force it after `grace`.
///
/// Returns the exit code when the container stopped within the grace period,
/// `None` when it had to be killed, and a timeout error when even the kill
/// did not end it within another grace period.
pub async fn stop_gracefully(
    runtime: &dyn ContainerRuntime,
    handle: &ContainerHandle,
    grace: Duration,
) -> Result<Option<i32>> {
    runtime.stop(handle).await?;

    match tokio::time::timeout(grace, runtime.wait(handle)).await {
        Ok(code) => code.map(Some),
        Err(_) => {
            tracing::warn!(
                "Container {} did not stop within {:?}, killing it",
                handle.name,
                grace
            );
            runtime.kill(handle).await?;
            match tokio::time::timeout(grace, runtime.wait(handle)).await {
                Ok(_) => Ok(None),
                Err(_) => Err(ComposeError::Timeout(format!(
                    "container {} did not exit after being killed",
                    handle.name
                ))),
            }
        }
    }
}
