//! Compose orchestrator
//!
//! Ties the pieces together for one project: resolve the start order,
//! optionally build images, provision shared resources, launch and
//! supervise the services, and tear everything down in reverse order.

use super::launcher::Launcher;
use super::model::Project;
use super::provisioner::Provisioner;
use super::resolver::DependencyResolver;
use super::supervisor::{ServiceState, ServiceStatus, Supervisor};
use crate::engine::{stop_gracefully, BuildRequest, ContainerHandle, ContainerRuntime, ImageBuilder};
use crate::error::{ComposeError, Result};
use crate::settings::Settings;
use crate::storage::VolumeManager;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

/// Options of `up`
#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    /// Services to start; empty means all. Dependencies are always included.
    pub services: Vec<String>,
    /// Build images before starting
    pub build: bool,
}

/// Result of bringing a project up
#[derive(Debug, Clone, Default)]
pub struct UpReport {
    /// Identifier of this run, recorded on its log span
    pub run_id: String,
    /// Services whose container started, in start order
    pub started: Vec<String>,
    /// Services that could not start, with the reason
    pub failed: Vec<(String, String)>,
}

impl UpReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Why supervision ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuperviseOutcome {
    /// The shutdown signal fired
    Interrupted,
    /// A service failed while failures abort the run
    Aborted(String),
    /// Every service reached a terminal state
    Finished,
}

/// Volume as shown by the `volumes` command
#[derive(Debug, Clone)]
pub struct VolumeStatus {
    /// Name inside the descriptor
    pub name: String,
    /// Provisioned resource name
    pub resource_name: String,
    pub external: bool,
    /// Host directory, if the volume exists
    pub mountpoint: Option<PathBuf>,
    /// Size in bytes, if the volume exists
    pub size: Option<u64>,
}

/// Compose orchestrator
pub struct ComposeOrchestrator {
    project: Arc<Project>,
    runtime: Arc<dyn ContainerRuntime>,
    builder: Arc<dyn ImageBuilder>,
    volumes: Arc<VolumeManager>,
    settings: Settings,
    supervisor: Option<Arc<Supervisor>>,
}

impl ComposeOrchestrator {
    /// Create a new orchestrator
    pub fn new(
        project: Project,
        runtime: Arc<dyn ContainerRuntime>,
        builder: Arc<dyn ImageBuilder>,
        volumes: Arc<VolumeManager>,
        settings: Settings,
    ) -> Self {
        Self {
            project: Arc::new(project),
            runtime,
            builder,
            volumes,
            settings,
            supervisor: None,
        }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Start order of `selected` (all when empty) and their dependencies
    pub fn start_order(&self, selected: &[String]) -> Result<Vec<String>> {
        DependencyResolver::new(&self.project).start_order_for(selected)
    }

    /// Start the project and wait until every selected service has started or failed
    pub async fn up(&mut self, options: UpOptions) -> Result<UpReport> {
        if self.supervisor.is_some() {
            return Err(ComposeError::Runtime(format!(
                "project {} is already up",
                self.project.name
            )));
        }

        let order = self.start_order(&options.services)?;
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("up", project = %self.project.name, run = %run_id);

        self.bring_up(order, run_id, options.build)
            .instrument(span)
            .await
    }

    async fn bring_up(&mut self, order: Vec<String>, run_id: String, build: bool) -> Result<UpReport> {
        tracing::info!("Starting compose project: {}", self.project.name);
        tracing::debug!("Start order: {:?}", order);

        if build {
            self.build_services(&order).await?;
        }

        let report = Provisioner::new(&self.project, &self.volumes, self.runtime.as_ref())
            .provision(&order)
            .await;

        let supervisor = Arc::new(Supervisor::new(
            self.runtime.clone(),
            &order,
            self.settings.backoff,
        ));
        Launcher::new(
            self.project.clone(),
            supervisor.clone(),
            self.volumes.clone(),
            self.settings.stop_grace,
        )
        .launch(&order, Arc::new(report))?;

        supervisor.wait_settled().await;
        self.supervisor = Some(supervisor.clone());

        let mut up = UpReport {
            run_id,
            ..Default::default()
        };
        for name in &order {
            let state = supervisor.state(name)?;
            match state.error {
                Some(error) if state.status == ServiceStatus::Failed => {
                    up.failed.push((name.clone(), error))
                }
                _ => up.started.push(name.clone()),
            }
        }

        if up.is_complete() {
            tracing::info!("Project {} is up", self.project.name);
        } else {
            tracing::warn!(
                "Project {} is up with {} failed service(s)",
                self.project.name,
                up.failed.len()
            );
        }
        Ok(up)
    }

    /// Supervise a project that is up until `shutdown` resolves.
    ///
    /// With `abort_on_failure`, the first failed service ends supervision.
    pub async fn supervise<F>(&self, shutdown: F, abort_on_failure: bool) -> Result<SuperviseOutcome>
    where
        F: Future<Output = ()>,
    {
        let supervisor = self
            .supervisor
            .as_ref()
            .ok_or_else(|| ComposeError::Runtime(format!("project {} is not up", self.project.name)))?;
        let mut changes = supervisor.subscribe();
        tokio::pin!(shutdown);

        loop {
            let states = supervisor.states()?;
            if abort_on_failure {
                if let Some(failed) = states.iter().find(|s| s.status == ServiceStatus::Failed) {
                    tracing::warn!("Service {} failed, aborting", failed.name);
                    return Ok(SuperviseOutcome::Aborted(failed.name.clone()));
                }
            }
            if states.iter().all(|s| s.status.is_terminal()) {
                tracing::info!("All services of {} have exited", self.project.name);
                return Ok(SuperviseOutcome::Finished);
            }

            tokio::select! {
                _ = &mut shutdown => return Ok(SuperviseOutcome::Interrupted),
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Ok(SuperviseOutcome::Finished);
                    }
                }
            }
        }
    }

    /// Stop and remove every container of the project in reverse dependency order
    pub async fn down(&mut self, remove_volumes: bool) -> Result<()> {
        tracing::info!("Stopping compose project: {}", self.project.name);

        let order = DependencyResolver::new(&self.project).stop_order()?;
        let supervisor = self.supervisor.take();

        for name in &order {
            let service = self
                .project
                .service(name)
                .ok_or_else(|| ComposeError::ServiceNotFound(name.clone()))?;
            let grace = service.stop_grace_period.unwrap_or(self.settings.stop_grace);

            let handle = match &supervisor {
                Some(sup) if sup.supervises(name) => sup.stop(name).await?.container,
                Some(_) => None,
                None => {
                    // Containers of an earlier run are addressed by name
                    let handle =
                        ContainerHandle::named(&service.container_name(&self.project.name), name);
                    if let Err(e) = stop_gracefully(self.runtime.as_ref(), &handle, grace).await {
                        tracing::debug!("Container {} was not running: {}", handle.name, e);
                    }
                    Some(handle)
                }
            };

            if let Some(handle) = handle {
                match self.runtime.remove(&handle).await {
                    Ok(()) => tracing::info!("Removed container {}", handle.name),
                    Err(e) => tracing::debug!("Container {} not removed: {}", handle.name, e),
                }
            }
        }

        for network in self.project.networks.iter().filter(|n| !n.external) {
            if let Err(e) = self.runtime.remove_network(&network.resource_name).await {
                tracing::debug!("Network {} not removed: {}", network.resource_name, e);
            }
        }

        if remove_volumes {
            for volume in self.project.volumes.iter().filter(|v| !v.external) {
                if !self.volumes.exists(&volume.resource_name)? {
                    continue;
                }
                if let Err(e) = self.volumes.remove(&volume.resource_name, false) {
                    tracing::warn!("Volume {} not removed: {}", volume.resource_name, e);
                }
            }
        }

        Ok(())
    }

    /// Build images for `selected` services (all when empty) that have a build section
    pub async fn build_services(&self, selected: &[String]) -> Result<Vec<String>> {
        for name in selected {
            if self.project.service(name).is_none() {
                return Err(ComposeError::ServiceNotFound(name.clone()));
            }
        }

        let mut built = Vec::new();
        for service in &self.project.services {
            if !selected.is_empty() && !selected.contains(&service.name) {
                continue;
            }
            let Some(build) = &service.build else {
                continue;
            };

            tracing::info!("Building image for service: {}", service.name);
            let request = BuildRequest {
                tag: service.image_ref(&self.project.name),
                context: build.context.clone(),
                dockerfile: build.dockerfile.as_ref().map(|d| build.context.join(d)),
                args: build.args.clone(),
                target: build.target.clone(),
            };
            self.builder.build(&request).await?;
            built.push(request.tag);
        }

        Ok(built)
    }

    /// State of every supervised service; empty when the project is not up
    pub fn status(&self) -> Result<Vec<ServiceState>> {
        match &self.supervisor {
            Some(supervisor) => supervisor.states(),
            None => Ok(Vec::new()),
        }
    }

    /// Declared volumes with their host directory and size
    pub fn volume_status(&self) -> Result<Vec<VolumeStatus>> {
        let mut list = Vec::with_capacity(self.project.volumes.len());
        for spec in &self.project.volumes {
            let existing = self.volumes.get(&spec.resource_name).ok();
            let size = match &existing {
                Some(volume) => Some(volume.size()?),
                None => None,
            };
            list.push(VolumeStatus {
                name: spec.name.clone(),
                resource_name: spec.resource_name.clone(),
                external: spec.external,
                mountpoint: existing.map(|v| v.mountpoint),
                size,
            });
        }
        Ok(list)
    }
}
