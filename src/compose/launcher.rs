//! Service launching
//!
//! Every selected service gets its own task. The task waits until all of
//! its dependencies are ready, resolves the container spec (environment
//! files are read at this point) and hands the container to the
//! supervisor. Services whose dependencies are ready launch concurrently.

use super::env::load_env_files;
use super::model::{DependencyCondition, MountKind, Project, Service};
use super::provisioner::ProvisionReport;
use super::supervisor::{stop_requested, Readiness, Supervisor};
use crate::engine::{ContainerSpec, MountBinding, PROJECT_LABEL, SERVICE_LABEL};
use crate::error::{ComposeError, Result};
use crate::storage::VolumeManager;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Build the container spec of `service`.
///
/// Inline `environment` entries override env file values; an entry without
/// a value is taken from the process environment.
pub fn container_spec(
    project: &Project,
    service: &Service,
    report: &ProvisionReport,
) -> Result<ContainerSpec> {
    let mut env: BTreeMap<String, String> = load_env_files(&service.env_files)
        .map_err(|e| ComposeError::launch(&service.name, e))?
        .into_iter()
        .collect();

    for (key, value) in &service.environment {
        match value {
            Some(value) => {
                env.insert(key.clone(), value.clone());
            }
            None => {
                if let Ok(value) = std::env::var(key) {
                    env.insert(key.clone(), value);
                }
            }
        }
    }

    let mut mounts = Vec::with_capacity(service.mounts.len());
    for mount in &service.mounts {
        let source = match mount.kind {
            MountKind::Volume => {
                let name = mount.source.as_deref().unwrap_or_default();
                let path = report.volumes.get(name).ok_or_else(|| {
                    ComposeError::launch(&service.name, format!("volume {} is not provisioned", name))
                })?;
                Some(path.clone())
            }
            MountKind::Bind => mount.source.as_ref().map(PathBuf::from),
            MountKind::Anonymous => None,
        };
        mounts.push(MountBinding {
            source,
            target: mount.target.clone(),
            read_only: mount.read_only,
        });
    }

    let mut networks = Vec::with_capacity(service.networks.len());
    for name in &service.networks {
        let resource = report.networks.get(name).ok_or_else(|| {
            ComposeError::launch(&service.name, format!("network {} is not provisioned", name))
        })?;
        networks.push(resource.clone());
    }

    let mut labels = service.labels.clone();
    labels.insert(PROJECT_LABEL.to_string(), project.name.clone());
    labels.insert(SERVICE_LABEL.to_string(), service.name.clone());

    Ok(ContainerSpec {
        name: service.container_name(&project.name),
        service: service.name.clone(),
        image: service.image_ref(&project.name),
        entrypoint: service.entrypoint.clone(),
        command: service.command.clone(),
        env,
        mounts,
        ports: service.ports.clone(),
        networks,
        labels,
        working_dir: service.working_dir.clone(),
        user: service.user.clone(),
        hostname: service.hostname.clone(),
    })
}

/// Launches the services of a project under a supervisor
pub struct Launcher {
    project: Arc<Project>,
    supervisor: Arc<Supervisor>,
    volumes: Arc<VolumeManager>,
    default_grace: Duration,
}

impl Launcher {
    pub fn new(
        project: Arc<Project>,
        supervisor: Arc<Supervisor>,
        volumes: Arc<VolumeManager>,
        default_grace: Duration,
    ) -> Self {
        Self {
            project,
            supervisor,
            volumes,
            default_grace,
        }
    }

    /// Spawn one launch task per service in `services`
    pub fn launch(&self, services: &[String], report: Arc<ProvisionReport>) -> Result<()> {
        for name in services {
            let service = self
                .project
                .service(name)
                .cloned()
                .ok_or_else(|| ComposeError::ServiceNotFound(name.clone()))?;

            let task = tokio::spawn(launch_service(
                self.project.clone(),
                service,
                self.supervisor.clone(),
                self.volumes.clone(),
                report.clone(),
                self.default_grace,
            ));
            self.supervisor.attach(name, task)?;
        }
        Ok(())
    }
}

enum Gate {
    Open,
    Blocked(ComposeError),
    Stopped,
}

async fn settled(rx: &mut watch::Receiver<Readiness>) -> Readiness {
    match rx.wait_for(|r| *r != Readiness::Waiting).await {
        Ok(r) => r.clone(),
        Err(_) => Readiness::Failed("supervisor gone".to_string()),
    }
}

/// Wait until every dependency of `service` is ready
async fn dependencies_ready(service: &Service, supervisor: &Supervisor) -> Gate {
    let Some(mut stop) = supervisor.stop_signal(&service.name) else {
        return Gate::Stopped;
    };

    for dep in &service.depends_on {
        if dep.condition != DependencyCondition::ServiceStarted {
            tracing::warn!(
                "Service {} waits for {} to be started; condition {:?} is treated as started",
                service.name,
                dep.service,
                dep.condition
            );
        }

        let Some(mut readiness) = supervisor.readiness(&dep.service) else {
            return Gate::Blocked(ComposeError::DependencyFailed {
                service: service.name.clone(),
                dependency: dep.service.clone(),
            });
        };

        let outcome = tokio::select! {
            r = settled(&mut readiness) => r,
            _ = stop_requested(&mut stop) => return Gate::Stopped,
        };

        if outcome != Readiness::Ready {
            return Gate::Blocked(ComposeError::DependencyFailed {
                service: service.name.clone(),
                dependency: dep.service.clone(),
            });
        }
    }

    Gate::Open
}

async fn launch_service(
    project: Arc<Project>,
    service: Service,
    supervisor: Arc<Supervisor>,
    volumes: Arc<VolumeManager>,
    report: Arc<ProvisionReport>,
    default_grace: Duration,
) {
    match dependencies_ready(&service, &supervisor).await {
        Gate::Open => {}
        Gate::Blocked(e) => {
            supervisor.fail(&service.name, &e);
            return;
        }
        Gate::Stopped => {
            supervisor.abandon(&service.name);
            return;
        }
    }

    if let Some(e) = report.blocking(&service) {
        supervisor.fail(
            &service.name,
            &ComposeError::launch(&service.name, e),
        );
        return;
    }

    let spec = match container_spec(&project, &service, &report) {
        Ok(spec) => spec,
        Err(e) => {
            supervisor.fail(&service.name, &e);
            return;
        }
    };

    let mounted: Vec<String> = service
        .volume_names()
        .filter_map(|name| project.volume(name))
        .map(|v| v.resource_name.clone())
        .collect();
    for volume in &mounted {
        if let Err(e) = volumes.add_reference(volume) {
            tracing::debug!("Not counting reference to {}: {}", volume, e);
        }
    }

    let grace = service.stop_grace_period.unwrap_or(default_grace);
    supervisor.run(spec, service.restart, grace).await;

    for volume in &mounted {
        if let Err(e) = volumes.remove_reference(volume) {
            tracing::debug!("Not releasing reference to {}: {}", volume, e);
        }
    }
}
