//! Shared resource provisioning
//!
//! Volumes and networks are ensured before any service that uses them is
//! launched. Ensuring is idempotent. A resource that cannot be provisioned
//! is recorded in the report instead of aborting the run, so only the
//! services that use it are held back.

use super::model::{Project, Service, VolumeSpec};
use crate::engine::ContainerRuntime;
use crate::error::{ComposeError, Result};
use crate::network::NetworkSpec;
use crate::storage::{VolumeDriver, VolumeManager};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Outcome of provisioning a project's resources
#[derive(Debug, Default)]
pub struct ProvisionReport {
    /// Host directory of every usable volume, by descriptor name
    pub volumes: BTreeMap<String, PathBuf>,
    /// Engine name of every usable network, by descriptor name
    pub networks: BTreeMap<String, String>,
    /// Volumes created during this run
    pub created: Vec<String>,
    /// Resources that could not be provisioned, by resource key
    pub failures: BTreeMap<String, ComposeError>,
}

impl ProvisionReport {
    /// The first failed resource `service` uses, if any
    pub fn blocking(&self, service: &Service) -> Option<&ComposeError> {
        service
            .volume_names()
            .map(volume_key)
            .chain(service.networks.iter().map(|n| network_key(n)))
            .find_map(|key| self.failures.get(&key))
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

fn volume_key(name: &str) -> String {
    format!("volume {}", name)
}

fn network_key(name: &str) -> String {
    format!("network {}", name)
}

/// Ensures volumes and networks of a project exist
pub struct Provisioner<'a> {
    project: &'a Project,
    volumes: &'a VolumeManager,
    runtime: &'a dyn ContainerRuntime,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        project: &'a Project,
        volumes: &'a VolumeManager,
        runtime: &'a dyn ContainerRuntime,
    ) -> Self {
        Self {
            project,
            volumes,
            runtime,
        }
    }

    /// Provision the resources used by `services`
    pub async fn provision(&self, services: &[String]) -> ProvisionReport {
        let mut report = ProvisionReport::default();
        let used: Vec<&Service> = services
            .iter()
            .filter_map(|name| self.project.service(name))
            .collect();

        for volume in &self.project.volumes {
            if !used.iter().any(|s| s.volume_names().any(|v| v == volume.name)) {
                continue;
            }
            match self.ensure_volume(volume) {
                Ok((path, created)) => {
                    if created {
                        report.created.push(volume.name.clone());
                    }
                    report.volumes.insert(volume.name.clone(), path);
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    report.failures.insert(volume_key(&volume.name), e);
                }
            }
        }

        for network in &self.project.networks {
            if !used.iter().any(|s| s.networks.contains(&network.name)) {
                continue;
            }
            match self.ensure_network(network).await {
                Ok(()) => {
                    report
                        .networks
                        .insert(network.name.clone(), network.resource_name.clone());
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    report.failures.insert(network_key(&network.name), e);
                }
            }
        }

        report
    }

    /// Ensure one volume. External volumes must already exist.
    pub fn ensure_volume(&self, volume: &VolumeSpec) -> Result<(PathBuf, bool)> {
        if volume.external {
            return match self.volumes.get(&volume.resource_name) {
                Ok(existing) => Ok((existing.mountpoint, false)),
                Err(_) => Err(ComposeError::provision(
                    &volume.resource_name,
                    "external volume does not exist",
                )),
            };
        }

        let mut labels: HashMap<String, String> = volume
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(
            crate::engine::PROJECT_LABEL.to_string(),
            self.project.name.clone(),
        );
        labels.insert("com.docker.compose.volume".to_string(), volume.name.clone());

        let (created, fresh) = self.volumes.ensure(
            &volume.resource_name,
            volume.driver.as_deref().map(VolumeDriver::from),
            volume.driver_opts.clone().into_iter().collect(),
            labels,
        )?;

        if fresh {
            tracing::info!("Volume {} created", volume.resource_name);
        } else {
            tracing::debug!("Volume {} already exists", volume.resource_name);
        }
        Ok((created.mountpoint, fresh))
    }

    /// Ensure one network. External networks must already exist.
    pub async fn ensure_network(&self, network: &NetworkSpec) -> Result<()> {
        if network.external {
            return match self.runtime.network_exists(&network.resource_name).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(ComposeError::provision(
                    &network.resource_name,
                    "external network does not exist",
                )),
                Err(e) => Err(ComposeError::provision(&network.resource_name, e)),
            };
        }

        match self.runtime.ensure_network(network).await {
            Ok(true) => {
                tracing::info!("Network {} created", network.resource_name);
                Ok(())
            }
            Ok(false) => {
                tracing::debug!("Network {} already exists", network.resource_name);
                Ok(())
            }
            Err(e @ ComposeError::ProvisionFailure { .. }) => Err(e),
            Err(e) => Err(ComposeError::provision(&network.resource_name, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::parser::ComposeParser;
    use crate::engine::testing::FakeRuntime;
    use std::path::Path;
    use tempfile::tempdir;

    const YAML: &str = r#"
services:
  web:
    image: nginx
    volumes:
      - shared:/shared
  worker:
    image: worker
    volumes:
      - shared:/shared
      - legacy:/legacy
    networks: [backend]
  lonely:
    image: busybox
volumes:
  shared:
  legacy:
    external: true
networks:
  backend:
"#;

    fn project() -> Project {
        ComposeParser::load_str(YAML, "relay", Path::new("/srv/relay"), &Default::default())
            .unwrap()
    }

    fn all(project: &Project) -> Vec<String> {
        project.service_names()
    }

    #[tokio::test]
    async fn test_provisioning_twice_is_a_no_op() {
        let temp = tempdir().unwrap();
        let volumes = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        volumes
            .create("legacy", None, HashMap::new(), HashMap::new())
            .unwrap();
        let runtime = FakeRuntime::new();
        let project = project();
        let provisioner = Provisioner::new(&project, &volumes, &runtime);

        let first = provisioner.provision(&all(&project)).await;
        assert!(first.is_complete());
        assert_eq!(first.created, vec!["shared"]);

        let second = provisioner.provision(&all(&project)).await;
        assert!(second.is_complete());
        assert!(second.created.is_empty());
        assert_eq!(first.volumes, second.volumes);

        let names: Vec<String> = volumes.list().unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["legacy", "relay_shared"]);
        assert_eq!(runtime.networks(), vec!["relay_backend", "relay_default"]);
    }

    #[tokio::test]
    async fn test_missing_external_volume_blocks_only_its_users() {
        let temp = tempdir().unwrap();
        let volumes = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        let runtime = FakeRuntime::new();
        let project = project();
        let provisioner = Provisioner::new(&project, &volumes, &runtime);

        let report = provisioner.provision(&all(&project)).await;
        assert!(!report.is_complete());
        assert!(!volumes.exists("legacy").unwrap());

        let blocked = |name: &str| report.blocking(project.service(name).unwrap()).is_some();
        assert!(blocked("worker"));
        assert!(!blocked("web"));
        assert!(!blocked("lonely"));
    }

    #[tokio::test]
    async fn test_network_failure_is_reported() {
        let temp = tempdir().unwrap();
        let volumes = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        volumes
            .create("legacy", None, HashMap::new(), HashMap::new())
            .unwrap();
        let runtime = FakeRuntime::new().fail_network("relay_backend");
        let project = project();
        let provisioner = Provisioner::new(&project, &volumes, &runtime);

        let report = provisioner.provision(&all(&project)).await;
        let err = report.blocking(project.service("worker").unwrap()).unwrap();
        assert!(matches!(err, ComposeError::ProvisionFailure { .. }));
        assert!(report.blocking(project.service("web").unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_external_network_is_checked_not_created() {
        let yaml = r#"
services:
  web:
    image: nginx
    networks: [edge]
networks:
  edge:
    external: true
    name: shared-edge
"#;
        let project =
            ComposeParser::load_str(yaml, "relay", Path::new("/srv/relay"), &Default::default())
                .unwrap();
        let temp = tempdir().unwrap();
        let volumes = VolumeManager::new(temp.path().to_path_buf()).unwrap();

        let missing = FakeRuntime::new();
        let report = Provisioner::new(&project, &volumes, &missing)
            .provision(&all(&project))
            .await;
        assert!(report.blocking(project.service("web").unwrap()).is_some());
        assert!(missing.calls_for("shared-edge").is_empty());

        let present = FakeRuntime::new().with_network("shared-edge");
        let report = Provisioner::new(&project, &volumes, &present)
            .provision(&all(&project))
            .await;
        assert!(report.is_complete());
        assert_eq!(report.networks.get("edge").map(String::as_str), Some("shared-edge"));
    }

    #[tokio::test]
    async fn test_only_resources_of_selected_services() {
        let temp = tempdir().unwrap();
        let volumes = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        let runtime = FakeRuntime::new();
        let project = project();
        let provisioner = Provisioner::new(&project, &volumes, &runtime);

        let report = provisioner.provision(&["lonely".to_string()]).await;
        assert!(report.is_complete());
        assert!(report.volumes.is_empty());
        assert_eq!(runtime.networks(), vec!["relay_default"]);
    }
}
