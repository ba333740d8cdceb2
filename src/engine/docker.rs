//! Engine adapter for the `docker` command line
//!
//! Every operation shells out to the engine binary (`docker`, or a
//! compatible one such as `podman`) and maps a non-zero exit to an error
//! carrying the command's stderr.

use super::{BuildRequest, ContainerHandle, ContainerRuntime, ContainerSpec, ImageBuilder};
use crate::error::{ComposeError, Result};
use crate::network::{NetworkDriver, NetworkSpec};
use async_trait::async_trait;
use tokio::process::Command;

/// Engine driven through its command line
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    /// Run the engine with `args` and return its trimmed stdout
    async fn exec(&self, args: &[String]) -> Result<String> {
        tracing::debug!("{} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ComposeError::Runtime(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ComposeError::Runtime(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Arguments of `docker run` for `spec`
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];

    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }

    for mount in &spec.mounts {
        let mut volume = match &mount.source {
            Some(source) => format!("{}:{}", source.display(), mount.target),
            None => mount.target.clone(),
        };
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.push("--volume".to_string());
        args.push(volume);
    }

    for port in &spec.ports {
        args.push("--publish".to_string());
        args.push(port.to_string());
    }

    if let Some(network) = spec.networks.first() {
        args.push("--network".to_string());
        args.push(network.clone());
        args.push("--network-alias".to_string());
        args.push(spec.service.clone());
    }

    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    if let Some(dir) = &spec.working_dir {
        args.push("--workdir".to_string());
        args.push(dir.clone());
    }
    if let Some(user) = &spec.user {
        args.push("--user".to_string());
        args.push(user.clone());
    }
    if let Some(hostname) = &spec.hostname {
        args.push("--hostname".to_string());
        args.push(hostname.clone());
    }

    // The engine takes a single entrypoint binary; the rest goes before the command
    let mut command = Vec::new();
    if let Some((first, rest)) = spec.entrypoint.split_first() {
        args.push("--entrypoint".to_string());
        args.push(first.clone());
        command.extend(rest.iter().cloned());
    }
    command.extend(spec.command.iter().cloned());

    args.push(spec.image.clone());
    args.extend(command);
    args
}

/// Arguments of `docker network connect` joining `container` to `network`
pub fn network_connect_args(network: &str, service: &str, container: &str) -> Vec<String> {
    strings(&[
        "network",
        "connect",
        "--alias",
        service,
        network,
        container,
    ])
}

/// Arguments of `docker network create` for `network`
pub fn network_create_args(network: &NetworkSpec) -> Vec<String> {
    let mut args = vec![
        "network".to_string(),
        "create".to_string(),
        "--driver".to_string(),
        network.driver.to_string(),
    ];
    if network.internal {
        args.push("--internal".to_string());
    }
    for (key, value) in &network.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(network.resource_name.clone());
    args
}

/// Arguments of `docker build` for `request`
pub fn build_args(request: &BuildRequest) -> Vec<String> {
    let mut args = vec!["build".to_string(), "--tag".to_string(), request.tag.clone()];

    if let Some(dockerfile) = &request.dockerfile {
        args.push("--file".to_string());
        args.push(dockerfile.display().to_string());
    }
    for (key, value) in &request.args {
        args.push("--build-arg".to_string());
        args.push(format!("{}={}", key, value));
    }
    if let Some(target) = &request.target {
        args.push("--target".to_string());
        args.push(target.clone());
    }

    args.push(request.context.display().to_string());
    args
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ensure_network(&self, network: &NetworkSpec) -> Result<bool> {
        if self.network_exists(&network.resource_name).await? {
            return Ok(false);
        }
        if matches!(network.driver, NetworkDriver::Host | NetworkDriver::None) {
            return Err(ComposeError::provision(
                &network.resource_name,
                format!("the {} network cannot be created", network.driver),
            ));
        }
        self.exec(&network_create_args(network))
            .await
            .map_err(|e| ComposeError::provision(&network.resource_name, e))?;
        Ok(true)
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        let names = self
            .exec(&strings(&["network", "ls", "--format", "{{.Name}}"]))
            .await?;
        Ok(names.lines().any(|line| line.trim() == name))
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.exec(&strings(&["network", "rm", name])).await?;
        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        // A container left behind by an earlier run would make `run` fail on the name
        if let Err(e) = self.exec(&strings(&["rm", "--force", &spec.name])).await {
            tracing::debug!("No leftover container {}: {}", spec.name, e);
        }

        let id = self
            .exec(&run_args(spec))
            .await
            .map_err(|e| ComposeError::launch(&spec.service, e))?;

        // `run` joins the first network only
        for network in spec.networks.iter().skip(1) {
            let args = network_connect_args(network, &spec.service, &id);
            if let Err(e) = self.exec(&args).await {
                if let Err(rm) = self.exec(&strings(&["rm", "--force", &id])).await {
                    tracing::warn!("Cannot remove container {}: {}", spec.name, rm);
                }
                return Err(ComposeError::launch(&spec.service, e));
            }
        }

        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
            service: spec.service.clone(),
        })
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i32> {
        let out = self.exec(&strings(&["wait", &handle.id])).await?;
        out.lines()
            .last()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| ComposeError::Runtime(format!("unexpected exit status '{}'", out)))
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        self.exec(&strings(&["kill", "--signal", "SIGTERM", &handle.id]))
            .await?;
        Ok(())
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<()> {
        self.exec(&strings(&["kill", &handle.id])).await?;
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.exec(&strings(&["rm", "--force", &handle.id])).await?;
        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for DockerCli {
    async fn build(&self, request: &BuildRequest) -> Result<()> {
        tracing::info!("Building image {}", request.tag);
        self.exec(&build_args(request))
            .await
            .map_err(|e| ComposeError::Build(format!("{}: {}", request.tag, e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::model::{PortMapping, Protocol};
    use crate::engine::MountBinding;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    #[test]
    fn test_run_args() {
        let spec = ContainerSpec {
            name: "relay-web-1".to_string(),
            service: "web".to_string(),
            image: "relay-web:latest".to_string(),
            command: vec!["gunicorn".to_string(), "app:wsgi".to_string()],
            env: BTreeMap::from([("DEBUG".to_string(), "0".to_string())]),
            mounts: vec![MountBinding {
                source: Some(PathBuf::from("/state/volumes/relay_shared/_data")),
                target: "/shared".to_string(),
                read_only: false,
            }],
            ports: vec![PortMapping {
                host_ip: None,
                host_port: Some(8000),
                container_port: 8888,
                protocol: Protocol::Tcp,
            }],
            networks: vec!["relay_default".to_string()],
            ..Default::default()
        };

        let args = run_args(&spec);
        assert_eq!(&args[..4], &["run", "--detach", "--name", "relay-web-1"]);
        assert!(args.windows(2).any(|w| w == ["--env", "DEBUG=0"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--volume", "/state/volumes/relay_shared/_data:/shared"]));
        assert!(args.windows(2).any(|w| w == ["--publish", "8000:8888/tcp"]));
        assert!(args.windows(2).any(|w| w == ["--network", "relay_default"]));
        assert!(args.windows(2).any(|w| w == ["--network-alias", "web"]));
        assert_eq!(&args[args.len() - 3..], &["relay-web:latest", "gunicorn", "app:wsgi"]);
    }

    #[test]
    fn test_run_args_split_entrypoint() {
        let spec = ContainerSpec {
            name: "p-a-1".to_string(),
            service: "a".to_string(),
            image: "busybox".to_string(),
            entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
            command: vec!["echo hi".to_string()],
            mounts: vec![MountBinding {
                source: None,
                target: "/cache".to_string(),
                read_only: true,
            }],
            ..Default::default()
        };

        let args = run_args(&spec);
        assert!(args.windows(2).any(|w| w == ["--entrypoint", "/bin/sh"]));
        assert!(args.windows(2).any(|w| w == ["--volume", "/cache:ro"]));
        assert_eq!(&args[args.len() - 3..], &["busybox", "-c", "echo hi"]);
    }

    #[test]
    fn test_additional_networks_are_connected() {
        let spec = ContainerSpec {
            name: "relay-web-1".to_string(),
            service: "web".to_string(),
            image: "nginx".to_string(),
            networks: vec!["relay_front".to_string(), "relay_back".to_string()],
            ..Default::default()
        };

        let args = run_args(&spec);
        assert_eq!(args.iter().filter(|a| *a == "--network").count(), 1);
        assert!(args.windows(2).any(|w| w == ["--network", "relay_front"]));
        assert!(!args.contains(&"relay_back".to_string()));

        assert_eq!(
            network_connect_args("relay_back", "web", "3f2a9c"),
            vec!["network", "connect", "--alias", "web", "relay_back", "3f2a9c"]
        );
    }

    #[test]
    fn test_build_args() {
        let request = BuildRequest {
            tag: "relay-web:latest".to_string(),
            context: PathBuf::from("/srv/relay"),
            dockerfile: Some(PathBuf::from("docker/web/Dockerfile")),
            args: BTreeMap::from([("VERSION".to_string(), "1.2".to_string())]),
            target: Some("prod".to_string()),
        };

        assert_eq!(
            build_args(&request),
            vec![
                "build",
                "--tag",
                "relay-web:latest",
                "--file",
                "docker/web/Dockerfile",
                "--build-arg",
                "VERSION=1.2",
                "--target",
                "prod",
                "/srv/relay",
            ]
        );
    }

    #[test]
    fn test_network_create_args() {
        let mut network = NetworkSpec::project_default("relay");
        network.internal = true;

        assert_eq!(
            network_create_args(&network),
            vec!["network", "create", "--driver", "bridge", "--internal", "relay_default"]
        );
    }
}
