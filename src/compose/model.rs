//! Validated project model
//!
//! A [`Project`] is built once per run from a [`ComposeConfig`] and is never
//! mutated afterwards. Everything that can be checked without touching the
//! host is checked here, so a project that loads is safe to hand to the
//! resolver and launcher.

use super::config::{
    BuildConfig, ComposeConfig, EnvFileConfig, PortConfig, ServiceConfig, VolumeConfig,
    VolumeMount,
};
use crate::error::{ComposeError, Result};
use crate::network::{NetworkDriver, NetworkSpec, DEFAULT_NETWORK};
use crate::storage::volume::VolumeScope;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("name pattern is valid")
});

/// A loaded, validated compose project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Project name, used to prefix engine resources
    pub name: String,
    /// Directory that relative paths resolve against
    pub working_dir: PathBuf,
    /// Services in declaration order
    pub services: Vec<Service>,
    /// Declared volumes in declaration order
    pub volumes: Vec<VolumeSpec>,
    /// Declared networks, always including the project default
    pub networks: Vec<NetworkSpec>,
}

/// A single service of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Service name, unique within the project
    pub name: String,
    /// Image to run; derived from the project name when only `build` is given
    pub image: Option<String>,
    /// How to build the image
    pub build: Option<BuildSpec>,
    /// Command override
    pub command: Vec<String>,
    /// Entrypoint override
    pub entrypoint: Vec<String>,
    /// Env files to read at launch, in override order
    pub env_files: Vec<PathBuf>,
    /// Inline environment; `None` values are taken from the host at launch
    pub environment: BTreeMap<String, Option<String>>,
    /// Dependencies in declaration order
    pub depends_on: Vec<Dependency>,
    /// Working directory inside the container
    pub working_dir: Option<String>,
    /// Published ports
    pub ports: Vec<PortMapping>,
    /// Volume and bind mounts
    pub mounts: Vec<Mount>,
    /// Networks the service joins
    pub networks: Vec<String>,
    /// What to do when the process exits on its own
    pub restart: RestartPolicy,
    /// Time between the stop request and a forced kill
    pub stop_grace_period: Option<Duration>,
    /// User to run as
    pub user: Option<String>,
    /// Hostname
    pub hostname: Option<String>,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

impl Service {
    /// Image reference used to run the service
    pub fn image_ref(&self, project: &str) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| format!("{}-{}:latest", project, self.name))
    }

    /// Container name for the single replica of this service
    pub fn container_name(&self, project: &str) -> String {
        format!("{}-{}-1", project, self.name)
    }

    /// Names of the services this one depends on
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.depends_on.iter().map(|d| d.service.as_str())
    }

    /// Named volumes mounted by this service
    pub fn volume_names(&self) -> impl Iterator<Item = &str> {
        self.mounts.iter().filter_map(|m| match m.kind {
            MountKind::Volume => m.source.as_deref(),
            _ => None,
        })
    }
}

/// Image build specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Build context directory
    pub context: PathBuf,
    /// Dockerfile path relative to the context
    pub dockerfile: Option<PathBuf>,
    /// Build arguments
    pub args: BTreeMap<String, String>,
    /// Target stage
    pub target: Option<String>,
}

/// One `depends_on` edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Service depended upon
    pub service: String,
    /// Requested readiness condition
    pub condition: DependencyCondition,
}

/// Readiness condition requested for a dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    ServiceStarted,
    ServiceHealthy,
    ServiceCompletedSuccessfully,
}

impl FromStr for DependencyCondition {
    type Err = ComposeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "service_started" => Ok(DependencyCondition::ServiceStarted),
            "service_healthy" => Ok(DependencyCondition::ServiceHealthy),
            "service_completed_successfully" => {
                Ok(DependencyCondition::ServiceCompletedSuccessfully)
            }
            other => Err(ComposeError::malformed(format!(
                "unknown depends_on condition '{}'",
                other
            ))),
        }
    }
}

/// Published port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host interface to bind
    pub host_ip: Option<String>,
    /// Host port; `None` lets the engine pick one
    pub host_port: Option<u16>,
    /// Port inside the container
    pub container_port: u16,
    /// Transport protocol
    pub protocol: Protocol,
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{}:", ip)?;
        }
        if let Some(port) = self.host_port {
            write!(f, "{}:", port)?;
        }
        write!(f, "{}/{}", self.container_port, self.protocol)
    }
}

/// Network protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Kind of mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    /// Declared named volume
    Volume,
    /// Host path
    Bind,
    /// Unnamed volume private to the container
    Anonymous,
}

/// A mount inside a service container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub kind: MountKind,
    /// Volume name or absolute host path; `None` for anonymous volumes
    pub source: Option<String>,
    /// Absolute path inside the container
    pub target: String,
    pub read_only: bool,
}

/// A declared named volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Name used inside the descriptor
    pub name: String,
    /// Name of the provisioned resource
    pub resource_name: String,
    /// Volumes are local to the project
    pub scope: VolumeScope,
    /// Driver requested by the descriptor
    pub driver: Option<String>,
    /// Driver options
    pub driver_opts: BTreeMap<String, String>,
    /// Managed outside of this project; never created or removed here
    pub external: bool,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

/// Restart policy of a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart
    #[default]
    No,
    /// Always restart after an exit the operator did not request
    Always,
    /// Restart after a non-zero exit, optionally a bounded number of times
    OnFailure { max_retries: Option<u32> },
    /// Like `always`; differs only for engine-level daemon restarts
    UnlessStopped,
}

impl RestartPolicy {
    /// Whether an unrequested exit with `exit_code` counts as a crash
    pub fn treats_as_crash(&self, exit_code: i32) -> bool {
        match self {
            RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
            RestartPolicy::No | RestartPolicy::OnFailure { .. } => exit_code != 0,
        }
    }

    /// Whether a crashed service that already restarted `restarts` times may restart again
    pub fn allows_restart(&self, restarts: u32) -> bool {
        match self {
            RestartPolicy::No => false,
            RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
            RestartPolicy::OnFailure { max_retries } => {
                max_retries.map_or(true, |max| restarts < max)
            }
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = ComposeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no" | "false" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            "on-failure" => Ok(RestartPolicy::OnFailure { max_retries: None }),
            other => match other.strip_prefix("on-failure:") {
                Some(count) => count
                    .parse()
                    .map(|max| RestartPolicy::OnFailure {
                        max_retries: Some(max),
                    })
                    .map_err(|_| {
                        ComposeError::malformed(format!("invalid restart retry count '{}'", count))
                    }),
                None => Err(ComposeError::malformed(format!(
                    "unknown restart policy '{}'",
                    other
                ))),
            },
        }
    }
}

impl Project {
    /// Validate a descriptor and build the project model.
    ///
    /// Relative paths resolve against `working_dir`. The function only reads
    /// its arguments; nothing on the host is inspected.
    pub fn from_config(config: ComposeConfig, name: &str, working_dir: &Path) -> Result<Self> {
        let name = normalize_project_name(name)?;

        if config.services.is_empty() {
            return Err(ComposeError::malformed("no services declared"));
        }

        let mut volumes = Vec::with_capacity(config.volumes.len());
        for (vol_name, vol_config) in &config.volumes {
            check_name("volume", vol_name)?;
            volumes.push(volume_spec(&name, vol_name, vol_config.clone().unwrap_or_default()));
        }

        let mut networks = vec![NetworkSpec::project_default(&name)];
        for (net_name, net_config) in &config.networks {
            check_name("network", net_name)?;
            let net_config = net_config.clone().unwrap_or_default();
            let external = net_config
                .external
                .as_ref()
                .is_some_and(|e| e.is_external());
            let spec = NetworkSpec {
                name: net_name.clone(),
                resource_name: net_config.name.clone().unwrap_or_else(|| {
                    if external {
                        net_name.clone()
                    } else {
                        format!("{}_{}", name, net_name)
                    }
                }),
                driver: net_config
                    .driver
                    .as_deref()
                    .map(|d| d.parse().unwrap_or_default())
                    .unwrap_or(NetworkDriver::Bridge),
                internal: net_config.internal.unwrap_or(false),
                external,
                labels: net_config
                    .labels
                    .map(|l| l.into_pairs().into_iter().collect())
                    .unwrap_or_default(),
            };
            if net_name == DEFAULT_NETWORK {
                networks[0] = spec;
            } else {
                networks.push(spec);
            }
        }

        let declared_volumes: HashSet<&str> = config.volumes.keys().map(String::as_str).collect();
        let declared_networks: HashSet<&str> = networks.iter().map(|n| n.name.as_str()).collect();
        let declared_services: HashSet<&str> = config.services.keys().map(String::as_str).collect();

        let mut services = Vec::with_capacity(config.services.len());
        for (svc_name, svc_config) in &config.services {
            check_name("service", svc_name)?;
            let service = build_service(svc_name, svc_config.clone(), working_dir)?;

            for dep in service.dependency_names() {
                if dep == svc_name {
                    return Err(ComposeError::malformed(format!(
                        "service '{}' depends on itself",
                        svc_name
                    )));
                }
                if !declared_services.contains(dep) {
                    return Err(ComposeError::malformed(format!(
                        "service '{}' depends on undeclared service '{}'",
                        svc_name, dep
                    )));
                }
            }

            for vol in service.volume_names() {
                if !declared_volumes.contains(vol) {
                    return Err(ComposeError::malformed(format!(
                        "service '{}' refers to undeclared volume '{}'",
                        svc_name, vol
                    )));
                }
            }

            for net in &service.networks {
                if !declared_networks.contains(net.as_str()) {
                    return Err(ComposeError::malformed(format!(
                        "service '{}' refers to undeclared network '{}'",
                        svc_name, net
                    )));
                }
            }

            services.push(service);
        }

        Ok(Self {
            name,
            working_dir: working_dir.to_path_buf(),
            services,
            volumes,
            networks,
        })
    }

    /// Look up a service by name
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Look up a declared volume by name
    pub fn volume(&self, name: &str) -> Option<&VolumeSpec> {
        self.volumes.iter().find(|v| v.name == name)
    }

    /// Service names in declaration order
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    /// `selected` plus everything they transitively depend on, in declaration order
    pub fn with_dependencies(&self, selected: &[String]) -> Result<Vec<String>> {
        let mut wanted: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();

        for name in selected {
            let service = self
                .service(name)
                .ok_or_else(|| ComposeError::ServiceNotFound(name.clone()))?;
            stack.push(service.name.as_str());
        }

        while let Some(name) = stack.pop() {
            if !wanted.insert(name) {
                continue;
            }
            if let Some(service) = self.service(name) {
                stack.extend(service.dependency_names());
            }
        }

        Ok(self
            .services
            .iter()
            .filter(|s| wanted.contains(s.name.as_str()))
            .map(|s| s.name.clone())
            .collect())
    }
}

/// Lowercase the name and strip characters the engine does not accept
pub fn normalize_project_name(name: &str) -> Result<String> {
    let normalized: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    let normalized = normalized.trim_start_matches(['-', '_']).to_string();

    if normalized.is_empty() {
        return Err(ComposeError::malformed(format!(
            "project name '{}' has no usable characters",
            name
        )));
    }
    Ok(normalized)
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(ComposeError::malformed(format!("invalid {} name '{}'", kind, name)))
    }
}

fn volume_spec(project: &str, name: &str, config: VolumeConfig) -> VolumeSpec {
    let external = config.external.as_ref().is_some_and(|e| e.is_external());
    let resource_name = match (&config.name, &config.external) {
        (Some(n), _) => n.clone(),
        (None, Some(super::config::ExternalConfig::Named { name })) => name.clone(),
        (None, _) if external => name.to_string(),
        (None, _) => format!("{}_{}", project, name),
    };

    VolumeSpec {
        name: name.to_string(),
        resource_name,
        scope: VolumeScope::Local,
        driver: config.driver,
        driver_opts: config.driver_opts.unwrap_or_default().into_iter().collect(),
        external,
        labels: config
            .labels
            .map(|l| l.into_pairs().into_iter().collect())
            .unwrap_or_default(),
    }
}

fn build_service(name: &str, config: ServiceConfig, working_dir: &Path) -> Result<Service> {
    let malformed = |msg: String| ComposeError::malformed(format!("service '{}': {}", name, msg));

    if config.image.is_none() && config.build.is_none() {
        return Err(malformed("either 'image' or 'build' must be specified".to_string()));
    }

    let build = config.build.map(|b| match b {
        BuildConfig::Simple(path) => BuildSpec {
            context: resolve_path(working_dir, &path),
            dockerfile: None,
            args: BTreeMap::new(),
            target: None,
        },
        BuildConfig::Full(full) => BuildSpec {
            context: resolve_path(working_dir, full.context.as_deref().unwrap_or(".")),
            dockerfile: full.dockerfile.map(PathBuf::from),
            args: full.args.unwrap_or_default().into_iter().collect(),
            target: full.target,
        },
    });

    let env_files = config
        .env_file
        .map(EnvFileConfig::into_vec)
        .unwrap_or_default()
        .iter()
        .map(|p| resolve_path(working_dir, p))
        .collect();

    let environment = config
        .environment
        .map(|e| e.into_pairs().into_iter().collect())
        .unwrap_or_default();

    let mut depends_on = Vec::new();
    for (dep, cond) in config.depends_on.map(|d| d.into_map()).unwrap_or_default() {
        depends_on.push(Dependency {
            service: dep,
            condition: cond.condition.parse().map_err(|e| malformed(detail(e)))?,
        });
    }
    let mut seen = HashSet::new();
    for dep in &depends_on {
        if !seen.insert(dep.service.as_str()) {
            return Err(malformed(format!("dependency '{}' listed twice", dep.service)));
        }
    }

    let ports = config
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|p| parse_port(&p).map_err(malformed))
        .collect::<Result<Vec<_>>>()?;

    let mounts = config
        .volumes
        .unwrap_or_default()
        .into_iter()
        .map(|m| parse_mount(m, working_dir).map_err(malformed))
        .collect::<Result<Vec<_>>>()?;
    let mut targets = HashSet::new();
    for mount in &mounts {
        if !targets.insert(mount.target.as_str()) {
            return Err(malformed(format!("mount target '{}' used twice", mount.target)));
        }
    }

    let networks = match config.networks {
        Some(n) => n.names(),
        None => vec![DEFAULT_NETWORK.to_string()],
    };

    let restart = match config.restart.as_deref() {
        Some(policy) => policy.parse().map_err(|e| malformed(detail(e)))?,
        None => RestartPolicy::No,
    };

    let stop_grace_period = config
        .stop_grace_period
        .as_deref()
        .map(|s| parse_duration(s).map_err(malformed))
        .transpose()?;

    Ok(Service {
        name: name.to_string(),
        image: config.image,
        build,
        command: config.command.map(|c| c.to_args()).unwrap_or_default(),
        entrypoint: config.entrypoint.map(|c| c.to_args()).unwrap_or_default(),
        env_files,
        environment,
        depends_on,
        working_dir: config.working_dir,
        ports,
        mounts,
        networks,
        restart,
        stop_grace_period,
        user: config.user,
        hostname: config.hostname,
        labels: config
            .labels
            .map(|l| l.into_pairs().into_iter().collect())
            .unwrap_or_default(),
    })
}

fn detail(err: ComposeError) -> String {
    match err {
        ComposeError::MalformedDescriptor(message) => message,
        other => other.to_string(),
    }
}

fn resolve_path(base: &Path, path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "." {
        return base.to_path_buf();
    }
    let path = Path::new(path.strip_prefix("./").unwrap_or(path));
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn looks_like_path(source: &str) -> bool {
    source.starts_with('.') || source.starts_with('/') || source.starts_with('~')
}

/// Parse a port entry: `8000`, `"8000"`, `"8080:80"`, `"127.0.0.1:8080:80"`, optionally `/udp`
pub fn parse_port(port: &PortConfig) -> std::result::Result<PortMapping, String> {
    match port {
        PortConfig::Number(p) => Ok(PortMapping {
            host_ip: None,
            host_port: None,
            container_port: *p,
            protocol: Protocol::Tcp,
        }),
        PortConfig::Long(long) => Ok(PortMapping {
            host_ip: long.host_ip.clone(),
            host_port: long
                .published
                .as_deref()
                .map(|p| parse_port_number(p))
                .transpose()?,
            container_port: long.target,
            protocol: parse_protocol(long.protocol.as_deref().unwrap_or("tcp"))?,
        }),
        PortConfig::Short(s) => {
            let (spec, protocol) = match s.rsplit_once('/') {
                Some((spec, proto)) => (spec, parse_protocol(proto)?),
                None => (s.as_str(), Protocol::Tcp),
            };
            let parts: Vec<&str> = spec.split(':').collect();
            let (host_ip, host_port, container_port) = match parts.as_slice() {
                [container] => (None, None, *container),
                [host, container] => (None, Some(*host), *container),
                [ip, host, container] => (Some(ip.to_string()), Some(*host), *container),
                _ => return Err(format!("invalid port mapping '{}'", s)),
            };
            Ok(PortMapping {
                host_ip,
                host_port: host_port
                    .filter(|h| !h.is_empty())
                    .map(parse_port_number)
                    .transpose()?,
                container_port: parse_port_number(container_port)?,
                protocol,
            })
        }
    }
}

fn parse_port_number(s: &str) -> std::result::Result<u16, String> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port '{}'", s)),
        Ok(port) => Ok(port),
    }
}

fn parse_protocol(s: &str) -> std::result::Result<Protocol, String> {
    match s {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        other => Err(format!("unsupported protocol '{}'", other)),
    }
}

/// Parse a mount entry in short (`name:/path[:ro]`) or long form
pub fn parse_mount(mount: VolumeMount, working_dir: &Path) -> std::result::Result<Mount, String> {
    let (kind, source, target, read_only) = match mount {
        VolumeMount::Short(s) => {
            let parts: Vec<&str> = s.split(':').collect();
            match parts.as_slice() {
                [target] => (MountKind::Anonymous, None, target.to_string(), false),
                [source, target] | [source, target, _] => {
                    let read_only = match parts.get(2) {
                        None => false,
                        Some(mode) => {
                            let flags: Vec<&str> = mode.split(',').collect();
                            if flags
                                .iter()
                                .any(|f| !matches!(*f, "ro" | "rw" | "z" | "Z" | "cached" | "delegated"))
                            {
                                return Err(format!("invalid mount mode '{}'", mode));
                            }
                            flags.contains(&"ro")
                        }
                    };
                    let kind = if looks_like_path(source) {
                        MountKind::Bind
                    } else {
                        MountKind::Volume
                    };
                    (kind, Some(source.to_string()), target.to_string(), read_only)
                }
                _ => return Err(format!("invalid volume mount '{}'", s)),
            }
        }
        VolumeMount::Long(long) => {
            let kind = match (long.mount_type.as_deref(), long.source.as_deref()) {
                (Some("bind"), Some(_)) => MountKind::Bind,
                (Some("bind"), None) => {
                    return Err(format!("bind mount to '{}' has no source", long.target))
                }
                (Some("volume"), Some(_)) => MountKind::Volume,
                (Some("volume"), None) => MountKind::Anonymous,
                (Some(other), _) => return Err(format!("unsupported mount type '{}'", other)),
                (None, Some(source)) if looks_like_path(source) => MountKind::Bind,
                (None, Some(_)) => MountKind::Volume,
                (None, None) => MountKind::Anonymous,
            };
            (kind, long.source, long.target, long.read_only.unwrap_or(false))
        }
    };

    if !target.starts_with('/') {
        return Err(format!("mount target '{}' must be an absolute path", target));
    }

    let source = match kind {
        MountKind::Bind => source.map(|s| resolve_path(working_dir, &s).to_string_lossy().into_owned()),
        _ => source,
    };

    Ok(Mount {
        kind,
        source,
        target,
        read_only,
    })
}

/// Parse a compose duration such as `10s`, `1m30s`, `500ms` or `2h`
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let invalid = || format!("invalid duration '{}'", s);
    let mut total = Duration::ZERO;
    let mut rest = s.trim();

    if rest.is_empty() {
        return Err(invalid());
    }

    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(invalid)?;
        let value: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let secs = match &rest[..unit_len] {
            "h" => value * 3600.0,
            "m" => value * 60.0,
            "s" => value,
            "ms" => value / 1000.0,
            "us" => value / 1_000_000.0,
            _ => return Err(invalid()),
        };
        let step = Duration::try_from_secs_f64(secs).map_err(|_| invalid())?;
        total = total.checked_add(step).ok_or_else(invalid)?;
        rest = &rest[unit_len..];
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::config::{PortConfigLong, VolumeMountLong};

    fn load(yaml: &str) -> Result<Project> {
        let config: ComposeConfig = serde_yaml::from_str(yaml).unwrap();
        Project::from_config(config, "relay", Path::new("/srv/relay"))
    }

    #[test]
    fn test_builds_model_in_declaration_order() {
        let project = load(
            r#"
services:
  web:
    build:
      context: .
      dockerfile: docker/web/Dockerfile
    env_file:
      - .env_docker_compose
    depends_on:
      - db
      - redis
    ports:
      - "8000:8000"
    volumes:
      - nginx-shared:/nginx
    command: docker/web/run_web.sh
  db:
    image: postgres:10-alpine
  redis:
    image: redis:4-alpine
volumes:
  nginx-shared:
"#,
        )
        .unwrap();

        assert_eq!(project.service_names(), vec!["web", "db", "redis"]);
        let web = project.service("web").unwrap();
        assert_eq!(web.build.as_ref().unwrap().context, PathBuf::from("/srv/relay"));
        assert_eq!(
            web.env_files,
            vec![PathBuf::from("/srv/relay/.env_docker_compose")]
        );
        assert_eq!(web.dependency_names().collect::<Vec<_>>(), vec!["db", "redis"]);
        assert_eq!(web.ports[0].host_port, Some(8000));
        assert_eq!(web.mounts[0].kind, MountKind::Volume);
        assert_eq!(web.mounts[0].target, "/nginx");
        assert_eq!(web.command, vec!["/bin/sh", "-c", "docker/web/run_web.sh"]);
        assert_eq!(web.image_ref("relay"), "relay-web:latest");
        assert_eq!(project.volume("nginx-shared").unwrap().resource_name, "relay_nginx-shared");
        assert_eq!(web.networks, vec!["default"]);
    }

    #[test]
    fn test_undeclared_volume_is_malformed() {
        let err = load(
            r#"
services:
  web:
    image: nginx
    volumes:
      - nginx-shared:/nginx
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ComposeError::MalformedDescriptor(ref m) if m.contains("nginx-shared")));
    }

    #[test]
    fn test_bind_mount_does_not_need_declaration() {
        let project = load(
            r#"
services:
  web:
    image: nginx
    volumes:
      - ./static:/usr/share/nginx/html:ro
"#,
        )
        .unwrap();
        let mount = &project.services[0].mounts[0];
        assert_eq!(mount.kind, MountKind::Bind);
        assert_eq!(mount.source.as_deref(), Some("/srv/relay/static"));
        assert!(mount.read_only);
    }

    #[test]
    fn test_missing_image_and_build_is_malformed() {
        let err = load("services:\n  web:\n    command: run\n").unwrap_err();
        assert!(matches!(err, ComposeError::MalformedDescriptor(_)));
    }

    #[test]
    fn test_unknown_dependency_is_malformed() {
        let err = load("services:\n  web:\n    image: x\n    depends_on: [db]\n").unwrap_err();
        assert!(matches!(err, ComposeError::MalformedDescriptor(_)));
    }

    #[test]
    fn test_self_dependency_is_malformed() {
        let err = load("services:\n  web:\n    image: x\n    depends_on: [web]\n").unwrap_err();
        assert!(matches!(err, ComposeError::MalformedDescriptor(_)));
    }

    #[test]
    fn test_no_services_is_malformed() {
        assert!(load("version: '3'\n").is_err());
    }

    #[test]
    fn test_long_form_depends_on() {
        let project = load(
            r#"
services:
  web:
    image: x
    depends_on:
      db:
        condition: service_healthy
  db:
    image: postgres
"#,
        )
        .unwrap();
        assert_eq!(
            project.services[0].depends_on[0].condition,
            DependencyCondition::ServiceHealthy
        );
    }

    #[test]
    fn test_with_dependencies_is_transitive() {
        let project = load(
            r#"
services:
  web:
    image: x
    depends_on: [api]
  api:
    image: x
    depends_on: [db]
  db:
    image: x
  other:
    image: x
"#,
        )
        .unwrap();
        let selected = project.with_dependencies(&["web".to_string()]).unwrap();
        assert_eq!(selected, vec!["web", "api", "db"]);
        assert!(project.with_dependencies(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_parse_port_forms() {
        let p = parse_port(&PortConfig::Short("127.0.0.1:8080:80/udp".to_string())).unwrap();
        assert_eq!(p.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(p.host_port, Some(8080));
        assert_eq!(p.container_port, 80);
        assert_eq!(p.protocol, Protocol::Udp);

        let p = parse_port(&PortConfig::Number(5432)).unwrap();
        assert_eq!(p.host_port, None);
        assert_eq!(p.to_string(), "5432/tcp");

        let p = parse_port(&PortConfig::Long(PortConfigLong {
            target: 80,
            published: Some("8080".to_string()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(p.to_string(), "8080:80/tcp");

        assert!(parse_port(&PortConfig::Short("80:abc".to_string())).is_err());
        assert!(parse_port(&PortConfig::Short("1:2:3:4".to_string())).is_err());
    }

    #[test]
    fn test_parse_mount_forms() {
        let dir = Path::new("/srv");
        let m = parse_mount(VolumeMount::Short("/data".to_string()), dir).unwrap();
        assert_eq!(m.kind, MountKind::Anonymous);

        let m = parse_mount(
            VolumeMount::Long(VolumeMountLong {
                mount_type: Some("volume".to_string()),
                source: Some("shared".to_string()),
                target: "/shared".to_string(),
                read_only: Some(true),
            }),
            dir,
        )
        .unwrap();
        assert_eq!(m.kind, MountKind::Volume);
        assert!(m.read_only);

        assert!(parse_mount(VolumeMount::Short("data:relative".to_string()), dir).is_err());
        assert!(parse_mount(VolumeMount::Short("data:/x:bogus".to_string()), dir).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn test_oversized_duration_is_malformed() {
        assert!(parse_duration("99999999999999999999999s").is_err());
        assert!(parse_duration("18446744073709551615s1h").is_err());

        let err = load("services:\n  web:\n    image: x\n    stop_grace_period: 99999999999999999999999s\n")
            .unwrap_err();
        assert!(matches!(err, ComposeError::MalformedDescriptor(_)));
    }

    #[test]
    fn test_restart_policy() {
        assert_eq!("no".parse::<RestartPolicy>().unwrap(), RestartPolicy::No);
        assert_eq!(
            "on-failure:3".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure {
                max_retries: Some(3)
            }
        );
        assert!("sometimes".parse::<RestartPolicy>().is_err());

        let policy = RestartPolicy::OnFailure {
            max_retries: Some(2),
        };
        assert!(policy.treats_as_crash(1));
        assert!(!policy.treats_as_crash(0));
        assert!(policy.allows_restart(1));
        assert!(!policy.allows_restart(2));
        assert!(!RestartPolicy::No.allows_restart(0));
        assert!(RestartPolicy::Always.treats_as_crash(0));
    }

    #[test]
    fn test_normalize_project_name() {
        assert_eq!(normalize_project_name("Safe-Relay_Service").unwrap(), "safe-relay_service");
        assert_eq!(normalize_project_name("my app").unwrap(), "myapp");
        assert!(normalize_project_name("???").is_err());
    }
}
