//! Compose descriptor types
//!
//! These mirror the descriptor file as written. Several fields accept more
//! than one syntax, so they are modelled as untagged enums and normalized
//! later by [`crate::compose::model`].

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

/// Compose descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Schema version (informational only)
    #[serde(default, deserialize_with = "scalar_string")]
    pub version: Option<String>,
    /// Project name
    #[serde(default)]
    pub name: Option<String>,
    /// Services in declaration order
    #[serde(default)]
    pub services: IndexMap<String, ServiceConfig>,
    /// Named volumes
    #[serde(default)]
    pub volumes: IndexMap<String, Option<VolumeConfig>>,
    /// Named networks
    #[serde(default)]
    pub networks: IndexMap<String, Option<NetworkConfig>>,
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default)]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default)]
    pub build: Option<BuildConfig>,
    /// Command to run
    #[serde(default)]
    pub command: Option<CommandConfig>,
    /// Entrypoint
    #[serde(default)]
    pub entrypoint: Option<CommandConfig>,
    /// Environment variables
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
    /// Environment files
    #[serde(default)]
    pub env_file: Option<EnvFileConfig>,
    /// Port mappings
    #[serde(default)]
    pub ports: Option<Vec<PortConfig>>,
    /// Volume mounts
    #[serde(default)]
    pub volumes: Option<Vec<VolumeMount>>,
    /// Networks to connect to
    #[serde(default)]
    pub networks: Option<NetworksConfig>,
    /// Service dependencies
    #[serde(default)]
    pub depends_on: Option<DependsOnConfig>,
    /// Labels
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
    /// Restart policy
    #[serde(default)]
    pub restart: Option<String>,
    /// Working directory
    #[serde(default)]
    pub working_dir: Option<String>,
    /// User
    #[serde(default)]
    pub user: Option<String>,
    /// Hostname
    #[serde(default)]
    pub hostname: Option<String>,
    /// Stop grace period, e.g. `10s` or `1m30s`
    #[serde(default)]
    pub stop_grace_period: Option<String>,
}

impl ServiceConfig {
    /// Overlay `other` on top of `self`.
    ///
    /// Scalars from `other` win, lists are appended and maps are merged key by key.
    pub fn merge(&mut self, other: ServiceConfig) {
        if other.image.is_some() {
            self.image = other.image;
        }
        if other.build.is_some() {
            self.build = other.build;
        }
        if other.command.is_some() {
            self.command = other.command;
        }
        if other.entrypoint.is_some() {
            self.entrypoint = other.entrypoint;
        }
        if other.restart.is_some() {
            self.restart = other.restart;
        }
        if other.working_dir.is_some() {
            self.working_dir = other.working_dir;
        }
        if other.user.is_some() {
            self.user = other.user;
        }
        if other.hostname.is_some() {
            self.hostname = other.hostname;
        }
        if other.stop_grace_period.is_some() {
            self.stop_grace_period = other.stop_grace_period;
        }

        self.environment = match (self.environment.take(), other.environment) {
            (Some(base), Some(overlay)) => {
                let mut merged = base.into_pairs();
                merged.extend(overlay.into_pairs());
                Some(EnvironmentConfig::Map(merged))
            }
            (base, overlay) => overlay.or(base),
        };
        self.labels = match (self.labels.take(), other.labels) {
            (Some(base), Some(overlay)) => {
                let mut merged = base.into_pairs();
                merged.extend(overlay.into_pairs());
                Some(LabelsConfig::Map(merged))
            }
            (base, overlay) => overlay.or(base),
        };
        self.env_file = match (self.env_file.take(), other.env_file) {
            (Some(base), Some(overlay)) => {
                let mut files = base.into_vec();
                files.extend(overlay.into_vec());
                Some(EnvFileConfig::Multiple(files))
            }
            (base, overlay) => overlay.or(base),
        };
        self.depends_on = match (self.depends_on.take(), other.depends_on) {
            (Some(base), Some(overlay)) => {
                let mut deps = base.into_map();
                deps.extend(overlay.into_map());
                Some(DependsOnConfig::Map(deps))
            }
            (base, overlay) => overlay.or(base),
        };
        self.networks = match (self.networks.take(), other.networks) {
            (Some(base), Some(overlay)) => {
                let mut nets = base.names();
                for net in overlay.names() {
                    if !nets.contains(&net) {
                        nets.push(net);
                    }
                }
                Some(NetworksConfig::Array(nets))
            }
            (base, overlay) => overlay.or(base),
        };
        if let Some(ports) = other.ports {
            self.ports.get_or_insert_with(Vec::new).extend(ports);
        }
        if let Some(volumes) = other.volumes {
            self.volumes.get_or_insert_with(Vec::new).extend(volumes);
        }
    }
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    /// Simple context path
    Simple(String),
    /// Full build configuration
    Full(BuildConfigFull),
}

/// Full build configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfigFull {
    /// Build context
    pub context: Option<String>,
    /// Dockerfile path, relative to the context
    pub dockerfile: Option<String>,
    /// Build arguments
    #[serde(default)]
    pub args: Option<IndexMap<String, String>>,
    /// Target stage
    pub target: Option<String>,
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

impl CommandConfig {
    /// Argument vector for the container runtime
    pub fn to_args(&self) -> Vec<String> {
        match self {
            CommandConfig::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
            CommandConfig::Exec(arr) => arr.clone(),
        }
    }
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    #[serde(deserialize_with = "scalar_map")]
    Map(IndexMap<String, Option<String>>),
}

impl EnvironmentConfig {
    /// Key/value pairs in declaration order; a bare `KEY` has no value
    pub fn into_pairs(self) -> IndexMap<String, Option<String>> {
        match self {
            EnvironmentConfig::Map(map) => map,
            EnvironmentConfig::Array(arr) => arr
                .into_iter()
                .map(|item| match item.split_once('=') {
                    Some((key, value)) => (key.to_string(), Some(value.to_string())),
                    None => (item, None),
                })
                .collect(),
        }
    }
}

/// Env file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvFileConfig {
    /// Single file
    Single(String),
    /// Multiple files
    Multiple(Vec<String>),
}

impl EnvFileConfig {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            EnvFileConfig::Single(path) => vec![path],
            EnvFileConfig::Multiple(paths) => paths,
        }
    }
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Bare container port: `8000`
    Number(u16),
    /// Short syntax: "8080:80"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u16,
    /// Published port on host
    #[serde(default, deserialize_with = "scalar_string")]
    pub published: Option<String>,
    /// Host IP to bind to
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp)
    pub protocol: Option<String>,
}

/// Volume mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    /// Short syntax: "source:target:mode"
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMountLong {
    /// Mount type (volume, bind)
    #[serde(rename = "type")]
    pub mount_type: Option<String>,
    /// Source path or volume name
    pub source: Option<String>,
    /// Target path in container
    pub target: String,
    /// Read only
    pub read_only: Option<bool>,
}

/// Networks configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    /// Array of network names
    Array(Vec<String>),
    /// Map of network name to (ignored) per-service settings
    Map(IndexMap<String, Option<serde_yaml::Value>>),
}

impl NetworksConfig {
    pub fn names(self) -> Vec<String> {
        match self {
            NetworksConfig::Array(arr) => arr,
            NetworksConfig::Map(map) => map.into_keys().collect(),
        }
    }
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(IndexMap<String, DependsOnCondition>),
}

impl DependsOnConfig {
    /// Dependency names with their conditions, in declaration order
    pub fn into_map(self) -> IndexMap<String, DependsOnCondition> {
        match self {
            DependsOnConfig::Array(arr) => arr
                .into_iter()
                .map(|name| (name, DependsOnCondition::default()))
                .collect(),
            DependsOnConfig::Map(map) => map,
        }
    }
}

/// Depends on condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for
    #[serde(default = "default_condition")]
    pub condition: String,
}

impl Default for DependsOnCondition {
    fn default() -> Self {
        Self {
            condition: default_condition(),
        }
    }
}

fn default_condition() -> String {
    "service_started".to_string()
}

/// Labels configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    /// Array of "key=value" strings
    Array(Vec<String>),
    /// Map of key to value
    #[serde(deserialize_with = "scalar_map_required")]
    Map(IndexMap<String, String>),
}

impl LabelsConfig {
    pub fn into_pairs(self) -> IndexMap<String, String> {
        match self {
            LabelsConfig::Map(map) => map,
            LabelsConfig::Array(arr) => arr
                .into_iter()
                .map(|item| match item.split_once('=') {
                    Some((key, value)) => (key.to_string(), value.to_string()),
                    None => (item, String::new()),
                })
                .collect(),
        }
    }
}

/// Volume configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Driver
    pub driver: Option<String>,
    /// Driver options
    #[serde(default)]
    pub driver_opts: Option<IndexMap<String, String>>,
    /// External volume
    pub external: Option<ExternalConfig>,
    /// Labels
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
    /// Name override
    pub name: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Driver
    pub driver: Option<String>,
    /// External network
    pub external: Option<ExternalConfig>,
    /// Internal network
    pub internal: Option<bool>,
    /// Labels
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
    /// Name override
    pub name: Option<String>,
}

/// External resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalConfig {
    /// Boolean
    Bool(bool),
    /// With name
    Named { name: String },
}

impl ExternalConfig {
    pub fn is_external(&self) -> bool {
        !matches!(self, ExternalConfig::Bool(false))
    }
}

/// Accept a string or a number where the descriptor format allows both (`version: 3.8`)
fn scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    scalar_value(value).map_err(<D::Error as serde::de::Error>::custom)
}

fn scalar_value(value: Option<serde_yaml::Value>) -> Result<Option<String>, String> {
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(serde_yaml::Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(format!("expected a scalar value, found {:?}", other)),
    }
}

/// Map whose values may be strings, numbers, booleans or empty (`DEBUG: true`)
fn scalar_map<'de, D>(deserializer: D) -> Result<IndexMap<String, Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    IndexMap::<String, Option<serde_yaml::Value>>::deserialize(deserializer)?
        .into_iter()
        .map(|(key, value)| {
            scalar_value(value)
                .map(|v| (key, v))
                .map_err(<D::Error as serde::de::Error>::custom)
        })
        .collect()
}

/// Like [`scalar_map`], an empty value becomes an empty string
fn scalar_map_required<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(scalar_map(deserializer)?
        .into_iter()
        .map(|(key, value)| (key, value.unwrap_or_default()))
        .collect())
}
