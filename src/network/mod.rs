//! Network declarations
//!
//! Networking itself belongs to the container engine. The orchestrator only
//! needs to know which networks a project declares so they can be ensured
//! before services join them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Name every project network is known by when a service lists no networks
pub const DEFAULT_NETWORK: &str = "default";

/// Network driver types
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkDriver {
    /// Bridge network (default)
    #[default]
    Bridge,
    /// Host network
    Host,
    /// No networking
    None,
    /// Overlay network
    Overlay,
    /// Macvlan network
    Macvlan,
    /// Any other engine-specific driver
    Custom(String),
}

impl std::fmt::Display for NetworkDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkDriver::Bridge => write!(f, "bridge"),
            NetworkDriver::Host => write!(f, "host"),
            NetworkDriver::None => write!(f, "none"),
            NetworkDriver::Overlay => write!(f, "overlay"),
            NetworkDriver::Macvlan => write!(f, "macvlan"),
            NetworkDriver::Custom(name) => write!(f, "{}", name),
        }
    }
}

impl FromStr for NetworkDriver {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "bridge" => NetworkDriver::Bridge,
            "host" => NetworkDriver::Host,
            "none" => NetworkDriver::None,
            "overlay" => NetworkDriver::Overlay,
            "macvlan" => NetworkDriver::Macvlan,
            other => NetworkDriver::Custom(other.to_string()),
        })
    }
}

/// A network declared by (or implied for) a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Name used inside the descriptor
    pub name: String,
    /// Name of the engine resource
    pub resource_name: String,
    /// Network driver
    pub driver: NetworkDriver,
    /// Internal network (no external access)
    pub internal: bool,
    /// Managed outside of this project; never created or removed here
    pub external: bool,
    /// Network labels
    pub labels: BTreeMap<String, String>,
}

impl NetworkSpec {
    /// The implicit `<project>_default` network
    pub fn project_default(project: &str) -> Self {
        Self {
            name: DEFAULT_NETWORK.to_string(),
            resource_name: format!("{}_{}", project, DEFAULT_NETWORK),
            driver: NetworkDriver::Bridge,
            internal: false,
            external: false,
            labels: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_round_trips_through_display() {
        for name in ["bridge", "host", "overlay", "weave"] {
            let driver: NetworkDriver = name.parse().unwrap();
            assert_eq!(driver.to_string(), name);
        }
    }

    #[test]
    fn test_project_default_network() {
        let net = NetworkSpec::project_default("relay");
        assert_eq!(net.name, "default");
        assert_eq!(net.resource_name, "relay_default");
        assert!(!net.external);
    }
}
