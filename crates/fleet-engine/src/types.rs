//! Value types exchanged with a container engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Resource ceilings applied to a container at start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in MiB (`None` = engine default)
    pub memory_mb: Option<u64>,
    /// CPU quota in thousandths of a core (`None` = engine default)
    pub cpu_millis: Option<u64>,
}

/// Desired state for a single container start call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name (unique per engine)
    pub name: String,
    /// Image reference
    pub image: String,
    /// Network IDs to attach before the container starts serving
    pub networks: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Resource limits
    pub limits: ResourceLimits,
}

impl ContainerSpec {
    /// Create a spec with no networks, env or limits.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            networks: Vec::new(),
            env: BTreeMap::new(),
            limits: ResourceLimits::default(),
        }
    }

    /// Attach the container to the given network on start.
    pub fn with_network(mut self, network_id: impl Into<String>) -> Self {
        self.networks.push(network_id.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Environment rendered as `KEY=value` pairs.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Observed container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Exited,
    Unknown,
}

impl ContainerStatus {
    /// Map an engine-reported state string.
    pub fn from_engine_state(state: &str) -> Self {
        match state {
            "running" => Self::Running,
            "exited" | "dead" | "created" => Self::Exited,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Engine-assigned identity plus observed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    /// Opaque engine ID
    pub id: String,
    /// Container name without the leading `/`
    pub name: String,
    /// Image reference the container runs
    pub image: String,
    /// Status at the time of the observation
    pub status: ContainerStatus,
}

/// Which of the two node networks a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    /// Ingress for proxy/query roles
    Public,
    /// Isolates agent-to-agent traffic from the host
    Internal,
}

/// Opaque identity of a created network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkHandle {
    pub id: String,
    pub name: String,
    pub class: NetworkClass,
}
