//! Node configuration.
//!
//! Every field has a default, so an empty file is a valid configuration.
//!
//! ```toml
//! [node]
//! name = "node-1"
//! container_prefix = "fleet"
//!
//! [networks]
//! public = "fleet-public"
//! internal = "fleet-internal"
//!
//! [dispatch]
//! timeout_ms = 30000
//!
//! [retry]
//! max_attempts = 3
//!
//! [[services]]
//! role = "scanner"
//! image = "fleet/scanner:latest"
//!
//! [[agents]]
//! id = "0xabc"
//! image = "registry.local/agents/abc@sha256:..."
//! chain_id = 1
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use fleet_engine::{ContainerSpec, DockerEngineConfig};
use serde::{Deserialize, Serialize};

use crate::bus::subjects;
use crate::coordinator::RetryPolicy;
use crate::domain::{AgentDescriptor, ConfigError};

/// Top-level node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub networks: NetworksConfig,
    pub subjects: SubjectsConfig,
    pub dispatch: DispatchConfig,
    pub retry: RetryPolicy,
    pub services: Vec<ServiceConfig>,
    /// Static desired agent set, published at start-up
    pub agents: Vec<AgentDescriptor>,
    pub docker: DockerEngineConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub name: String,
    /// Prefix for every container this node starts
    pub container_prefix: String,
    /// Stop agent containers on shutdown instead of leaving them running
    pub stop_agents_on_shutdown: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: "fleet-node".to_string(),
            container_prefix: "fleet".to_string(),
            stop_agents_on_shutdown: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworksConfig {
    pub public: String,
    pub internal: String,
}

impl Default for NetworksConfig {
    fn default() -> Self {
        Self {
            public: "fleet-public".to_string(),
            internal: "fleet-internal".to_string(),
        }
    }
}

/// Bus subjects the coordinator listens and publishes on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectsConfig {
    pub desired: String,
    pub requests: String,
    pub results: String,
    pub status_running: String,
    pub status_stopped: String,
    pub reconcile_report: String,
}

impl Default for SubjectsConfig {
    fn default() -> Self {
        Self {
            desired: subjects::AGENTS_DESIRED.to_string(),
            requests: subjects::EVALUATION_REQUESTS.to_string(),
            results: subjects::EVALUATION_RESULTS.to_string(),
            status_running: subjects::AGENTS_STATUS_RUNNING.to_string(),
            status_stopped: subjects::AGENTS_STATUS_STOPPED.to_string(),
            reconcile_report: subjects::RECONCILE_REPORT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Per-agent upper bound for one evaluate call (milliseconds)
    pub timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// Role of a node service container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    Scanner,
    Proxy,
    Query,
}

impl ServiceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scanner => "scanner",
            Self::Proxy => "proxy",
            Self::Query => "query",
        }
    }

    /// Proxy and query containers serve ingress and need the public network.
    pub fn default_public(&self) -> bool {
        !matches!(self, Self::Scanner)
    }
}

/// One scanner/proxy/query container run next to the agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub role: ServiceRole,
    pub image: String,
    /// Container name; defaults to `{prefix}-{role}`
    #[serde(default)]
    pub name: Option<String>,
    /// Attach the public network; defaults by role
    #[serde(default)]
    pub public: Option<bool>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ServiceConfig {
    pub fn container_name(&self, prefix: &str) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{prefix}-{}", self.role.as_str()))
    }

    pub fn is_public(&self) -> bool {
        self.public.unwrap_or_else(|| self.role.default_public())
    }

    /// Spec for starting this service on `internal_network_id`.
    pub fn container_spec(&self, prefix: &str, internal_network_id: &str) -> ContainerSpec {
        let mut spec = ContainerSpec::new(self.container_name(prefix), self.image.clone())
            .with_network(internal_network_id);
        for (k, v) in &self.env {
            spec = spec.with_env(k.clone(), v.clone());
        }
        spec
    }
}

impl NodeConfig {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.container_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("node.container_prefix is empty".into()));
        }
        if self.networks.public.is_empty() || self.networks.internal.is_empty() {
            return Err(ConfigError::Invalid("network names must not be empty".into()));
        }
        if self.networks.public == self.networks.internal {
            return Err(ConfigError::Invalid(
                "public and internal networks must differ".into(),
            ));
        }
        if self.dispatch.timeout_ms == 0 {
            return Err(ConfigError::Invalid("dispatch.timeout_ms must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0".into()));
        }
        if self.retry.recovery_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry.recovery_interval_ms must be > 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.as_str().is_empty() {
                return Err(ConfigError::Invalid("agent with empty id".into()));
            }
            if agent.image.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("agent {} has no image", agent.id)));
            }
            if !seen.insert(&agent.id) {
                return Err(ConfigError::Invalid(format!("duplicate agent id {}", agent.id)));
            }
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if service.image.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{} service has no image",
                    service.role.as_str()
                )));
            }
            let name = service.container_name(&self.node.container_prefix);
            if !names.insert(name.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate service name {name}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = NodeConfig::from_toml_str("").unwrap();
        assert_eq!(config.node.container_prefix, "fleet");
        assert_eq!(config.dispatch.timeout_ms, 30_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.subjects.desired, subjects::AGENTS_DESIRED);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn service_defaults_follow_role() {
        let scanner = ServiceConfig {
            role: ServiceRole::Scanner,
            image: "scanner".into(),
            name: None,
            public: None,
            env: BTreeMap::new(),
        };
        assert!(!scanner.is_public());
        assert_eq!(scanner.container_name("fleet"), "fleet-scanner");

        let proxy = ServiceConfig {
            role: ServiceRole::Proxy,
            ..scanner.clone()
        };
        assert!(proxy.is_public());
    }

    #[test]
    fn same_networks_rejected() {
        let mut config = NodeConfig::default();
        config.networks.public = "x".into();
        config.networks.internal = "x".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
