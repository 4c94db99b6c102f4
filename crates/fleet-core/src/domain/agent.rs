//! Agent identity and declared configuration.

use std::collections::BTreeMap;

use fleet_engine::ResourceLimits;
use serde::{Deserialize, Serialize};

/// Default port an agent container serves its evaluation RPC on.
pub const DEFAULT_AGENT_RPC_PORT: u16 = 50051;

/// Unique identifier of a detection agent (registry-assigned).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        AgentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Form safe for container names: `[a-zA-Z0-9_.-]` only.
    pub fn container_safe(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        AgentId(s.to_string())
    }
}

fn default_rpc_port() -> u16 {
    DEFAULT_AGENT_RPC_PORT
}

/// Declared identity and configuration of one detection agent.
///
/// Two descriptors with the same `id` but different content describe a
/// changed agent; reconciliation replaces the running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Registry identifier
    pub id: AgentId,
    /// Container image reference
    pub image: String,
    /// Chain the agent evaluates (`None` = every chain)
    #[serde(default)]
    pub chain_id: Option<u64>,
    /// Explicit RPC endpoint; derived from the container name when absent
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Port used when deriving the endpoint
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    /// Whether the agent needs the public network
    #[serde(default)]
    pub public: bool,
    /// Extra environment for the container
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Resource limits for the container
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: AgentId::new(id),
            image: image.into(),
            chain_id: None,
            endpoint: None,
            rpc_port: DEFAULT_AGENT_RPC_PORT,
            public: false,
            env: BTreeMap::new(),
            limits: ResourceLimits::default(),
        }
    }

    pub fn with_chain(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    /// Container name under the node's prefix.
    pub fn container_name(&self, prefix: &str) -> String {
        format!("{prefix}-agent-{}", self.id.container_safe())
    }

    /// RPC endpoint of the agent inside the internal network.
    pub fn resolved_endpoint(&self, prefix: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("http://{}:{}", self.container_name(prefix), self.rpc_port),
        }
    }

    /// Whether the agent should receive requests for `chain_id`.
    pub fn serves_chain(&self, chain_id: Option<u64>) -> bool {
        match (self.chain_id, chain_id) {
            (Some(mine), Some(requested)) => mine == requested,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_sanitized() {
        let d = AgentDescriptor::new("0xabc/def:1", "img");
        assert_eq!(d.container_name("fleet"), "fleet-agent-0xabc-def-1");
    }

    #[test]
    fn endpoint_defaults_to_container_dns_name() {
        let d = AgentDescriptor::new("a1", "img");
        assert_eq!(d.resolved_endpoint("fleet"), "http://fleet-agent-a1:50051");

        let d = d.with_endpoint("http://10.0.0.4:9000");
        assert_eq!(d.resolved_endpoint("fleet"), "http://10.0.0.4:9000");
    }

    #[test]
    fn chain_scoping() {
        let scoped = AgentDescriptor::new("a", "img").with_chain(1);
        assert!(scoped.serves_chain(Some(1)));
        assert!(!scoped.serves_chain(Some(137)));
        assert!(scoped.serves_chain(None));

        let unscoped = AgentDescriptor::new("b", "img");
        assert!(unscoped.serves_chain(Some(137)));
    }

    #[test]
    fn descriptor_deserializes_with_defaults() {
        let d: AgentDescriptor =
            serde_json::from_str(r#"{"id":"a","image":"agent:1"}"#).unwrap();
        assert_eq!(d.rpc_port, DEFAULT_AGENT_RPC_PORT);
        assert!(!d.public);
        assert!(d.env.is_empty());
    }
}
