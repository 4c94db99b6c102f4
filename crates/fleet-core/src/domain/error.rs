//! Error taxonomy for sessions, the bus, configuration and the coordinator.

use fleet_engine::EngineError;
use serde::{Deserialize, Serialize};

use super::agent::AgentId;

/// Failure to establish an agent session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DialError {
    #[error("agent {agent_id} unreachable at {endpoint}: {reason}")]
    Unreachable {
        agent_id: AgentId,
        endpoint: String,
        reason: String,
    },

    #[error("agent {agent_id} rejected the handshake: {reason}")]
    Rejected { agent_id: AgentId, reason: String },
}

/// Failure of a single evaluation call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    #[error("agent {agent_id} is busy with another evaluation")]
    Busy { agent_id: AgentId },

    #[error("agent {agent_id} disconnected: {reason}")]
    Disconnected { agent_id: AgentId, reason: String },

    #[error("agent {agent_id} did not respond within {limit_ms}ms")]
    Timeout { agent_id: AgentId, limit_ms: u64 },

    #[error("session for agent {agent_id} is closed")]
    Closed { agent_id: AgentId },

    #[error("agent {agent_id} returned a fault: {message}")]
    Agent { agent_id: AgentId, message: String },
}

/// Errors produced by the message bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to encode payload for {subject}: {source}")]
    Encode {
        subject: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode payload on {subject}: {source}")]
    Decode {
        subject: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors produced while loading node configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which step of an agent's add/remove failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Pull,
    Start,
    Attach,
    Dial,
    Stop,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pull => "pull",
            Self::Start => "start",
            Self::Attach => "attach",
            Self::Dial => "dial",
            Self::Stop => "stop",
        };
        write!(f, "{s}")
    }
}

/// One descriptor that could not be added or removed in a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDescriptor {
    pub agent_id: AgentId,
    pub stage: FailureStage,
    pub reason: String,
}

/// Coordinator-level errors.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Node-wide resource (network, prune) failed; fatal for this cycle only.
    #[error("node resource error: {0}")]
    NodeResource(#[from] EngineError),

    #[error("reconciliation finished with {} failed descriptor(s)", .failed.len())]
    ReconciliationPartialFailure { failed: Vec<FailedDescriptor> },

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("coordinator is shutting down")]
    ShuttingDown,
}

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_counts_descriptors() {
        let err = CoordinatorError::ReconciliationPartialFailure {
            failed: vec![FailedDescriptor {
                agent_id: AgentId::new("b"),
                stage: FailureStage::Pull,
                reason: "manifest unknown".into(),
            }],
        };
        assert!(err.to_string().contains("1 failed descriptor"));
    }

    #[test]
    fn evaluation_error_display() {
        let err = EvaluationError::Timeout {
            agent_id: AgentId::new("a"),
            limit_ms: 250,
        };
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn engine_errors_become_node_resource_errors() {
        let err: CoordinatorError = EngineError::Prune("disk busy".into()).into();
        assert!(matches!(err, CoordinatorError::NodeResource(_)));
    }
}
