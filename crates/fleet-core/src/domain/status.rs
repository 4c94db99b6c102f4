//! Session states and the read-only fleet status exposed to collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::AgentId;
use super::error::FailureStage;

/// Lifecycle of an agent session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Coordinator's view of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "health", rename_all = "snake_case")]
pub enum AgentHealth {
    /// Session open; receives dispatches
    Healthy,
    /// Reconnect attempts exhausted; excluded from dispatch
    Unhealthy {
        since: DateTime<Utc>,
        last_error: String,
    },
    /// Could not be added in the last cycle; not tracked
    Failed { stage: FailureStage, reason: String },
    /// Being removed, or its container could not be stopped yet
    PendingRemoval,
}

impl AgentHealth {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy { .. } => "unhealthy",
            Self::Failed { .. } => "failed",
            Self::PendingRemoval => "pending_removal",
        }
    }
}

/// Status line for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: AgentId,
    #[serde(flatten)]
    pub health: AgentHealth,
    pub session: Option<SessionState>,
    pub container_id: Option<String>,
}

/// Point-in-time copy of the coordinator's tracked state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    /// Incremented every time tracked state changes
    pub generation: u64,
    pub agents: Vec<AgentStatus>,
}

impl FleetSnapshot {
    pub fn get(&self, agent_id: &AgentId) -> Option<&AgentStatus> {
        self.agents.iter().find(|a| &a.agent_id == agent_id)
    }

    /// IDs whose health label equals `label`, sorted.
    pub fn ids_with(&self, label: &str) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|a| a.health.label() == label)
            .map(|a| a.agent_id.clone())
            .collect();
        ids.sort();
        ids
    }
}
