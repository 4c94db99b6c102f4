//! Evaluation requests, responses and the aggregated per-request result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::agent::AgentId;
use super::error::EvaluationError;

/// Identifier of one block/tx submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Deterministic ID from the request content (SHA-256, first 16 hex chars).
    ///
    /// Redelivered copies of the same block/tx get the same ID, so consumers
    /// can drop duplicates.
    pub fn from_content(kind: EvaluationKind, payload: &serde_json::Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(payload.to_string().as_bytes());
        let digest = hex::encode(hasher.finalize());
        RequestId(format!("{}-{}", kind.as_str(), &digest[..16]))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationKind {
    Block,
    Transaction,
}

impl EvaluationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Transaction => "tx",
        }
    }
}

/// One unit of block or transaction data to submit to agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub id: RequestId,
    pub kind: EvaluationKind,
    /// Chain the data comes from; agents scoped to other chains are skipped
    #[serde(default)]
    pub chain_id: Option<u64>,
    /// Raw block/tx payload, opaque to the node
    pub payload: serde_json::Value,
}

impl EvaluationRequest {
    pub fn block(payload: serde_json::Value) -> Self {
        Self::new(EvaluationKind::Block, payload)
    }

    pub fn transaction(payload: serde_json::Value) -> Self {
        Self::new(EvaluationKind::Transaction, payload)
    }

    fn new(kind: EvaluationKind, payload: serde_json::Value) -> Self {
        Self {
            id: RequestId::from_content(kind, &payload),
            kind,
            chain_id: None,
            payload,
        }
    }

    pub fn on_chain(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }
}

/// Severity reported by an agent for a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
    #[serde(other)]
    Unknown,
}

/// A single structured finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub alert_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// What an agent returns for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResponse {
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// Agent-reported processing time
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

/// Classification of a per-agent fault in an aggregated result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Busy,
    Disconnected,
    Timeout,
    Closed,
    Agent,
}

/// A fault recorded for one agent on one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationFault {
    pub kind: FaultKind,
    pub message: String,
}

impl From<&EvaluationError> for EvaluationFault {
    fn from(err: &EvaluationError) -> Self {
        let kind = match err {
            EvaluationError::Busy { .. } => FaultKind::Busy,
            EvaluationError::Disconnected { .. } => FaultKind::Disconnected,
            EvaluationError::Timeout { .. } => FaultKind::Timeout,
            EvaluationError::Closed { .. } => FaultKind::Closed,
            EvaluationError::Agent { .. } => FaultKind::Agent,
        };
        EvaluationFault {
            kind,
            message: err.to_string(),
        }
    }
}

/// Success or fault for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentOutcome {
    Success { response: EvaluationResponse },
    Fault { fault: EvaluationFault },
}

impl AgentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            Self::Fault { fault } => Some(fault.kind),
            Self::Success { .. } => None,
        }
    }
}

/// One agent's entry in an aggregated result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: AgentId,
    #[serde(flatten)]
    pub outcome: AgentOutcome,
}

/// Every agent's outcome for one request, published once per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub request_id: RequestId,
    pub kind: EvaluationKind,
    pub results: Vec<AgentResult>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl AggregatedResult {
    pub fn successes(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_success()).count()
    }

    pub fn faults(&self) -> usize {
        self.results.len() - self.successes()
    }

    pub fn outcome_for(&self, agent_id: &AgentId) -> Option<&AgentOutcome> {
        self.results
            .iter()
            .find(|r| &r.agent_id == agent_id)
            .map(|r| &r.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_id_is_content_derived() {
        let a = EvaluationRequest::block(json!({"number": 100}));
        let b = EvaluationRequest::block(json!({"number": 100}));
        let c = EvaluationRequest::transaction(json!({"number": 100}));
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert!(a.id.0.starts_with("block-"));
    }

    #[test]
    fn unknown_severity_is_tolerated() {
        let f: Finding = serde_json::from_value(json!({
            "alert_id": "X-1",
            "name": "odd",
            "severity": "catastrophic"
        }))
        .unwrap();
        assert_eq!(f.severity, Severity::Unknown);
    }

    #[test]
    fn agent_result_serializes_flat() {
        let r = AgentResult {
            agent_id: AgentId::new("a"),
            outcome: AgentOutcome::Fault {
                fault: EvaluationFault {
                    kind: FaultKind::Timeout,
                    message: "late".into(),
                },
            },
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["agent_id"], "a");
        assert_eq!(v["status"], "fault");
        assert_eq!(v["fault"]["kind"], "timeout");
    }
}
