//! Domain model: agents, evaluations, status and errors.

pub mod agent;
pub mod error;
pub mod evaluation;
pub mod status;

pub use agent::{AgentDescriptor, AgentId, DEFAULT_AGENT_RPC_PORT};
pub use error::{
    BusError, ConfigError, CoordinatorError, DialError, EvaluationError, FailedDescriptor,
    FailureStage, Result,
};
pub use evaluation::{
    AgentOutcome, AgentResult, AggregatedResult, EvaluationFault, EvaluationKind,
    EvaluationRequest, EvaluationResponse, FaultKind, Finding, RequestId, Severity,
};
pub use status::{AgentHealth, AgentStatus, FleetSnapshot, SessionState};
