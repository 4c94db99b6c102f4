//! Fleet Core Library
//!
//! Runtime orchestration for a node that runs detection agents: the message
//! bus, agent sessions, the coordinator that reconciles and dispatches, and the
//! node's configuration and telemetry.

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod rpc;
pub mod session;
pub mod telemetry;

pub use bus::{
    handler, publish_json, subjects, subscribe_typed, Handler, LocalBus, Message, MessageClient,
    SubscriptionId,
};

pub use config::{
    DispatchConfig, NetworksConfig, NodeConfig, NodeSection, ServiceConfig, ServiceRole,
    SubjectsConfig,
};

pub use coordinator::{
    AgentStatusEvent, Coordinator, CoordinatorConfig, CoordinatorHandle, ReconcileReport,
    RetryPolicy,
};

pub use domain::{
    AgentDescriptor, AgentHealth, AgentId, AgentOutcome, AgentResult, AgentStatus,
    AggregatedResult, BusError, ConfigError, CoordinatorError, DialError, EvaluationError,
    EvaluationFault, EvaluationKind, EvaluationRequest, EvaluationResponse, FailedDescriptor,
    FailureStage, FaultKind, Finding, FleetSnapshot, RequestId, Result, SessionState, Severity,
};

pub use rpc::{HttpConnector, HttpConnectorConfig};
pub use session::{AgentChannel, AgentConnector, AgentSession, ChannelError, SessionPool};
pub use telemetry::init_tracing;
