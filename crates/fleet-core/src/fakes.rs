//! Scripted agent connector (testing only)
//!
//! `ScriptedConnector` hands out in-memory channels whose dial and evaluate
//! behaviour is set per agent. Opens and closes are recorded into a
//! [`Journal`] that can be shared with `fleet_engine::fakes::MemoryEngine`,
//! so tests can assert ordering across the session pool and the engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_engine::fakes::Journal;
use serde_json::json;

use crate::domain::{
    AgentDescriptor, AgentId, DialError, EvaluationRequest, EvaluationResponse, Finding, Severity,
};
use crate::session::{AgentChannel, AgentConnector, ChannelError};

/// How `connect` behaves for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialBehavior {
    Accept,
    /// Handshake refused
    Reject,
    /// Endpoint never answers
    Unreachable,
    /// Unreachable for the next `n` attempts, then accept
    FailTimes(u32),
}

/// How `evaluate` behaves for one agent's channels.
#[derive(Debug, Clone)]
pub enum EvalBehavior {
    /// Reply with one finding tagged with the agent and request IDs
    Respond,
    /// Reply after sleeping
    Delay(Duration),
    /// Never reply
    Hang,
    /// Break the transport
    Disconnect,
    /// Reply with an agent-side fault
    Fault(String),
}

#[derive(Default)]
struct Script {
    dial: HashMap<AgentId, DialBehavior>,
    eval: HashMap<AgentId, EvalBehavior>,
    dial_attempts: HashMap<AgentId, u32>,
    evaluations: HashMap<AgentId, u32>,
}

/// In-memory [`AgentConnector`].
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
    journal: Journal,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            script: Arc::default(),
            journal,
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn set_dial(&self, agent_id: &AgentId, behavior: DialBehavior) {
        self.script
            .lock()
            .unwrap()
            .dial
            .insert(agent_id.clone(), behavior);
    }

    /// Applies to channels already handed out as well as future ones.
    pub fn set_eval(&self, agent_id: &AgentId, behavior: EvalBehavior) {
        self.script
            .lock()
            .unwrap()
            .eval
            .insert(agent_id.clone(), behavior);
    }

    /// Number of `connect` calls made for `agent_id`.
    pub fn dial_attempts(&self, agent_id: &AgentId) -> u32 {
        self.script
            .lock()
            .unwrap()
            .dial_attempts
            .get(agent_id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of `evaluate` calls that reached a channel for `agent_id`.
    pub fn evaluations(&self, agent_id: &AgentId) -> u32 {
        self.script
            .lock()
            .unwrap()
            .evaluations
            .get(agent_id)
            .copied()
            .unwrap_or(0)
    }

    fn eval_behavior(&self, agent_id: &AgentId) -> EvalBehavior {
        let mut script = self.script.lock().unwrap();
        *script.evaluations.entry(agent_id.clone()).or_default() += 1;
        script
            .eval
            .get(agent_id)
            .cloned()
            .unwrap_or(EvalBehavior::Respond)
    }
}

#[async_trait]
impl AgentConnector for ScriptedConnector {
    async fn connect(
        &self,
        descriptor: &AgentDescriptor,
    ) -> Result<Arc<dyn AgentChannel>, DialError> {
        let id = descriptor.id.clone();
        let behavior = {
            let mut script = self.script.lock().unwrap();
            *script.dial_attempts.entry(id.clone()).or_default() += 1;
            let behavior = script.dial.get(&id).cloned().unwrap_or(DialBehavior::Accept);
            if let DialBehavior::FailTimes(n) = behavior {
                let next = if n <= 1 {
                    DialBehavior::Accept
                } else {
                    DialBehavior::FailTimes(n - 1)
                };
                script.dial.insert(id.clone(), next);
            }
            behavior
        };

        match behavior {
            DialBehavior::Accept => {
                self.journal.record(format!("open:{id}"));
                Ok(Arc::new(ScriptedChannel {
                    agent_id: id,
                    connector: self.clone(),
                    closed: AtomicBool::new(false),
                }))
            }
            DialBehavior::Reject => Err(DialError::Rejected {
                agent_id: id,
                reason: "scripted rejection".to_string(),
            }),
            DialBehavior::Unreachable | DialBehavior::FailTimes(_) => Err(DialError::Unreachable {
                endpoint: descriptor.resolved_endpoint("test"),
                agent_id: id,
                reason: "scripted unreachable".to_string(),
            }),
        }
    }
}

struct ScriptedChannel {
    agent_id: AgentId,
    connector: ScriptedConnector,
    closed: AtomicBool,
}

impl ScriptedChannel {
    fn respond(&self, request: &EvaluationRequest) -> EvaluationResponse {
        EvaluationResponse {
            findings: vec![Finding {
                alert_id: format!("{}:{}", self.agent_id, request.id),
                name: "scripted".to_string(),
                description: String::new(),
                severity: Severity::Info,
                metadata: json!({ "agent_id": self.agent_id }),
            }],
            latency_ms: Some(0),
        }
    }
}

#[async_trait]
impl AgentChannel for ScriptedChannel {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResponse, ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Transport("channel closed".to_string()));
        }
        match self.connector.eval_behavior(&self.agent_id) {
            EvalBehavior::Respond => Ok(self.respond(request)),
            EvalBehavior::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(self.respond(request))
            }
            EvalBehavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            EvalBehavior::Disconnect => Err(ChannelError::Transport("scripted disconnect".to_string())),
            EvalBehavior::Fault(message) => Err(ChannelError::Agent(message)),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.connector.journal.record(format!("close:{}", self.agent_id));
        }
    }
}
