//! Agent session pool.
//!
//! One [`AgentSession`] per agent wraps an [`AgentChannel`] produced by an
//! [`AgentConnector`]. The pool never retries or reconnects on its own; those
//! decisions belong to the coordinator.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Ready -> Closing -> Closed
//!                                 |                   ^
//!                                 v                   |
//!                           Disconnected -------------+
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    AgentDescriptor, AgentId, DialError, EvaluationError, EvaluationRequest, EvaluationResponse,
    SessionState,
};

/// Failure reported by a channel for one call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The connection broke; the session can no longer be used.
    #[error("transport error: {0}")]
    Transport(String),
    /// The agent answered with a fault; the connection is still usable.
    #[error("agent fault: {0}")]
    Agent(String),
}

/// An established RPC channel to one agent.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResponse, ChannelError>;

    /// Release the underlying connection.
    async fn close(&self);
}

/// Establishes channels, including the agent's initialize handshake.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &AgentDescriptor,
    ) -> Result<Arc<dyn AgentChannel>, DialError>;
}

/// Live session bound to one agent.
pub struct AgentSession {
    agent_id: AgentId,
    state: Mutex<SessionState>,
    busy: AtomicBool,
    channel: Mutex<Option<Arc<dyn AgentChannel>>>,
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("agent_id", &self.agent_id)
            .field("state", &self.state())
            .field("busy", &self.is_busy())
            .finish()
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Clears the busy flag when the evaluation future completes or is dropped.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AgentSession {
    fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            state: Mutex::new(SessionState::Disconnected),
            busy: AtomicBool::new(false),
            channel: Mutex::new(None),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Whether an evaluation is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        debug!(agent_id = %self.agent_id, from = %*state, to = %next, "session transition");
        *state = next;
    }

    /// `Ready -> Disconnected`; any other state is left alone.
    fn mark_disconnected(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == SessionState::Ready {
            *state = SessionState::Disconnected;
            true
        } else {
            false
        }
    }
}

/// Pool of agent sessions, at most one per agent ID.
pub struct SessionPool {
    connector: Arc<dyn AgentConnector>,
    sessions: Mutex<HashMap<AgentId, Arc<AgentSession>>>,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn AgentConnector>) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a session to `descriptor`'s agent.
    ///
    /// A previous session for the same agent is closed once the new one is
    /// ready, so the pool never holds two channels for one agent.
    #[instrument(skip(self, descriptor), fields(agent_id = %descriptor.id))]
    pub async fn open(&self, descriptor: &AgentDescriptor) -> Result<Arc<AgentSession>, DialError> {
        let session = Arc::new(AgentSession::new(descriptor.id.clone()));
        session.set_state(SessionState::Connecting);

        let channel = match self.connector.connect(descriptor).await {
            Ok(channel) => channel,
            Err(e) => {
                session.set_state(SessionState::Disconnected);
                return Err(e);
            }
        };

        *lock(&session.channel) = Some(channel);
        session.set_state(SessionState::Ready);

        let previous = lock(&self.sessions).insert(descriptor.id.clone(), Arc::clone(&session));
        if let Some(previous) = previous {
            self.close(&previous).await;
        }

        info!(agent_id = %descriptor.id, "session ready");
        Ok(session)
    }

    /// Issue one evaluation call on `session`.
    ///
    /// Fails fast with `Busy` if a call is already in flight, and with
    /// `Disconnected`/`Closed` if the session is not ready.
    pub async fn evaluate(
        &self,
        session: &AgentSession,
        request: &EvaluationRequest,
    ) -> Result<EvaluationResponse, EvaluationError> {
        let agent_id = session.agent_id().clone();

        match session.state() {
            SessionState::Ready => {}
            SessionState::Disconnected | SessionState::Connecting => {
                return Err(EvaluationError::Disconnected {
                    agent_id,
                    reason: "session is not connected".to_string(),
                })
            }
            SessionState::Closing | SessionState::Closed => {
                return Err(EvaluationError::Closed { agent_id })
            }
        }

        if session
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EvaluationError::Busy { agent_id });
        }
        let _guard = BusyGuard(&session.busy);

        let channel = lock(&session.channel).clone();
        let Some(channel) = channel else {
            return Err(EvaluationError::Closed { agent_id });
        };

        match channel.evaluate(request).await {
            Ok(response) => Ok(response),
            Err(ChannelError::Agent(message)) => Err(EvaluationError::Agent { agent_id, message }),
            Err(ChannelError::Transport(reason)) => {
                if session.mark_disconnected() {
                    warn!(agent_id = %agent_id, error = %reason, "session lost its transport");
                    Err(EvaluationError::Disconnected { agent_id, reason })
                } else {
                    // Closed underneath us.
                    Err(EvaluationError::Closed { agent_id })
                }
            }
        }
    }

    /// Close `session` and release its channel. Idempotent.
    pub async fn close(&self, session: &AgentSession) {
        {
            let mut state = lock(&session.state);
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }

        let channel = lock(&session.channel).take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        session.set_state(SessionState::Closed);

        let mut sessions = lock(&self.sessions);
        if let Some(current) = sessions.get(session.agent_id()) {
            if std::ptr::eq(Arc::as_ptr(current), session) {
                sessions.remove(session.agent_id());
            }
        }
        debug!(agent_id = %session.agent_id(), "session closed");
    }

    /// Current session for `agent_id`, if any.
    pub fn get(&self, agent_id: &AgentId) -> Option<Arc<AgentSession>> {
        lock(&self.sessions).get(agent_id).cloned()
    }

    /// Number of sessions held by the pool.
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session (shutdown path).
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<AgentSession>> = lock(&self.sessions).values().cloned().collect();
        for session in sessions {
            self.close(&session).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{EvalBehavior, ScriptedConnector};
    use serde_json::json;
    use std::time::Duration;

    fn pool_with(connector: ScriptedConnector) -> (SessionPool, Arc<ScriptedConnector>) {
        let connector = Arc::new(connector);
        (SessionPool::new(connector.clone()), connector)
    }

    #[tokio::test]
    async fn open_reaches_ready() {
        let (pool, _) = pool_with(ScriptedConnector::new());
        let session = pool.open(&AgentDescriptor::new("a", "img")).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn reopen_closes_previous_session() {
        let (pool, _) = pool_with(ScriptedConnector::new());
        let d = AgentDescriptor::new("a", "img");
        let first = pool.open(&d).await.unwrap();
        let second = pool.open(&d).await.unwrap();
        assert_eq!(first.state(), SessionState::Closed);
        assert_eq!(second.state(), SessionState::Ready);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn transport_loss_disconnects_session() {
        let connector = ScriptedConnector::new();
        connector.set_eval(&"a".into(), EvalBehavior::Disconnect);
        let (pool, _) = pool_with(connector);
        let session = pool.open(&AgentDescriptor::new("a", "img")).await.unwrap();

        let err = pool
            .evaluate(&session, &EvaluationRequest::block(json!({"n": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluationError::Disconnected { .. }));
        assert_eq!(session.state(), SessionState::Disconnected);

        // Further calls fail fast without touching the channel.
        let err = pool
            .evaluate(&session, &EvaluationRequest::block(json!({"n": 2})))
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluationError::Disconnected { .. }));
    }

    #[tokio::test]
    async fn dropped_call_releases_busy_flag() {
        let connector = ScriptedConnector::new();
        connector.set_eval(&"a".into(), EvalBehavior::Hang);
        let (pool, _) = pool_with(connector);
        let session = pool.open(&AgentDescriptor::new("a", "img")).await.unwrap();

        let req = EvaluationRequest::block(json!({"n": 1}));
        let timed = tokio::time::timeout(Duration::from_millis(20), pool.evaluate(&session, &req)).await;
        assert!(timed.is_err());
        assert!(!session.is_busy());
        assert!(session.is_ready());
    }
}
