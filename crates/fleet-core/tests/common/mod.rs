//! Shared wiring for coordinator tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleet_core::fakes::{DialBehavior, EvalBehavior, ScriptedConnector};
use fleet_core::{
    handler, AgentId, Coordinator, CoordinatorConfig, EvaluationRequest, LocalBus, MessageClient,
    RetryPolicy, SessionState,
};
use serde_json::json;
use fleet_engine::fakes::{Journal, MemoryEngine};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

pub struct Harness {
    pub journal: Journal,
    pub engine: Arc<MemoryEngine>,
    pub connector: Arc<ScriptedConnector>,
    pub bus: Arc<LocalBus>,
    pub coordinator: Arc<Coordinator>,
}

/// Retry quickly so exhausted reconnects do not slow tests down.
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            recovery_interval_ms: 60_000,
        },
        dispatch_timeout: Duration::from_millis(500),
        ..CoordinatorConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(fast_config())
}

pub fn harness_with(config: CoordinatorConfig) -> Harness {
    let journal = Journal::new();
    let engine = Arc::new(MemoryEngine::with_journal(journal.clone()));
    let connector = Arc::new(ScriptedConnector::with_journal(journal.clone()));
    let bus = Arc::new(LocalBus::new());
    let coordinator = Coordinator::new(engine.clone(), connector.clone(), bus.clone(), config);
    Harness {
        journal,
        engine,
        connector,
        bus,
        coordinator,
    }
}

impl Harness {
    /// Break a tracked agent's transport and make it unreachable, so the
    /// next recovery attempt leaves it unhealthy.
    pub async fn lose_agent(&self, agent_id: &AgentId) {
        self.connector.set_eval(agent_id, EvalBehavior::Disconnect);
        self.coordinator
            .dispatch(EvaluationRequest::transaction(json!({ "lose": agent_id.as_str() })))
            .await
            .unwrap();
        assert_eq!(
            self.coordinator.session(agent_id).unwrap().state(),
            SessionState::Disconnected
        );
        self.connector.set_dial(agent_id, DialBehavior::Unreachable);
        self.connector.set_eval(agent_id, EvalBehavior::Respond);
    }
}

/// Collect every message on `subject`, decoded as `T`.
pub fn record<T>(bus: &LocalBus, subject: &str) -> mpsc::UnboundedReceiver<T>
where
    T: DeserializeOwned + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    bus.subscribe(
        subject,
        handler(move |msg| {
            let tx = tx.clone();
            async move {
                let value = msg.decode::<T>()?;
                // Receiver dropped means the test no longer cares.
                let _ = tx.send(value);
                Ok(())
            }
        }),
    );
    rx
}

/// Next recorded message, failing the test after two seconds.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("recorder closed")
}

/// Whether nothing more arrives within a short grace period.
pub async fn quiet<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> bool {
    tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .is_err()
}
