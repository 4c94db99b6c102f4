//! Orchestration coordinator.
//!
//! Owns the tracked agent state (descriptor → container + session) and is the
//! only component that mutates it. Every mutation happens under one async
//! lock, so reconciliation, recovery, prune and shutdown never overlap.
//! Dispatch reads a [`watch`] snapshot and never takes the lock.
//!
//! - [`reconcile`]: converge running agents to a desired set
//! - [`dispatch`]: fan one evaluation request out and aggregate
//! - [`retry`]: reconnect policy

mod dispatch;
mod reconcile;
mod retry;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use fleet_engine::{ContainerEngine, ContainerHandle, ContainerStatus, NetworkHandle};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{subscribe_typed, MessageClient, SubscriptionId};
use crate::config::{NodeConfig, ServiceConfig, SubjectsConfig};
use crate::domain::{
    AgentDescriptor, AgentHealth, AgentId, AgentStatus, CoordinatorError, EvaluationRequest,
    FailedDescriptor, FleetSnapshot, Result,
};
use crate::metrics::METRICS;
use crate::session::{AgentConnector, AgentSession, SessionPool};

pub use reconcile::{AgentStatusEvent, ReconcileReport};
pub use retry::{open_with_backoff, RetryExhausted, RetryPolicy};

/// Coordinator settings, usually derived from [`NodeConfig`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub container_prefix: String,
    pub public_network: String,
    pub internal_network: String,
    pub subjects: SubjectsConfig,
    /// Per-agent upper bound for one evaluate call
    pub dispatch_timeout: Duration,
    pub retry: RetryPolicy,
    pub services: Vec<ServiceConfig>,
    pub stop_agents_on_shutdown: bool,
}

impl From<&NodeConfig> for CoordinatorConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            container_prefix: config.node.container_prefix.clone(),
            public_network: config.networks.public.clone(),
            internal_network: config.networks.internal.clone(),
            subjects: config.subjects.clone(),
            dispatch_timeout: Duration::from_millis(config.dispatch.timeout_ms),
            retry: config.retry.clone(),
            services: config.services.clone(),
            stop_agents_on_shutdown: config.node.stop_agents_on_shutdown,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&NodeConfig::default())
    }
}

#[derive(Debug, Clone)]
struct Networks {
    public: NetworkHandle,
    internal: NetworkHandle,
}

/// One agent the coordinator has a container for.
#[derive(Debug, Clone)]
struct TrackedAgent {
    descriptor: AgentDescriptor,
    container_id: String,
    /// Last opened session; may be disconnected while the agent is unhealthy
    session: Arc<AgentSession>,
    health: AgentHealth,
}

/// A removed agent whose container could not be stopped yet.
#[derive(Debug, Clone)]
struct PendingRemoval {
    container_id: String,
}

#[derive(Debug, Default)]
struct FleetState {
    agents: BTreeMap<AgentId, TrackedAgent>,
    failed: BTreeMap<AgentId, FailedDescriptor>,
    pending_removal: BTreeMap<AgentId, PendingRemoval>,
    networks: Option<Networks>,
    generation: u64,
    cycle: u64,
}

impl FleetState {
    fn snapshot(&self) -> FleetSnapshot {
        let mut agents: Vec<AgentStatus> = self
            .agents
            .iter()
            .map(|(id, agent)| AgentStatus {
                agent_id: id.clone(),
                health: agent.health.clone(),
                session: Some(agent.session.state()),
                container_id: Some(agent.container_id.clone()),
            })
            .collect();
        for (id, failed) in &self.failed {
            if !self.agents.contains_key(id) {
                agents.push(AgentStatus {
                    agent_id: id.clone(),
                    health: AgentHealth::Failed {
                        stage: failed.stage,
                        reason: failed.reason.clone(),
                    },
                    session: None,
                    container_id: None,
                });
            }
        }
        for (id, pending) in &self.pending_removal {
            if !self.agents.contains_key(id) && !self.failed.contains_key(id) {
                agents.push(AgentStatus {
                    agent_id: id.clone(),
                    health: AgentHealth::PendingRemoval,
                    session: None,
                    container_id: Some(pending.container_id.clone()),
                });
            }
        }
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        FleetSnapshot {
            generation: self.generation,
            agents,
        }
    }
}

/// Agent eligible for dispatch.
#[derive(Debug, Clone)]
struct DispatchTarget {
    agent_id: AgentId,
    chain_id: Option<u64>,
    session: Arc<AgentSession>,
}

/// What readers outside the lock see.
#[derive(Debug, Clone, Default)]
struct FleetView {
    targets: Vec<DispatchTarget>,
    snapshot: FleetSnapshot,
}

/// Reconciles agents and dispatches evaluations.
pub struct Coordinator {
    engine: Arc<dyn ContainerEngine>,
    pool: Arc<SessionPool>,
    bus: Arc<dyn MessageClient>,
    config: CoordinatorConfig,
    state: Mutex<FleetState>,
    view: watch::Sender<FleetView>,
    /// Wakes the maintenance loop; holds at most one pending report
    recover_tx: mpsc::Sender<AgentId>,
    recover_rx: StdMutex<Option<mpsc::Receiver<AgentId>>>,
    shutting_down: AtomicBool,
}

impl Coordinator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        connector: Arc<dyn AgentConnector>,
        bus: Arc<dyn MessageClient>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        let (view, _) = watch::channel(FleetView::default());
        let (recover_tx, recover_rx) = mpsc::channel(1);
        Arc::new(Self {
            engine,
            pool: Arc::new(SessionPool::new(connector)),
            bus,
            config,
            state: Mutex::new(FleetState::default()),
            view,
            recover_tx,
            recover_rx: StdMutex::new(Some(recover_rx)),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Read-only copy of the tracked state.
    pub fn snapshot(&self) -> FleetSnapshot {
        self.view.borrow().snapshot.clone()
    }

    /// Status of one agent, if the coordinator knows it.
    pub fn status(&self, agent_id: &AgentId) -> Option<AgentStatus> {
        self.view.borrow().snapshot.get(agent_id).cloned()
    }

    /// Current session for `agent_id` in the pool.
    pub fn session(&self, agent_id: &AgentId) -> Option<Arc<AgentSession>> {
        self.pool.get(agent_id)
    }

    /// IDs of tracked agents (running container, healthy or unhealthy).
    pub fn tracked_ids(&self) -> Vec<AgentId> {
        self.view
            .borrow()
            .snapshot
            .agents
            .iter()
            .filter(|a| matches!(a.health, AgentHealth::Healthy | AgentHealth::Unhealthy { .. }))
            .map(|a| a.agent_id.clone())
            .collect()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Publish the dispatch targets and snapshot for lock-free readers.
    fn publish_view(&self, state: &mut FleetState) {
        state.generation += 1;
        let targets = state
            .agents
            .values()
            .filter(|a| matches!(a.health, AgentHealth::Healthy))
            .map(|a| DispatchTarget {
                agent_id: a.descriptor.id.clone(),
                chain_id: a.descriptor.chain_id,
                session: Arc::clone(&a.session),
            })
            .collect();
        self.view.send_replace(FleetView {
            targets,
            snapshot: state.snapshot(),
        });
    }

    /// Create the node networks unless already known.
    async fn ensure_networks(&self, state: &mut FleetState) -> Result<Networks> {
        if let Some(networks) = &state.networks {
            return Ok(networks.clone());
        }
        let public = self
            .engine
            .create_public_network(&self.config.public_network)
            .await?;
        let internal = self
            .engine
            .create_internal_network(&self.config.internal_network)
            .await?;
        let networks = Networks { public, internal };
        state.networks = Some(networks.clone());
        Ok(networks)
    }

    /// Ensure the node networks and start the configured service containers.
    ///
    /// A service whose container is already running under its name is left
    /// alone. Any failure is fatal for this call.
    pub async fn bootstrap(&self) -> Result<Vec<ContainerHandle>> {
        if self.is_shutting_down() {
            return Err(CoordinatorError::ShuttingDown);
        }
        let mut state = self.state.lock().await;
        let networks = self.ensure_networks(&mut state).await?;
        let existing = self.engine.list_containers().await?;
        let prefix = &self.config.container_prefix;

        let mut handles = Vec::with_capacity(self.config.services.len());
        for service in &self.config.services {
            let name = service.container_name(prefix);
            let current = existing.iter().find(|c| c.name == name);
            if let Some(running) = current.filter(|c| c.status == ContainerStatus::Running) {
                debug!(service = %name, "service already running");
                handles.push(running.clone());
                continue;
            }
            if let Some(stale) = current {
                self.engine.stop_container(&stale.id).await?;
            }
            if !self.engine.has_local_image(&service.image).await {
                self.engine.pull_image(&service.image).await?;
            }
            let handle = self
                .engine
                .start_container(&service.container_spec(prefix, &networks.internal.id))
                .await?;
            if service.is_public() {
                if let Err(e) = self
                    .engine
                    .attach_network(&handle.id, &networks.public.id)
                    .await
                {
                    let _ = self.engine.stop_container(&handle.id).await;
                    return Err(e.into());
                }
            }
            info!(service = %name, role = service.role.as_str(), container_id = %handle.id, "service started");
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Prune the engine. Never overlaps a reconciliation.
    pub async fn prune(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.engine.prune().await?;
        // Unused networks may be gone now.
        state.networks = None;
        info!("engine pruned");
        Ok(())
    }

    /// Subscribe to the registry and request subjects and spawn the
    /// reconcile and maintenance loops.
    pub fn start(self: &Arc<Self>) -> CoordinatorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (desired_tx, desired_rx) = mpsc::unbounded_channel::<Vec<AgentDescriptor>>();
        let subjects = &self.config.subjects;

        let registry = subscribe_typed(self.bus.as_ref(), &subjects.desired, move |desired: Vec<AgentDescriptor>| {
            let desired_tx = desired_tx.clone();
            async move {
                desired_tx
                    .send(desired)
                    .map_err(|_| anyhow::anyhow!("reconcile loop has stopped"))
            }
        });

        // Every in-flight dispatch holds a sender clone; shutdown waits for
        // the channel to close.
        let (inflight_tx, inflight_rx) = mpsc::channel::<()>(1);
        let coordinator = Arc::clone(self);
        let requests = subscribe_typed(self.bus.as_ref(), &subjects.requests, move |request: EvaluationRequest| {
            let coordinator = Arc::clone(&coordinator);
            let inflight = inflight_tx.clone();
            async move {
                // Pipelined: the handler returns before the fan-out completes.
                tokio::spawn(async move {
                    let _inflight = inflight;
                    if let Err(e) = coordinator.dispatch(request).await {
                        warn!(error = %e, "dispatch failed");
                    }
                });
                Ok(())
            }
        });

        let recover_rx = match self.recover_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let mut tasks = vec![tokio::spawn(reconcile::run_reconcile_loop(
            Arc::clone(self),
            desired_rx,
            shutdown_rx.clone(),
        ))];
        match recover_rx {
            Some(recover_rx) => tasks.push(tokio::spawn(reconcile::run_maintenance_loop(
                Arc::clone(self),
                recover_rx,
                shutdown_rx,
            ))),
            None => warn!("coordinator already started; maintenance loop not spawned"),
        }

        info!(
            desired = %subjects.desired,
            requests = %subjects.requests,
            "coordinator started"
        );
        CoordinatorHandle {
            coordinator: Arc::clone(self),
            shutdown_tx,
            tasks,
            subscriptions: vec![registry, requests],
            inflight: inflight_rx,
        }
    }

    /// Close every session and, if configured, stop agent containers.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let mut state = self.state.lock().await;
        self.pool.close_all().await;

        if self.config.stop_agents_on_shutdown {
            let agents = std::mem::take(&mut state.agents);
            for (id, agent) in agents {
                match self.engine.stop_container(&agent.container_id).await {
                    Ok(()) => METRICS.inc_agents_stopped(),
                    Err(e) => warn!(agent_id = %id, error = %e, "failed to stop agent on shutdown"),
                }
            }
        }
        self.publish_view(&mut state);
        info!("coordinator shut down");
    }
}

/// Running coordinator loops and subscriptions.
pub struct CoordinatorHandle {
    coordinator: Arc<Coordinator>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    subscriptions: Vec<SubscriptionId>,
    inflight: mpsc::Receiver<()>,
}

impl CoordinatorHandle {
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Stop listening, wait for the loops and in-flight dispatches to finish
    /// and shut the coordinator down.
    pub async fn shutdown(mut self) {
        for id in &self.subscriptions {
            self.coordinator.bus.unsubscribe(*id);
        }
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        // Resolves once the request handler and every dispatch it spawned
        // have dropped their sender. A dispatch is bounded by the per-call
        // timeout, plus publishing.
        let grace = self.coordinator.config.dispatch_timeout * 2;
        if tokio::time::timeout(grace, self.inflight.recv()).await.is_err() {
            warn!("in-flight dispatches still running at shutdown");
        }
        self.coordinator.shutdown().await;
    }
}
