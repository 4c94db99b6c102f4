//! Reconciliation and recovery, plus the loops that drive them.
//!
//! A cycle runs entirely under the coordinator's state lock:
//!
//! 1. ensure node networks and list containers (failure aborts the cycle)
//! 2. remove agents that left the desired set or changed: close session, then stop
//! 3. reopen sessions of tracked agents that are unhealthy or disconnected
//! 4. add new agents: pull if missing, start, attach public, open
//! 5. publish the snapshot, status events and the report

use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use fleet_engine::{ContainerHandle, ContainerSpec, EngineError};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

use super::retry::open_with_backoff;
use super::{Coordinator, FleetState, Networks, PendingRemoval, TrackedAgent};
use crate::bus::publish_json;
use crate::domain::{
    AgentDescriptor, AgentHealth, AgentId, CoordinatorError, FailedDescriptor, FailureStage,
    Result, SessionState,
};
use crate::metrics::METRICS;
use crate::obs::{
    cycle_span, emit_agent_failed, emit_agent_started, emit_agent_stopped, emit_agent_unhealthy,
    emit_reconcile_finished,
};

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub cycle: u64,
    /// Agents started in this cycle (healthy or not)
    pub added: Vec<AgentId>,
    /// Agents whose session was closed and container stopped
    pub removed: Vec<AgentId>,
    pub failed: Vec<FailedDescriptor>,
    /// Agents tracked but excluded from dispatch after this cycle
    pub unhealthy: Vec<AgentId>,
    /// Previously unhealthy or disconnected agents that reopened
    pub recovered: Vec<AgentId>,
    pub duration_ms: u64,
}

/// Payload of the running/stopped status subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatusEvent {
    pub generation: u64,
    pub agent_ids: Vec<AgentId>,
}

/// A failed addition, plus a container the rollback could not stop.
struct AddFailure {
    failed: FailedDescriptor,
    leftover_container: Option<String>,
}

fn needs_recovery(agent: &TrackedAgent) -> bool {
    matches!(agent.health, AgentHealth::Unhealthy { .. })
        || agent.session.state() == SessionState::Disconnected
}

impl Coordinator {
    /// Converge running agents to `desired` (a full replacement).
    ///
    /// Returns `ReconciliationPartialFailure` when any descriptor could not be
    /// added or removed; every other descriptor is still converged and the
    /// snapshot reflects the outcome.
    pub async fn reconcile(&self, desired: Vec<AgentDescriptor>) -> Result<ReconcileReport> {
        if self.is_shutting_down() {
            return Err(CoordinatorError::ShuttingDown);
        }
        let mut state = self.state.lock().await;
        state.cycle += 1;
        let span = cycle_span(state.cycle);
        self.reconcile_locked(&mut state, desired)
            .instrument(span)
            .await
    }

    async fn reconcile_locked(
        &self,
        state: &mut FleetState,
        desired: Vec<AgentDescriptor>,
    ) -> Result<ReconcileReport> {
        let started = Instant::now();
        // Last occurrence of an ID wins.
        let desired: BTreeMap<AgentId, AgentDescriptor> =
            desired.into_iter().map(|d| (d.id.clone(), d)).collect();

        let networks = self.ensure_networks(state).await?;
        let existing = self.engine.list_containers().await?;

        let mut report = ReconcileReport {
            cycle: state.cycle,
            ..Default::default()
        };
        state.failed.clear();

        // Removals, plus retries of earlier failed stops.
        let remove_ids: Vec<AgentId> = state
            .agents
            .iter()
            .filter(|(id, agent)| desired.get(*id) != Some(&agent.descriptor))
            .map(|(id, _)| id.clone())
            .collect();
        let removing: Vec<TrackedAgent> = remove_ids
            .iter()
            .filter_map(|id| state.agents.remove(id))
            .collect();
        let retrying: Vec<(AgentId, PendingRemoval)> =
            std::mem::take(&mut state.pending_removal).into_iter().collect();

        let (removal_results, retry_results) = tokio::join!(
            join_all(removing.iter().map(|agent| self.remove_agent(agent))),
            join_all(retrying.iter().map(|(_, p)| self.engine.stop_container(&p.container_id))),
        );

        let mut stopped: HashSet<String> = HashSet::new();
        for (agent, result) in removing.into_iter().zip(removal_results) {
            let id = agent.descriptor.id;
            match result {
                Ok(()) => {
                    stopped.insert(agent.container_id);
                    report.removed.push(id);
                }
                Err(e) => {
                    emit_agent_failed(id.as_str(), "stop", &e);
                    report.failed.push(FailedDescriptor {
                        agent_id: id.clone(),
                        stage: FailureStage::Stop,
                        reason: e.to_string(),
                    });
                    state.pending_removal.insert(
                        id,
                        PendingRemoval {
                            container_id: agent.container_id,
                        },
                    );
                }
            }
        }
        for ((id, pending), result) in retrying.into_iter().zip(retry_results) {
            match result {
                Ok(()) => {
                    debug!(agent_id = %id, "pending container stopped");
                    stopped.insert(pending.container_id);
                }
                Err(e) => {
                    warn!(agent_id = %id, error = %e, "container still not stopped");
                    state.pending_removal.insert(id, pending);
                }
            }
        }

        let (recovered, _) = self.recover_locked(state).await;
        report.recovered = recovered;

        // Additions. Containers stopped above are no longer stale.
        let existing: Vec<ContainerHandle> = existing
            .into_iter()
            .filter(|c| !stopped.contains(&c.id))
            .collect();
        let to_add: Vec<&AgentDescriptor> = desired
            .values()
            .filter(|d| !state.agents.contains_key(&d.id))
            .collect();
        let add_results =
            join_all(to_add.iter().map(|d| self.add_agent(d, &networks, &existing))).await;

        for result in add_results {
            match result {
                Ok(agent) => {
                    report.added.push(agent.descriptor.id.clone());
                    state.agents.insert(agent.descriptor.id.clone(), agent);
                }
                Err(failure) => {
                    let id = failure.failed.agent_id.clone();
                    if let Some(container_id) = failure.leftover_container {
                        state
                            .pending_removal
                            .insert(id.clone(), PendingRemoval { container_id });
                    }
                    report.failed.push(failure.failed.clone());
                    state.failed.insert(id, failure.failed);
                }
            }
        }

        report.unhealthy = state
            .agents
            .values()
            .filter(|a| matches!(a.health, AgentHealth::Unhealthy { .. }))
            .map(|a| a.descriptor.id.clone())
            .collect();
        report.duration_ms = started.elapsed().as_millis() as u64;

        self.publish_view(state);
        METRICS.inc_reconciliations();
        emit_reconcile_finished(
            report.added.len(),
            report.removed.len(),
            report.failed.len(),
            report.duration_ms,
        );
        self.publish_cycle_events(state, &report);

        if report.failed.is_empty() {
            Ok(report)
        } else {
            Err(CoordinatorError::ReconciliationPartialFailure {
                failed: report.failed,
            })
        }
    }

    /// Close the session first, then stop the container.
    async fn remove_agent(&self, agent: &TrackedAgent) -> std::result::Result<(), EngineError> {
        self.pool.close(&agent.session).await;
        self.engine.stop_container(&agent.container_id).await?;
        METRICS.inc_agents_stopped();
        emit_agent_stopped(agent.descriptor.id.as_str());
        Ok(())
    }

    fn agent_spec(&self, descriptor: &AgentDescriptor, name: String, networks: &Networks) -> ContainerSpec {
        let mut spec = ContainerSpec::new(name, descriptor.image.clone())
            .with_network(networks.internal.id.clone())
            .with_env("FLEET_AGENT_ID", descriptor.id.as_str())
            .with_env("FLEET_AGENT_RPC_PORT", descriptor.rpc_port.to_string())
            .with_limits(descriptor.limits.clone());
        if let Some(chain_id) = descriptor.chain_id {
            spec = spec.with_env("FLEET_CHAIN_ID", chain_id.to_string());
        }
        for (key, value) in &descriptor.env {
            spec = spec.with_env(key.clone(), value.clone());
        }
        spec
    }

    /// Bring one agent up. Failures roll back this agent only.
    async fn add_agent(
        &self,
        descriptor: &AgentDescriptor,
        networks: &Networks,
        existing: &[ContainerHandle],
    ) -> std::result::Result<TrackedAgent, AddFailure> {
        let id = &descriptor.id;
        let fail = |stage: FailureStage, err: &dyn Display, leftover_container: Option<String>| {
            emit_agent_failed(id.as_str(), &stage.to_string(), err);
            AddFailure {
                failed: FailedDescriptor {
                    agent_id: id.clone(),
                    stage,
                    reason: err.to_string(),
                },
                leftover_container,
            }
        };

        let name = descriptor.container_name(&self.config.container_prefix);
        if let Some(stale) = existing.iter().find(|c| c.name == name) {
            debug!(agent_id = %id, container_id = %stale.id, "stopping stale container");
            self.engine
                .stop_container(&stale.id)
                .await
                .map_err(|e| fail(FailureStage::Start, &e, Some(stale.id.clone())))?;
        }

        if !self.engine.has_local_image(&descriptor.image).await {
            self.engine
                .pull_image(&descriptor.image)
                .await
                .map_err(|e| fail(FailureStage::Pull, &e, None))?;
        }

        let handle = self
            .engine
            .start_container(&self.agent_spec(descriptor, name, networks))
            .await
            .map_err(|e| fail(FailureStage::Start, &e, None))?;

        if descriptor.public {
            if let Err(e) = self
                .engine
                .attach_network(&handle.id, &networks.public.id)
                .await
            {
                let leftover = self.rollback(id, &handle.id).await;
                return Err(fail(FailureStage::Attach, &e, leftover));
            }
        }

        match open_with_backoff(&self.pool, descriptor, &self.config.retry).await {
            Ok(session) => {
                METRICS.inc_agents_started();
                emit_agent_started(id.as_str(), &handle.id);
                Ok(TrackedAgent {
                    descriptor: descriptor.clone(),
                    container_id: handle.id,
                    session,
                    health: AgentHealth::Healthy,
                })
            }
            Err(exhausted) => {
                // Rejected or still unreachable: a new agent that never
                // answered is rolled back rather than tracked.
                let leftover = self.rollback(id, &handle.id).await;
                Err(fail(FailureStage::Dial, &exhausted.last_error, leftover))
            }
        }
    }

    /// Undo a partial addition. Returns the container ID if it is still running.
    async fn rollback(&self, agent_id: &AgentId, container_id: &str) -> Option<String> {
        if let Some(session) = self.pool.get(agent_id) {
            self.pool.close(&session).await;
        }
        match self.engine.stop_container(container_id).await {
            Ok(()) => None,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "rollback could not stop container");
                Some(container_id.to_string())
            }
        }
    }

    /// Reopen sessions of unhealthy or disconnected agents.
    ///
    /// Returns `(recovered, still_unhealthy)`.
    async fn recover_locked(&self, state: &mut FleetState) -> (Vec<AgentId>, Vec<AgentId>) {
        let candidates: Vec<AgentDescriptor> = state
            .agents
            .values()
            .filter(|a| needs_recovery(a))
            .map(|a| a.descriptor.clone())
            .collect();
        if candidates.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let results = join_all(
            candidates
                .iter()
                .map(|d| open_with_backoff(&self.pool, d, &self.config.retry)),
        )
        .await;

        let mut recovered = Vec::new();
        let mut unhealthy = Vec::new();
        for (descriptor, result) in candidates.iter().zip(results) {
            let Some(agent) = state.agents.get_mut(&descriptor.id) else {
                continue;
            };
            match result {
                Ok(session) => {
                    info!(agent_id = %descriptor.id, "agent session recovered");
                    agent.session = session;
                    agent.health = AgentHealth::Healthy;
                    recovered.push(descriptor.id.clone());
                }
                Err(exhausted) => {
                    let since = match &agent.health {
                        AgentHealth::Unhealthy { since, .. } => *since,
                        _ => Utc::now(),
                    };
                    emit_agent_unhealthy(
                        descriptor.id.as_str(),
                        exhausted.attempts,
                        &exhausted.last_error,
                    );
                    agent.health = AgentHealth::Unhealthy {
                        since,
                        last_error: exhausted.last_error.to_string(),
                    };
                    unhealthy.push(descriptor.id.clone());
                }
            }
        }
        (recovered, unhealthy)
    }

    /// Retry unhealthy and disconnected agents outside a reconciliation.
    ///
    /// Returns the agents that recovered.
    pub async fn recover(&self) -> Vec<AgentId> {
        if self.is_shutting_down() {
            return Vec::new();
        }
        let mut state = self.state.lock().await;
        let (recovered, unhealthy) = self.recover_locked(&mut state).await;
        if !recovered.is_empty() || !unhealthy.is_empty() {
            self.publish_view(&mut state);
        }
        recovered
    }

    fn publish_cycle_events(&self, state: &FleetState, report: &ReconcileReport) {
        let subjects = &self.config.subjects;
        let running = AgentStatusEvent {
            generation: state.generation,
            agent_ids: state
                .agents
                .values()
                .filter(|a| matches!(a.health, AgentHealth::Healthy))
                .map(|a| a.descriptor.id.clone())
                .collect(),
        };
        let stopped = AgentStatusEvent {
            generation: state.generation,
            agent_ids: report.removed.clone(),
        };

        let published = publish_json(self.bus.as_ref(), &subjects.status_running, &running)
            .and_then(|()| {
                if stopped.agent_ids.is_empty() {
                    Ok(())
                } else {
                    publish_json(self.bus.as_ref(), &subjects.status_stopped, &stopped)
                }
            })
            .and_then(|()| publish_json(self.bus.as_ref(), &subjects.reconcile_report, report));
        if let Err(e) = published {
            warn!(error = %e, "failed to publish reconcile events");
        }
    }
}

/// Apply desired sets one at a time, coalescing any that queued up meanwhile.
pub(super) async fn run_reconcile_loop(
    coordinator: Arc<Coordinator>,
    mut desired_rx: mpsc::UnboundedReceiver<Vec<AgentDescriptor>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown_rx.changed() => break,
            next = desired_rx.recv() => next,
        };
        let Some(mut desired) = next else {
            break;
        };
        // Each set is a full replacement; only the newest matters.
        while let Ok(newer) = desired_rx.try_recv() {
            desired = newer;
        }

        match coordinator.reconcile(desired).await {
            Ok(report) => debug!(cycle = report.cycle, "reconcile complete"),
            Err(CoordinatorError::ReconciliationPartialFailure { failed }) => {
                warn!(failed = failed.len(), "reconcile finished with failures")
            }
            Err(CoordinatorError::ShuttingDown) => break,
            Err(e) => warn!(error = %e, "reconcile aborted"),
        }
    }
    debug!("reconcile loop stopped");
}

/// Periodic recovery, plus immediate recovery when dispatch reports a disconnect.
pub(super) async fn run_maintenance_loop(
    coordinator: Arc<Coordinator>,
    mut recover_rx: mpsc::Receiver<AgentId>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let period = coordinator.config.retry.recovery_interval();
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tick.tick() => {
                coordinator.recover().await;
                METRICS.flush();
            }
            Some(agent_id) = recover_rx.recv() => {
                debug!(agent_id = %agent_id, "disconnect reported");
                while recover_rx.try_recv().is_ok() {}
                coordinator.recover().await;
            }
        }
    }
    debug!("maintenance loop stopped");
}
