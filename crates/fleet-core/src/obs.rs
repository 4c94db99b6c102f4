//! Structured lifecycle events for agents, reconciliation and dispatch.
//!
//! Every helper emits one event with a stable `event` field so log pipelines
//! can key on it. Set `FLEET_LOG` to adjust verbosity.

use tracing::{info, warn};

/// Span covering one reconciliation cycle.
///
/// Attach with `tracing::Instrument` so it follows the future across awaits.
pub fn cycle_span(cycle: u64) -> tracing::Span {
    tracing::info_span!("fleet.reconcile", cycle = cycle)
}

/// Emit event: agent container running and session ready.
pub fn emit_agent_started(agent_id: &str, container_id: &str) {
    info!(event = "agent.started", agent_id = %agent_id, container_id = %container_id);
}

/// Emit event: agent session closed and container stopped.
pub fn emit_agent_stopped(agent_id: &str) {
    info!(event = "agent.stopped", agent_id = %agent_id);
}

/// Emit event: an add/remove step failed for one agent.
pub fn emit_agent_failed(agent_id: &str, stage: &str, error: &dyn std::fmt::Display) {
    warn!(event = "agent.failed", agent_id = %agent_id, stage = %stage, error = %error);
}

/// Emit event: reconnect attempts exhausted.
pub fn emit_agent_unhealthy(agent_id: &str, attempts: u32, error: &dyn std::fmt::Display) {
    warn!(
        event = "agent.unhealthy",
        agent_id = %agent_id,
        attempts = attempts,
        error = %error,
    );
}

/// Emit event: reconciliation cycle completed.
pub fn emit_reconcile_finished(added: usize, removed: usize, failed: usize, duration_ms: u64) {
    info!(
        event = "reconcile.finished",
        added = added,
        removed = removed,
        failed = failed,
        duration_ms = duration_ms,
    );
}

/// Emit event: one request fanned out and aggregated.
pub fn emit_dispatch_completed(request_id: &str, agents: usize, faults: usize, duration_ms: u64) {
    info!(
        event = "dispatch.completed",
        request_id = %request_id,
        agents = agents,
        faults = faults,
        duration_ms = duration_ms,
    );
}

/// Emit event: a bus subscriber failed on a message (non-fatal).
pub fn emit_bus_handler_fault(subject: &str, error: &dyn std::fmt::Display) {
    warn!(event = "bus.handler_fault", subject = %subject, error = %error);
}
