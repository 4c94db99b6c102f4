//! Evaluation fan-out and aggregation.

use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, instrument};

use super::{Coordinator, DispatchTarget};
use crate::bus::publish_json;
use crate::domain::{
    AgentOutcome, AgentResult, AggregatedResult, EvaluationError, EvaluationFault,
    EvaluationRequest, FaultKind, Result,
};
use crate::metrics::METRICS;
use crate::obs::emit_dispatch_completed;

impl Coordinator {
    /// Send `request` to every healthy agent serving its chain, wait for all
    /// of them (each bounded by the dispatch timeout) and publish one
    /// aggregated result.
    #[instrument(skip(self, request), fields(request_id = %request.id, kind = request.kind.as_str()))]
    pub async fn dispatch(&self, request: EvaluationRequest) -> Result<AggregatedResult> {
        let started = Instant::now();
        let targets: Vec<DispatchTarget> = self
            .view
            .borrow()
            .targets
            .iter()
            .filter(|t| match (t.chain_id, request.chain_id) {
                (Some(mine), Some(requested)) => mine == requested,
                _ => true,
            })
            .cloned()
            .collect();

        let results = join_all(targets.iter().map(|target| self.evaluate_one(target, &request))).await;

        let faults = results.iter().filter(|r| !r.outcome.is_success()).count();
        METRICS.add_evaluations(results.len() as u64);
        METRICS.add_evaluation_faults(faults as u64);

        for result in &results {
            if result.outcome.fault_kind() == Some(FaultKind::Disconnected) {
                // Recovery sweeps every disconnected agent, so one pending
                // wake-up is enough. Full or closed (no loop) is fine.
                let _ = self.recover_tx.try_send(result.agent_id.clone());
            }
        }

        let aggregated = AggregatedResult {
            request_id: request.id.clone(),
            kind: request.kind,
            results,
            completed_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        publish_json(self.bus.as_ref(), &self.config.subjects.results, &aggregated)?;
        emit_dispatch_completed(
            &request.id.0,
            aggregated.results.len(),
            faults,
            aggregated.duration_ms,
        );
        Ok(aggregated)
    }

    async fn evaluate_one(&self, target: &DispatchTarget, request: &EvaluationRequest) -> AgentResult {
        let limit = self.config.dispatch_timeout;
        let outcome = match tokio::time::timeout(limit, self.pool.evaluate(&target.session, request)).await {
            Ok(Ok(response)) => AgentOutcome::Success { response },
            Ok(Err(err)) => AgentOutcome::Fault {
                fault: EvaluationFault::from(&err),
            },
            Err(_) => {
                let err = EvaluationError::Timeout {
                    agent_id: target.agent_id.clone(),
                    limit_ms: limit.as_millis() as u64,
                };
                AgentOutcome::Fault {
                    fault: EvaluationFault::from(&err),
                }
            }
        };
        if let Some(kind) = outcome.fault_kind() {
            debug!(agent_id = %target.agent_id, fault = ?kind, "agent faulted");
        }
        AgentResult {
            agent_id: target.agent_id.clone(),
            outcome,
        }
    }
}
