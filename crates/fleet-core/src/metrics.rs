//! Global atomic counters for node observability.
//!
//! Counters are bumped silently at the call site. [`Metrics::flush`] emits the
//! current values as one `tracing::info!` event; the daemon calls it on its
//! recovery tick.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free counters.
pub struct Metrics {
    reconciliations: AtomicU64,
    agents_started: AtomicU64,
    agents_stopped: AtomicU64,
    evaluations_dispatched: AtomicU64,
    evaluation_faults: AtomicU64,
    bus_handler_faults: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            reconciliations: AtomicU64::new(0),
            agents_started: AtomicU64::new(0),
            agents_stopped: AtomicU64::new(0),
            evaluations_dispatched: AtomicU64::new(0),
            evaluation_faults: AtomicU64::new(0),
            bus_handler_faults: AtomicU64::new(0),
        }
    }

    pub fn inc_reconciliations(&self) {
        self.reconciliations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "reconciliations", "counter incremented");
    }

    pub fn inc_agents_started(&self) {
        self.agents_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_agents_stopped(&self) {
        self.agents_stopped.fetch_add(1, Ordering::Relaxed);
    }

    /// Count `n` per-agent evaluation calls.
    pub fn add_evaluations(&self, n: u64) {
        self.evaluations_dispatched.fetch_add(n, Ordering::Relaxed);
    }

    /// Count `n` per-agent faults (timeouts, disconnects, busy rejections).
    pub fn add_evaluation_faults(&self, n: u64) {
        self.evaluation_faults.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_bus_handler_faults(&self) {
        self.bus_handler_faults.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "bus_handler_faults", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            reconciliations = self.reconciliations(),
            agents_started = self.agents_started(),
            agents_stopped = self.agents_stopped(),
            evaluations_dispatched = self.evaluations_dispatched(),
            evaluation_faults = self.evaluation_faults(),
            bus_handler_faults = self.bus_handler_faults(),
        );
    }

    pub fn reconciliations(&self) -> u64 {
        self.reconciliations.load(Ordering::Relaxed)
    }

    pub fn agents_started(&self) -> u64 {
        self.agents_started.load(Ordering::Relaxed)
    }

    pub fn agents_stopped(&self) -> u64 {
        self.agents_stopped.load(Ordering::Relaxed)
    }

    pub fn evaluations_dispatched(&self) -> u64 {
        self.evaluations_dispatched.load(Ordering::Relaxed)
    }

    pub fn evaluation_faults(&self) -> u64 {
        self.evaluation_faults.load(Ordering::Relaxed)
    }

    pub fn bus_handler_faults(&self) -> u64 {
        self.bus_handler_faults.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.reconciliations,
            &self.agents_started,
            &self.agents_stopped,
            &self.evaluations_dispatched,
            &self.evaluation_faults,
            &self.bus_handler_faults,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_reconciliations();
        m.inc_reconciliations();
        assert_eq!(m.reconciliations(), 2);

        m.add_evaluations(3);
        m.add_evaluation_faults(1);
        assert_eq!(m.evaluations_dispatched(), 3);
        assert_eq!(m.evaluation_faults(), 1);

        m.inc_bus_handler_faults();
        assert_eq!(m.bus_handler_faults(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_agents_started();
        m.inc_agents_stopped();
        m.add_evaluations(5);
        m.reset();
        assert_eq!(m.agents_started(), 0);
        assert_eq!(m.agents_stopped(), 0);
        assert_eq!(m.evaluations_dispatched(), 0);
    }
}
