//! Prometheus metrics for sync activity.
//!
//! One [`SyncMetrics`] is created by the binary and injected into mediators,
//! coordinators and newer-items watches. The registry is private, so tests can
//! create as many as they like.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::entity::EntityKind;
use crate::mutation::OperationKind;

pub struct SyncMetrics {
    registry: Registry,

    /// Mediator loads by kind, load type and outcome.
    loads: IntCounterVec,

    /// Optimistic mutations by kind, operation and outcome.
    mutations: IntCounterVec,

    /// Local deltas reverted after a failed or cancelled mutation.
    rollbacks: IntCounterVec,

    /// Newer-items polls by kind and outcome.
    newer_polls: IntCounterVec,

    /// Rows per store, split by visibility.
    store_rows: IntGaugeVec,
}

impl SyncMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("feed_sync".to_string()), None)?;

        let loads = IntCounterVec::new(
            Opts::new("mediator_loads_total", "Remote mediator loads"),
            &["kind", "load_type", "outcome"],
        )?;
        let mutations = IntCounterVec::new(
            Opts::new("mutations_total", "Optimistic mutations"),
            &["kind", "operation", "outcome"],
        )?;
        let rollbacks = IntCounterVec::new(
            Opts::new("rollbacks_total", "Reverted optimistic deltas"),
            &["kind", "operation"],
        )?;
        let newer_polls = IntCounterVec::new(
            Opts::new("newer_polls_total", "Newer-items polls"),
            &["kind", "outcome"],
        )?;
        let store_rows = IntGaugeVec::new(
            Opts::new("store_rows", "Rows held by each entity store"),
            &["kind", "state"],
        )?;

        registry.register(Box::new(loads.clone()))?;
        registry.register(Box::new(mutations.clone()))?;
        registry.register(Box::new(rollbacks.clone()))?;
        registry.register(Box::new(newer_polls.clone()))?;
        registry.register(Box::new(store_rows.clone()))?;

        Ok(Self {
            registry,
            loads,
            mutations,
            rollbacks,
            newer_polls,
            store_rows,
        })
    }

    pub fn record_load(&self, kind: EntityKind, load_type: &str, outcome: &str) {
        self.loads
            .with_label_values(&[kind.to_string().as_str(), load_type, outcome])
            .inc();
    }

    pub fn record_mutation(&self, kind: EntityKind, operation: OperationKind, outcome: &str) {
        self.mutations
            .with_label_values(&[kind.to_string().as_str(), operation.label(), outcome])
            .inc();
    }

    pub fn record_rollback(&self, kind: EntityKind, operation: OperationKind) {
        self.rollbacks
            .with_label_values(&[kind.to_string().as_str(), operation.label()])
            .inc();
    }

    pub fn record_newer_poll(&self, kind: EntityKind, outcome: &str) {
        self.newer_polls
            .with_label_values(&[kind.to_string().as_str(), outcome])
            .inc();
    }

    pub fn set_store_rows(&self, kind: EntityKind, visible: usize, hidden: usize) {
        let kind = kind.to_string();
        self.store_rows
            .with_label_values(&[kind.as_str(), "visible"])
            .set(visible as i64);
        self.store_rows
            .with_label_values(&[kind.as_str(), "hidden"])
            .set(hidden as i64);
    }

    pub fn mutation_count(&self, kind: EntityKind, operation: OperationKind, outcome: &str) -> u64 {
        self.mutations
            .with_label_values(&[kind.to_string().as_str(), operation.label(), outcome])
            .get()
    }

    pub fn rollback_count(&self, kind: EntityKind, operation: OperationKind) -> u64 {
        self.rollbacks
            .with_label_values(&[kind.to_string().as_str(), operation.label()])
            .get()
    }

    pub fn load_count(&self, kind: EntityKind, load_type: &str, outcome: &str) -> u64 {
        self.loads
            .with_label_values(&[kind.to_string().as_str(), load_type, outcome])
            .get()
    }

    /// Text exposition format for `GET /metrics`.
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_exposition() {
        let metrics = SyncMetrics::new().unwrap();
        metrics.record_load(EntityKind::Post, "refresh", "success");
        metrics.record_mutation(EntityKind::Post, OperationKind::Like, "failed");
        metrics.record_rollback(EntityKind::Post, OperationKind::Like);
        metrics.set_store_rows(EntityKind::Event, 4, 1);

        assert_eq!(metrics.load_count(EntityKind::Post, "refresh", "success"), 1);
        assert_eq!(metrics.rollback_count(EntityKind::Post, OperationKind::Like), 1);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("feed_sync_mediator_loads_total"));
        assert!(text.contains("feed_sync_store_rows{kind=\"event\",state=\"hidden\"} 1"));
    }
}
