//! Prometheus metrics for the control plane
//!
//! Call `init_metrics()` once at startup to register everything. When
//! initialization never ran (library use, unit tests), every recording helper
//! is a no-op, so instrumented code does not need to care.

use prometheus::{
    register_counter_vec, register_gauge, Encoder, CounterVec, Gauge, TextEncoder,
};
use std::sync::OnceLock;

/// Container for all control-plane metrics
struct ControlPlaneMetrics {
    reconcile_total: CounterVec,
    ring_members: Gauge,
    cache_sites: Gauge,
    assumed_workloads: Gauge,
    dispatch_queue_depth: Gauge,
    dispatch_total: CounterVec,
}

/// Global storage for registered metrics
static METRICS: OnceLock<ControlPlaneMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Register all Prometheus metrics. Safe to call more than once; only the
/// first call registers.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = ControlPlaneMetrics {
        reconcile_total: register_counter_vec!(
            "haneul_reconcile_total",
            "Reconcile outcomes by event kind",
            &["kind", "outcome"]
        )?,
        ring_members: register_gauge!(
            "haneul_ring_members",
            "Schedulers currently on the routing ring"
        )?,
        cache_sites: register_gauge!(
            "haneul_cache_sites",
            "Sites tracked by the collector cache"
        )?,
        assumed_workloads: register_gauge!(
            "haneul_assumed_workloads",
            "Workloads in assumed state awaiting bind confirmation"
        )?,
        dispatch_queue_depth: register_gauge!(
            "haneul_dispatch_queue_depth",
            "Workloads waiting in the dispatcher channel"
        )?,
        dispatch_total: register_counter_vec!(
            "haneul_dispatch_total",
            "Dispatcher deliveries by operation and outcome",
            &["operation", "outcome"]
        )?,
    };

    METRICS.set(metrics).ok();
    Ok(())
}

/// Render all registered metrics in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// ============================================================================
// Recording helpers (no-ops before init)
// ============================================================================

pub fn reconcile_observed(kind: &str, outcome: &str) {
    if let Some(metrics) = METRICS.get() {
        metrics
            .reconcile_total
            .with_label_values(&[kind, outcome])
            .inc();
    }
}

pub fn set_ring_members(count: usize) {
    if let Some(metrics) = METRICS.get() {
        metrics.ring_members.set(count as f64);
    }
}

pub fn set_cache_sites(count: usize) {
    if let Some(metrics) = METRICS.get() {
        metrics.cache_sites.set(count as f64);
    }
}

pub fn set_assumed_workloads(count: usize) {
    if let Some(metrics) = METRICS.get() {
        metrics.assumed_workloads.set(count as f64);
    }
}

pub fn set_dispatch_queue_depth(depth: usize) {
    if let Some(metrics) = METRICS.get() {
        metrics.dispatch_queue_depth.set(depth as f64);
    }
}

pub fn dispatch_observed(operation: &str, outcome: &str) {
    if let Some(metrics) = METRICS.get() {
        metrics
            .dispatch_total
            .with_label_values(&[operation, outcome])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_are_noops_before_init() {
        // Must not panic with nothing registered.
        reconcile_observed("add_cluster", "synced");
        set_ring_members(3);
        set_cache_sites(10);
        set_assumed_workloads(1);
        set_dispatch_queue_depth(0);
        dispatch_observed("create", "ok");
    }

    #[test]
    fn test_init_and_gather() {
        init_metrics().unwrap();
        init_metrics().unwrap();

        reconcile_observed("add_cluster", "synced");
        set_ring_members(2);

        let rendered = gather();
        assert!(rendered.contains("haneul_ring_members"));
    }
}
