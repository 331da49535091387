//! Controller Metrics
//!
//! Prometheus collectors for reconcile outcomes, provisioner latency,
//! failovers and recovery. Each controller owns its own registry so tests
//! can build as many controllers as they like.

use crate::error::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix
const NAMESPACE: &str = "replicated_disk";

#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    reconciles: IntCounterVec,
    provisioner_calls: HistogramVec,
    failovers: IntCounter,
    recovered: IntCounterVec,
    queue_depth: IntGaugeVec,
}

impl std::fmt::Debug for ControllerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerMetrics").finish_non_exhaustive()
    }
}

impl ControllerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)?;

        let reconciles = IntCounterVec::new(
            Opts::new("reconciles_total", "Reconcile passes grouped by kind and result"),
            &["kind", "result"],
        )?;
        let provisioner_calls = HistogramVec::new(
            HistogramOpts::new(
                "provisioner_call_duration_seconds",
                "Provisioner call latency grouped by operation and result",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
            &["operation", "result"],
        )?;
        let failovers = IntCounter::with_opts(Opts::new(
            "failovers_total",
            "Replica promotions after a primary was lost",
        ))?;
        let recovered = IntCounterVec::new(
            Opts::new(
                "recovered_resources_total",
                "Resources reset out of a transient state at start-up",
            ),
            &["kind"],
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("operation_queue_depth", "Pending operations per resource kind"),
            &["kind"],
        )?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(provisioner_calls.clone()))?;
        registry.register(Box::new(failovers.clone()))?;
        registry.register(Box::new(recovered.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            reconciles,
            provisioner_calls,
            failovers,
            recovered,
            queue_depth,
        })
    }

    pub fn record_reconcile(&self, kind: &str, ok: bool) {
        let result = if ok { "success" } else { "error" };
        self.reconciles.with_label_values(&[kind, result]).inc();
    }

    pub fn observe_provisioner_call(&self, operation: &str, ok: bool, elapsed: Duration) {
        let result = if ok { "success" } else { "error" };
        self.provisioner_calls
            .with_label_values(&[operation, result])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_failover(&self) {
        self.failovers.inc();
    }

    pub fn record_recovered(&self, kind: &str, count: usize) {
        self.recovered
            .with_label_values(&[kind])
            .inc_by(count as u64);
    }

    pub fn set_queue_depth(&self, kind: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[kind])
            .set(depth as i64);
    }

    pub fn reconcile_count(&self, kind: &str, ok: bool) -> u64 {
        let result = if ok { "success" } else { "error" };
        self.reconciles.with_label_values(&[kind, result]).get()
    }

    pub fn queue_depth(&self, kind: &str) -> i64 {
        self.queue_depth.with_label_values(&[kind]).get()
    }

    pub fn failover_count(&self) -> u64 {
        self.failovers.get()
    }

    /// Text exposition of every collector
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_exposition() {
        let metrics = ControllerMetrics::new().unwrap();
        metrics.record_reconcile("DiskVolume", true);
        metrics.record_reconcile("DiskVolume", true);
        metrics.record_failover();
        metrics.observe_provisioner_call("CreateVolume", true, Duration::from_millis(20));

        assert_eq!(metrics.reconcile_count("DiskVolume", true), 2);
        assert_eq!(metrics.failover_count(), 1);

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("replicated_disk_reconciles_total"));
        assert!(text.contains("replicated_disk_provisioner_call_duration_seconds"));
    }

    #[test]
    fn test_independent_registries() {
        let a = ControllerMetrics::new().unwrap();
        let b = ControllerMetrics::new().unwrap();
        a.record_failover();
        assert_eq!(b.failover_count(), 0);
    }
}
