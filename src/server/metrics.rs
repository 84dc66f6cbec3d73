//! Prometheus metrics for the operator
//!
//! Exposed on `/metrics` by the health server.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

pub type SharedMetrics = Arc<ControllerMetrics>;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Metrics output is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub struct ControllerMetrics {
    registry: Registry,
    fibers_total: IntCounterVec,
    fibers_active: IntGauge,
    api_calls_total: IntCounterVec,
    api_retries_total: IntCounterVec,
    rolls_completed_total: IntCounter,
    reconcile_duration_seconds: Histogram,
}

/// Create the metrics registry with every operator metric registered
pub fn create_metrics() -> Result<SharedMetrics, MetricsError> {
    let registry = Registry::new();

    let fibers_total = IntCounterVec::new(
        Opts::new(
            "domain_operator_fibers_total",
            "Fibers that reached a terminal state",
        ),
        &["outcome"],
    )?;
    let fibers_active = IntGauge::new(
        "domain_operator_fibers_active",
        "Fibers currently running or suspended",
    )?;
    let api_calls_total = IntCounterVec::new(
        Opts::new(
            "domain_operator_api_calls_total",
            "Kubernetes API calls issued by request steps",
        ),
        &["verb", "outcome"],
    )?;
    let api_retries_total = IntCounterVec::new(
        Opts::new(
            "domain_operator_api_retries_total",
            "Failed Kubernetes API calls that were retried or rerouted",
        ),
        &["kind"],
    )?;
    let rolls_completed_total = IntCounter::new(
        "domain_operator_rolls_completed_total",
        "Rolling restarts that completed",
    )?;
    let reconcile_duration_seconds = Histogram::with_opts(
        HistogramOpts::new(
            "domain_operator_reconcile_duration_seconds",
            "Duration of Domain reconciliations",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
    )?;

    registry.register(Box::new(fibers_total.clone()))?;
    registry.register(Box::new(fibers_active.clone()))?;
    registry.register(Box::new(api_calls_total.clone()))?;
    registry.register(Box::new(api_retries_total.clone()))?;
    registry.register(Box::new(rolls_completed_total.clone()))?;
    registry.register(Box::new(reconcile_duration_seconds.clone()))?;

    Ok(Arc::new(ControllerMetrics {
        registry,
        fibers_total,
        fibers_active,
        api_calls_total,
        api_retries_total,
        rolls_completed_total,
        reconcile_duration_seconds,
    }))
}

impl ControllerMetrics {
    pub fn fiber_started(&self) {
        self.fibers_active.inc();
    }

    pub fn fiber_finished(&self, succeeded: bool) {
        self.fibers_active.dec();
        let outcome = if succeeded { "success" } else { "failure" };
        self.fibers_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_api_call(&self, verb: &str, outcome: &str) {
        self.api_calls_total
            .with_label_values(&[verb, outcome])
            .inc();
    }

    /// `kind` is "retry" or "conflict"
    pub fn record_retry(&self, kind: &str) {
        self.api_retries_total.with_label_values(&[kind]).inc();
    }

    pub fn record_roll_completed(&self) {
        self.rolls_completed_total.inc();
    }

    pub fn observe_reconcile(&self, seconds: f64) {
        self.reconcile_duration_seconds.observe(seconds);
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_counters() {
        let metrics = create_metrics().unwrap();
        metrics.fiber_started();
        metrics.fiber_started();
        metrics.fiber_finished(true);

        let text = metrics.encode().unwrap();
        assert!(text.contains("domain_operator_fibers_active 1"));
        assert!(text.contains(r#"domain_operator_fibers_total{outcome="success"} 1"#));
    }

    #[test]
    fn test_api_calls_labelled_by_verb() {
        let metrics = create_metrics().unwrap();
        metrics.record_api_call("list", "success");
        metrics.record_retry("conflict");

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"domain_operator_api_calls_total{outcome="success",verb="list"} 1"#));
        assert!(text.contains(r#"domain_operator_api_retries_total{kind="conflict"} 1"#));
    }
}
