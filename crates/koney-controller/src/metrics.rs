//! Prometheus metrics for the controller.
//!
//! Exposed in text format at `/metrics` on the metrics port.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use prometheus::{CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Histogram buckets for reconcile duration (in seconds).
const RECONCILE_BUCKETS: &[f64] = &[0.005, 0.025, 0.1, 0.5, 2.0, 10.0];

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),
}

/// Controller metrics, registered with a shared registry.
///
/// All metrics use interior mutability and are safe to share across
/// tasks.
pub struct ControllerMetrics {
    registry: Registry,

    /// Total reconcile passes by result.
    reconciles_total: CounterVec,

    /// Reconcile pass duration by result.
    reconcile_duration: HistogramVec,

    /// Policies currently known to the controller.
    active_policies: Gauge,
}

impl ControllerMetrics {
    /// Create the metrics and register them with a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register.
    pub fn new() -> Result<Arc<Self>, MetricsError> {
        let registry = Registry::new();

        let reconciles_total = CounterVec::new(
            Opts::new(
                "koney_controller_reconciles_total",
                "Total reconcile passes by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(reconciles_total.clone()))?;

        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "koney_controller_reconcile_duration_seconds",
                "Reconcile pass duration",
            )
            .buckets(RECONCILE_BUCKETS.to_vec()),
            &["result"],
        )?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        let active_policies = Gauge::new(
            "koney_controller_active_policies",
            "Deception policies currently known to the controller",
        )?;
        registry.register(Box::new(active_policies.clone()))?;

        Ok(Arc::new(Self {
            registry,
            reconciles_total,
            reconcile_duration,
            active_policies,
        }))
    }

    /// Record one reconcile pass.
    pub fn observe_reconcile(&self, result: &str, elapsed: Duration) {
        self.reconciles_total.with_label_values(&[result]).inc();
        self.reconcile_duration
            .with_label_values(&[result])
            .observe(elapsed.as_secs_f64());
    }

    /// Set the active-policy gauge.
    pub fn set_active_policies(&self, count: usize) {
        #[allow(clippy::cast_precision_loss)]
        self.active_policies.set(count as f64);
    }

    /// Render all metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// An axum router serving `GET /metrics`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&self);
                async move { metrics.render() }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        let metrics = ControllerMetrics::new().unwrap();
        metrics.observe_reconcile("ok", Duration::from_millis(12));
        metrics.set_active_policies(3);

        let rendered = metrics.render();
        assert!(rendered.contains("koney_controller_reconciles_total"));
        assert!(rendered.contains("koney_controller_active_policies 3"));
    }
}
