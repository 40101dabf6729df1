//! Prometheus export for the `metrics` facade.
//!
//! The limiter emits through `metrics::counter!`/`histogram!` unconditionally;
//! without an installed recorder those calls are no-ops, so the library never
//! requires this module. The server binary installs the recorder and serves
//! [`MetricsRegistry::render`] on `/metrics`.

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for decision latency (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

// Default value functions
fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5]
}

/// Handle to the installed Prometheus recorder.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("installed", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// Prometheus text exposition, empty when metrics are disabled.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }
}

/// Install the global Prometheus recorder.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the buckets are empty.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::default());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!(
        "rate_limit_requests_total",
        "Rate limit decisions by strategy and outcome"
    );
    describe_counter!(
        "rate_limit_exempted_total",
        "Requests that bypassed rate limiting"
    );
    describe_counter!(
        "rate_limit_fail_open_total",
        "Requests forwarded because the limiter was unavailable"
    );
    describe_counter!(
        "rate_limit_storage_errors_total",
        "Failed storage operations by backend"
    );
    describe_counter!(
        "rate_limit_storage_ops_total",
        "Storage operations by backend and operation"
    );
    describe_histogram!(
        "rate_limit_decision_duration_seconds",
        Unit::Seconds,
        "Time spent deciding whether to admit a request"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_registry_renders_empty() {
        let config = MetricsConfig {
            enabled: false,
            ..Default::default()
        };
        let registry = init_metrics(&config, "test").unwrap();
        assert!(!registry.is_enabled());
        assert!(registry.render().is_empty());
    }

    #[test]
    fn test_default_buckets_sorted() {
        let buckets = default_duration_buckets();
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }
}
