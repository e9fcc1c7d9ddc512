//! Prometheus metrics exposition
//!
//! - `bridge_flows_total` (counter): label `outcome` — one increment per
//!   finished authorization flow (`completed`, `denied`, `invalid_state`,
//!   `upstream_error`, `upstream_denied`)
//! - `bridge_upstream_requests_total` (counter): label `kind` —
//!   `exchange`, `refresh`, `jwks`, `userinfo`
//! - `bridge_request_duration_seconds` (histogram): label `endpoint`

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `bridge_request_duration_seconds` gets explicit buckets so it renders
/// as a histogram (`_bucket` lines usable by `histogram_quantile()`)
/// rather than the default summary. The range covers 5ms to 30s; the
/// upper end is an upstream round-trip on a bad day.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "bridge_request_duration_seconds".to_string(),
            ),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a finished authorization flow.
pub fn record_flow(outcome: &str) {
    metrics::counter!("bridge_flows_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record one request to the upstream provider.
pub fn record_upstream(kind: &str) {
    metrics::counter!("bridge_upstream_requests_total", "kind" => kind.to_string()).increment(1);
}

/// Record request latency for one of the bridge endpoints.
pub fn record_duration(endpoint: &str, duration_secs: f64) {
    metrics::histogram!("bridge_request_duration_seconds", "endpoint" => endpoint.to_string())
        .record(duration_secs);
}
