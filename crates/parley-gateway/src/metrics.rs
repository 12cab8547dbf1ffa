//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

pub fn record_session_open() {
    metrics::gauge!("sessions_active").increment(1.0);
}

pub fn record_session_close() {
    metrics::gauge!("sessions_active").decrement(1.0);
}

/// Record how a turn ended: `completed`, `failed`, `interrupted` or `rejected`.
pub fn record_turn(outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("turns_total", &labels).increment(1);
}

pub fn record_stt_reconnect() {
    metrics::counter!("stt_reconnects_total").increment(1);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}
