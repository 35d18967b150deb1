//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder
/// Returns a handle that renders the current snapshot
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    tracing::info!("Prometheus metrics recorder installed");

    Ok(handle)
}

/// Record the outcome of a provisioning call ("ready" or a failure stage)
pub fn record_provision(outcome: &str) {
    metrics::counter!("embedding_provisioner_provision_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a completed registry download
pub fn record_download(elapsed: Duration) {
    metrics::counter!("embedding_provisioner_downloads_total").increment(1);
    metrics::histogram!("embedding_provisioner_download_seconds").record(elapsed.as_secs_f64());
}

/// Record a quantization attempt
pub fn record_quantization(backend: &str, success: bool) {
    metrics::counter!("embedding_provisioner_quantizations_total",
        "backend" => backend.to_string(),
        "outcome" => if success { "success" } else { "failure" }
    )
    .increment(1);
}
