//! Prometheus metrics export
//!
//! Recording functions are no-ops until `init_metrics` installs the recorder.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// Prometheus metrics recorder
static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Safe to call more than once.
pub fn init_metrics() -> Result<()> {
    METRICS_HANDLE.get_or_try_init(|| {
        PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("mriqc_run_duration_seconds".to_string()),
                &[10.0, 60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 14400.0],
            )
            .context("Invalid histogram buckets")?
            .install_recorder()
            .context("Failed to install Prometheus recorder")
    })?;
    Ok(())
}

/// Record a finished (or abandoned) MRIQC run
pub fn record_run(outcome: &str, duration: Duration) {
    counter!("mriqc_runs_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("mriqc_run_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

/// Record an accepted upload
pub fn record_upload(size_bytes: u64) {
    counter!("mriqc_uploads_total").increment(1);
    counter!("mriqc_upload_bytes_total").increment(size_bytes);
}

/// Record a result archive sent back to a caller
pub fn record_result(size_bytes: u64) {
    counter!("mriqc_result_bytes_total").increment(size_bytes);
}

/// Record a request rejected before or during processing
pub fn record_rejection(status: StatusCode) {
    counter!("mriqc_rejections_total", "status" => status.as_u16().to_string()).increment(1);
}

/// Prometheus metrics endpoint handler
pub async fn metrics_handler() -> impl IntoResponse {
    let metrics = METRICS_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default();

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics,
    )
}
