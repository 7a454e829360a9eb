//! Worker metrics.
//!
//! Installs the Prometheus recorder behind the `metrics` facade used by
//! `strata-ingest` and serves it on `/metrics`.

use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use strata_ingest::metrics::names;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder and describes the ingestion metrics.
///
/// Safe to call multiple times; later calls return the installed handle.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed, for example when
/// another global recorder is already set.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    tracing::info!("prometheus metrics recorder initialized");
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!(
        names::ROWS_ACCEPTED_TOTAL,
        "Rows admitted and written, including ignored duplicates"
    );
    describe_counter!(
        names::RECORDS_DROPPED_TOTAL,
        "Raw records dropped as unreadable or invalid"
    );
    describe_counter!(names::MESSAGES_TOTAL, "Ingestion messages by outcome");
    describe_histogram!(
        names::BATCH_FLUSH_DURATION,
        "Duration of batch inserts in seconds"
    );
    describe_counter!(
        names::MAINTENANCE_CYCLES_TOTAL,
        "Partition maintenance ticks by outcome"
    );
    describe_counter!(
        names::PARTITIONS_CREATED_TOTAL,
        "Partitions added by maintenance"
    );
    describe_counter!(
        names::OBJECTS_DISCOVERED_TOTAL,
        "Objects tracked for the first time, by source"
    );
}

/// Handler for `GET /metrics`.
pub async fn serve_metrics() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}
