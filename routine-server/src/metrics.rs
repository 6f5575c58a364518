//! Prometheus metrics for routine-server.
//!
//! Provides metrics collection and a Prometheus-compatible `/metrics` endpoint.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use routine_core::{ConnectionStatus, SyncEvent, SyncSummary};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;

// Metric names as constants for consistency
const PROXY_REQUESTS_TOTAL: &str = "routine_proxy_requests_total";
const PROXY_REQUEST_DURATION: &str = "routine_proxy_request_duration_seconds";
const SYNC_PASSES_TOTAL: &str = "routine_sync_passes_total";
const SYNC_RECORDS_TOTAL: &str = "routine_sync_records_total";
const PENDING_RECORDS: &str = "routine_pending_records";
const CONNECTIVITY_TRANSITIONS_TOTAL: &str = "routine_connectivity_transitions_total";
const MUTATIONS_TOTAL: &str = "routine_mutations_total";

/// Initialize metrics and return the Prometheus handle.
///
/// # Errors
///
/// Returns an error if the Prometheus recorder cannot be installed
/// (e.g., if another recorder is already installed).
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Record a request answered by the cache engine.
///
/// # Arguments
///
/// * `strategy` - Strategy label (network-first, cache-first, ...)
/// * `source` - Where the response came from (network, cache, fallback, synthesized)
/// * `status` - HTTP status code returned
/// * `duration_secs` - Time to answer in seconds
pub fn record_proxy_request(strategy: &str, source: &str, status: u16, duration_secs: f64) {
    counter!(
        PROXY_REQUESTS_TOTAL,
        "strategy" => strategy.to_string(),
        "source" => source.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        PROXY_REQUEST_DURATION,
        "strategy" => strategy.to_string()
    )
    .record(duration_secs);
}

/// Record a finished reconciliation pass.
pub fn record_sync_pass(summary: &SyncSummary) {
    let outcome = if summary.is_success() { "success" } else { "failure" };
    counter!(SYNC_PASSES_TOTAL, "outcome" => outcome).increment(1);
    counter!(SYNC_RECORDS_TOTAL, "result" => "synced").increment(summary.synced_count() as u64);
    counter!(SYNC_RECORDS_TOTAL, "result" => "failed").increment(summary.failed_count() as u64);
}

/// Update the number of records waiting for reconciliation.
#[allow(clippy::cast_precision_loss)]
pub fn set_pending_records(count: usize) {
    gauge!(PENDING_RECORDS).set(count as f64);
}

/// Record a connectivity change reported by the platform.
pub fn record_connectivity_transition(status: ConnectionStatus) {
    let to = if status.is_online() { "online" } else { "offline" };
    counter!(CONNECTIVITY_TRANSITIONS_TOTAL, "to" => to).increment(1);
}

/// Record a direct mutation through the API.
///
/// # Arguments
///
/// * `operation` - create, update, delete, activate, deactivate, import
/// * `success` - Whether the mutation succeeded
pub fn record_mutation(operation: &str, success: bool) {
    counter!(
        MUTATIONS_TOTAL,
        "operation" => operation.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}

/// Feed reconciler events into the pass counters.
pub fn spawn_sync_recorder(mut events: Receiver<SyncEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::Completed { summary } | SyncEvent::Failed { summary, .. }) => {
                    record_sync_pass(&summary);
                }
                Ok(SyncEvent::Started { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Sync metrics recorder lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
