//! Health check endpoints.
//!
//! - `/health/live` - Liveness probe (restart if fails)
//! - `/health/ready` - Readiness probe (remove from LB if fails)
//! - `/health` - Same as readiness

use axum::{extract::State, http::StatusCode, Json};
use routine_cache::Phase;
use serde::Serialize;

use crate::AppState;

/// Health status response.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// Overall status: "healthy" or "unhealthy"
    pub status: &'static str,
    /// Server version
    pub version: &'static str,
    /// Individual component checks
    pub checks: HealthChecks,
}

/// Individual health checks.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Local store readable
    pub local_store: bool,
    /// Cache generation lifecycle phase
    pub cache_phase: Phase,
    /// Platform connectivity
    pub online: bool,
    /// Records waiting for reconciliation
    pub pending_records: usize,
    /// Backend flavour ("http" or "memory")
    pub backend: &'static str,
}

/// Liveness probe - is the server running?
#[tracing::instrument(name = "liveness_probe")]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe - can the host answer data requests?
///
/// Offline is still ready: the local store answers reads and queues writes.
#[tracing::instrument(name = "readiness_probe", skip(state))]
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let replica = state.repository.replica();
    let probe = replica.schema().names().into_iter().next();
    let store_ok = match probe {
        Some(collection) => replica.store().get_all(&collection).await.is_ok(),
        None => true,
    };

    let status = HealthStatus {
        status: if store_ok { "healthy" } else { "unhealthy" },
        version: env!("CARGO_PKG_VERSION"),
        checks: HealthChecks {
            local_store: store_ok,
            cache_phase: state.cache.phase(),
            online: state.connectivity().is_online(),
            pending_records: state.pending_total(),
            backend: state.backend.kind(),
        },
    };

    let code = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(status))
}
