//! REST handlers over the repository, reconciler and cache engine.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use routine_cache::{CacheStats, ControlMessage, ControlReply, Phase};
use routine_core::{
    ChangeNotification, ConnectionStatus, Fields, MutationError, MutationResult, Record,
    RemoteError, StorageError, SyncSummary, SyncTrigger,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::metrics;
use crate::AppState;

/// Errors returned by API handlers as JSON bodies.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A repository mutation failed.
    #[error(transparent)]
    Mutation(#[from] MutationError),

    /// The collection is not declared.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// The operation needs connectivity.
    #[error("client is offline")]
    Offline,
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        Self::Mutation(MutationError::Storage(e))
    }
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownCollection(_) => StatusCode::NOT_FOUND,
            Self::Offline => StatusCode::SERVICE_UNAVAILABLE,
            Self::Mutation(e) => match e {
                MutationError::NotFound { .. } => StatusCode::NOT_FOUND,
                MutationError::InvalidState(_) => StatusCode::CONFLICT,
                MutationError::Storage(StorageError::UnknownCollection(_)) => StatusCode::NOT_FOUND,
                MutationError::Storage(StorageError::QuotaExceeded { .. }) => StatusCode::INSUFFICIENT_STORAGE,
                MutationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                MutationError::Remote(remote) => remote_status(remote),
            },
        }
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownCollection(_) => "unknown_collection",
            Self::Offline => "offline",
            Self::Mutation(MutationError::NotFound { .. }) => "not_found",
            Self::Mutation(MutationError::InvalidState(_)) => "invalid_state",
            Self::Mutation(MutationError::Storage(_)) => "storage",
            Self::Mutation(MutationError::Remote(e)) if e.is_retryable() => "backend_unreachable",
            Self::Mutation(MutationError::Remote(_)) => "backend",
        }
    }
}

fn remote_status(e: &RemoteError) -> StatusCode {
    match e {
        RemoteError::Network(_) | RemoteError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        RemoteError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        RemoteError::NotFound(_) => StatusCode::NOT_FOUND,
        RemoteError::Rejected { status, .. } => StatusCode::from_u16(*status)
            .ok()
            .filter(StatusCode::is_client_error)
            .unwrap_or(StatusCode::BAD_GATEWAY),
        RemoteError::Decode(_) => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "API request failed");
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Count a mutation outcome and convert its error.
fn tally<T>(operation: &str, result: MutationResult<T>) -> Result<T, ApiError> {
    metrics::record_mutation(operation, result.is_ok());
    result.map_err(ApiError::from)
}

fn ensure_collection(state: &AppState, collection: &str) -> Result<(), ApiError> {
    if state.repository.replica().schema().contains(collection) {
        Ok(())
    } else {
        Err(ApiError::UnknownCollection(collection.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

/// `GET /api/collections/{collection}`
pub async fn list_records(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> Result<Json<Vec<Record>>, ApiError> {
    ensure_collection(&state, &collection)?;
    Ok(Json(state.repository.records(&collection)))
}

/// `POST /api/collections/{collection}`
#[tracing::instrument(skip(state, fields))]
pub async fn create_record(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(fields): Json<Fields>,
) -> Result<(StatusCode, Json<Record>), ApiError> {
    let record = tally("create", state.repository.create(&collection, fields).await)?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// `PATCH /api/collections/{collection}/{id}`
#[tracing::instrument(skip(state, patch))]
pub async fn update_record(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(patch): Json<Fields>,
) -> Result<Json<Record>, ApiError> {
    let record = tally("update", state.repository.update(&collection, &id, patch).await)?;
    Ok(Json(record))
}

/// `DELETE /api/collections/{collection}/{id}`
#[tracing::instrument(skip(state))]
pub async fn delete_record(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    tally("delete", state.repository.delete(&collection, &id).await)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/collections/{collection}/{id}/activate`
#[tracing::instrument(skip(state))]
pub async fn activate_record(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<Record>, ApiError> {
    let record = tally("activate", state.repository.activate(&collection, &id).await)?;
    Ok(Json(record))
}

/// `POST /api/collections/{collection}/{id}/deactivate`
#[tracing::instrument(skip(state))]
pub async fn deactivate_record(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<Record>, ApiError> {
    let record = tally("deactivate", state.repository.deactivate(&collection, &id).await)?;
    Ok(Json(record))
}

/// `POST /api/collections/{collection}/import`
#[tracing::instrument(skip(state, records), fields(count = records.len()))]
pub async fn import_records(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(records): Json<Vec<Fields>>,
) -> Result<(StatusCode, Json<Vec<Record>>), ApiError> {
    let created = tally("import", state.repository.import(&collection, records).await)?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /api/collections/{collection}/export`
pub async fn export_records(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> Result<Json<Vec<Value>>, ApiError> {
    Ok(Json(state.repository.export(&collection).await?))
}

// ---------------------------------------------------------------------------
// Connectivity and sync
// ---------------------------------------------------------------------------

/// Connectivity as seen by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityBody {
    /// True when online.
    pub online: bool,
    /// `"online"` or `"offline"`.
    pub status: ConnectionStatus,
}

impl From<ConnectionStatus> for ConnectivityBody {
    fn from(status: ConnectionStatus) -> Self {
        Self {
            online: status.is_online(),
            status,
        }
    }
}

/// Platform connectivity signal.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityUpdate {
    /// New state.
    pub online: bool,
}

/// `GET /api/connectivity`
pub async fn get_connectivity(State(state): State<AppState>) -> Json<ConnectivityBody> {
    Json(state.connectivity().status().into())
}

/// `POST /api/connectivity`
///
/// An offline→online edge starts a reconciliation pass in the background.
#[tracing::instrument(skip(state))]
pub async fn set_connectivity(
    State(state): State<AppState>,
    Json(update): Json<ConnectivityUpdate>,
) -> Json<ConnectivityBody> {
    let status = if update.online {
        ConnectionStatus::Online
    } else {
        ConnectionStatus::Offline
    };
    if state.connectivity().set_status(status) {
        metrics::record_connectivity_transition(status);
    }
    Json(status.into())
}

/// `POST /api/sync` - run a full pass now.
#[tracing::instrument(skip(state))]
pub async fn sync_now(State(state): State<AppState>) -> Result<Json<SyncSummary>, ApiError> {
    if !state.connectivity().is_online() {
        return Err(ApiError::Offline);
    }
    Ok(Json(state.reconciler.run_full_pass(SyncTrigger::Manual).await))
}

/// Pending-change summary for the sync indicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingBody {
    /// Platform connectivity.
    pub online: bool,
    /// Records waiting across all collections.
    pub total: usize,
    /// Records waiting per collection.
    pub collections: BTreeMap<String, usize>,
}

/// `GET /api/sync/pending`
pub async fn pending(State(state): State<AppState>) -> Json<PendingBody> {
    let collections = state.repository.pending_count();
    Json(PendingBody {
        online: state.connectivity().is_online(),
        total: collections.values().sum(),
        collections,
    })
}

/// `POST /api/changes` - change-notification webhook for the backend.
#[tracing::instrument(skip(state), fields(collection = %notification.collection))]
pub async fn change_notification(
    State(state): State<AppState>,
    Json(notification): Json<ChangeNotification>,
) -> Result<StatusCode, ApiError> {
    ensure_collection(&state, &notification.collection)?;
    state.backend.notify(notification);
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// Storage maintenance
// ---------------------------------------------------------------------------

/// What to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearScope {
    /// Drop non-critical collections to relieve storage pressure.
    #[default]
    NonCritical,
    /// Wipe everything, pending changes included.
    All,
}

/// Body of `POST /api/storage/clear`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClearRequest {
    /// Scope, defaults to non-critical.
    #[serde(default)]
    pub scope: ClearScope,
}

/// `POST /api/storage/clear`
#[tracing::instrument(skip(state))]
pub async fn clear_storage(
    State(state): State<AppState>,
    Json(request): Json<ClearRequest>,
) -> Result<StatusCode, ApiError> {
    let replica = state.repository.replica();
    match request.scope {
        ClearScope::NonCritical => replica.clear_non_critical().await?,
        ClearScope::All => replica.destroy().await?,
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Cache engine
// ---------------------------------------------------------------------------

/// `POST /sw/message` - control channel of the cache engine.
#[tracing::instrument(skip(state))]
pub async fn control_message(
    State(state): State<AppState>,
    Json(message): Json<ControlMessage>,
) -> Json<ControlReply> {
    Json(state.cache.handle_message(message).await)
}

/// Cache engine status.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatusBody {
    /// Current generation name.
    pub generation: String,
    /// Lifecycle phase.
    pub phase: Phase,
    /// Counters.
    pub stats: CacheStats,
    /// Hit rate (0.0 to 1.0).
    pub hit_rate: f64,
}

/// `GET /sw/stats`
pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStatusBody> {
    let stats = state.cache.stats();
    Json(CacheStatusBody {
        generation: state.cache.generation().to_string(),
        phase: state.cache.phase(),
        hit_rate: stats.hit_rate(),
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let offline = ApiError::from(MutationError::Remote(RemoteError::offline()));
        assert_eq!(offline.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(offline.code(), "backend_unreachable");

        let rejected = ApiError::from(MutationError::Remote(RemoteError::Rejected {
            status: 422,
            message: "bad".into(),
        }));
        assert_eq!(rejected.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let server_side = ApiError::from(MutationError::Remote(RemoteError::Rejected {
            status: 500,
            message: "oops".into(),
        }));
        assert_eq!(server_side.status(), StatusCode::BAD_GATEWAY);

        let invalid = ApiError::from(MutationError::InvalidState("no exclusive field".into()));
        assert_eq!(invalid.status(), StatusCode::CONFLICT);

        let unknown = ApiError::from(StorageError::UnknownCollection("nope".into()));
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_clear_scope_defaults_to_non_critical() {
        let request: ClearRequest = serde_json::from_str("{}").expect("parse");
        assert_eq!(request.scope, ClearScope::NonCritical);
        let request: ClearRequest = serde_json::from_str(r#"{"scope":"all"}"#).expect("parse");
        assert_eq!(request.scope, ClearScope::All);
    }
}
