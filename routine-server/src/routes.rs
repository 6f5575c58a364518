//! Router assembly.

use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::{api, events, health, proxy, AppState};

/// Build the host router. Requests without a matching route are answered by
/// the cache engine against the upstream origin.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health check endpoints
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/health", get(health::readiness))
        // Cache engine control channel
        .route("/sw/message", post(api::control_message))
        .route("/sw/stats", get(api::cache_stats))
        // Connectivity and sync
        .route(
            "/api/connectivity",
            get(api::get_connectivity).post(api::set_connectivity),
        )
        .route("/api/sync", post(api::sync_now))
        .route("/api/sync/pending", get(api::pending))
        .route("/api/sync/events", get(events::sync_events))
        .route("/api/changes", post(api::change_notification))
        .route("/api/storage/clear", post(api::clear_storage))
        // Collections
        .route(
            "/api/collections/{collection}",
            get(api::list_records).post(api::create_record),
        )
        .route("/api/collections/{collection}/import", post(api::import_records))
        .route("/api/collections/{collection}/export", get(api::export_records))
        .route(
            "/api/collections/{collection}/{id}",
            patch(api::update_record).delete(api::delete_record),
        )
        .route(
            "/api/collections/{collection}/{id}/activate",
            post(api::activate_record),
        )
        .route(
            "/api/collections/{collection}/{id}/deactivate",
            post(api::deactivate_record),
        )
        // Everything else goes through the cache engine
        .fallback(proxy::proxy)
        .with_state(state)
}
