//! Fallback handler: every request not served by the host's own routes is
//! answered by the cache engine against the upstream origin.

use std::time::Instant;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use routine_cache::{CacheRequest, CacheResponse, Destination};
use serde_json::json;
use thiserror::Error;
use url::Url;

use crate::metrics;
use crate::AppState;

/// Largest request body forwarded upstream.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Failure to turn an incoming request into a [`CacheRequest`].
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The path does not form a valid upstream URL.
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The request body could not be read.
    #[error("failed to read request body: {0}")]
    Body(#[from] axum::Error),
}

/// Answer a request through the cache engine.
#[tracing::instrument(name = "proxy", skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn proxy(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let cache_request = match to_cache_request(state.cache.origin(), request).await {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "Rejecting unproxyable request");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response();
        }
    };

    match state.cache.handle(cache_request).await {
        Ok(handled) => {
            metrics::record_proxy_request(
                handled.strategy.as_str(),
                handled.source.as_str(),
                handled.response.status.as_u16(),
                started.elapsed().as_secs_f64(),
            );
            into_response(handled.response)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Upstream unreachable for pass-through request");
            metrics::record_proxy_request(
                "pass-through",
                "error",
                StatusCode::BAD_GATEWAY.as_u16(),
                started.elapsed().as_secs_f64(),
            );
            (StatusCode::BAD_GATEWAY, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// Build the engine's view of an incoming request.
///
/// The path and query are resolved against `upstream`. Navigation is taken
/// from `Sec-Fetch-Mode`, or from an HTML `Accept` header when the browser
/// sends no fetch metadata.
///
/// # Errors
///
/// Returns [`ProxyError`] for unresolvable paths or unreadable bodies.
pub async fn to_cache_request(upstream: &Url, request: Request) -> Result<CacheRequest, ProxyError> {
    let (parts, body) = request.into_parts();
    let path_and_query = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
    let url = upstream.join(path_and_query)?;
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES).await?;

    let destination = header_str(&parts.headers, "sec-fetch-dest")
        .map_or(Destination::Other, Destination::from_fetch_dest);
    let navigate = match header_str(&parts.headers, "sec-fetch-mode") {
        Some(mode) => mode == "navigate",
        None => header_str(&parts.headers, header::ACCEPT.as_str())
            .is_some_and(|accept| accept.starts_with("text/html")),
    };

    Ok(CacheRequest {
        method: parts.method,
        url,
        headers: parts.headers,
        body,
        destination,
        navigate,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn into_response(response: CacheResponse) -> Response {
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out
}
