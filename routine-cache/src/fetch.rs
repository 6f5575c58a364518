//! Network access for the cache engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderName, CONNECTION, HOST, TRANSFER_ENCODING, UPGRADE};
use http::HeaderMap;
use reqwest::Client;

use crate::error::{FetchError, FetchResult};
use crate::request::{CacheRequest, CacheResponse};

/// Performs network requests on behalf of the engine.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Fetch `request` from the network.
    async fn fetch(&self, request: &CacheRequest) -> FetchResult<CacheResponse>;
}

/// [`Fetcher`] backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpFetcher {
    inner: Arc<InnerFetcher>,
}

struct InnerFetcher {
    http: Client,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher").finish_non_exhaustive()
    }
}

impl HttpFetcher {
    /// Create a fetcher with a hard per-request timeout.
    ///
    /// The engine applies its own, shorter, window for network-with-timeout
    /// requests; this one bounds every other request.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidRequest`] if the client cannot be built.
    pub fn new(request_timeout: Duration) -> FetchResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("routine-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(InnerFetcher { http }),
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &CacheRequest) -> FetchResult<CacheResponse> {
        let response = self
            .inner
            .http
            .request(request.method.clone(), request.url.clone())
            .headers(forwardable(&request.headers))
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status();
        let headers = forwardable(response.headers());
        let body = response.bytes().await?;
        tracing::trace!(url = %request.url, %status, bytes = body.len(), "Fetched");
        Ok(CacheResponse {
            status,
            headers,
            body,
        })
    }
}

/// Copy headers, dropping hop-by-hop ones.
fn forwardable(headers: &HeaderMap) -> HeaderMap {
    const HOP_BY_HOP: [HeaderName; 4] = [CONNECTION, HOST, TRANSFER_ENCODING, UPGRADE];
    let mut out = headers.clone();
    for name in &HOP_BY_HOP {
        out.remove(name);
    }
    out.remove("keep-alive");
    out.remove("proxy-connection");
    out
}
