//! Intercepted requests and the responses handed back for them.

use bytes::Bytes;
use http::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ClassificationError;

/// Header set on responses produced without the network.
pub const OFFLINE_HEADER: &str = "x-routine-offline";

/// Header naming the strategy that produced a response.
pub const STRATEGY_HEADER: &str = "x-routine-cache";

/// What the request will be used for, as reported by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    /// Top-level page load.
    Document,
    /// JavaScript.
    Script,
    /// Stylesheet.
    Style,
    /// Image.
    Image,
    /// Web font.
    Font,
    /// Manifest or other JSON metadata.
    Manifest,
    /// Anything else (XHR, fetch()).
    #[default]
    Other,
}

impl Destination {
    /// Parse the `Sec-Fetch-Dest` header value.
    #[must_use]
    pub fn from_fetch_dest(value: &str) -> Self {
        match value {
            "document" | "iframe" => Self::Document,
            "script" | "worker" | "sharedworker" => Self::Script,
            "style" => Self::Style,
            "image" => Self::Image,
            "font" => Self::Font,
            "manifest" => Self::Manifest,
            _ => Self::Other,
        }
    }
}

/// A request seen by the cache engine.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute request URL.
    pub url: Url,
    /// Request headers forwarded to the network.
    pub headers: HeaderMap,
    /// Request body (non-GET only).
    pub body: Bytes,
    /// Reported destination.
    pub destination: Destination,
    /// True for top-level navigations.
    pub navigate: bool,
}

impl CacheRequest {
    /// Build a GET request for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ClassificationError::InvalidUrl`] if `url` does not parse.
    pub fn get(url: &str) -> Result<Self, ClassificationError> {
        Self::new(Method::GET, url)
    }

    /// Build a request.
    ///
    /// # Errors
    ///
    /// Returns [`ClassificationError::InvalidUrl`] if `url` does not parse.
    pub fn new(method: Method, url: &str) -> Result<Self, ClassificationError> {
        let url = Url::parse(url).map_err(|e| ClassificationError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            destination: Destination::Other,
            navigate: false,
        })
    }

    /// Builder: mark as a top-level navigation.
    #[must_use]
    pub fn navigation(mut self) -> Self {
        self.navigate = true;
        self.destination = Destination::Document;
        self
    }

    /// Builder: set the destination.
    #[must_use]
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Builder: set headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Builder: set the body.
    #[must_use]
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Returns true for navigations.
    #[must_use]
    pub fn is_navigation(&self) -> bool {
        self.navigate || self.destination == Destination::Document
    }

    /// Key used for exact cache matches: the URL without its fragment.
    #[must_use]
    pub fn cache_key(&self) -> String {
        cache_key(&self.url)
    }
}

/// Cache key for a URL: the URL without its fragment.
#[must_use]
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

/// A response, from the network, the cache, or synthesized.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResponse {
    /// Status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

impl CacheResponse {
    /// Create a response.
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Builder: set a header. Invalid values are ignored.
    #[must_use]
    pub fn with_header(mut self, name: http::header::HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Only exact 200 responses are written to the cache.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK
    }

    /// Synthesized response for a request that neither the network nor the
    /// cache could answer.
    #[must_use]
    pub fn request_timeout() -> Self {
        Self::new(StatusCode::REQUEST_TIMEOUT, "Network request timed out and no cached copy exists")
            .with_header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .with_header(CACHE_CONTROL, "no-store")
            .with_header(http::header::HeaderName::from_static(OFFLINE_HEADER), "1")
    }

    /// Built-in page served for navigations when no fallback is cached.
    #[must_use]
    pub fn builtin_offline_page() -> Self {
        Self::new(StatusCode::OK, BUILTIN_OFFLINE_PAGE)
            .with_header(CONTENT_TYPE, "text/html; charset=utf-8")
            .with_header(CACHE_CONTROL, "no-store")
            .with_header(http::header::HeaderName::from_static(OFFLINE_HEADER), "1")
    }

    /// Returns true if the response was produced without the network.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.headers.contains_key(OFFLINE_HEADER)
    }
}

const BUILTIN_OFFLINE_PAGE: &str = "<!doctype html>\
<html lang=\"en\"><head><meta charset=\"utf-8\">\
<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
<title>Offline</title></head>\
<body><main><h1>You are offline</h1>\
<p>Your tasks and routines are still available. Changes made now will sync \
when the connection returns.</p></main></body></html>";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_drops_fragment() {
        let req = CacheRequest::get("https://app.example/page?x=1#section").expect("url");
        assert_eq!(req.cache_key(), "https://app.example/page?x=1");
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            CacheRequest::get("not a url"),
            Err(ClassificationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_navigation_builder() {
        let req = CacheRequest::get("https://app.example/").expect("url").navigation();
        assert!(req.is_navigation());
        assert_eq!(req.destination, Destination::Document);
    }

    #[test]
    fn test_synthesized_responses() {
        let timeout = CacheResponse::request_timeout();
        assert_eq!(timeout.status, StatusCode::REQUEST_TIMEOUT);
        assert!(timeout.is_offline());
        assert!(!timeout.is_cacheable());

        let page = CacheResponse::builtin_offline_page();
        assert_eq!(page.status, StatusCode::OK);
        assert!(page.is_offline());
    }

    #[test]
    fn test_fetch_dest_parsing() {
        assert_eq!(Destination::from_fetch_dest("script"), Destination::Script);
        assert_eq!(Destination::from_fetch_dest("document"), Destination::Document);
        assert_eq!(Destination::from_fetch_dest("empty"), Destination::Other);
    }
}
