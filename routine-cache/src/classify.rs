//! Request classification.
//!
//! Rules are checked in a fixed order and the first match wins:
//!
//! 1. non-GET → pass through
//! 2. backend/auth origin, or API/auth path → pass through
//! 3. navigation → network-first
//! 4. script or stylesheet → cache-first
//! 5. static asset pattern or font origin → stale-while-revalidate
//! 6. anything else → network with timeout

use http::Method;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ClassificationError;
use crate::policy::CachePolicy;
use crate::request::{CacheRequest, Destination};

/// How a request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Forward unmodified; never cached.
    PassThrough,
    /// Network, then exact cache match, then offline fallback.
    NetworkFirst,
    /// Cache, refreshed in the background.
    CacheFirst,
    /// Cache immediately, network refresh behind it.
    StaleWhileRevalidate,
    /// Network within a time window, then cache, then a synthesized 408.
    NetworkWithTimeout,
}

impl Strategy {
    /// Label used in headers, logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PassThrough => "pass-through",
            Self::NetworkFirst => "network-first",
            Self::CacheFirst => "cache-first",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
            Self::NetworkWithTimeout => "network-timeout",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps requests to strategies. Pure: the same request always gets the same
/// strategy.
#[derive(Debug, Clone)]
pub struct Classifier {
    backend_origins: Vec<String>,
    api_path_prefixes: Vec<String>,
    font_origins: Vec<String>,
    static_patterns: Vec<Regex>,
}

impl Classifier {
    /// Compile the classifier for `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`ClassificationError::InvalidPattern`] for a bad regex.
    pub fn new(policy: &CachePolicy) -> Result<Self, ClassificationError> {
        let static_patterns = policy
            .static_asset_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ClassificationError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            backend_origins: policy.backend_origins.clone(),
            api_path_prefixes: policy.api_path_prefixes.clone(),
            font_origins: policy.font_origins.clone(),
            static_patterns,
        })
    }

    /// Classify a request. Unclassifiable requests pass through.
    #[must_use]
    pub fn classify(&self, request: &CacheRequest) -> Strategy {
        match self.try_classify(request) {
            Ok(strategy) => strategy,
            Err(e) => {
                tracing::debug!(url = %request.url, error = %e, "Passing through unclassifiable request");
                Strategy::PassThrough
            }
        }
    }

    /// Classify a request, reporting why it cannot be.
    ///
    /// # Errors
    ///
    /// Returns [`ClassificationError::UnsupportedScheme`] for non-http(s) URLs.
    pub fn try_classify(&self, request: &CacheRequest) -> Result<Strategy, ClassificationError> {
        let scheme = request.url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(ClassificationError::UnsupportedScheme(scheme.to_string()));
        }
        if request.method != Method::GET {
            return Ok(Strategy::PassThrough);
        }

        let host = request.url.host_str().unwrap_or_default();
        let path = request.url.path();
        if self.backend_origins.iter().any(|o| host_matches(host, o))
            || self.api_path_prefixes.iter().any(|p| path.starts_with(p.as_str()))
        {
            return Ok(Strategy::PassThrough);
        }

        if request.is_navigation() {
            return Ok(Strategy::NetworkFirst);
        }

        if matches!(request.destination, Destination::Script | Destination::Style)
            || path.ends_with(".js")
            || path.ends_with(".mjs")
            || path.ends_with(".css")
        {
            return Ok(Strategy::CacheFirst);
        }

        if matches!(request.destination, Destination::Image | Destination::Font)
            || self.font_origins.iter().any(|o| host_matches(host, o))
            || self.static_patterns.iter().any(|re| re.is_match(path))
        {
            return Ok(Strategy::StaleWhileRevalidate);
        }

        Ok(Strategy::NetworkWithTimeout)
    }
}

/// Exact host or any subdomain of it.
fn host_matches(host: &str, origin: &str) -> bool {
    host == origin
        || host
            .strip_suffix(origin)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use super::Strategy;

    fn classifier() -> Classifier {
        Classifier::new(&CachePolicy::default()).expect("default policy compiles")
    }

    fn get(url: &str) -> CacheRequest {
        CacheRequest::get(url).expect("valid url")
    }

    #[test]
    fn test_non_get_passes_through() {
        let req = CacheRequest::new(Method::POST, "https://app.example/assets/app.js").expect("url");
        assert_eq!(classifier().classify(&req), Strategy::PassThrough);
    }

    #[test]
    fn test_backend_and_api_pass_through() {
        let c = classifier();
        assert_eq!(
            c.classify(&get("https://firestore.googleapis.com/v1/projects/x")),
            Strategy::PassThrough
        );
        assert_eq!(c.classify(&get("https://app.example/api/tasks")), Strategy::PassThrough);
        // API paths win over navigation.
        assert_eq!(
            c.classify(&get("https://app.example/auth/callback").navigation()),
            Strategy::PassThrough
        );
    }

    #[test]
    fn test_navigation_is_network_first() {
        let req = get("https://app.example/routines").navigation();
        assert_eq!(classifier().classify(&req), Strategy::NetworkFirst);
    }

    #[test]
    fn test_scripts_and_styles_are_cache_first() {
        let c = classifier();
        assert_eq!(c.classify(&get("https://app.example/assets/app.a1b2.js")), Strategy::CacheFirst);
        assert_eq!(c.classify(&get("https://app.example/assets/app.css")), Strategy::CacheFirst);
        assert_eq!(
            c.classify(&get("https://app.example/chunk").with_destination(Destination::Script)),
            Strategy::CacheFirst
        );
    }

    #[test]
    fn test_static_assets_are_stale_while_revalidate() {
        let c = classifier();
        assert_eq!(c.classify(&get("https://app.example/icons/192.png")), Strategy::StaleWhileRevalidate);
        assert_eq!(c.classify(&get("https://fonts.gstatic.com/s/roboto.woff2")), Strategy::StaleWhileRevalidate);
        assert_eq!(c.classify(&get("https://fonts.googleapis.com/css2?family=Inter")), Strategy::StaleWhileRevalidate);
        assert_eq!(c.classify(&get("https://app.example/manifest.json")), Strategy::StaleWhileRevalidate);
    }

    #[test]
    fn test_everything_else_uses_timeout() {
        assert_eq!(
            classifier().classify(&get("https://app.example/data/holidays")),
            Strategy::NetworkWithTimeout
        );
    }

    #[test]
    fn test_unsupported_scheme() {
        let req = get("chrome-extension://abc/script.js");
        assert!(matches!(
            classifier().try_classify(&req),
            Err(ClassificationError::UnsupportedScheme(_))
        ));
        assert_eq!(classifier().classify(&req), Strategy::PassThrough);
    }

    #[test]
    fn test_host_matches_subdomains_only() {
        assert!(host_matches("eu.firestore.googleapis.com", "firestore.googleapis.com"));
        assert!(!host_matches("evilfirestore.googleapis.com", "firestore.googleapis.com"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let policy = CachePolicy {
            static_asset_patterns: vec!["([".to_string()],
            ..CachePolicy::default()
        };
        assert!(matches!(
            Classifier::new(&policy),
            Err(ClassificationError::InvalidPattern { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_classification_is_deterministic(
            path in "/[a-z0-9/._-]{0,40}",
            navigate in any::<bool>(),
            post in any::<bool>(),
        ) {
            let c = classifier();
            let method = if post { Method::POST } else { Method::GET };
            let mut req = CacheRequest::new(method, &format!("https://app.example{path}")).expect("url");
            if navigate {
                req = req.navigation();
            }
            let first = c.classify(&req);
            let second = classifier().classify(&req.clone());
            prop_assert_eq!(first, second);
            if post {
                prop_assert_eq!(first, Strategy::PassThrough);
            }
        }
    }
}
