//! Error types for the cache policy engine.

use std::time::Duration;

use thiserror::Error;

/// Result type for cache storage operations.
pub type CacheResult<T> = Result<T, CacheStorageError>;

/// Result type for network fetches.
pub type FetchResult<T> = Result<T, FetchError>;

/// A request that cannot be classified. Such requests pass through unmodified.
#[derive(Debug, Error)]
pub enum ClassificationError {
    /// The request URL could not be parsed.
    #[error("invalid request URL: {0}")]
    InvalidUrl(String),

    /// Only http and https requests are intercepted.
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// A configured static-asset pattern is not a valid regex.
    #[error("invalid static asset pattern `{pattern}`: {source}")]
    InvalidPattern {
        /// Offending pattern.
        pattern: String,
        /// Regex compile error.
        #[source]
        source: regex::Error,
    },
}

/// Failure to obtain a response from the network.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The network is unreachable or the connection failed.
    #[error("network error: {0}")]
    Network(String),

    /// No response within the allowed window.
    #[error("network request timed out after {0:?}")]
    Timeout(Duration),

    /// The request could not be turned into a network call.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Returns true for timeouts.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else if e.is_builder() {
            Self::InvalidRequest(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Cache storage failures. Writes are swallowed, reads count as misses.
#[derive(Debug, Error)]
pub enum CacheStorageError {
    /// Storage cannot be reached.
    #[error("cache storage unavailable: {0}")]
    Unavailable(String),

    /// The write would exceed the storage quota.
    #[error("cache quota exceeded")]
    QuotaExceeded,

    /// The named generation does not exist.
    #[error("unknown cache generation: {0}")]
    UnknownGeneration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_timeout() {
        assert!(FetchError::Timeout(Duration::from_secs(5)).is_timeout());
        assert!(!FetchError::Network("down".into()).is_timeout());
    }

    #[test]
    fn test_invalid_pattern_message() {
        let source = regex::Regex::new("(").expect_err("unbalanced");
        let err = ClassificationError::InvalidPattern {
            pattern: "(".into(),
            source,
        };
        assert!(err.to_string().starts_with("invalid static asset pattern `(`"));
    }
}
