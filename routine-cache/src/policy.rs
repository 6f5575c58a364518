//! Cache policy configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Declarative configuration of the cache engine.
///
/// Every field has a default, so a JSON file only needs the overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Base name of cache generations.
    pub cache_name: String,
    /// Version of the current generation. Bump to roll out new assets.
    pub version: u32,
    /// Hosts of the data backend and auth provider. Never cached.
    pub backend_origins: Vec<String>,
    /// Path prefixes of API and auth routes. Never cached.
    pub api_path_prefixes: Vec<String>,
    /// Regexes matched against the URL path of static assets.
    pub static_asset_patterns: Vec<String>,
    /// Hosts serving web fonts and their stylesheets.
    pub font_origins: Vec<String>,
    /// Window for network-with-timeout requests, in milliseconds.
    pub network_timeout_ms: u64,
    /// Delay before a cache-first hit is refreshed, in milliseconds.
    pub refresh_debounce_ms: u64,
    /// Path of the page served to failed navigations.
    pub offline_fallback: String,
    /// Paths fetched into the generation on install.
    pub precache: Vec<String>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            cache_name: "routine-app".to_string(),
            version: 1,
            backend_origins: vec![
                "firestore.googleapis.com".to_string(),
                "identitytoolkit.googleapis.com".to_string(),
                "securetoken.googleapis.com".to_string(),
            ],
            api_path_prefixes: vec!["/api/".to_string(), "/auth/".to_string(), "/__/auth/".to_string()],
            static_asset_patterns: vec![
                r"\.(?:png|jpe?g|gif|svg|webp|ico)$".to_string(),
                r"\.(?:woff2?|ttf|otf|eot)$".to_string(),
                r"/manifest\.(?:json|webmanifest)$".to_string(),
            ],
            font_origins: vec![
                "fonts.googleapis.com".to_string(),
                "fonts.gstatic.com".to_string(),
            ],
            network_timeout_ms: 5_000,
            refresh_debounce_ms: 2_000,
            offline_fallback: "/offline.html".to_string(),
            precache: vec!["/".to_string(), "/index.html".to_string(), "/manifest.json".to_string()],
        }
    }
}

impl CachePolicy {
    /// Load a policy from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Builder: set the version.
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Name of the current generation, `{cache_name}-v{version}`.
    #[must_use]
    pub fn generation_name(&self) -> String {
        format!("{}-v{}", self.cache_name, self.version)
    }

    /// Returns true if `generation` belongs to this policy's cache family.
    #[must_use]
    pub fn owns_generation(&self, generation: &str) -> bool {
        self.generation_version(generation).is_some()
    }

    /// Version of an owned generation, `None` for foreign caches.
    #[must_use]
    pub fn generation_version(&self, generation: &str) -> Option<u32> {
        generation
            .strip_prefix(&self.cache_name)
            .and_then(|rest| rest.strip_prefix("-v"))
            .and_then(|v| v.parse().ok())
    }

    /// Network window for network-with-timeout requests.
    #[must_use]
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    /// Delay before refreshing a cache-first hit in the background.
    #[must_use]
    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_generation_name() {
        let policy = CachePolicy::default().with_version(7);
        assert_eq!(policy.generation_name(), "routine-app-v7");
        assert!(policy.owns_generation("routine-app-v1"));
        assert!(!policy.owns_generation("other-v1"));
        assert!(!policy.owns_generation("routine-app-vX"));
        assert_eq!(policy.generation_version("routine-app-v12"), Some(12));
        assert_eq!(policy.generation_version("other-v12"), None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let policy: CachePolicy =
            serde_json::from_str(r#"{"version": 4, "network_timeout_ms": 100}"#).expect("parse");
        assert_eq!(policy.version, 4);
        assert_eq!(policy.network_timeout(), Duration::from_millis(100));
        assert_eq!(policy.cache_name, "routine-app");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"cache_name": "custom"}}"#).expect("write");
        let policy = CachePolicy::from_file(file.path()).expect("load");
        assert_eq!(policy.generation_name(), "custom-v1");
    }
}
