//! Command-line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use routine_cache::CachePolicy;
use url::Url;

/// Default port for the host ("ROUT" on a phone keypad).
pub const DEFAULT_PORT: u16 = 7688;

/// Command-line arguments for routine-sync.
#[derive(Debug, Clone, Parser)]
#[command(name = "routine-sync")]
#[command(about = "Offline-first host for the task and routine manager")]
#[command(version)]
pub struct CliArgs {
    /// Port to listen on (localhost only)
    #[arg(long, env = "ROUTINE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Origin serving the app shell (e.g., <http://127.0.0.1:5173>)
    #[arg(long, env = "ROUTINE_UPSTREAM", default_value = "http://127.0.0.1:5173")]
    pub upstream: Url,

    /// Base URL of the REST data backend; an in-process backend is used when unset
    #[arg(long, env = "ROUTINE_BACKEND_URL")]
    pub backend_url: Option<Url>,

    /// Directory for the durable local store; records stay in memory when unset
    #[arg(long, env = "ROUTINE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// JSON file overriding the cache policy
    #[arg(long, env = "ROUTINE_CACHE_POLICY")]
    pub cache_policy: Option<PathBuf>,

    /// Start in offline mode until the platform reports connectivity
    #[arg(long, env = "ROUTINE_START_OFFLINE")]
    pub start_offline: bool,

    /// Hard timeout for proxied and backend requests, in seconds
    #[arg(long, env = "ROUTINE_REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout_secs: u64,
}

/// Resolved host configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port.
    pub port: u16,
    /// App shell origin.
    pub upstream: Url,
    /// REST data backend, if any.
    pub backend_url: Option<Url>,
    /// Durable store directory, if any.
    pub data_dir: Option<PathBuf>,
    /// Cache policy file, if any.
    pub cache_policy: Option<PathBuf>,
    /// Initial connectivity.
    pub start_offline: bool,
    /// Hard timeout for outbound requests.
    pub request_timeout: Duration,
}

impl From<CliArgs> for ServerConfig {
    fn from(args: CliArgs) -> Self {
        Self {
            port: args.port,
            upstream: args.upstream,
            backend_url: args.backend_url,
            data_dir: args.data_dir,
            cache_policy: args.cache_policy,
            start_offline: args.start_offline,
            request_timeout: Duration::from_secs(args.request_timeout_secs),
        }
    }
}

impl ServerConfig {
    /// Load the cache policy file, or the defaults when none is configured.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the configured file cannot be read or parsed.
    pub fn load_policy(&self) -> std::io::Result<CachePolicy> {
        match &self.cache_policy {
            Some(path) => CachePolicy::from_file(path),
            None => Ok(CachePolicy::default()),
        }
    }
}
