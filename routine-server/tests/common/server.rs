//! Test server harness for integration tests.
//!
//! Spins up the real router on a random port, backed by an in-memory store
//! and backend, proxying to a caller-chosen upstream.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use routine_cache::{CacheEngine, CachePolicy, HttpFetcher, MemoryCacheStorage};
use routine_core::{
    ConnectionStatus, ConnectivityMonitor, MemoryBackend, MemoryStore, Replica, Repository, Schema,
    SyncConfig,
};
use routine_server::{build_router, AppState, Backend};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

/// A running host with handles to its in-memory parts.
pub struct TestServer {
    addr: SocketAddr,
    /// Shared state of the running router.
    pub state: AppState,
    /// The in-memory backend behind the repository.
    pub backend: MemoryBackend,
    /// HTTP client for talking to the server.
    pub client: reqwest::Client,
    tasks: Vec<JoinHandle<()>>,
}

impl TestServer {
    /// Start a host proxying to `upstream`.
    ///
    /// # Panics
    ///
    /// Panics if no port is available or the server fails to bind.
    pub async fn start(upstream: &str, online: bool) -> Self {
        let port = portpicker::pick_unused_port().expect("no available port");
        let addr = SocketAddr::from(([127, 0, 0, 1], port));

        let replica = Arc::new(Replica::new(Arc::new(MemoryStore::new(
            Schema::routine_manager(),
        ))));
        replica.load().await.expect("load replica");

        let backend = MemoryBackend::new();
        let status = if online {
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        };
        let repository = Arc::new(Repository::new(
            replica,
            Arc::new(backend.clone()),
            ConnectivityMonitor::new(status),
        ));

        let policy = CachePolicy {
            network_timeout_ms: 1_000,
            ..CachePolicy::default()
        };
        let fetcher = HttpFetcher::new(Duration::from_secs(5)).expect("fetcher");
        let cache = CacheEngine::new(
            policy,
            Url::parse(upstream).expect("upstream url"),
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(fetcher),
        )
        .expect("engine");

        let state = AppState::new(repository, cache, Backend::Memory(backend.clone()));
        let mut tasks = state.spawn_background(SyncConfig {
            max_retries: 0,
            ..SyncConfig::default()
        });

        let app = build_router(state.clone());
        let listener = TcpListener::bind(addr).await.expect("bind test server");
        tasks.push(tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        }));

        Self {
            addr,
            state,
            backend,
            client: reqwest::Client::new(),
            tasks,
        }
    }

    /// Absolute URL of `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// GET `path` and decode the JSON body.
    pub async fn get_json(&self, path: &str) -> serde_json::Value {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json body")
    }

    /// POST a JSON body to `path`.
    pub async fn post_json(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("request")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Poll `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
