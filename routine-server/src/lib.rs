//! # Routine Sync Server Library
//!
//! Shared types and functionality for the routine-sync host.
//! This library is used by both the binary and integration tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use anyhow::Context;
use routine_cache::{CacheEngine, HttpFetcher, MemoryCacheStorage};
use routine_core::{
    ConnectionStatus, ConnectivityMonitor, FileStore, LocalStore, MemoryBackend, MemoryStore,
    Reconciler, Replica, Repository, Schema, SyncConfig,
};
use tokio::task::JoinHandle;

pub mod api;
pub mod backend;
pub mod config;
pub mod events;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod routes;

pub use backend::{Backend, HttpBackend};
pub use config::{CliArgs, ServerConfig};
pub use routes::build_router;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Offline-aware data access.
    pub repository: Arc<Repository>,
    /// Reconciler sharing the repository's pass locks.
    pub reconciler: Arc<Reconciler>,
    /// Cache policy engine answering proxied requests.
    pub cache: CacheEngine,
    /// Data backend, kept for change-notification forwarding.
    pub backend: Backend,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("backend", &self.backend.kind())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Assemble state from its parts.
    #[must_use]
    pub fn new(repository: Arc<Repository>, cache: CacheEngine, backend: Backend) -> Self {
        let reconciler = Arc::new(repository.reconciler());
        Self {
            repository,
            reconciler,
            cache,
            backend,
        }
    }

    /// Build state from configuration: open the local store, pick the
    /// backend and create the cache engine.
    ///
    /// # Errors
    ///
    /// Fails if the local store cannot be loaded, the backend client or
    /// cache policy cannot be built.
    pub async fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        let schema = Schema::routine_manager();
        let store: Arc<dyn LocalStore> = match &config.data_dir {
            Some(dir) => Arc::new(FileStore::new(dir.clone(), schema)),
            None => Arc::new(MemoryStore::new(schema)),
        };
        let replica = Arc::new(Replica::new(store));
        replica.load().await.context("failed to load local store")?;

        let backend = match &config.backend_url {
            Some(url) => Backend::Http(
                HttpBackend::new(url.clone(), config.request_timeout)
                    .context("failed to build backend client")?,
            ),
            None => Backend::Memory(MemoryBackend::new()),
        };

        let initial = if config.start_offline {
            ConnectionStatus::Offline
        } else {
            ConnectionStatus::Online
        };
        let repository = Arc::new(Repository::new(
            replica,
            backend.shared(),
            ConnectivityMonitor::new(initial),
        ));

        let policy = config.load_policy().context("failed to load cache policy")?;
        let fetcher = HttpFetcher::new(config.request_timeout).context("failed to build fetch client")?;
        let cache = CacheEngine::new(
            policy,
            config.upstream.clone(),
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(fetcher),
        )
        .context("invalid cache policy")?;

        Ok(Self::new(repository, cache, backend))
    }

    /// Connectivity monitor shared by repository and reconciler.
    #[must_use]
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        self.repository.connectivity()
    }

    /// Total number of records waiting for reconciliation.
    #[must_use]
    pub fn pending_total(&self) -> usize {
        self.repository.pending_count().values().sum()
    }

    /// Start the background tasks: reconnect-driven sync, remote change
    /// refresh, and metric recorders.
    pub fn spawn_background(&self, sync: SyncConfig) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            self.reconciler.spawn_reconnect_sync(self.connectivity().clone(), sync),
            self.repository.spawn_change_listener(),
            metrics::spawn_sync_recorder(self.reconciler.subscribe()),
        ];

        let state = self.clone();
        let mut changes = self.repository.replica().subscribe();
        handles.push(tokio::spawn(async move {
            metrics::set_pending_records(state.pending_total());
            loop {
                match changes.recv().await {
                    Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        metrics::set_pending_records(state.pending_total());
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serde_json::json;

    fn offline_config(dir: &std::path::Path) -> ServerConfig {
        let dir = dir.to_string_lossy().into_owned();
        ServerConfig::from(CliArgs::parse_from([
            "routine-sync",
            "--data-dir",
            dir.as_str(),
            "--start-offline",
        ]))
    }

    #[tokio::test]
    async fn test_pending_records_survive_restart() {
        let dir = tempfile::tempdir().expect("tempdir");

        let state = AppState::from_config(&offline_config(dir.path()))
            .await
            .expect("state");
        assert_eq!(state.backend.kind(), "memory");
        let fields = json!({"title": "Offline task"})
            .as_object()
            .cloned()
            .unwrap_or_default();
        let created = state.repository.create("tasks", fields).await.expect("create");
        assert!(created.has_temp_id());
        drop(state);

        let restarted = AppState::from_config(&offline_config(dir.path()))
            .await
            .expect("state");
        assert_eq!(restarted.pending_total(), 1);
        let record = restarted
            .repository
            .record("tasks", &created.id)
            .expect("persisted record");
        assert_eq!(record.str_field("title"), Some("Offline task"));
    }
}
