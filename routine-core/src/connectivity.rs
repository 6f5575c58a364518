//! Connectivity monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Whether the remote backend is currently reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Network reachable; mutations go straight to the backend.
    Online,
    /// Disconnected; mutations are recorded locally.
    Offline,
}

impl ConnectionStatus {
    /// Returns true when online.
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Holds the current connectivity status and notifies subscribers on change.
///
/// Clones share the same underlying channel.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectionStatus>,
    reconnects: Arc<AtomicU64>,
}

impl ConnectivityMonitor {
    /// Create a monitor with an initial status.
    #[must_use]
    pub fn new(initial: ConnectionStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx,
            reconnects: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    /// Returns true when online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status().is_online()
    }

    /// Report a new status. Subscribers are only woken when it changes.
    ///
    /// Returns true if the status changed.
    pub fn set_status(&self, status: ConnectionStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                if status.is_online() {
                    // Bumped before subscribers are woken.
                    self.reconnects.fetch_add(1, Ordering::SeqCst);
                }
                true
            }
        });
        if changed {
            match status {
                ConnectionStatus::Online => tracing::info!("Connectivity restored"),
                ConnectionStatus::Offline => tracing::warn!("Connectivity lost"),
            }
        }
        changed
    }

    /// Number of offline→online transitions so far.
    ///
    /// A subscriber that compares this against the value it last saw
    /// catches reconnects even when the channel collapsed an
    /// offline→online pair into a single wake-up.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectionStatus::Online)
    }
}
