//! # Routine Sync Core
//!
//! Offline-first data layer for the task and routine manager.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                   Repository                     │
//! │   online → DataBackend, then mirror locally      │
//! │   offline → optimistic write + SyncState tag     │
//! ├────────────────────────┬─────────────────────────┤
//! │  Replica               │  Reconciler             │
//! │  - LocalStore (durable)│  - per-collection pass  │
//! │  - in-memory mirror    │  - temp id binding      │
//! │  - change feed         │  - exclusivity          │
//! ├────────────────────────┴─────────────────────────┤
//! │  ConnectivityMonitor: offline→online edge → pass │
//! └──────────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod connectivity;
pub mod error;
pub mod file_store;
pub mod reconcile;
pub mod record;
pub mod replica;
pub mod repository;
pub mod schema;
pub mod store;

pub use backend::{
    BackendCall, BackendOp, ChangeKind, ChangeNotification, DataBackend, MemoryBackend,
};
pub use connectivity::{ConnectionStatus, ConnectivityMonitor};
pub use error::{
    MutationError, MutationResult, RemoteError, RemoteResult, StorageError, StorageResult,
};
pub use file_store::FileStore;
pub use reconcile::{
    CollectionLocks, FailedRecord, PassOutcome, Reconciler, SyncConfig, SyncEvent,
    SyncOperation, SyncReport, SyncSummary, SyncTrigger,
};
pub use record::{generate_temp_id, is_temp_id, now_millis, Fields, Record, SyncState};
pub use replica::{ChangeEvent, Replica};
pub use repository::Repository;
pub use schema::{CollectionSpec, ParentLink, Schema};
pub use store::{Collections, LocalStore, MemoryStore, WriteBatch, WriteOp};

/// Routine Sync core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
