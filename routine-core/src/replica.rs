//! Local replica: the durable store plus the in-memory state the UI reads.
//!
//! Every write goes to the store first and is mirrored in memory only after
//! the store committed it, so the two never disagree about a record that a
//! caller was told about.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::StorageResult;
use crate::record::{now_millis, Record};
use crate::schema::Schema;
use crate::store::{Collections, LocalStore, WriteBatch};

/// Capacity of the change-event channel.
const EVENT_CAPACITY: usize = 256;

/// Emitted after a committed write touched a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Collection that changed.
    pub collection: String,
}

/// Durable store with an in-memory mirror and a change feed.
pub struct Replica {
    store: Arc<dyn LocalStore>,
    mirror: RwLock<Collections>,
    events: broadcast::Sender<ChangeEvent>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("schema_version", &self.schema().version)
            .finish_non_exhaustive()
    }
}

impl Replica {
    /// Wrap a store. The mirror starts empty; call [`Replica::load`].
    #[must_use]
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            mirror: RwLock::new(Collections::for_schema(store.schema())),
            store,
            events,
        }
    }

    /// Hydrate the in-memory mirror from the store.
    ///
    /// # Errors
    ///
    /// Returns the store error if any collection cannot be read; the mirror is
    /// left unchanged in that case.
    pub async fn load(&self) -> StorageResult<()> {
        let schema = self.schema().clone();
        let mut image = Collections::for_schema(&schema);
        let mut batch = WriteBatch::new();
        for name in schema.names() {
            for record in self.store.get_all(&name).await? {
                batch.put(name.clone(), record);
            }
        }
        image.apply(&batch)?;
        *self
            .mirror
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = image;
        tracing::debug!(records = batch.len(), "Loaded local replica");
        Ok(())
    }

    /// Declared schema.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        self.store.schema()
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Commit a batch to the store, then mirror it and notify subscribers.
    ///
    /// Puts into critical collections get `last_updated` stamped.
    ///
    /// # Errors
    ///
    /// Returns the store error; nothing is mirrored in that case.
    pub async fn commit(&self, mut batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        batch.stamp_critical(self.schema(), now_millis());
        self.store.write(batch.clone()).await?;

        let mut touched: Vec<String> = Vec::new();
        {
            let mut mirror = self
                .mirror
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            mirror.apply(&batch)?;
        }
        for op in batch.ops() {
            if !touched.iter().any(|c| c == op.collection()) {
                touched.push(op.collection().to_string());
            }
        }
        for collection in touched {
            // No subscribers is fine.
            let _ = self.events.send(ChangeEvent { collection });
        }
        Ok(())
    }

    /// Records of a collection as currently shown, tombstones included.
    #[must_use]
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.mirror
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_all(collection)
            .unwrap_or_default()
    }

    /// Records of a collection without local tombstones.
    #[must_use]
    pub fn visible(&self, collection: &str) -> Vec<Record> {
        self.records(collection)
            .into_iter()
            .filter(|r| !r.sync.is_tombstone())
            .collect()
    }

    /// A record from the in-memory mirror.
    #[must_use]
    pub fn record(&self, collection: &str, id: &str) -> Option<Record> {
        self.mirror
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(collection, id)
            .ok()
            .flatten()
    }

    /// Pending records of a collection, read from the durable store.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn pending(&self, collection: &str) -> StorageResult<Vec<Record>> {
        self.store.pending(collection).await
    }

    /// Children of `parent_id` in `child_collection`, linked through `field`.
    #[must_use]
    pub fn children(&self, child_collection: &str, field: &str, parent_id: &str) -> Vec<Record> {
        self.records(child_collection)
            .into_iter()
            .filter(|r| r.str_field(field) == Some(parent_id))
            .collect()
    }

    /// Subscribe to committed changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// Drop every non-critical collection to free storage.
    ///
    /// # Errors
    ///
    /// Returns the store error; nothing is cleared in that case.
    pub async fn clear_non_critical(&self) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        for spec in self.schema().collections.iter().filter(|c| !c.critical) {
            batch.clear(spec.name.clone());
        }
        let cleared = batch.len();
        self.commit(batch).await?;
        tracing::info!(collections = cleared, "Cleared non-critical local data");
        Ok(())
    }

    /// Wipe the store and the mirror ("clear cache").
    ///
    /// Pending mutations are lost.
    ///
    /// # Errors
    ///
    /// Returns the store error; the mirror is kept in that case.
    pub async fn destroy(&self) -> StorageResult<()> {
        self.store.destroy().await?;
        *self
            .mirror
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) =
            Collections::for_schema(self.schema());
        for collection in self.schema().names() {
            let _ = self.events.send(ChangeEvent { collection });
        }
        tracing::warn!("Local replica destroyed");
        Ok(())
    }
}
