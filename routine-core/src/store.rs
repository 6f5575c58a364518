//! Local durable store: keyed by (collection, record id).
//!
//! The [`LocalStore`] trait is the capability the host environment supplies.
//! Writes go through [`WriteBatch`], which commits atomically: either every
//! operation in the batch is visible afterwards or none is.
//!
//! [`MemoryStore`] keeps everything in memory and supports failure injection
//! for tests; [`crate::FileStore`] persists to a JSON snapshot on disk.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::record::{now_millis, Record};
use crate::schema::Schema;

/// One operation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or replace a record.
    Put {
        /// Target collection.
        collection: String,
        /// Record to store.
        record: Record,
    },
    /// Remove a record if present.
    Delete {
        /// Target collection.
        collection: String,
        /// Record id.
        id: String,
    },
    /// Remove every record of a collection.
    Clear {
        /// Target collection.
        collection: String,
    },
}

impl WriteOp {
    /// Collection the operation touches.
    #[must_use]
    pub fn collection(&self) -> &str {
        match self {
            Self::Put { collection, .. }
            | Self::Delete { collection, .. }
            | Self::Clear { collection } => collection,
        }
    }
}

/// Ordered set of writes committed as one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an upsert.
    pub fn put(&mut self, collection: impl Into<String>, record: Record) -> &mut Self {
        self.ops.push(WriteOp::Put {
            collection: collection.into(),
            record,
        });
        self
    }

    /// Add a delete.
    pub fn delete(&mut self, collection: impl Into<String>, id: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            collection: collection.into(),
            id: id.into(),
        });
        self
    }

    /// Add a clear.
    pub fn clear(&mut self, collection: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Clear {
            collection: collection.into(),
        });
        self
    }

    /// Append all operations of another batch.
    pub fn extend(&mut self, other: WriteBatch) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    /// Number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch holds no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operations in commit order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Stamp `last_updated` on every put into a critical collection.
    pub fn stamp_critical(&mut self, schema: &Schema, now: u64) {
        for op in &mut self.ops {
            if let WriteOp::Put { collection, record } = op {
                if schema.is_critical(collection) {
                    record.last_updated = Some(now);
                }
            }
        }
    }
}

/// In-memory image of every collection, in storage order.
///
/// Shared by the store implementations and by the client-side mirror.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collections {
    /// Schema version the image was last upgraded to.
    pub version: u32,
    collections: IndexMap<String, IndexMap<String, Record>>,
}

impl Collections {
    /// Create an image holding every collection of `schema`, all empty.
    #[must_use]
    pub fn for_schema(schema: &Schema) -> Self {
        let mut image = Self::default();
        image.upgrade(schema);
        image
    }

    /// Create newly declared collections and bump the version.
    ///
    /// Existing collections are left untouched. Returns the names that were
    /// added.
    pub fn upgrade(&mut self, schema: &Schema) -> Vec<String> {
        let mut added = Vec::new();
        for spec in &schema.collections {
            if !self.collections.contains_key(&spec.name) {
                self.collections.insert(spec.name.clone(), IndexMap::new());
                added.push(spec.name.clone());
            }
        }
        self.version = self.version.max(schema.version);
        added
    }

    /// Apply a batch in order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownCollection`] before applying anything if
    /// the batch names an undeclared collection.
    pub fn apply(&mut self, batch: &WriteBatch) -> StorageResult<()> {
        if let Some(op) = batch
            .ops()
            .iter()
            .find(|op| !self.collections.contains_key(op.collection()))
        {
            return Err(StorageError::UnknownCollection(op.collection().to_string()));
        }
        for op in batch.ops() {
            match op {
                WriteOp::Put { collection, record } => {
                    if let Some(records) = self.collections.get_mut(collection) {
                        records.insert(record.id.clone(), record.clone());
                    }
                }
                WriteOp::Delete { collection, id } => {
                    if let Some(records) = self.collections.get_mut(collection) {
                        records.shift_remove(id);
                    }
                }
                WriteOp::Clear { collection } => {
                    if let Some(records) = self.collections.get_mut(collection) {
                        records.clear();
                    }
                }
            }
        }
        Ok(())
    }

    /// All records of a collection.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownCollection`] for undeclared names.
    pub fn get_all(&self, collection: &str) -> StorageResult<Vec<Record>> {
        self.collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .ok_or_else(|| StorageError::UnknownCollection(collection.to_string()))
    }

    /// One record of a collection.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownCollection`] for undeclared names.
    pub fn get(&self, collection: &str, id: &str) -> StorageResult<Option<Record>> {
        self.collections
            .get(collection)
            .map(|records| records.get(id).cloned())
            .ok_or_else(|| StorageError::UnknownCollection(collection.to_string()))
    }

    /// Total number of stored records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.collections.values().map(IndexMap::len).sum()
    }

    /// Names of the collections present in the image.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }
}

/// Keyed durable storage with named collections.
///
/// Implementations must make [`LocalStore::write`] atomic and must leave
/// state unchanged when they return an error.
#[async_trait]
pub trait LocalStore: Send + Sync + 'static {
    /// Declared schema.
    fn schema(&self) -> &Schema;

    /// All records of a collection in storage order. Empty if never written.
    async fn get_all(&self, collection: &str) -> StorageResult<Vec<Record>>;

    /// A record by id.
    async fn get(&self, collection: &str, id: &str) -> StorageResult<Option<Record>>;

    /// Commit a batch atomically.
    async fn write(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Remove every record of every collection ("clear cache" action).
    async fn destroy(&self) -> StorageResult<()>;

    /// Upsert one record. Critical collections get `last_updated` stamped.
    async fn upsert(&self, collection: &str, record: Record) -> StorageResult<()> {
        self.upsert_many(collection, vec![record]).await
    }

    /// Upsert several records in one transaction.
    async fn upsert_many(&self, collection: &str, records: Vec<Record>) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        for record in records {
            batch.put(collection, record);
        }
        batch.stamp_critical(self.schema(), now_millis());
        self.write(batch).await
    }

    /// Delete a record. Deleting an absent id is not an error.
    async fn delete(&self, collection: &str, id: &str) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(collection, id);
        self.write(batch).await
    }

    /// Remove every record of a collection.
    ///
    /// Pending mutations in the collection are lost; reconcile first.
    async fn clear(&self, collection: &str) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.clear(collection);
        self.write(batch).await
    }

    /// Records of a collection that are waiting for reconciliation.
    async fn pending(&self, collection: &str) -> StorageResult<Vec<Record>> {
        Ok(self
            .get_all(collection)
            .await?
            .into_iter()
            .filter(|r| r.sync.is_pending())
            .collect())
    }
}

/// In-memory [`LocalStore`] with optional quota and failure injection.
#[derive(Debug)]
pub struct MemoryStore {
    schema: Schema,
    data: RwLock<Collections>,
    max_records: Option<usize>,
    unavailable: AtomicBool,
    failing_writes: AtomicUsize,
    write_count: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store for `schema`.
    #[must_use]
    pub fn new(schema: Schema) -> Self {
        Self {
            data: RwLock::new(Collections::for_schema(&schema)),
            schema,
            max_records: None,
            unavailable: AtomicBool::new(false),
            failing_writes: AtomicUsize::new(0),
            write_count: AtomicUsize::new(0),
        }
    }

    /// Builder: reject writes that would store more than `limit` records.
    #[must_use]
    pub fn with_quota(mut self, limit: usize) -> Self {
        self.max_records = Some(limit);
        self
    }

    /// Make every operation fail with [`StorageError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Abort the next `count` write transactions.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of committed write transactions.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Copy of the current image.
    #[must_use]
    pub fn snapshot(&self) -> Collections {
        self.data
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store disabled".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Schema::default())
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn get_all(&self, collection: &str) -> StorageResult<Vec<Record>> {
        self.check_available()?;
        self.data
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_all(collection)
    }

    async fn get(&self, collection: &str, id: &str) -> StorageResult<Option<Record>> {
        self.check_available()?;
        self.data
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(collection, id)
    }

    async fn write(&self, batch: WriteBatch) -> StorageResult<()> {
        self.check_available()?;
        let failing = self.failing_writes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_writes.store(failing - 1, Ordering::SeqCst);
            return Err(StorageError::Aborted("injected write failure".to_string()));
        }

        let mut data = self
            .data
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut next = data.clone();
        next.apply(&batch)?;
        if let Some(limit) = self.max_records {
            let used = next.record_count();
            if used > limit {
                return Err(StorageError::QuotaExceeded { used, limit });
            }
        }
        *data = next;
        self.write_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) -> StorageResult<()> {
        self.check_available()?;
        let mut data = self
            .data
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *data = Collections::for_schema(&self.schema);
        Ok(())
    }
}
