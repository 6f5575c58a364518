//! Remote data backend capability and an in-memory implementation.
//!
//! The backend scopes every collection to the signed-in owner, so `list`
//! returns the owner's records only. Exclusive activation is enforced
//! server-side: `set_active(.., true)` clears the flag on every sibling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{RemoteError, RemoteResult};
use crate::record::{Fields, Record};

/// Capacity of the change-notification channel.
const NOTIFICATION_CAPACITY: usize = 256;

/// What changed remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A record was added.
    Added,
    /// A record was modified.
    Modified,
    /// A record was removed.
    Removed,
    /// Several records changed at once (import, server-side batch).
    Bulk,
}

/// Server push telling the client a collection changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Collection that changed.
    pub collection: String,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Affected record, when the change targets a single one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

/// Remote source of truth, reached over the network.
///
/// Ids passed in are always server ids; temp ids never leave the client.
#[async_trait]
pub trait DataBackend: Send + Sync + 'static {
    /// All records of a collection owned by the current user.
    async fn list(&self, collection: &str) -> RemoteResult<Vec<Record>>;

    /// Create a record; the backend assigns the id.
    async fn create(&self, collection: &str, fields: Fields) -> RemoteResult<Record>;

    /// Replace the fields of a record.
    async fn update(&self, collection: &str, id: &str, fields: Fields) -> RemoteResult<Record>;

    /// Delete a record.
    async fn delete(&self, collection: &str, id: &str) -> RemoteResult<()>;

    /// Set or clear the exclusive active flag.
    async fn set_active(&self, collection: &str, id: &str, active: bool) -> RemoteResult<Record>;

    /// Create many records in one call.
    async fn import(&self, collection: &str, records: Vec<Fields>) -> RemoteResult<Vec<Record>>;

    /// Export a collection as plain JSON documents including ids.
    async fn export(&self, collection: &str) -> RemoteResult<Vec<Value>>;

    /// Subscribe to remote change notifications.
    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification>;
}

impl std::fmt::Debug for dyn DataBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataBackend")
    }
}

/// Backend operation, used by [`MemoryBackend`] call logs and failure rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendOp {
    /// `list`
    List,
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `set_active`
    SetActive,
    /// `import`
    Import,
    /// `export`
    Export,
}

/// One recorded call to a [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCall {
    /// Operation.
    pub op: BackendOp,
    /// Collection.
    pub collection: String,
    /// Target id, if any.
    pub id: Option<String>,
    /// Payload fields sent, if any.
    pub fields: Option<Fields>,
}

#[derive(Debug, Clone)]
struct FailureRule {
    op: BackendOp,
    id: Option<String>,
    error: fn() -> RemoteError,
}

#[derive(Debug, Default)]
struct BackendData {
    collections: HashMap<String, IndexMap<String, Record>>,
    calls: Vec<BackendCall>,
    failures: Vec<FailureRule>,
}

/// In-memory [`DataBackend`] with call log and failure injection.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryBackendInner>,
}

#[derive(Debug)]
struct MemoryBackendInner {
    data: Mutex<BackendData>,
    next_id: AtomicU64,
    reachable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    exclusive_field: String,
    notifications: broadcast::Sender<ChangeNotification>,
}

impl MemoryBackend {
    /// Create an empty, reachable backend. `active` is the exclusive field.
    #[must_use]
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            inner: Arc::new(MemoryBackendInner {
                data: Mutex::new(BackendData::default()),
                next_id: AtomicU64::new(1),
                reachable: AtomicBool::new(true),
                latency: Mutex::new(None),
                exclusive_field: "active".to_string(),
                notifications,
            }),
        }
    }

    /// Seed a record directly, bypassing the call log.
    pub fn seed(&self, collection: &str, record: Record) {
        self.lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(record.id.clone(), record);
    }

    /// Make every call fail with a network error while `false`.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self
            .inner
            .latency
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = latency;
    }

    /// Fail every `op` call (optionally only for `id`) with a rejection.
    pub fn fail_on(&self, op: BackendOp, id: Option<&str>) {
        self.fail_with(op, id, || RemoteError::Rejected {
            status: 500,
            message: "injected failure".to_string(),
        });
    }

    /// Fail every `op` call (optionally only for `id`) with a custom error.
    pub fn fail_with(&self, op: BackendOp, id: Option<&str>, error: fn() -> RemoteError) {
        self.lock().failures.push(FailureRule {
            op,
            id: id.map(str::to_string),
            error,
        });
    }

    /// Remove all failure rules.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Calls received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// Calls of one operation.
    #[must_use]
    pub fn calls_of(&self, op: BackendOp) -> Vec<BackendCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    /// Current server-side records of a collection.
    #[must_use]
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.lock()
            .collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Push a change notification to subscribers.
    pub fn notify(&self, notification: ChangeNotification) {
        // No subscribers is fine.
        let _ = self.inner.notifications.send(notification);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BackendData> {
        self.inner
            .data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn allocate_id(&self) -> String {
        format!("srv-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Log the call, then apply latency, reachability and failure rules.
    async fn enter(
        &self,
        op: BackendOp,
        collection: &str,
        id: Option<&str>,
        fields: Option<&Fields>,
    ) -> RemoteResult<()> {
        let latency = *self
            .inner
            .latency
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::offline());
        }

        let mut data = self.lock();
        data.calls.push(BackendCall {
            op,
            collection: collection.to_string(),
            id: id.map(str::to_string),
            fields: fields.cloned(),
        });
        let rule = data
            .failures
            .iter()
            .find(|rule| rule.op == op && (rule.id.is_none() || rule.id.as_deref() == id));
        match rule {
            Some(rule) => Err((rule.error)()),
            None => Ok(()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataBackend for MemoryBackend {
    async fn list(&self, collection: &str) -> RemoteResult<Vec<Record>> {
        self.enter(BackendOp::List, collection, None, None).await?;
        Ok(self.records(collection))
    }

    async fn create(&self, collection: &str, fields: Fields) -> RemoteResult<Record> {
        self.enter(BackendOp::Create, collection, None, Some(&fields))
            .await?;
        let record = Record::new(self.allocate_id(), fields);
        self.seed(collection, record.clone());
        Ok(record)
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> RemoteResult<Record> {
        self.enter(BackendOp::Update, collection, Some(id), Some(&fields))
            .await?;
        let mut data = self.lock();
        let record = data
            .collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        record.merge_fields(&fields);
        Ok(record.clone())
    }

    async fn delete(&self, collection: &str, id: &str) -> RemoteResult<()> {
        self.enter(BackendOp::Delete, collection, Some(id), None)
            .await?;
        let mut data = self.lock();
        data.collections
            .get_mut(collection)
            .and_then(|c| c.shift_remove(id))
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn set_active(&self, collection: &str, id: &str, active: bool) -> RemoteResult<Record> {
        self.enter(BackendOp::SetActive, collection, Some(id), None)
            .await?;
        let field = self.inner.exclusive_field.clone();
        let mut data = self.lock();
        let records = data
            .collections
            .get_mut(collection)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        if !records.contains_key(id) {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        for (other_id, record) in records.iter_mut() {
            if other_id == id {
                record.set_field(field.clone(), Value::Bool(active));
            } else if active {
                record.set_field(field.clone(), Value::Bool(false));
            }
        }
        records
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn import(&self, collection: &str, records: Vec<Fields>) -> RemoteResult<Vec<Record>> {
        self.enter(BackendOp::Import, collection, None, None).await?;
        let created: Vec<Record> = records
            .into_iter()
            .map(|fields| Record::new(self.allocate_id(), fields))
            .collect();
        for record in &created {
            self.seed(collection, record.clone());
        }
        Ok(created)
    }

    async fn export(&self, collection: &str) -> RemoteResult<Vec<Value>> {
        self.enter(BackendOp::Export, collection, None, None).await?;
        Ok(self
            .records(collection)
            .into_iter()
            .map(|record| {
                let mut doc = record.fields;
                doc.insert("id".to_string(), Value::String(record.id));
                Value::Object(doc)
            })
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.inner.notifications.subscribe()
    }
}
