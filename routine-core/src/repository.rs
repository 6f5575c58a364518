//! Mutation path used by the UI.
//!
//! Each mutation picks its route from the connectivity monitor. Online, the
//! backend is called first and the result mirrored locally. Offline, the
//! mutation is applied optimistically and tagged with a [`SyncState`] for the
//! reconciler. Either way nothing is committed locally when the mutation
//! returns an error.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::backend::DataBackend;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{MutationError, MutationResult, RemoteError, StorageError};
use crate::reconcile::{CollectionLocks, Reconciler};
use crate::record::{is_temp_id, Fields, Record, SyncState};
use crate::replica::Replica;
use crate::schema::CollectionSpec;
use crate::store::WriteBatch;

/// Offline-aware access to every collection.
#[derive(Debug)]
pub struct Repository {
    replica: Arc<Replica>,
    backend: Arc<dyn DataBackend>,
    connectivity: ConnectivityMonitor,
    locks: Arc<CollectionLocks>,
}

impl Repository {
    /// Create a repository over a loaded replica.
    #[must_use]
    pub fn new(
        replica: Arc<Replica>,
        backend: Arc<dyn DataBackend>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        let locks = Arc::new(CollectionLocks::new(replica.schema()));
        Self {
            replica,
            backend,
            connectivity,
            locks,
        }
    }

    /// Build the reconciler sharing this repository's replica, backend and
    /// per-collection pass locks.
    #[must_use]
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.replica),
            Arc::clone(&self.backend),
            Arc::clone(&self.locks),
        )
    }

    /// Local replica.
    #[must_use]
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// Connectivity monitor driving route selection.
    #[must_use]
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Records shown to the user (local tombstones hidden).
    #[must_use]
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.replica.visible(collection)
    }

    /// A record shown to the user.
    #[must_use]
    pub fn record(&self, collection: &str, id: &str) -> Option<Record> {
        self.replica
            .record(collection, id)
            .filter(|r| !r.sync.is_tombstone())
    }

    /// Number of records waiting for reconciliation, per collection.
    #[must_use]
    pub fn pending_count(&self) -> BTreeMap<String, usize> {
        self.replica
            .schema()
            .names()
            .into_iter()
            .map(|name| {
                let count = self
                    .replica
                    .records(&name)
                    .iter()
                    .filter(|r| r.sync.is_pending())
                    .count();
                (name, count)
            })
            .collect()
    }

    /// Create a record.
    ///
    /// A child whose parent has not reached the backend yet is always
    /// recorded locally, even while online.
    #[tracing::instrument(skip(self, fields), fields(online = self.connectivity.is_online()))]
    pub async fn create(&self, collection: &str, mut fields: Fields) -> MutationResult<Record> {
        let spec = self.spec(collection)?;
        fields.remove("id");
        let mut batch = WriteBatch::new();

        let record = if self.connectivity.is_online() && !links_pending_parent(&spec, &fields) {
            let created = self.backend.create(collection, fields).await?;
            tracing::debug!(record_id = %created.id, "Created remotely");
            created
        } else {
            let record = Record::pending_create(fields);
            tracing::debug!(record_id = %record.id, "Recorded pending create");
            record
        };

        if let Some(field) = &spec.exclusive_field {
            if record.flag(field) {
                self.clear_siblings(&mut batch, collection, field, &record.id);
            }
        }
        let id = record.id.clone();
        batch.put(collection, record.clone());
        self.replica.commit(batch).await?;
        Ok(self.replica.record(collection, &id).unwrap_or(record))
    }

    /// Shallow-merge `patch` into a record.
    ///
    /// The exclusive field cannot be patched; use [`Repository::activate`] or
    /// [`Repository::deactivate`].
    #[tracing::instrument(skip(self, patch), fields(online = self.connectivity.is_online()))]
    pub async fn update(&self, collection: &str, id: &str, patch: Fields) -> MutationResult<Record> {
        let spec = self.spec(collection)?;
        if let Some(field) = &spec.exclusive_field {
            if patch.contains_key(field) {
                return Err(MutationError::InvalidState(format!(
                    "`{field}` is exclusive in {collection}; use activate or deactivate"
                )));
            }
        }
        let mut record = self.live_record(collection, id)?;
        record.merge_fields(&patch);

        if self.routes_remote(&spec, &record) {
            let server = self.backend.update(collection, id, record.payload()).await?;
            record.merge_fields(&server.fields);
            record.sync = SyncState::Clean;
        } else {
            record.sync = record
                .sync
                .after_update()
                .ok_or_else(|| MutationError::not_found(collection, id))?;
            tracing::debug!(state = record.sync.label(), "Recorded pending update");
        }

        let mut batch = WriteBatch::new();
        batch.put(collection, record.clone());
        self.replica.commit(batch).await?;
        Ok(self.replica.record(collection, id).unwrap_or(record))
    }

    /// Delete a record.
    ///
    /// A record that never reached the backend is removed locally with its
    /// children. Offline, server records become tombstones; their children
    /// are removed once the delete is reconciled.
    #[tracing::instrument(skip(self), fields(online = self.connectivity.is_online()))]
    pub async fn delete(&self, collection: &str, id: &str) -> MutationResult<()> {
        let spec = self.spec(collection)?;
        let record = self.live_record(collection, id)?;
        let mut batch = WriteBatch::new();

        if record.sync == SyncState::PendingCreate || record.has_temp_id() {
            batch.delete(collection, id);
            self.drop_children(&mut batch, &spec, id, false);
        } else if self.connectivity.is_online() {
            match self.backend.delete(collection, id).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            batch.delete(collection, id);
            self.drop_children(&mut batch, &spec, id, false);
        } else {
            batch.put(collection, record.with_sync(SyncState::PendingDelete));
            self.drop_children(&mut batch, &spec, id, true);
            tracing::debug!(record_id = %id, "Recorded pending delete");
        }

        self.replica.commit(batch).await?;
        Ok(())
    }

    /// Mark a record as the collection's single active record.
    pub async fn activate(&self, collection: &str, id: &str) -> MutationResult<Record> {
        self.set_exclusive(collection, id, true).await
    }

    /// Clear a record's active flag.
    pub async fn deactivate(&self, collection: &str, id: &str) -> MutationResult<Record> {
        self.set_exclusive(collection, id, false).await
    }

    #[tracing::instrument(skip(self), fields(online = self.connectivity.is_online()))]
    async fn set_exclusive(&self, collection: &str, id: &str, active: bool) -> MutationResult<Record> {
        let spec = self.spec(collection)?;
        let field = spec.exclusive_field.clone().ok_or_else(|| {
            MutationError::InvalidState(format!("{collection} has no exclusive field"))
        })?;
        let mut record = self.live_record(collection, id)?;

        if self.routes_remote(&spec, &record) {
            let server = self.backend.set_active(collection, id, active).await?;
            record.set_field(field.clone(), server.field(&field).cloned().unwrap_or(Value::Bool(active)));
        } else {
            record.set_field(field.clone(), Value::Bool(active));
            record.sync = record
                .sync
                .after_exclusive_toggle(active)
                .ok_or_else(|| MutationError::not_found(collection, id))?;
            tracing::debug!(state = record.sync.label(), "Recorded pending transition");
        }

        let mut batch = WriteBatch::new();
        if active {
            self.clear_siblings(&mut batch, collection, &field, id);
        }
        batch.put(collection, record.clone());
        self.replica.commit(batch).await?;
        Ok(self.replica.record(collection, id).unwrap_or(record))
    }

    /// Reload a collection from the backend, keeping every pending record.
    ///
    /// Waits for an in-flight reconciliation of the collection to finish.
    /// Returns the number of records the backend returned.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self, collection: &str) -> MutationResult<usize> {
        self.spec(collection)?;
        if !self.connectivity.is_online() {
            return Err(RemoteError::offline().into());
        }
        let _pass = self.locks.acquire(collection).await;
        let remote = self.backend.list(collection).await?;

        let local = self.replica.records(collection);
        let pending: HashSet<&str> = local
            .iter()
            .filter(|r| r.sync.is_pending())
            .map(|r| r.id.as_str())
            .collect();
        let remote_ids: HashSet<&str> = remote.iter().map(|r| r.id.as_str()).collect();

        let mut batch = WriteBatch::new();
        for record in &local {
            if !record.sync.is_pending() && !remote_ids.contains(record.id.as_str()) {
                batch.delete(collection, record.id.clone());
            }
        }
        for record in &remote {
            if !pending.contains(record.id.as_str()) {
                batch.put(collection, record.clone());
            }
        }
        self.replica.commit(batch).await?;
        tracing::debug!(count = remote.len(), kept_pending = pending.len(), "Refreshed");
        Ok(remote.len())
    }

    /// Bulk-create records through the backend. Online only.
    #[tracing::instrument(skip(self, records), fields(count = records.len()))]
    pub async fn import(&self, collection: &str, records: Vec<Fields>) -> MutationResult<Vec<Record>> {
        self.spec(collection)?;
        if !self.connectivity.is_online() {
            return Err(RemoteError::offline().into());
        }
        let records = records
            .into_iter()
            .map(|mut fields| {
                fields.remove("id");
                fields
            })
            .collect();
        let created = self.backend.import(collection, records).await?;
        let mut batch = WriteBatch::new();
        for record in &created {
            batch.put(collection, record.clone());
        }
        self.replica.commit(batch).await?;
        Ok(created)
    }

    /// Export a collection from the backend. Online only.
    pub async fn export(&self, collection: &str) -> MutationResult<Vec<Value>> {
        self.spec(collection)?;
        if !self.connectivity.is_online() {
            return Err(RemoteError::offline().into());
        }
        Ok(self.backend.export(collection).await?)
    }

    /// Refresh collections whenever the backend reports a change while online.
    pub fn spawn_change_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let repo = Arc::clone(self);
        let mut rx = self.backend.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => {
                        let collection = notification.collection;
                        if !repo.replica.schema().contains(&collection) {
                            tracing::debug!(%collection, "Ignoring change for undeclared collection");
                            continue;
                        }
                        if !repo.connectivity.is_online() {
                            continue;
                        }
                        if let Err(e) = repo.refresh(&collection).await {
                            tracing::warn!(%collection, error = %e, "Remote refresh failed");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Change listener lagged; refreshing everything");
                        for name in repo.replica.schema().names() {
                            if let Err(e) = repo.refresh(&name).await {
                                tracing::warn!(collection = %name, error = %e, "Remote refresh failed");
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spec(&self, collection: &str) -> MutationResult<CollectionSpec> {
        self.replica
            .schema()
            .collection(collection)
            .cloned()
            .ok_or_else(|| StorageError::UnknownCollection(collection.to_string()).into())
    }

    fn live_record(&self, collection: &str, id: &str) -> MutationResult<Record> {
        self.record(collection, id)
            .ok_or_else(|| MutationError::not_found(collection, id))
    }

    /// Remote route applies to records the backend already knows and that
    /// carry no pending intent stronger than a field edit.
    fn routes_remote(&self, spec: &CollectionSpec, record: &Record) -> bool {
        self.connectivity.is_online()
            && !record.has_temp_id()
            && matches!(record.sync, SyncState::Clean | SyncState::PendingUpdate)
            && !links_pending_parent(spec, &record.fields)
    }

    fn clear_siblings(&self, batch: &mut WriteBatch, collection: &str, field: &str, keep: &str) {
        for sibling in exclusive_siblings(&self.replica.records(collection), field, &[keep]) {
            batch.put(collection, sibling);
        }
    }

    fn drop_children(&self, batch: &mut WriteBatch, spec: &CollectionSpec, parent_id: &str, only_unsynced: bool) {
        for child in self.replica.schema().children_of(&spec.name) {
            let Some(link) = &child.parent else { continue };
            for record in self.replica.children(&child.name, &link.field, parent_id) {
                if !only_unsynced || record.sync == SyncState::PendingCreate {
                    batch.delete(child.name.clone(), record.id);
                }
            }
        }
    }
}

/// Records other than `keep` that have `field` set, with the flag cleared.
///
/// A sibling whose own activation was still pending drops that intent: the
/// backend never saw it active.
pub(crate) fn exclusive_siblings(records: &[Record], field: &str, keep: &[&str]) -> Vec<Record> {
    records
        .iter()
        .filter(|r| !keep.contains(&r.id.as_str()) && r.flag(field))
        .map(|r| {
            let mut sibling = r.clone();
            sibling.set_field(field, Value::Bool(false));
            if let SyncState::PendingActivation { fields_dirty } = sibling.sync {
                sibling.sync = if fields_dirty {
                    SyncState::PendingUpdate
                } else {
                    SyncState::Clean
                };
            }
            sibling
        })
        .collect()
}

fn links_pending_parent(spec: &CollectionSpec, fields: &Fields) -> bool {
    spec.parent
        .as_ref()
        .and_then(|link| fields.get(&link.field))
        .and_then(Value::as_str)
        .is_some_and(is_temp_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOp, ChangeKind, ChangeNotification, MemoryBackend};
    use crate::connectivity::ConnectionStatus;
    use crate::schema::{ROUTINES, ROUTINE_SLOTS, TASKS};
    use crate::store::{LocalStore, MemoryStore};
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    fn setup(status: ConnectionStatus) -> (Arc<MemoryStore>, MemoryBackend, Arc<Repository>) {
        let store = Arc::new(MemoryStore::default());
        let backend = MemoryBackend::new();
        let replica = Arc::new(Replica::new(store.clone()));
        let repo = Repository::new(
            replica,
            Arc::new(backend.clone()),
            ConnectivityMonitor::new(status),
        );
        (store, backend, Arc::new(repo))
    }

    #[tokio::test]
    async fn test_online_create_goes_to_backend() {
        let (store, backend, repo) = setup(ConnectionStatus::Online);
        let record = repo
            .create(TASKS, fields(json!({"title": "Read"})))
            .await
            .expect("create");
        assert!(!record.has_temp_id());
        assert_eq!(record.sync, SyncState::Clean);
        assert!(record.last_updated.is_some());
        assert_eq!(backend.records(TASKS).len(), 1);
        assert!(store.get(TASKS, &record.id).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn test_offline_create_uses_temp_id() {
        let (_store, backend, repo) = setup(ConnectionStatus::Offline);
        let record = repo
            .create(TASKS, fields(json!({"title": "Read", "id": "sneaky"})))
            .await
            .expect("create");
        assert!(record.has_temp_id());
        assert_eq!(record.sync, SyncState::PendingCreate);
        assert!(backend.calls().is_empty());
        assert_eq!(repo.pending_count().get(TASKS), Some(&1));
    }

    #[tokio::test]
    async fn test_online_failure_commits_nothing() {
        let (store, backend, repo) = setup(ConnectionStatus::Online);
        backend.fail_on(BackendOp::Create, None);
        let err = repo
            .create(TASKS, fields(json!({"title": "Read"})))
            .await
            .expect_err("rejected");
        assert!(matches!(err, MutationError::Remote(_)));
        assert!(store.get_all(TASKS).await.expect("tasks").is_empty());
        assert!(repo.records(TASKS).is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_is_surfaced() {
        let (store, _backend, repo) = setup(ConnectionStatus::Offline);
        store.fail_next_writes(1);
        let err = repo
            .create(TASKS, fields(json!({"title": "Read"})))
            .await
            .expect_err("aborted");
        assert!(matches!(err, MutationError::Storage(StorageError::Aborted(_))));
        assert!(repo.records(TASKS).is_empty());
    }

    #[tokio::test]
    async fn test_offline_update_of_pending_create_stays_create() {
        let (_store, _backend, repo) = setup(ConnectionStatus::Offline);
        let record = repo
            .create(TASKS, fields(json!({"title": "Read"})))
            .await
            .expect("create");
        let updated = repo
            .update(TASKS, &record.id, fields(json!({"title": "Write"})))
            .await
            .expect("update");
        assert_eq!(updated.sync, SyncState::PendingCreate);
        assert_eq!(updated.str_field("title"), Some("Write"));
    }

    #[tokio::test]
    async fn test_update_rejects_exclusive_field() {
        let (_store, _backend, repo) = setup(ConnectionStatus::Offline);
        let routine = repo
            .create(ROUTINES, fields(json!({"name": "Morning"})))
            .await
            .expect("create");
        let err = repo
            .update(ROUTINES, &routine.id, fields(json!({"active": true})))
            .await
            .expect_err("exclusive");
        assert!(matches!(err, MutationError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_delete_pending_create_is_local_only() {
        let (_store, backend, repo) = setup(ConnectionStatus::Offline);
        let routine = repo
            .create(ROUTINES, fields(json!({"name": "Morning"})))
            .await
            .expect("create");
        repo.create(ROUTINE_SLOTS, fields(json!({"routineId": routine.id, "start": "08:00"})))
            .await
            .expect("slot");

        repo.delete(ROUTINES, &routine.id).await.expect("delete");
        assert!(repo.records(ROUTINES).is_empty());
        assert!(repo.records(ROUTINE_SLOTS).is_empty());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_offline_delete_leaves_tombstone() {
        let (_store, _backend, repo) = setup(ConnectionStatus::Offline);
        let mut batch = WriteBatch::new();
        batch.put(TASKS, Record::new("t1", fields(json!({"title": "Read"}))));
        repo.replica().commit(batch).await.expect("seed");

        repo.delete(TASKS, "t1").await.expect("delete");
        assert!(repo.record(TASKS, "t1").is_none());
        let tombstone = repo.replica().record(TASKS, "t1").expect("tombstone");
        assert_eq!(tombstone.sync, SyncState::PendingDelete);

        let err = repo
            .update(TASKS, "t1", fields(json!({"title": "x"})))
            .await
            .expect_err("deleted");
        assert!(matches!(err, MutationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_offline_activation_is_exclusive_locally() {
        let (_store, _backend, repo) = setup(ConnectionStatus::Offline);
        let mut batch = WriteBatch::new();
        batch.put(ROUTINES, Record::new("r1", fields(json!({"active": true}))));
        batch.put(ROUTINES, Record::new("r2", fields(json!({"active": false}))));
        repo.replica().commit(batch).await.expect("seed");

        let r2 = repo.activate(ROUTINES, "r2").await.expect("activate");
        assert_eq!(r2.sync, SyncState::PendingActivation { fields_dirty: false });
        let r1 = repo.record(ROUTINES, "r1").expect("r1");
        assert!(!r1.flag("active"));
        assert_eq!(r1.sync, SyncState::Clean);

        let active = repo
            .records(ROUTINES)
            .into_iter()
            .filter(|r| r.flag("active"))
            .count();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn test_activate_requires_exclusive_field() {
        let (_store, _backend, repo) = setup(ConnectionStatus::Offline);
        let task = repo
            .create(TASKS, fields(json!({"title": "Read"})))
            .await
            .expect("create");
        let err = repo.activate(TASKS, &task.id).await.expect_err("no field");
        assert!(matches!(err, MutationError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_online_child_of_pending_parent_stays_local() {
        let (_store, backend, repo) = setup(ConnectionStatus::Offline);
        let routine = repo
            .create(ROUTINES, fields(json!({"name": "Morning"})))
            .await
            .expect("create");
        repo.connectivity().set_status(ConnectionStatus::Online);

        let slot = repo
            .create(ROUTINE_SLOTS, fields(json!({"routineId": routine.id})))
            .await
            .expect("slot");
        assert_eq!(slot.sync, SyncState::PendingCreate);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_keeps_pending_records() {
        let (_store, backend, repo) = setup(ConnectionStatus::Online);
        backend.seed(TASKS, Record::new("s1", fields(json!({"title": "server"}))));
        let mut batch = WriteBatch::new();
        batch.put(TASKS, Record::new("gone", Fields::new()));
        batch.put(
            TASKS,
            Record::new("s1", fields(json!({"title": "edited"}))).with_sync(SyncState::PendingUpdate),
        );
        batch.put(TASKS, Record::pending_create(fields(json!({"title": "new"}))));
        repo.replica().commit(batch).await.expect("seed");

        let count = repo.refresh(TASKS).await.expect("refresh");
        assert_eq!(count, 1);
        let records = repo.records(TASKS);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.id != "gone"));
        let s1 = repo.record(TASKS, "s1").expect("s1");
        assert_eq!(s1.str_field("title"), Some("edited"));
    }

    #[tokio::test]
    async fn test_import_export_online_only() {
        let (_store, _backend, repo) = setup(ConnectionStatus::Offline);
        let err = repo
            .import(TASKS, vec![fields(json!({"title": "a"}))])
            .await
            .expect_err("offline");
        assert!(matches!(err, MutationError::Remote(RemoteError::Network(_))));

        repo.connectivity().set_status(ConnectionStatus::Online);
        let created = repo
            .import(TASKS, vec![fields(json!({"title": "a"})), fields(json!({"title": "b"}))])
            .await
            .expect("import");
        assert_eq!(created.len(), 2);
        assert_eq!(repo.records(TASKS).len(), 2);
        assert_eq!(repo.export(TASKS).await.expect("export").len(), 2);
    }

    #[tokio::test]
    async fn test_change_listener_refreshes() {
        let (_store, backend, repo) = setup(ConnectionStatus::Online);
        let mut changes = repo.replica().subscribe();
        let handle = repo.spawn_change_listener();

        backend.seed(TASKS, Record::new("s1", fields(json!({"title": "pushed"}))));
        backend.notify(ChangeNotification {
            collection: TASKS.into(),
            kind: ChangeKind::Added,
            record_id: Some("s1".into()),
        });

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), changes.recv())
            .await
            .expect("refresh in time")
            .expect("event");
        assert_eq!(event.collection, TASKS);
        assert!(repo.record(TASKS, "s1").is_some());
        handle.abort();
    }
}
