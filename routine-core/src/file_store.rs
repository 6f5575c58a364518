//! File-backed [`LocalStore`].
//!
//! All collections live in one JSON snapshot (`store.json`) under the data
//! directory. The snapshot is opened lazily on first use and upgraded when
//! the declared schema is newer. Each write transaction lands in a temp file
//! first and is renamed over the snapshot, so a crash mid-write leaves the
//! previous state intact.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};

use crate::error::{StorageError, StorageResult};
use crate::record::Record;
use crate::schema::Schema;
use crate::store::{Collections, LocalStore, WriteBatch};

const SNAPSHOT_FILE: &str = "store.json";

/// [`LocalStore`] persisted as a JSON snapshot on disk.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    schema: Schema,
    image: OnceCell<RwLock<Collections>>,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a store rooted at `dir`. Nothing touches the disk until the
    /// first operation.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, schema: Schema) -> Self {
        Self {
            dir: dir.into(),
            schema,
            image: OnceCell::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Data directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    async fn opened(&self) -> StorageResult<&RwLock<Collections>> {
        self.image
            .get_or_try_init(|| async { self.open().await.map(RwLock::new) })
            .await
    }

    #[tracing::instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn open(&self) -> StorageResult<Collections> {
        let path = self.snapshot_path();
        let existing = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(serde_json::from_slice::<Collections>(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(StorageError::Unavailable(e.to_string())),
        };

        match existing {
            Some(image) if image.version > self.schema.version => {
                Err(StorageError::VersionDowngrade {
                    persisted: image.version,
                    declared: self.schema.version,
                })
            }
            Some(mut image) => {
                let from = image.version;
                let added = image.upgrade(&self.schema);
                if from < self.schema.version || !added.is_empty() {
                    tracing::info!(
                        from,
                        to = self.schema.version,
                        added = ?added,
                        "Upgraded local store schema"
                    );
                    self.persist(&image).await?;
                }
                Ok(image)
            }
            None => {
                tokio::fs::create_dir_all(&self.dir)
                    .await
                    .map_err(|e| StorageError::Unavailable(e.to_string()))?;
                let image = Collections::for_schema(&self.schema);
                self.persist(&image).await?;
                tracing::info!(version = self.schema.version, "Created local store");
                Ok(image)
            }
        }
    }

    async fn persist(&self, image: &Collections) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(image)?;
        let tmp = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StorageError::Aborted(e.to_string()))?;
        tokio::fs::rename(&tmp, self.snapshot_path())
            .await
            .map_err(|e| StorageError::Aborted(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl LocalStore for FileStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn get_all(&self, collection: &str) -> StorageResult<Vec<Record>> {
        self.opened()
            .await?
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_all(collection)
    }

    async fn get(&self, collection: &str, id: &str) -> StorageResult<Option<Record>> {
        self.opened()
            .await?
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(collection, id)
    }

    async fn write(&self, batch: WriteBatch) -> StorageResult<()> {
        let image = self.opened().await?;
        let _guard = self.write_lock.lock().await;

        let mut next = image
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        next.apply(&batch)?;
        self.persist(&next).await?;

        *image
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = next;
        Ok(())
    }

    async fn destroy(&self) -> StorageResult<()> {
        let image = self.opened().await?;
        let _guard = self.write_lock.lock().await;

        let fresh = Collections::for_schema(&self.schema);
        self.persist(&fresh).await?;
        *image
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = fresh;
        tracing::info!(dir = %self.dir.display(), "Destroyed local store contents");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Fields;
    use crate::schema::{CollectionSpec, ROUTINES, TASKS};
    use serde_json::json;
    use tempfile::TempDir;

    fn record(id: &str) -> Record {
        let mut fields = Fields::new();
        fields.insert("title".into(), json!(id));
        Record::new(id, fields)
    }

    #[tokio::test]
    async fn test_lazy_open_creates_snapshot() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileStore::new(dir.path().join("data"), Schema::routine_manager());
        assert!(!store.snapshot_path().exists());

        assert!(store.get_all(TASKS).await.expect("get_all").is_empty());
        assert!(store.snapshot_path().exists());
    }

    #[tokio::test]
    async fn test_writes_survive_reopen() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = FileStore::new(dir.path(), Schema::routine_manager());
            store.upsert(TASKS, record("t1")).await.expect("upsert");
            store.upsert(TASKS, record("t2")).await.expect("upsert");
            store.delete(TASKS, "t1").await.expect("delete");
        }

        let reopened = FileStore::new(dir.path(), Schema::routine_manager());
        let ids: Vec<_> = reopened
            .get_all(TASKS)
            .await
            .expect("get_all")
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["t2"]);
    }

    #[tokio::test]
    async fn test_upgrade_keeps_existing_collections() {
        let dir = TempDir::new().expect("tempdir");
        {
            let v1 = Schema::new(1, vec![CollectionSpec::new(TASKS, true)]);
            let store = FileStore::new(dir.path(), v1);
            store.upsert(TASKS, record("t1")).await.expect("upsert");
            assert!(store.get_all(ROUTINES).await.is_err());
        }

        let store = FileStore::new(dir.path(), Schema::routine_manager());
        assert_eq!(store.get_all(TASKS).await.expect("tasks").len(), 1);
        assert!(store.get_all(ROUTINES).await.expect("routines").is_empty());
    }

    #[tokio::test]
    async fn test_newer_persisted_version_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = FileStore::new(dir.path(), Schema::routine_manager());
            store.get_all(TASKS).await.expect("open");
        }

        let old = Schema::new(1, vec![CollectionSpec::new(TASKS, true)]);
        let store = FileStore::new(dir.path(), old);
        let err = store.get_all(TASKS).await.expect_err("downgrade");
        assert!(matches!(
            err,
            StorageError::VersionDowngrade {
                persisted: 3,
                declared: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_persist() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileStore::new(dir.path(), Schema::routine_manager());
        let mut batch = WriteBatch::new();
        batch.put(TASKS, record("t1"));
        batch.put("ghost", record("g1"));
        assert!(store.write(batch).await.is_err());

        let reopened = FileStore::new(dir.path(), Schema::routine_manager());
        assert!(reopened.get_all(TASKS).await.expect("tasks").is_empty());
    }

    #[tokio::test]
    async fn test_destroy_clears_disk() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileStore::new(dir.path(), Schema::routine_manager());
        store.upsert(TASKS, record("t1")).await.expect("upsert");
        store.destroy().await.expect("destroy");
        assert!(store.get_all(TASKS).await.expect("tasks").is_empty());

        let reopened = FileStore::new(dir.path(), Schema::routine_manager());
        assert!(reopened.get_all(TASKS).await.expect("tasks").is_empty());
    }
}
