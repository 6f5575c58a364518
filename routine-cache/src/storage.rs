//! Generation-scoped response storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{CacheResult, CacheStorageError};
use crate::request::CacheResponse;

/// Named generations of cached responses, keyed by request URL.
///
/// The engine owns its storage exclusively.
#[async_trait]
pub trait CacheStorage: Send + Sync + 'static {
    /// Create `generation` if it does not exist yet.
    async fn open(&self, generation: &str) -> CacheResult<()>;

    /// Exact match lookup.
    async fn get(&self, generation: &str, key: &str) -> CacheResult<Option<CacheResponse>>;

    /// Store a response, replacing any previous entry.
    async fn put(&self, generation: &str, key: &str, response: CacheResponse) -> CacheResult<()>;

    /// Names of all generations.
    async fn generations(&self) -> CacheResult<Vec<String>>;

    /// Delete a generation. Returns false if it did not exist.
    async fn delete_generation(&self, generation: &str) -> CacheResult<bool>;

    /// Number of entries in a generation.
    async fn len(&self, generation: &str) -> CacheResult<usize>;
}

/// In-memory [`CacheStorage`] with read and write failure injection.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    generations: RwLock<HashMap<String, HashMap<String, CacheResponse>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryCacheStorage {
    /// Create empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, generation: &str) -> CacheResult<()> {
        self.generations
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(generation.to_string())
            .or_default();
        Ok(())
    }

    async fn get(&self, generation: &str, key: &str) -> CacheResult<Option<CacheResponse>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheStorageError::Unavailable("injected read failure".into()));
        }
        Ok(self
            .generations
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(generation)
            .and_then(|entries| entries.get(key).cloned()))
    }

    async fn put(&self, generation: &str, key: &str, response: CacheResponse) -> CacheResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheStorageError::QuotaExceeded);
        }
        self.generations
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_mut(generation)
            .ok_or_else(|| CacheStorageError::UnknownGeneration(generation.to_string()))?
            .insert(key.to_string(), response);
        Ok(())
    }

    async fn generations(&self) -> CacheResult<Vec<String>> {
        let mut names: Vec<String> = self
            .generations
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn delete_generation(&self, generation: &str) -> CacheResult<bool> {
        Ok(self
            .generations
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(generation)
            .is_some())
    }

    async fn len(&self, generation: &str) -> CacheResult<usize> {
        Ok(self
            .generations
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(generation)
            .map_or(0, HashMap::len))
    }
}
