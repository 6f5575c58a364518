//! # Cache Policy Engine
//!
//! Answers intercepted requests from the network, the current cache
//! generation, or a blend of both, depending on the request's [`Strategy`].
//!
//! ## Generations
//!
//! Responses live in a generation named `{cache_name}-v{version}`. A new
//! version installs into a fresh generation and waits while an older one is
//! still present; until it is activated, requests keep being answered from
//! and refreshed into the newest older generation. Activation deletes every
//! other generation. Entries have no TTL.
//!
//! ## Failure handling
//!
//! Cache write failures are logged and swallowed. Cache read failures count
//! as misses. A navigation that neither network nor cache can answer gets
//! the offline fallback page.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use http::header::HeaderName;
use http::HeaderValue;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use url::Url;

use crate::classify::{Classifier, Strategy};
use crate::error::{ClassificationError, FetchError};
use crate::fetch::Fetcher;
use crate::policy::CachePolicy;
use crate::request::{cache_key, CacheRequest, CacheResponse, STRATEGY_HEADER};
use crate::storage::CacheStorage;

/// Lifecycle phase of the current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Created, not installed yet.
    Idle,
    /// Precaching into the new generation.
    Installing,
    /// Installed while an older generation still serves.
    Waiting,
    /// Serving requests; older generations purged.
    Active,
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// Fresh from the network.
    Network,
    /// Exact match in the current generation.
    Cache,
    /// The offline fallback page.
    Fallback,
    /// Synthesized by the engine.
    Synthesized,
}

impl ResponseSource {
    /// Label used in metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Cache => "cache",
            Self::Fallback => "fallback",
            Self::Synthesized => "synthesized",
        }
    }
}

/// Response together with how it was produced.
#[derive(Debug, Clone)]
pub struct Handled {
    /// The response to return.
    pub response: CacheResponse,
    /// Strategy used.
    pub strategy: Strategy,
    /// Origin of the response.
    pub source: ResponseSource,
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Requests answered from the cache.
    pub hits: u64,
    /// Cache lookups that found nothing (including read failures).
    pub misses: u64,
    /// Network responses written to the cache.
    pub network_fills: u64,
    /// Offline fallback pages served.
    pub fallbacks: u64,
    /// Synthesized timeout responses.
    pub timeouts: u64,
    /// Background refreshes started.
    pub background_refreshes: u64,
    /// Cache writes that failed and were swallowed.
    pub write_errors: u64,
    /// Cache reads that failed and counted as misses.
    pub read_errors: u64,
}

impl CacheStats {
    /// Hit rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    network_fills: AtomicU64,
    fallbacks: AtomicU64,
    timeouts: AtomicU64,
    background_refreshes: AtomicU64,
    write_errors: AtomicU64,
    read_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            network_fills: self.network_fills.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            background_refreshes: self.background_refreshes.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of a precache run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecacheReport {
    /// URLs stored.
    pub cached: Vec<String>,
    /// URLs that could not be fetched or stored.
    pub failed: Vec<String>,
}

/// The cache policy engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    policy: CachePolicy,
    generation: String,
    origin: Url,
    classifier: Classifier,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    phase: RwLock<Phase>,
    /// Generation still serving while this one waits.
    previous: RwLock<Option<String>>,
    /// Keys with a debounced refresh scheduled.
    refreshing: Mutex<HashSet<String>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("generation", &self.inner.generation)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl CacheEngine {
    /// Create an engine for `policy`, resolving relative paths against `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`ClassificationError::InvalidPattern`] for a bad asset regex.
    pub fn new(
        policy: CachePolicy,
        origin: Url,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ClassificationError> {
        let classifier = Classifier::new(&policy)?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                generation: policy.generation_name(),
                policy,
                origin,
                classifier,
                storage,
                fetcher,
                phase: RwLock::new(Phase::Idle),
                previous: RwLock::new(None),
                refreshing: Mutex::new(HashSet::new()),
                background: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        })
    }

    /// Active policy.
    #[must_use]
    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    /// Origin that relative paths resolve against.
    #[must_use]
    pub fn origin(&self) -> &Url {
        &self.inner.origin
    }

    /// Name of the current generation.
    #[must_use]
    pub fn generation(&self) -> &str {
        &self.inner.generation
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        *self
            .inner
            .phase
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot()
    }

    /// Strategy the engine would use for `request`.
    #[must_use]
    pub fn classify(&self, request: &CacheRequest) -> Strategy {
        self.inner.classifier.classify(request)
    }

    /// Install the current generation: open it and precache the configured
    /// assets plus the offline fallback.
    ///
    /// Activates immediately when no older generation exists, otherwise
    /// waits for [`CacheEngine::skip_waiting`].
    #[tracing::instrument(skip(self), fields(generation = %self.inner.generation))]
    pub async fn install(&self) -> PrecacheReport {
        self.set_phase(Phase::Installing);
        if let Err(e) = self.inner.storage.open(&self.inner.generation).await {
            tracing::warn!(error = %e, "Could not open cache generation");
        }

        let mut assets = self.inner.policy.precache.clone();
        if !assets.contains(&self.inner.policy.offline_fallback) {
            assets.push(self.inner.policy.offline_fallback.clone());
        }
        let report = self.precache(&assets).await;

        let policy = &self.inner.policy;
        let older = match self.inner.storage.generations().await {
            Ok(names) => names
                .into_iter()
                .filter(|n| n != &self.inner.generation)
                .filter_map(|n| policy.generation_version(&n).map(|v| (v, n)))
                .max_by_key(|(v, _)| *v)
                .map(|(_, n)| n),
            Err(e) => {
                tracing::warn!(error = %e, "Could not list cache generations");
                None
            }
        };
        if let Some(older) = older {
            tracing::info!(cached = report.cached.len(), serving = %older, "Installed; waiting for activation");
            *self
                .inner
                .previous
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(older);
            self.set_phase(Phase::Waiting);
        } else {
            self.activate().await;
        }
        report
    }

    /// Activate a waiting generation. No-op in other phases.
    pub async fn skip_waiting(&self) -> Vec<String> {
        if self.phase() == Phase::Waiting {
            self.activate().await
        } else {
            Vec::new()
        }
    }

    /// Make the current generation active and delete every other one.
    ///
    /// Returns the deleted generation names.
    pub async fn activate(&self) -> Vec<String> {
        self.set_phase(Phase::Active);
        *self
            .inner
            .previous
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        let deleted = self.clear_old_caches().await;
        tracing::info!(generation = %self.inner.generation, purged = ?deleted, "Cache generation active");
        deleted
    }

    /// Delete every generation except the current one.
    pub async fn clear_old_caches(&self) -> Vec<String> {
        let names = match self.inner.storage.generations().await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list cache generations");
                return Vec::new();
            }
        };
        let mut deleted = Vec::new();
        for name in names.into_iter().filter(|n| n != &self.inner.generation) {
            match self.inner.storage.delete_generation(&name).await {
                Ok(true) => deleted.push(name),
                Ok(false) => {}
                Err(e) => tracing::warn!(generation = %name, error = %e, "Could not delete cache generation"),
            }
        }
        deleted
    }

    /// Fetch `assets` (absolute URLs or paths on the origin) into the
    /// current generation.
    pub async fn precache(&self, assets: &[String]) -> PrecacheReport {
        let mut report = PrecacheReport::default();
        if let Err(e) = self.inner.storage.open(&self.inner.generation).await {
            tracing::warn!(error = %e, "Could not open cache generation");
        }
        for asset in assets {
            let Some(url) = self.resolve(asset) else {
                report.failed.push(asset.clone());
                continue;
            };
            let request = match CacheRequest::get(url.as_str()) {
                Ok(request) => request,
                Err(_) => {
                    report.failed.push(asset.clone());
                    continue;
                }
            };
            match self.inner.fetcher.fetch(&request).await {
                Ok(response) if response.is_cacheable() => {
                    if self.store_in(&self.inner.generation, &request.cache_key(), response).await {
                        report.cached.push(request.cache_key());
                    } else {
                        report.failed.push(asset.clone());
                    }
                }
                Ok(response) => {
                    tracing::debug!(%url, status = %response.status, "Not precaching non-OK response");
                    report.failed.push(asset.clone());
                }
                Err(e) => {
                    tracing::debug!(%url, error = %e, "Precache fetch failed");
                    report.failed.push(asset.clone());
                }
            }
        }
        report
    }

    /// Answer an intercepted request.
    #[tracing::instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn handle(&self, request: CacheRequest) -> Result<Handled, FetchError> {
        let strategy = self.classify(&request);
        tracing::debug!(%strategy, "Classified");
        let (response, source) = match strategy {
            Strategy::PassThrough => (self.inner.fetcher.fetch(&request).await?, ResponseSource::Network),
            Strategy::NetworkFirst => self.network_first(&request).await,
            Strategy::CacheFirst => self.cache_first(&request, true).await,
            Strategy::StaleWhileRevalidate => self.cache_first(&request, false).await,
            Strategy::NetworkWithTimeout => self.network_with_timeout(&request).await,
        };
        Ok(Handled {
            response: tag(response, strategy),
            strategy,
            source,
        })
    }

    /// Wait for every background refresh started so far.
    pub async fn flush_background(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .background
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background refresh task failed");
            }
        }
    }

    async fn network_first(&self, request: &CacheRequest) -> (CacheResponse, ResponseSource) {
        match self.inner.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_cacheable() {
                    self.store(&request.cache_key(), response.clone()).await;
                }
                (response, ResponseSource::Network)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Navigation network failed; trying cache");
                if let Some(cached) = self.lookup(&request.cache_key()).await {
                    return (cached, ResponseSource::Cache);
                }
                Counters::bump(&self.inner.counters.fallbacks);
                (self.offline_fallback().await, ResponseSource::Fallback)
            }
        }
    }

    /// Serve from cache when possible and refresh behind the response.
    ///
    /// With `debounce`, the refresh waits out the debounce window first.
    async fn cache_first(&self, request: &CacheRequest, debounce: bool) -> (CacheResponse, ResponseSource) {
        let key = request.cache_key();
        if let Some(cached) = self.lookup(&key).await {
            self.spawn_refresh(request.clone(), debounce);
            return (cached, ResponseSource::Cache);
        }
        match self.inner.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_cacheable() {
                    self.store(&key, response.clone()).await;
                }
                (response, ResponseSource::Network)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Asset unavailable from network and cache");
                Counters::bump(&self.inner.counters.timeouts);
                (CacheResponse::request_timeout(), ResponseSource::Synthesized)
            }
        }
    }

    async fn network_with_timeout(&self, request: &CacheRequest) -> (CacheResponse, ResponseSource) {
        let window = self.inner.policy.network_timeout();
        let outcome = match tokio::time::timeout(window, self.inner.fetcher.fetch(request)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(window)),
        };
        match outcome {
            Ok(response) => {
                if response.is_cacheable() {
                    self.store(&request.cache_key(), response.clone()).await;
                }
                (response, ResponseSource::Network)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Network unavailable; trying cache");
                if let Some(cached) = self.lookup(&request.cache_key()).await {
                    return (cached, ResponseSource::Cache);
                }
                Counters::bump(&self.inner.counters.timeouts);
                (CacheResponse::request_timeout(), ResponseSource::Synthesized)
            }
        }
    }

    /// Refresh `request` in the background.
    ///
    /// With `debounce`, the fetch starts after the debounce window and
    /// further hits on the same key coalesce into the scheduled refresh.
    fn spawn_refresh(&self, request: CacheRequest, debounce: bool) {
        let key = request.cache_key();
        let delay = if debounce {
            let mut refreshing = self
                .inner
                .refreshing
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !refreshing.insert(key.clone()) {
                tracing::trace!(%key, "Refresh already scheduled");
                return;
            }
            self.inner.policy.refresh_debounce()
        } else {
            Duration::ZERO
        };

        Counters::bump(&self.inner.counters.background_refreshes);
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = engine.inner.fetcher.fetch(&request).await;
            if debounce {
                engine
                    .inner
                    .refreshing
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&key);
            }
            match outcome {
                Ok(response) if response.is_cacheable() => {
                    engine.store(&key, response).await;
                }
                Ok(response) => {
                    tracing::debug!(%key, status = %response.status, "Refresh returned non-OK; keeping cached copy");
                }
                Err(e) => tracing::debug!(%key, error = %e, "Background refresh failed"),
            }
        });

        let mut background = self
            .inner
            .background
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    /// Generation answering requests: the previous one while waiting.
    fn serving_generation(&self) -> String {
        if self.phase() == Phase::Waiting {
            if let Some(previous) = self
                .inner
                .previous
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
            {
                return previous;
            }
        }
        self.inner.generation.clone()
    }

    /// Cache read; failures are misses.
    async fn lookup(&self, key: &str) -> Option<CacheResponse> {
        match self.inner.storage.get(&self.serving_generation(), key).await {
            Ok(Some(response)) => {
                Counters::bump(&self.inner.counters.hits);
                Some(response)
            }
            Ok(None) => {
                Counters::bump(&self.inner.counters.misses);
                None
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "Cache read failed; treating as miss");
                Counters::bump(&self.inner.counters.read_errors);
                Counters::bump(&self.inner.counters.misses);
                None
            }
        }
    }

    /// Write into the serving generation.
    async fn store(&self, key: &str, response: CacheResponse) -> bool {
        self.store_in(&self.serving_generation(), key, response).await
    }

    /// Cache write; failures are logged and swallowed. Returns true on success.
    async fn store_in(&self, generation: &str, key: &str, response: CacheResponse) -> bool {
        let written = match self.inner.storage.open(generation).await {
            Ok(()) => self.inner.storage.put(generation, key, response).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {
                Counters::bump(&self.inner.counters.network_fills);
                true
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "Cache write failed");
                Counters::bump(&self.inner.counters.write_errors);
                false
            }
        }
    }

    async fn offline_fallback(&self) -> CacheResponse {
        if let Some(url) = self.resolve(&self.inner.policy.offline_fallback) {
            let key = cache_key(&url);
            let serving = self.serving_generation();
            for generation in [serving.as_str(), self.inner.generation.as_str()] {
                if let Ok(Some(page)) = self.inner.storage.get(generation, &key).await {
                    return page.with_header(HeaderName::from_static(crate::request::OFFLINE_HEADER), "1");
                }
            }
        }
        CacheResponse::builtin_offline_page()
    }

    fn resolve(&self, asset: &str) -> Option<Url> {
        Url::parse(asset).or_else(|_| self.inner.origin.join(asset)).ok()
    }

    fn set_phase(&self, phase: Phase) {
        *self
            .inner
            .phase
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = phase;
    }
}

fn tag(mut response: CacheResponse, strategy: Strategy) -> CacheResponse {
    if strategy != Strategy::PassThrough {
        response
            .headers
            .insert(HeaderName::from_static(STRATEGY_HEADER), HeaderValue::from_static(strategy.as_str()));
    }
    response
}
