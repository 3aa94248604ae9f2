use super::backend::{CacheBackend, CacheLookup};
use super::keys::KeySpace;
use super::lock::{LockGuard, StampedeLock};
use crate::database::{BatchFetcher, BatchSource};
use crate::error::{ForumError, ForumResult};
use crate::observability::ForumMetrics;
use crate::types::Entity;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Values the cache-aside store can hold
pub trait Cacheable: Entity + Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Entity + Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Origin side of a cache-aside store
#[async_trait]
pub trait EntityLoader<T>: Send + Sync {
    async fn load_one(&self, id: i64) -> ForumResult<Option<T>>;

    /// Rows for the ids that exist; absent ids are simply left out
    async fn load_many(&self, ids: &[i64]) -> ForumResult<HashMap<i64, T>>;
}

/// Loads rows through a [`BatchFetcher`]
pub struct BatchLoader<S: ?Sized> {
    source: Arc<S>,
    fetcher: BatchFetcher,
}

impl<S: ?Sized> BatchLoader<S> {
    pub fn new(source: Arc<S>, fetcher: BatchFetcher) -> Self {
        Self { source, fetcher }
    }
}

#[async_trait]
impl<T, S> EntityLoader<T> for BatchLoader<S>
where
    T: Cacheable,
    S: BatchSource<T> + ?Sized + 'static,
{
    async fn load_one(&self, id: i64) -> ForumResult<Option<T>> {
        let mut result = self.fetcher.fetch(&*self.source, &[id]).await?;
        Ok(result.rows.remove(&id))
    }

    async fn load_many(&self, ids: &[i64]) -> ForumResult<HashMap<i64, T>> {
        Ok(self.fetcher.fetch(&*self.source, ids).await?.rows)
    }
}

/// Hit/miss/error counters of one store
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses + self.errors;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

/// Tuning shared by every store instance
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub ttl: Duration,
    pub lock_ttl: Duration,
    pub lock_retry: Duration,
}

/// Leader outcome as seen by in-process followers
type Shared<T> = Result<Option<T>, Arc<ForumError>>;

type Inflight<T> = Mutex<HashMap<i64, broadcast::Sender<Shared<T>>>>;

/// Removes the in-flight entry even when the leading fetch is cancelled
struct InflightSlot<'a, T> {
    inflight: &'a Inflight<T>,
    id: i64,
}

impl<T> Drop for InflightSlot<'_, T> {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.id);
    }
}

enum Role<T> {
    Leader(broadcast::Sender<Shared<T>>),
    Follower(broadcast::Receiver<Shared<T>>),
}

/// Read-through cache for one entity type.
///
/// Concurrent misses for the same id in this process share one fetch. Across
/// processes a [`StampedeLock`] elects a single fetcher; callers that lose
/// the lock wait once and then read the origin directly. Cache failures
/// never fail a read.
pub struct CacheAsideStore<T: Cacheable> {
    backend: Arc<dyn CacheBackend>,
    loader: Arc<dyn EntityLoader<T>>,
    keys: KeySpace,
    lock: StampedeLock,
    settings: StoreSettings,
    inflight: Inflight<T>,
    counters: CacheCounters,
    metrics: Option<ForumMetrics>,
}

impl<T: Cacheable> CacheAsideStore<T> {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        loader: Arc<dyn EntityLoader<T>>,
        keys: KeySpace,
        settings: StoreSettings,
        metrics: Option<ForumMetrics>,
    ) -> Self {
        let lock = StampedeLock::new(Arc::clone(&backend), settings.lock_ttl);
        Self {
            backend,
            loader,
            keys,
            lock,
            settings,
            inflight: Mutex::new(HashMap::new()),
            counters: CacheCounters::default(),
            metrics,
        }
    }

    pub fn cache_key(&self, id: i64) -> String {
        self.keys.entity(T::KIND, id)
    }

    /// Cached value, or the origin row fetched at most once per key
    pub async fn get(&self, id: i64) -> ForumResult<Option<T>> {
        let key = self.cache_key(id);

        let lookup = self.lookup(&key).await;
        self.record_lookup(&lookup, &key);
        if let CacheLookup::Hit(value) = lookup {
            return Ok(Some(value));
        }

        let role = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&id) {
                Some(sender) => Role::Follower(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    inflight.insert(id, sender.clone());
                    Role::Leader(sender)
                }
            }
        };

        match role {
            Role::Follower(mut receiver) => match receiver.recv().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e.shared_copy()),
                Err(_) => {
                    debug!(key = %key, "Leading fetch was cancelled, fetching independently");
                    self.fetch_guarded(id, &key).await
                }
            },
            Role::Leader(sender) => {
                let slot = InflightSlot {
                    inflight: &self.inflight,
                    id,
                };
                let result = self.fetch_guarded(id, &key).await;
                // unregister before publishing so no follower subscribes too late
                drop(slot);
                let shared = match &result {
                    Ok(value) => Ok(value.clone()),
                    Err(e) => Err(Arc::new(e.shared_copy())),
                };
                let _ = sender.send(shared);
                result
            }
        }
    }

    async fn fetch_guarded(&self, id: i64, key: &str) -> ForumResult<Option<T>> {
        match self.lock.try_acquire(self.keys.lock(T::KIND, id)).await {
            Ok(Some(guard)) => {
                // another process may have filled it meanwhile
                if let CacheLookup::Hit(value) = self.lookup(key).await {
                    self.release(guard).await;
                    return Ok(Some(value));
                }

                let result = self.load_one(id).await;
                self.release(guard).await;

                if let Ok(Some(value)) = &result {
                    self.spawn_writeback(vec![(key.to_string(), value.clone())]);
                }
                result
            }
            Ok(None) => {
                debug!(key = %key, "Stampede lock busy, retrying cache");
                if let Some(metrics) = &self.metrics {
                    metrics.lock_contention_total.with_label_values(&[T::KIND]).inc();
                }

                tokio::time::sleep(self.settings.lock_retry).await;
                if let CacheLookup::Hit(value) = self.lookup(key).await {
                    return Ok(Some(value));
                }

                warn!(key = %key, "Cache still empty after lock retry, reading origin directly");
                self.load_one(id).await
            }
            Err(e) => {
                warn!(key = %key, "Stampede lock unavailable, reading origin directly: {}", e);
                self.load_one(id).await
            }
        }
    }

    /// Cached values for `ids` with misses resolved in one origin batch.
    ///
    /// Ids with no origin row are absent from the map.
    pub async fn batch_get(&self, ids: &[i64]) -> ForumResult<HashMap<i64, T>> {
        let unique = BatchFetcher::dedup(ids);
        if unique.is_empty() {
            return Ok(HashMap::new());
        }

        let keys: Vec<String> = unique.iter().map(|id| self.cache_key(*id)).collect();
        let lookup = self.backend.mget(&keys).await.and_then(|values| {
            if values.len() == keys.len() {
                Ok(values)
            } else {
                Err(ForumError::CacheError(format!(
                    "multi-get returned {} values for {} keys",
                    values.len(),
                    keys.len()
                )))
            }
        });
        let cached = match lookup {
            Ok(values) => values,
            Err(e) => {
                warn!(entity = T::KIND, error_type = e.error_type(), "Cache multi-get failed, reading origin: {}", e);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics
                        .cache_lookups_total
                        .with_label_values(&[T::KIND, "error"])
                        .inc();
                }
                vec![None; keys.len()]
            }
        };

        let mut found = HashMap::with_capacity(unique.len());
        let mut misses = Vec::new();
        for (id, raw) in unique.iter().copied().zip(cached) {
            match raw.map(|raw| serde_json::from_str::<T>(&raw)) {
                Some(Ok(value)) => {
                    found.insert(id, value);
                }
                Some(Err(e)) => {
                    warn!(entity = T::KIND, id, "Discarding undecodable cache entry: {}", e);
                    misses.push(id);
                }
                None => misses.push(id),
            }
        }

        self.counters.hits.fetch_add(found.len() as u64, Ordering::Relaxed);
        self.counters.misses.fetch_add(misses.len() as u64, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics
                .cache_lookups_total
                .with_label_values(&[T::KIND, "hit"])
                .inc_by(found.len() as u64);
            metrics
                .cache_lookups_total
                .with_label_values(&[T::KIND, "miss"])
                .inc_by(misses.len() as u64);
        }
        debug!(entity = T::KIND, hits = found.len(), misses = misses.len(), "Batch cache lookup");

        if !misses.is_empty() {
            if let Some(metrics) = &self.metrics {
                metrics.origin_fetches_total.with_label_values(&[T::KIND]).inc();
            }
            let fetched = self.loader.load_many(&misses).await?;

            let entries = fetched
                .iter()
                .map(|(id, value)| (self.cache_key(*id), value.clone()))
                .collect();
            self.spawn_writeback(entries);

            found.extend(fetched);
        }

        Ok(found)
    }

    /// Drop the cached copy after the origin row changed
    pub async fn invalidate(&self, id: i64) -> ForumResult<()> {
        let key = self.cache_key(id);
        self.backend.del(&key).await?;
        debug!(key = %key, "Cache entry invalidated");
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    async fn lookup(&self, key: &str) -> CacheLookup<T> {
        match self.backend.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => CacheLookup::Hit(value),
                Err(e) => CacheLookup::Error(ForumError::from(e)),
            },
            Ok(None) => CacheLookup::Miss,
            Err(e) => CacheLookup::Error(e),
        }
    }

    fn record_lookup(&self, lookup: &CacheLookup<T>, key: &str) {
        match lookup {
            CacheLookup::Hit(_) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cache hit");
            }
            CacheLookup::Miss => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cache miss");
            }
            CacheLookup::Error(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error_type = e.error_type(), "Cache read failed, treating as miss: {}", e);
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .cache_lookups_total
                .with_label_values(&[T::KIND, lookup.outcome_label()])
                .inc();
        }
    }

    async fn load_one(&self, id: i64) -> ForumResult<Option<T>> {
        if let Some(metrics) = &self.metrics {
            metrics.origin_fetches_total.with_label_values(&[T::KIND]).inc();
        }
        self.loader.load_one(id).await.map_err(|e| {
            error!(entity = T::KIND, id, "Origin fetch failed: {}", e);
            e
        })
    }

    async fn release(&self, guard: LockGuard) {
        let key = guard.key().to_string();
        if let Err(e) = guard.release().await {
            warn!(key = %key, "Failed to release stampede lock: {}", e);
        }
    }

    /// Populate the cache in the background; failures are only logged
    fn spawn_writeback(&self, values: Vec<(String, T)>) {
        if values.is_empty() {
            return;
        }

        let mut entries = Vec::with_capacity(values.len());
        for (key, value) in values {
            match serde_json::to_string(&value) {
                Ok(payload) => entries.push((key, payload)),
                Err(e) => warn!(key = %key, "Failed to serialize cache entry: {}", e),
            }
        }

        let backend = Arc::clone(&self.backend);
        let ttl = self.settings.ttl;
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let count = entries.len();
            let result = if count == 1 {
                let (key, payload) = entries.remove(0);
                backend.set_ex(&key, payload, ttl).await
            } else {
                backend.set_many(entries, ttl).await
            };

            let outcome = match result {
                Ok(()) => "ok",
                Err(e) => {
                    error!(entity = T::KIND, count, "Failed to populate cache: {}", e);
                    "error"
                }
            };
            if let Some(metrics) = metrics {
                metrics
                    .cache_writebacks_total
                    .with_label_values(&[T::KIND, outcome])
                    .inc();
            }
        });
    }
}
