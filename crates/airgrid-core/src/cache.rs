//! Fetch-through caching for provider responses.
//!
//! [`FetchThroughCache`] maps coordinates onto [`GeoBucketKey`] grid cells, so nearby
//! points share one entry and one provider call. Entries stay in the store past
//! their TTL: while younger than `stale_if_error_ttl` they are served when the
//! provider fails. Entries older than that are dropped by the cleanup pass that
//! runs on every write.
//!
//! Misses are single-flight per cell. Concurrent callers for the same cell wait on
//! that cell's lock and re-check the store before fetching, so one cell costs at
//! most one provider call at a time, while different cells fetch in parallel.
//!
//! [`SnapshotCache`] applies the same TTL and stale-if-error rules to a single
//! value for domains that are not point-indexed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::context::FetchContext;
use crate::error::{ConfigError, FetchError};
use crate::geo::{Coordinates, GeoBucketKey};
use crate::provider::{GlobalProvider, PointProvider};

/// Defines how a lookup interacts with the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Serve a fresh entry if present; otherwise fetch and store. (Default)
    #[default]
    Use,
    /// Always fetch and store, still falling back to a stale entry on failure.
    Refresh,
    /// Fetch without reading or writing the cache.
    Bypass,
}

/// Cached value with its freshness bounds. Replaced wholesale, never mutated.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    value: T,
    fetched_at: Instant,
    expires_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T, now: Instant, ttl: Duration) -> Self {
        Self {
            value,
            fetched_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    /// Whether the entry is younger than `window`.
    fn is_within(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.fetched_at) < window
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub fresh_entries: usize,
    pub provider: String,
}

struct CacheInner<T> {
    provider: Arc<dyn PointProvider<T>>,
    config: CacheConfig,
    store: tokio::sync::RwLock<HashMap<GeoBucketKey, CacheEntry<T>>>,
    key_locks: KeyLocks,
}

/// Geo-bucketed fetch-through cache for one provider.
pub struct FetchThroughCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for FetchThroughCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> FetchThroughCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        provider: Arc<dyn PointProvider<T>>,
        config: CacheConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                provider,
                config,
                store: tokio::sync::RwLock::new(HashMap::new()),
                key_locks: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn provider_name(&self) -> &str {
        self.inner.provider.name()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Cached value for the cell containing the coordinates, fetching on miss or expiry.
    pub async fn get(
        &self,
        context: &FetchContext,
        latitude: f64,
        longitude: f64,
    ) -> Result<T, FetchError> {
        self.get_with_mode(context, latitude, longitude, CacheMode::Use)
            .await
    }

    pub async fn get_with_mode(
        &self,
        context: &FetchContext,
        latitude: f64,
        longitude: f64,
        mode: CacheMode,
    ) -> Result<T, FetchError> {
        let coordinates = Coordinates::new(latitude, longitude)?;
        self.get_at(context, coordinates, mode).await
    }

    /// Same as [`get_with_mode`](Self::get_with_mode) for already validated coordinates.
    pub async fn get_at(
        &self,
        context: &FetchContext,
        coordinates: Coordinates,
        mode: CacheMode,
    ) -> Result<T, FetchError> {
        let provider = self.provider_name();

        if mode == CacheMode::Bypass {
            return self
                .inner
                .provider
                .fetch(context, coordinates)
                .await
                .map_err(|error| unavailable(provider, error));
        }

        let key = coordinates.bucket(self.inner.config.grid_size);
        if mode == CacheMode::Use {
            if let Some(value) = self.fresh_value(&key).await {
                debug!(provider, key = %key, "cache hit");
                return Ok(value);
            }
        }

        let key_lock = KeyLock::acquire(&self.inner.key_locks, key);
        self.fetch_locked(context, coordinates, key, mode, &key_lock)
            .await
    }

    pub async fn invalidate_all(&self) {
        self.inner.store.write().await.clear();
        debug!(provider = self.provider_name(), "cache invalidated");
    }

    pub async fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let store = self.inner.store.read().await;
        CacheStats {
            entries: store.len(),
            fresh_entries: store.values().filter(|entry| entry.is_fresh(now)).count(),
            provider: self.provider_name().to_owned(),
        }
    }

    /// Number of stored entries, fresh or stale.
    pub async fn len(&self) -> usize {
        self.inner.store.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.store.read().await.is_empty()
    }

    /// Drops entries older than the stale-if-error window. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let mut store = self.inner.store.write().await;
        self.cleanup_locked(&mut store, Instant::now())
    }

    async fn fetch_locked(
        &self,
        context: &FetchContext,
        coordinates: Coordinates,
        key: GeoBucketKey,
        mode: CacheMode,
        key_lock: &KeyLock<'_>,
    ) -> Result<T, FetchError> {
        let provider = self.provider_name();
        let _guard = context.run(key_lock.lock.lock()).await?;

        if mode == CacheMode::Use {
            if let Some(value) = self.fresh_value(&key).await {
                debug!(provider, key = %key, "cache filled by concurrent fetch");
                return Ok(value);
            }
        }

        debug!(provider, key = %key, "cache miss, fetching");
        match self.inner.provider.fetch(context, coordinates).await {
            Ok(value) => {
                self.store_value(key, value.clone()).await;
                Ok(value)
            }
            Err(error) => self.fallback(key, error).await,
        }
    }

    async fn fresh_value(&self, key: &GeoBucketKey) -> Option<T> {
        let now = Instant::now();
        let store = self.inner.store.read().await;
        store
            .get(key)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.value.clone())
    }

    async fn store_value(&self, key: GeoBucketKey, value: T) {
        let now = Instant::now();
        let mut store = self.inner.store.write().await;
        store.insert(key, CacheEntry::new(value, now, self.inner.config.ttl));
        self.cleanup_locked(&mut store, now);
    }

    async fn fallback(&self, key: GeoBucketKey, error: FetchError) -> Result<T, FetchError> {
        let provider = self.provider_name();
        if matches!(error, FetchError::FeatureDisabled { .. }) {
            return Err(error);
        }

        let now = Instant::now();
        let stale = {
            let store = self.inner.store.read().await;
            store
                .get(&key)
                .filter(|entry| entry.is_within(now, self.inner.config.stale_if_error_ttl))
                .map(|entry| {
                    let age = now.saturating_duration_since(entry.fetched_at);
                    (entry.value.clone(), age)
                })
        };

        match stale {
            Some((value, age)) => {
                warn!(
                    provider,
                    key = %key,
                    age_secs = age.as_secs(),
                    error = %error,
                    "provider failed, serving stale value"
                );
                Ok(value)
            }
            None => Err(unavailable(provider, error)),
        }
    }

    fn cleanup_locked(
        &self,
        store: &mut HashMap<GeoBucketKey, CacheEntry<T>>,
        now: Instant,
    ) -> usize {
        let before = store.len();
        let window = self.inner.config.stale_if_error_ttl;
        store.retain(|_, entry| entry.is_within(now, window));
        let removed = before - store.len();
        if removed > 0 {
            debug!(provider = self.provider_name(), removed, "evicted expired cache entries");
        }
        removed
    }
}

type KeyLocks = Mutex<HashMap<GeoBucketKey, Arc<tokio::sync::Mutex<()>>>>;

/// Handle on one cell's single-flight lock. Dropping it removes the map entry
/// once no other caller holds the lock, including when the caller's future is
/// dropped mid-fetch.
struct KeyLock<'a> {
    locks: &'a KeyLocks,
    key: GeoBucketKey,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> KeyLock<'a> {
    fn acquire(locks: &'a KeyLocks, key: GeoBucketKey) -> Self {
        let lock = {
            let mut map = locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(key).or_default())
        };
        Self { locks, key, lock }
    }
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(std::mem::take(&mut self.lock));
        // Only the map still references the lock: nobody else is waiting.
        if map
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.key);
        }
    }
}

/// Maps a provider failure with no stale fallback to the error surfaced to callers.
fn unavailable(provider: &str, error: FetchError) -> FetchError {
    match error {
        FetchError::FeatureDisabled { .. }
        | FetchError::Cancelled
        | FetchError::DeadlineExceeded
        | FetchError::ProviderUnavailable { .. } => error,
        other => FetchError::unavailable(provider, other.to_string()),
    }
}

/// Single-slot cache with the same TTL and stale-if-error rules as [`FetchThroughCache`].
pub struct SnapshotCache<T> {
    provider: Arc<dyn GlobalProvider<T>>,
    ttl: Duration,
    stale_if_error_ttl: Duration,
    slot: tokio::sync::Mutex<Option<CacheEntry<T>>>,
}

impl<T> SnapshotCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        provider: Arc<dyn GlobalProvider<T>>,
        ttl: Duration,
        stale_if_error_ttl: Duration,
    ) -> Result<Self, ConfigError> {
        if ttl.is_zero() {
            return Err(ConfigError::invalid("snapshot.ttl", "must be greater than zero"));
        }
        if stale_if_error_ttl < ttl {
            return Err(ConfigError::invalid(
                "snapshot.stale_if_error_ttl",
                "must not be shorter than snapshot.ttl",
            ));
        }

        Ok(Self {
            provider,
            ttl,
            stale_if_error_ttl,
            slot: tokio::sync::Mutex::new(None),
        })
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub async fn get(&self, context: &FetchContext) -> Result<T, FetchError> {
        self.get_with_mode(context, CacheMode::Use).await
    }

    /// The slot lock is held across the fetch, so concurrent callers share one provider call.
    pub async fn get_with_mode(
        &self,
        context: &FetchContext,
        mode: CacheMode,
    ) -> Result<T, FetchError> {
        let provider = self.provider_name();
        if mode == CacheMode::Bypass {
            return self
                .provider
                .fetch(context)
                .await
                .map_err(|error| unavailable(provider, error));
        }

        let mut slot = context.run(self.slot.lock()).await?;
        let now = Instant::now();
        if mode == CacheMode::Use {
            if let Some(entry) = slot.as_ref().filter(|entry| entry.is_fresh(now)) {
                debug!(provider, "snapshot hit");
                return Ok(entry.value.clone());
            }
        }

        match self.provider.fetch(context).await {
            Ok(value) => {
                *slot = Some(CacheEntry::new(value.clone(), Instant::now(), self.ttl));
                Ok(value)
            }
            Err(error @ FetchError::FeatureDisabled { .. }) => Err(error),
            Err(error) => {
                let now = Instant::now();
                match slot
                    .as_ref()
                    .filter(|entry| entry.is_within(now, self.stale_if_error_ttl))
                {
                    Some(entry) => {
                        warn!(provider, error = %error, "provider failed, serving stale snapshot");
                        Ok(entry.value.clone())
                    }
                    None => Err(unavailable(provider, error)),
                }
            }
        }
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }

    pub async fn is_fresh(&self) -> bool {
        let now = Instant::now();
        self.slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|entry| entry.is_fresh(now))
    }
}
