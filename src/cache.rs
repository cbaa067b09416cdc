//! Session caches with single-flight resolution.
//!
//! Lookups that hit a chain or canister are expensive and rate limited, so
//! the discovery engine and the remote-mint oracle memoize them for the
//! lifetime of a session. Two properties hold for every cache here:
//!
//! - **No implicit eviction.** Entries live until [`SingleFlightCache::invalidate`]
//!   or [`SingleFlightCache::clear`] is called. Negative results (e.g. "no mirror
//!   canister") are cached like positive ones.
//! - **Single flight per key.** Concurrent callers asking for the same key
//!   share one in-flight resolution; the resolver runs once. A failed
//!   resolution is not cached, so the next caller tries again.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

/// Hit/miss counters, exposed for logging and tests
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    resolutions: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of times a resolver actually ran
    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }
}

/// Memoizing map from `K` to `V` whose values are produced by async resolvers.
pub struct SingleFlightCache<K, V> {
    name: &'static str,
    cells: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
    stats: CacheStats,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cells: Mutex::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    fn cell(&self, key: &K) -> Arc<OnceCell<V>> {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Return the cached value for `key`, or run `resolve` to produce it.
    ///
    /// Callers racing on the same key wait for the first resolver instead of
    /// starting their own.
    pub async fn get_or_try_resolve<E, F, Fut>(&self, key: &K, resolve: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self.cell(key);
        if let Some(value) = cell.get() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value.clone());
        }

        let value = cell
            .get_or_try_init(|| async move {
                self.stats.resolutions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(cache = self.name, "Resolving cache entry");
                resolve().await
            })
            .await?;
        Ok(value.clone())
    }

    /// Cached value, without resolving
    pub fn peek(&self, key: &K) -> Option<V> {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Seed a value, e.g. from a previous session's known state
    pub fn insert(&self, key: K, value: V) {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells.insert(key, Arc::new(OnceCell::new_with(Some(value))));
    }

    /// Drop one entry so the next lookup resolves it again
    pub fn invalidate(&self, key: &K) -> bool {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells.remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(cache = self.name, entries = cells.len(), "Clearing cache");
        cells.clear();
    }

    /// Number of resolved entries
    pub fn len(&self) -> usize {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_resolves_once_and_hits_after() {
        let cache: SingleFlightCache<u32, String> = SingleFlightCache::new("test");
        let first: Result<String, ()> = cache.get_or_try_resolve(&1, || async { Ok("one".to_string()) }).await;
        assert_eq!(first.unwrap(), "one");

        let second = cache
            .get_or_try_resolve(&1, || async { Ok::<String, ()>("other".to_string()) })
            .await;
        assert_eq!(second.unwrap(), "one");
        assert_eq!(cache.stats().resolutions(), 1);
        assert_eq!(cache.stats().hits(), 1);
    }

    #[tokio::test]
    async fn test_negative_results_are_cached() {
        let cache: SingleFlightCache<&'static str, Option<String>> = SingleFlightCache::new("test");
        let none: Result<Option<String>, ()> = cache.get_or_try_resolve(&"k", || async { Ok(None) }).await;
        assert_eq!(none.unwrap(), None);
        assert_eq!(cache.peek(&"k"), Some(None));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache: SingleFlightCache<u8, u8> = SingleFlightCache::new("test");
        let err: Result<u8, &str> = cache.get_or_try_resolve(&1, || async { Err("rpc down") }).await;
        assert!(err.is_err());
        assert!(cache.is_empty());

        let ok: Result<u8, &str> = cache.get_or_try_resolve(&1, || async { Ok(9) }).await;
        assert_eq!(ok.unwrap(), 9);
        assert_eq!(cache.stats().resolutions(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_resolution() {
        let cache: Arc<SingleFlightCache<u8, u8>> = Arc::new(SingleFlightCache::new("test"));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_try_resolve(&7, || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<u8, ()>(42)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(cache.stats().resolutions(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_insert() {
        let cache: SingleFlightCache<u8, u8> = SingleFlightCache::new("test");
        cache.insert(1, 5);
        assert_eq!(cache.peek(&1), Some(5));
        assert!(cache.invalidate(&1));
        assert_eq!(cache.peek(&1), None);
        assert!(!cache.invalidate(&1));

        cache.insert(2, 6);
        cache.clear();
        assert!(cache.is_empty());
    }
}
