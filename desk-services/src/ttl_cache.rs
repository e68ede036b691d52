//! TTL cache
//!
//! In-memory cache with per-entry expiry. Reads treat expired entries as
//! absent; writes opportunistically drop whatever has already expired.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use desk_core::DeskResult;
use parking_lot::RwLock;

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// In-memory TTL cache keyed by string
pub struct TtlCache<T> {
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get a fresh value, or `None` when absent or expired
    pub fn get(&self, key: &str) -> Option<T> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|entry| entry.is_fresh())
            .map(|entry| entry.value.clone())
    }

    /// Store a value under its own TTL
    pub fn set(&self, key: impl Into<String>, value: T, ttl: Duration) {
        let mut entries = self.entries.write();
        entries.retain(|_, entry| entry.is_fresh());
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Return the cached value or compute, store, and return a fresh one
    ///
    /// Errors from `compute` are returned and never cached. No lock is held
    /// while computing, so concurrent misses may compute in parallel; the
    /// last writer wins.
    pub async fn get_or_set<F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> DeskResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DeskResult<T>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let value = compute().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }

    pub fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Number of fresh entries
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.is_fresh())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for TtlCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn get_returns_none_after_expiry() {
        let cache: TtlCache<u32> = TtlCache::new();
        cache.set("k", 1, Duration::from_millis(20));
        assert_eq!(cache.get("k"), Some(1));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn get_or_set_computes_only_on_miss() {
        let cache: TtlCache<u32> = TtlCache::new();
        let computes = AtomicU32::new(0);

        let first = cache
            .get_or_set("k", Duration::from_secs(60), || async {
                computes.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();
        let second = cache
            .get_or_set("k", Duration::from_secs(60), || async {
                computes.fetch_add(1, Ordering::SeqCst);
                Ok(8)
            })
            .await
            .unwrap();

        assert_eq!(first, 7);
        assert_eq!(second, 7);
        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_set_does_not_cache_errors() {
        let cache: TtlCache<u32> = TtlCache::new();

        let result = cache
            .get_or_set("k", Duration::from_secs(60), || async {
                Err(desk_core::DeskError::network("boom"))
            })
            .await;
        assert!(result.is_err());

        let value = cache
            .get_or_set("k", Duration::from_secs(60), || async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn set_purges_expired_entries() {
        let cache: TtlCache<u32> = TtlCache::new();
        cache.set("old", 1, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));

        cache.set("new", 2, Duration::from_secs(60));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("new"), Some(2));
    }
}
