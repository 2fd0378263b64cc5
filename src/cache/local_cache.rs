use crate::idempotency::record::IdempotencyRecord;
use crate::observability::get_metrics;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Cache statistics for monitoring.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn get_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn get_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn get_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// Bounded in-process cache of idempotency records, least recently used
/// entries evicted first.
///
/// Entries are snapshots. Callers re-check expiry and status before trusting
/// one and never use the cache to settle a conflict.
pub struct LocalCache {
    entries: Mutex<LruCache<String, IdempotencyRecord>>,
    stats: Arc<CacheStats>,
}

impl LocalCache {
    pub fn new(max_items: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(max_items)),
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<String, IdempotencyRecord>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, idempotency_key: &str) -> Option<IdempotencyRecord> {
        let found = self.entries().get(idempotency_key).cloned();

        match found {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        get_metrics().record_local_cache_lookup(found.is_some());

        found
    }

    pub fn set(&self, record: IdempotencyRecord) {
        let mut entries = self.entries();
        // push also hands back the old value when the key was already cached
        let evicted = entries
            .push(record.idempotency_key.clone(), record)
            .map(|(key, _)| key)
            .filter(|key| !entries.contains(key));
        drop(entries);

        if let Some(evicted_key) = evicted {
            self.stats.record_eviction();
            tracing::debug!(key = %evicted_key, "Evicted idempotency record from local cache");
        }
    }

    pub fn remove(&self, idempotency_key: &str) {
        self.entries().pop(idempotency_key);
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(key: &str) -> IdempotencyRecord {
        IdempotencyRecord::completed(key, None, json!({"key": key}), i64::MAX)
    }

    fn cache(max_items: usize) -> LocalCache {
        LocalCache::new(NonZeroUsize::new(max_items).unwrap())
    }

    #[test]
    fn test_cache_stats() {
        let stats = CacheStats::new();

        assert_eq!(stats.get_hits(), 0);
        assert_eq!(stats.get_misses(), 0);
        assert_eq!(stats.hit_rate(), 0.0);

        stats.record_hit();
        stats.record_hit();
        stats.record_miss();

        assert_eq!(stats.get_hits(), 2);
        assert_eq!(stats.get_misses(), 1);
        assert!((stats.hit_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_get_and_set() {
        let cache = cache(4);
        assert!(cache.get("fn#a").is_none());

        cache.set(record("fn#a"));

        assert_eq!(cache.get("fn#a"), Some(record("fn#a")));
        assert_eq!(cache.stats().get_hits(), 1);
        assert_eq!(cache.stats().get_misses(), 1);
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let cache = cache(2);
        cache.set(record("fn#a"));
        cache.set(record("fn#b"));

        // touch a so b becomes the eviction candidate
        cache.get("fn#a");
        cache.set(record("fn#c"));

        assert!(cache.get("fn#a").is_some());
        assert!(cache.get("fn#b").is_none());
        assert!(cache.get("fn#c").is_some());
        assert_eq!(cache.stats().get_evictions(), 1);
    }

    #[test]
    fn test_overwrite_is_not_an_eviction() {
        let cache = cache(2);
        cache.set(record("fn#a"));
        cache.set(record("fn#a"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().get_evictions(), 0);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = cache(4);
        cache.set(record("fn#a"));
        cache.set(record("fn#b"));

        cache.remove("fn#a");
        assert!(cache.get("fn#a").is_none());
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
