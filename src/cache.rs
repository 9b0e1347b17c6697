//! Process-wide cache of loaded translations, keyed by translation hash.
//!
//! Makes activation idempotent for shared execute segments: two machines
//! realizing byte-identical segments under the same code-generation flags
//! resolve to the same hash and re-use one loaded code object instead of
//! reopening (or recompiling) it.
//!
//! LRU-bounded; evicted entries only drop the cache's reference, the code
//! object itself stays alive for as long as some segment maps it.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::bintr::loader::LoadedDylib;

/// Cache statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Cache lookup hits.
    pub hits: u64,
    /// Cache lookup misses.
    pub misses: u64,
    /// Number of entries inserted.
    pub insertions: u64,
    /// Number of entries evicted by LRU order.
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups answered from the cache.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// LRU cache of loaded translations.
pub struct TranslationCache {
    entries: LruCache<u32, Arc<LoadedDylib>>,
    stats: CacheStats,
}

impl TranslationCache {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            stats: CacheStats::default(),
        }
    }

    /// Look up a translation by hash, updating LRU order.
    pub fn get(&mut self, hash: u32) -> Option<Arc<LoadedDylib>> {
        match self.entries.get(&hash) {
            Some(lib) => {
                self.stats.hits += 1;
                Some(lib.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Insert a loaded translation, evicting the least recently used entry
    /// when full.
    pub fn insert(&mut self, hash: u32, lib: Arc<LoadedDylib>) {
        if self.entries.len() == usize::from(self.entries.cap()) && !self.entries.contains(&hash) {
            self.stats.evictions += 1;
        }
        self.entries.put(hash, lib);
        self.stats.insertions += 1;
    }

    pub fn contains(&self, hash: u32) -> bool {
        self.entries.contains(&hash)
    }

    pub fn invalidate(&mut self, hash: u32) -> bool {
        self.entries.pop(&hash).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// The process-wide instance consulted by the loader.
pub static TRANSLATION_CACHE: Mutex<Option<TranslationCache>> = Mutex::new(None);

/// Run `f` against the process-wide cache, creating it on first use.
pub fn with_translation_cache<R>(f: impl FnOnce(&mut TranslationCache) -> R) -> R {
    let mut guard = TRANSLATION_CACHE.lock();
    let cache = guard.get_or_insert_with(|| TranslationCache::new(64));
    f(cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bintr::loader::LoadedDylib;

    fn fake_lib() -> Arc<LoadedDylib> {
        Arc::new(LoadedDylib::for_tests())
    }

    #[test]
    fn test_basic_insert_get() {
        let mut cache = TranslationCache::new(10);
        cache.insert(0x1234, fake_lib());
        assert!(cache.contains(0x1234));
        assert!(cache.get(0x1234).is_some());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().insertions, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_miss_is_counted() {
        let mut cache = TranslationCache::new(10);
        assert!(cache.get(0xAAAA).is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hit_ratio(), 0.0);
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = TranslationCache::new(2);
        cache.insert(1, fake_lib());
        cache.insert(2, fake_lib());
        // Touch 1 so 2 becomes the eviction candidate.
        let _ = cache.get(1);
        cache.insert(3, fake_lib());
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_invalidate() {
        let mut cache = TranslationCache::new(4);
        cache.insert(7, fake_lib());
        assert!(cache.invalidate(7));
        assert!(!cache.invalidate(7));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hit_ratio() {
        let mut cache = TranslationCache::new(4);
        cache.insert(1, fake_lib());
        let _ = cache.get(1);
        let _ = cache.get(1);
        let _ = cache.get(1);
        let _ = cache.get(2);
        assert!((cache.stats().hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stats_serialize_camel_case() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            insertions: 2,
            evictions: 0,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"hits\":3"));
        assert!(json.contains("\"insertions\":2"));
        assert!(json.contains("\"evictions\":0"));
    }
}
