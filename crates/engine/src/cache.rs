//! Memory-budgeted LRU over loaded recognition models.

use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::model::SpeechModel;

/// Default budget: 2 GiB.
pub const DEFAULT_CACHE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Cache key: a model is distinct per device and precision it was loaded
/// with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub model: String,
    pub device: String,
    pub precision: String,
}

struct CacheEntry {
    handle: Arc<dyn SpeechModel>,
    bytes: u64,
}

struct CacheInner {
    entries: LruCache<ModelKey, CacheEntry>,
    current_bytes: u64,
}

/// LRU of loaded models bounded by estimated byte cost.
///
/// Eviction happens on insert: least-recently-used entries are dropped
/// while the incoming entry would push the cache over budget, but the
/// incoming entry itself is always admitted, so a single oversize model
/// may occupy the cache alone.
pub struct ModelCache {
    inner: Mutex<CacheInner>,
    budget: u64,
}

impl ModelCache {
    pub fn new(budget: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                // The byte budget is the real bound; entry count is not.
                entries: LruCache::unbounded(),
                current_bytes: 0,
            }),
            budget,
        }
    }

    /// Look up a model, marking it most recently used.
    pub fn get(&self, key: &ModelKey) -> Option<Arc<dyn SpeechModel>> {
        let mut inner = self.lock();
        inner.entries.get(key).map(|e| Arc::clone(&e.handle))
    }

    /// Insert a model, evicting LRU entries to stay within budget.
    pub fn put(&self, key: ModelKey, handle: Arc<dyn SpeechModel>, bytes: u64) {
        let mut inner = self.lock();
        if let Some(old) = inner.entries.pop(&key) {
            inner.current_bytes -= old.bytes;
        }
        while inner.current_bytes + bytes > self.budget && !inner.entries.is_empty() {
            if let Some((evicted, entry)) = inner.entries.pop_lru() {
                inner.current_bytes -= entry.bytes;
                tracing::info!(
                    model = %evicted.model,
                    device = %evicted.device,
                    freed_bytes = entry.bytes,
                    "evicted model from cache"
                );
            }
        }
        inner.current_bytes += bytes;
        inner.entries.push(key, CacheEntry { handle, bytes });
    }

    pub fn contains(&self, key: &ModelKey) -> bool {
        self.lock().entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn current_bytes(&self) -> u64 {
        self.lock().current_bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().expect("model cache mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::model::{RecognitionOptions, SegmentIter};

    struct StubModel;

    impl SpeechModel for StubModel {
        fn transcribe(&self, _audio: &Path, _options: &RecognitionOptions) -> crate::Result<SegmentIter> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    fn key(model: &str) -> ModelKey {
        ModelKey {
            model: model.to_string(),
            device: "cpu".to_string(),
            precision: "int8".to_string(),
        }
    }

    fn put(cache: &ModelCache, name: &str, bytes: u64) {
        cache.put(key(name), Arc::new(StubModel), bytes);
    }

    #[test]
    fn get_miss_returns_none() {
        let cache = ModelCache::new(100);
        assert!(cache.get(&key("base")).is_none());
    }

    #[test]
    fn put_then_get_hits() {
        let cache = ModelCache::new(100);
        put(&cache, "base", 40);
        assert!(cache.get(&key("base")).is_some());
        assert_eq!(cache.current_bytes(), 40);
    }

    #[test]
    fn second_model_over_budget_evicts_first() {
        // 100 MB budget, two 80 MB models: the first must go.
        let cache = ModelCache::new(100_000_000);
        put(&cache, "first", 80_000_000);
        put(&cache, "second", 80_000_000);

        assert!(cache.get(&key("first")).is_none());
        assert!(cache.get(&key("second")).is_some());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_bytes(), 80_000_000);
    }

    #[test]
    fn get_refreshes_recency() {
        let cache = ModelCache::new(100);
        put(&cache, "a", 40);
        put(&cache, "b", 40);
        // Touch `a` so `b` becomes the eviction candidate.
        assert!(cache.get(&key("a")).is_some());
        put(&cache, "c", 40);

        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
    }

    #[test]
    fn single_oversize_entry_is_admitted() {
        let cache = ModelCache::new(100);
        put(&cache, "small", 60);
        put(&cache, "huge", 500);

        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&key("huge")));
        assert_eq!(cache.current_bytes(), 500);
    }

    #[test]
    fn replacing_a_key_does_not_double_count() {
        let cache = ModelCache::new(100);
        put(&cache, "base", 40);
        put(&cache, "base", 60);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_bytes(), 60);
    }

    #[test]
    fn budget_invariant_holds_under_churn() {
        let cache = ModelCache::new(100);
        for i in 0..20u64 {
            put(&cache, &format!("m{i}"), 10 + (i % 7) * 15);
            assert!(
                cache.current_bytes() <= 100 || cache.len() == 1,
                "cache exceeded budget with {} entries",
                cache.len()
            );
        }
    }

    #[test]
    fn distinct_device_or_precision_is_a_distinct_entry() {
        let cache = ModelCache::new(1_000);
        cache.put(key("base"), Arc::new(StubModel), 100);
        let cuda = ModelKey {
            model: "base".to_string(),
            device: "cuda".to_string(),
            precision: "float16".to_string(),
        };
        cache.put(cuda.clone(), Arc::new(StubModel), 100);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&cuda).is_some());
    }
}
