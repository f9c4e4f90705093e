//! Memory Cache (L1) - bounded in-process byte cache
//!
//! Entry-count bounded LRU over encoded image variants.
//!
//! # Design
//!
//! - One mutex serializes insert, lookup and eviction so victim selection
//!   always sees a consistent recency ordering
//! - Recency is a logical clock, so ordering is total even when two accesses
//!   land in the same clock tick
//! - Victims are marked under the lock and handed to an [`EvictionListener`]
//!   while still resident, then removed. Listener failures are logged and
//!   never keep an entry alive. An overwrite during the callback replaces the
//!   marked entry and survives the removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::entry::{CacheKey, MemoryEntry};
use super::DEFAULT_MEMORY_ENTRIES;
use crate::error::{Error, Result};

/// Called for every entry leaving the memory tier
#[async_trait]
pub trait EvictionListener: Send + Sync {
    /// Observe an evicted entry. Errors are logged by the cache.
    async fn on_evict(&self, image_id: &str, data: &Bytes) -> Result<()>;
}

/// Memory cache configuration
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Maximum number of resident entries
    pub max_entries: usize,
    /// Entries idle for longer than this are removed by the sweep
    pub idle_timeout: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MEMORY_ENTRIES,
            idle_timeout: Duration::from_secs(60 * 60),
        }
    }
}

impl MemoryCacheConfig {
    /// Reject configurations the cache cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(Error::Config(
                "memory cache must hold at least one entry".to_string(),
            ));
        }
        Ok(())
    }
}

/// Memory Cache - RAM-resident hot tier
pub struct MemoryCache {
    /// Resident entries
    entries: Mutex<HashMap<CacheKey, MemoryEntry>>,
    /// Logical access clock
    clock: AtomicU64,
    /// Configuration
    config: MemoryCacheConfig,
    /// Eviction observer
    listener: Option<Arc<dyn EvictionListener>>,
    /// Hit count
    hits: AtomicU64,
    /// Miss count
    misses: AtomicU64,
    /// Eviction count
    evictions: AtomicU64,
}

impl MemoryCache {
    /// Create a memory cache without an eviction listener
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            config,
            listener: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Create a memory cache that reports evictions to `listener`
    pub fn with_listener(config: MemoryCacheConfig, listener: Arc<dyn EvictionListener>) -> Self {
        let mut cache = Self::new(config);
        cache.listener = Some(listener);
        cache
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Get cached bytes and refresh recency
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.touch(self.tick());
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.data().clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or overwrite an entry, evicting least-recently-used entries
    /// beyond the configured capacity. Returns the number of evicted entries.
    pub async fn put(&self, key: CacheKey, data: Bytes) -> usize {
        let victims = {
            let mut entries = self.entries.lock();
            let sequence = self.tick();
            entries.insert(key, MemoryEntry::new(data, sequence));

            // Entries already marked by a concurrent put are on their way out
            let live = entries.values().filter(|e| !e.is_evicting()).count();
            let overflow = live.saturating_sub(self.config.max_entries);
            if overflow == 0 {
                Vec::new()
            } else {
                let mut by_recency: Vec<(CacheKey, u64)> = entries
                    .iter()
                    .filter(|(_, e)| !e.is_evicting())
                    .map(|(k, e)| (k.clone(), e.sequence()))
                    .collect();
                by_recency.sort_by_key(|(_, sequence)| *sequence);

                let keys: Vec<CacheKey> = by_recency
                    .into_iter()
                    .take(overflow)
                    .map(|(k, _)| k)
                    .collect();
                mark_victims(&mut entries, keys)
            }
        };

        self.evict(victims).await
    }

    /// Check if an exact variant is resident
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Check if any variant of an image is resident
    pub fn contains_image(&self, image_id: &str) -> bool {
        self.entries
            .lock()
            .keys()
            .any(|key| key.image_id() == image_id)
    }

    /// Remove every entry idle for longer than the configured window
    pub async fn sweep_inactive(&self) -> usize {
        self.sweep_idle_since(Instant::now()).await
    }

    async fn sweep_idle_since(&self, now: Instant) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let expired = {
            let mut entries = self.entries.lock();
            let stale: Vec<CacheKey> = entries
                .iter()
                .filter(|(_, entry)| !entry.is_evicting())
                .filter(|(_, entry)| now.saturating_duration_since(entry.last_used()) > idle_timeout)
                .map(|(key, _)| key.clone())
                .collect();
            mark_victims(&mut entries, stale)
        };

        for (key, _) in &expired {
            debug!("Removing {} from memory cache due to inactivity", key);
        }

        self.evict(expired).await
    }

    /// Evict (and flush) every entry. Used for a clean drain at shutdown.
    pub async fn close(&self) -> usize {
        let drained = {
            let mut entries = self.entries.lock();
            let keys: Vec<CacheKey> = entries
                .iter()
                .filter(|(_, entry)| !entry.is_evicting())
                .map(|(key, _)| key.clone())
                .collect();
            mark_victims(&mut entries, keys)
        };
        self.evict(drained).await
    }

    /// Run the listener for each victim, then drop the ones still marked.
    /// Returns the number of entries removed.
    async fn evict(&self, victims: Vec<(CacheKey, Bytes)>) -> usize {
        if victims.is_empty() {
            return 0;
        }

        if let Some(listener) = &self.listener {
            for (key, data) in &victims {
                if let Err(e) = listener.on_evict(key.image_id(), data).await {
                    warn!("Eviction callback failed for {}: {}", key, e);
                }
            }
        }

        let removed = {
            let mut entries = self.entries.lock();
            victims
                .iter()
                .filter(|(key, _)| {
                    if entries.get(key).is_some_and(MemoryEntry::is_evicting) {
                        entries.remove(key);
                        true
                    } else {
                        false
                    }
                })
                .count()
        };

        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        crate::metrics::MEMORY_EVICTIONS.inc_by(removed as u64);
        removed
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Get capacity in entries
    pub fn capacity(&self) -> usize {
        self.config.max_entries
    }

    /// Get resident bytes
    pub fn size(&self) -> u64 {
        self.entries.lock().values().map(MemoryEntry::size).sum()
    }

    /// Get hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get cache statistics
    pub fn stats(&self) -> MemoryCacheStats {
        MemoryCacheStats {
            entries: self.len(),
            capacity: self.capacity(),
            size: self.size(),
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
        }
    }
}

/// Mark `keys` as evicting and snapshot their bytes for the listener
fn mark_victims(
    entries: &mut HashMap<CacheKey, MemoryEntry>,
    keys: Vec<CacheKey>,
) -> Vec<(CacheKey, Bytes)> {
    keys.into_iter()
        .filter_map(|key| {
            let entry = entries.get_mut(&key)?;
            entry.mark_evicting();
            let data = entry.data().clone();
            Some((key, data))
        })
        .collect()
}

/// Memory cache statistics
#[derive(Debug, Clone)]
pub struct MemoryCacheStats {
    /// Number of entries
    pub entries: usize,
    /// Capacity in entries
    pub capacity: usize,
    /// Resident bytes
    pub size: u64,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Eviction count
    pub evictions: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every eviction, optionally failing each callback
    #[derive(Default)]
    struct RecordingListener {
        evicted: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl EvictionListener for RecordingListener {
        async fn on_evict(&self, image_id: &str, _data: &Bytes) -> Result<()> {
            self.evicted.lock().push(image_id.to_string());
            if self.fail {
                return Err(Error::Internal("listener down".to_string()));
            }
            Ok(())
        }
    }

    fn make_key(id: &str) -> CacheKey {
        CacheKey::new(id, 400, 80)
    }

    fn make_cache(max_entries: usize) -> (MemoryCache, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        let config = MemoryCacheConfig {
            max_entries,
            ..Default::default()
        };
        (
            MemoryCache::with_listener(config, listener.clone()),
            listener,
        )
    }

    #[tokio::test]
    async fn test_memory_cache_put_get() {
        let (cache, _) = make_cache(10);

        cache
            .put(make_key("a"), Bytes::from_static(b"Hello, World!"))
            .await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 13);

        let data = cache.get(&make_key("a")).unwrap();
        assert_eq!(data.as_ref(), b"Hello, World!");
        assert_eq!(cache.hits(), 1);
    }

    #[tokio::test]
    async fn test_memory_cache_miss() {
        let (cache, _) = make_cache(10);
        assert!(cache.get(&make_key("missing")).is_none());
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 0);
    }

    #[tokio::test]
    async fn test_overflow_evicts_exactly_the_least_recent() {
        let (cache, listener) = make_cache(3);

        cache.put(make_key("a"), Bytes::from_static(b"a")).await;
        cache.put(make_key("b"), Bytes::from_static(b"b")).await;
        cache.put(make_key("c"), Bytes::from_static(b"c")).await;

        // Refresh "a" so "b" becomes the oldest
        cache.get(&make_key("a"));

        let evicted = cache.put(make_key("d"), Bytes::from_static(b"d")).await;

        assert_eq!(evicted, 1);
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&make_key("b")));
        assert!(cache.contains(&make_key("a")));
        assert!(cache.contains(&make_key("d")));
        assert_eq!(*listener.evicted.lock(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let (cache, listener) = make_cache(2);

        cache.put(make_key("a"), Bytes::from_static(b"one")).await;
        cache.put(make_key("b"), Bytes::from_static(b"two")).await;
        let evicted = cache.put(make_key("a"), Bytes::from_static(b"three")).await;

        assert_eq!(evicted, 0);
        assert_eq!(cache.get(&make_key("a")).unwrap().as_ref(), b"three");
        assert!(listener.evicted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failing_listener_still_removes_entry() {
        let listener = Arc::new(RecordingListener {
            fail: true,
            ..Default::default()
        });
        let config = MemoryCacheConfig {
            max_entries: 1,
            ..Default::default()
        };
        let cache = MemoryCache::with_listener(config, listener.clone());

        cache.put(make_key("a"), Bytes::from_static(b"a")).await;
        cache.put(make_key("b"), Bytes::from_static(b"b")).await;

        assert!(!cache.contains(&make_key("a")));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.evictions(), 1);
        assert_eq!(listener.evicted.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_contains_image_matches_any_variant() {
        let (cache, _) = make_cache(10);
        cache
            .put(CacheKey::new("img", 320, 60), Bytes::from_static(b"x"))
            .await;

        assert!(cache.contains_image("img"));
        assert!(!cache.contains_image("other"));
        assert!(!cache.contains(&CacheKey::new("img", 640, 60)));
    }

    #[tokio::test]
    async fn test_sweep_removes_only_idle_entries() {
        let listener = Arc::new(RecordingListener::default());
        let config = MemoryCacheConfig {
            max_entries: 10,
            idle_timeout: Duration::from_millis(10),
        };
        let cache = MemoryCache::with_listener(config, listener.clone());

        cache.put(make_key("old"), Bytes::from_static(b"o")).await;
        std::thread::sleep(Duration::from_millis(25));
        cache.put(make_key("fresh"), Bytes::from_static(b"f")).await;

        let fresh_used = cache
            .entries
            .lock()
            .get(&make_key("fresh"))
            .map(MemoryEntry::last_used)
            .unwrap();

        // "old" has been idle for >= 25ms, "fresh" for 5ms
        let removed = cache
            .sweep_idle_since(fresh_used + Duration::from_millis(5))
            .await;
        assert_eq!(removed, 1);
        assert!(cache.contains(&make_key("fresh")));
        assert!(!cache.contains(&make_key("old")));
        assert_eq!(*listener.evicted.lock(), vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn test_close_flushes_everything() {
        let (cache, listener) = make_cache(10);
        for id in ["a", "b", "c"] {
            cache.put(make_key(id), Bytes::from_static(b"x")).await;
        }

        assert_eq!(cache.close().await, 3);
        assert!(cache.is_empty());

        let mut flushed = listener.evicted.lock().clone();
        flushed.sort();
        assert_eq!(flushed, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_concurrent_puts_respect_capacity() {
        let (cache, listener) = make_cache(16);
        let cache = Arc::new(cache);

        let mut handles = Vec::new();
        for t in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    let key = CacheKey::new(format!("img-{}-{}", t, i), 400, 80);
                    cache.put(key.clone(), Bytes::from(vec![i as u8; 8])).await;
                    cache.get(&key);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cache.len(), 16);
        assert_eq!(listener.evicted.lock().len(), 8 * 50 - 16);
    }

    /// Records whether the evicted image was still resident during the callback
    #[derive(Default)]
    struct ResidencyListener {
        cache: Mutex<std::sync::Weak<MemoryCache>>,
        resident: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl EvictionListener for ResidencyListener {
        async fn on_evict(&self, image_id: &str, _data: &Bytes) -> Result<()> {
            let cache = self.cache.lock().upgrade();
            if let Some(cache) = cache {
                self.resident.lock().push(cache.contains_image(image_id));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_victim_stays_resident_until_callback_returns() {
        let listener = Arc::new(ResidencyListener::default());
        let config = MemoryCacheConfig {
            max_entries: 1,
            ..Default::default()
        };
        let cache = Arc::new(MemoryCache::with_listener(config, listener.clone()));
        *listener.cache.lock() = Arc::downgrade(&cache);

        cache.put(make_key("a"), Bytes::from_static(b"a")).await;
        cache.put(make_key("b"), Bytes::from_static(b"b")).await;

        // A reconciler asking "is this hot?" mid-eviction must still see it
        assert_eq!(*listener.resident.lock(), vec![true]);
        assert!(!cache.contains(&make_key("a")));

        cache.close().await;
        assert_eq!(*listener.resident.lock(), vec![true, true]);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_marked_entry_is_not_chosen_twice() {
        let (cache, listener) = make_cache(2);
        cache.put(make_key("a"), Bytes::from_static(b"a")).await;
        cache.put(make_key("b"), Bytes::from_static(b"b")).await;

        // Simulate a put whose callback is still running for "a"
        let victims = mark_victims(&mut cache.entries.lock(), vec![make_key("a")]);
        assert_eq!(victims.len(), 1);

        // Only "b" counts as live, so this insert overflows nothing
        let evicted = cache.put(make_key("c"), Bytes::from_static(b"c")).await;
        assert_eq!(evicted, 0);
        assert!(listener.evicted.lock().is_empty());

        assert_eq!(cache.evict(victims).await, 1);
        assert_eq!(*listener.evicted.lock(), vec!["a".to_string()]);
        assert!(cache.contains(&make_key("b")));
        assert!(cache.contains(&make_key("c")));
    }

    #[tokio::test]
    async fn test_overwrite_during_callback_survives_removal() {
        let (cache, _) = make_cache(2);
        cache.put(make_key("a"), Bytes::from_static(b"old")).await;

        let victims = mark_victims(&mut cache.entries.lock(), vec![make_key("a")]);
        cache.put(make_key("a"), Bytes::from_static(b"new")).await;

        assert_eq!(cache.evict(victims).await, 0);
        assert_eq!(cache.get(&make_key("a")).unwrap().as_ref(), b"new");
        assert_eq!(cache.evictions(), 0);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = MemoryCacheConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(MemoryCacheConfig::default().validate().is_ok());
    }
}
