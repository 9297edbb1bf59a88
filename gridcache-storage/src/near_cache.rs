//! Member-local near-cache.
//!
//! Each region keeps a bounded local copy of recently read or written
//! entries in front of the distributed map. Entries older than the region's
//! TTL are treated as misses; size is brought back under the configured
//! maximum by the cleanup task, which evicts oldest entries first.
//!
//! # Fills racing invalidations
//!
//! A reader that misses locally reads the grid and then fills the
//! near-cache. An invalidation that lands between the grid read and the fill
//! must win, or the member would serve the pre-invalidation value until the
//! TTL runs out. Every local invalidation therefore takes a sequence number
//! and leaves a tombstone for its key. Readers [`reserve`](NearCache::reserve)
//! the sequence before touching the grid and fill with
//! [`put_if_fresh`](NearCache::put_if_fresh), which refuses when the key (or
//! the whole cache) was invalidated after the reservation. Tombstones are
//! pruned by the cleanup pass; fills reserved before a prune are refused.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gridcache_core::{CacheKey, ClusterTime, RegionConfig, Timestamper};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Near-cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NearCacheStats {
    /// Number of local hits.
    pub hits: u64,
    /// Number of local misses (absent or expired).
    pub misses: u64,
    /// Number of entries currently held.
    pub entry_count: u64,
    /// Number of entries removed by TTL, trimming or invalidation.
    pub evictions: u64,
}

impl NearCacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Entries removed by one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired: usize,
    pub trimmed: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.expired + self.trimmed
    }
}

/// Local side of invalidation: what a topic listener may do to a cache.
pub trait LocalInvalidation: Send + Sync {
    /// Drop one key; true if something was held.
    fn invalidate_key(&self, key: &CacheKey) -> bool;

    /// Drop everything; returns how many entries were held.
    fn invalidate_all(&self) -> usize;
}

#[derive(Debug, Clone)]
struct NearEntry<V> {
    value: V,
    cached_at: ClusterTime,
}

/// Bounded, TTL-limited local cache keyed by [`CacheKey`].
#[derive(Debug)]
pub struct NearCache<V> {
    entries: DashMap<CacheKey, NearEntry<V>>,
    /// Sequence of the latest invalidation per key since the last prune.
    tombstones: DashMap<CacheKey, u64>,
    sequence: AtomicU64,
    /// Fills reserved before this sequence are refused.
    horizon: AtomicU64,
    config: RegionConfig,
    clock: Arc<dyn Timestamper>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone + Send + Sync> NearCache<V> {
    pub fn new(config: RegionConfig, clock: Arc<dyn Timestamper>) -> Self {
        Self {
            entries: DashMap::new(),
            tombstones: DashMap::new(),
            sequence: AtomicU64::new(0),
            horizon: AtomicU64::new(0),
            config,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    fn is_expired(&self, cached_at: ClusterTime, now: ClusterTime) -> bool {
        now.saturating_sub(cached_at) >= self.config.near_cache_ttl.as_millis() as i64
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = self.clock.now();
        // The shard guard must be gone before `remove_if` locks the shard again.
        let held = self
            .entries
            .get(key)
            .map(|e| (!self.is_expired(e.cached_at, now)).then(|| e.value.clone()));
        let found = match held {
            Some(Some(value)) => Some(value),
            Some(None) => {
                if self
                    .entries
                    .remove_if(key, |_, e| self.is_expired(e.cached_at, now))
                    .is_some()
                {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None
            }
            None => None,
        };
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Unconditional local write.
    pub fn put(&self, key: CacheKey, value: V) {
        let cached_at = self.clock.now();
        self.entries.insert(key, NearEntry { value, cached_at });
    }

    /// Invalidation sequence to pass to [`put_if_fresh`](Self::put_if_fresh).
    /// Take it before reading the grid.
    pub fn reserve(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Cache `value` unless `key` was invalidated after `since` was reserved.
    ///
    /// The check runs under the key's shard lock, so an invalidation either
    /// sees the filled entry and removes it or is seen here.
    pub fn put_if_fresh(&self, key: CacheKey, value: V, since: u64) -> bool {
        let cached_at = self.clock.now();
        match self.entries.entry(key) {
            Entry::Occupied(mut slot) => {
                if self.invalidated_since(slot.key(), since) {
                    return false;
                }
                slot.insert(NearEntry { value, cached_at });
            }
            Entry::Vacant(slot) => {
                if self.invalidated_since(slot.key(), since) {
                    return false;
                }
                slot.insert(NearEntry { value, cached_at });
            }
        }
        true
    }

    fn invalidated_since(&self, key: &CacheKey, since: u64) -> bool {
        self.horizon.load(Ordering::SeqCst) > since
            || self.tombstones.get(key).is_some_and(|seq| *seq > since)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn evict(&self, key: &CacheKey) -> bool {
        let seq = self.next_sequence();
        self.tombstones.insert(key.clone(), seq);
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn clear(&self) -> usize {
        let seq = self.next_sequence();
        self.horizon.fetch_max(seq, Ordering::SeqCst);
        self.tombstones.clear();
        let count = self.entries.len();
        self.entries.clear();
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop expired entries, then the oldest ones beyond the size limit,
    /// then the tombstones of earlier invalidations.
    pub fn cleanup(&self) -> CleanupReport {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !self.is_expired(e.cached_at, now));
        let expired = before.saturating_sub(self.entries.len());

        let mut trimmed = 0;
        let overflow = self
            .entries
            .len()
            .saturating_sub(self.config.near_cache_max_size);
        if overflow > 0 {
            let mut by_age: Vec<(ClusterTime, CacheKey)> = self
                .entries
                .iter()
                .map(|e| (e.cached_at, e.key().clone()))
                .collect();
            by_age.sort();
            for (_, key) in by_age.into_iter().take(overflow) {
                if self.entries.remove(&key).is_some() {
                    trimmed += 1;
                }
            }
        }

        if !self.tombstones.is_empty() {
            let seq = self.sequence.load(Ordering::SeqCst);
            self.horizon.fetch_max(seq, Ordering::SeqCst);
            self.tombstones.retain(|_, s| *s > seq);
        }

        self.evictions
            .fetch_add((expired + trimmed) as u64, Ordering::Relaxed);
        CleanupReport { expired, trimmed }
    }

    pub fn stats(&self) -> NearCacheStats {
        NearCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl<V: Clone + Send + Sync> LocalInvalidation for NearCache<V> {
    fn invalidate_key(&self, key: &CacheKey) -> bool {
        self.evict(key)
    }

    fn invalidate_all(&self) -> usize {
        self.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridcache_core::ManualTimestamper;
    use std::time::Duration;

    fn cache(max: usize, ttl_ms: u64) -> (Arc<ManualTimestamper>, NearCache<u32>) {
        let clock = ManualTimestamper::shared(0);
        let config = RegionConfig::default()
            .with_max_size(max)
            .with_ttl(Duration::from_millis(ttl_ms));
        (clock.clone(), NearCache::new(config, clock))
    }

    #[test]
    fn test_get_respects_ttl() {
        let (clock, near) = cache(10, 100);
        let key = CacheKey::entity("Person", 1);
        near.put(key.clone(), 7);
        assert_eq!(near.get(&key), Some(7));

        clock.advance(Duration::from_millis(100));
        assert_eq!(near.get(&key), None);
        assert!(near.is_empty());

        let stats = near.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_expired_entry_read_from_another_thread_returns() {
        let (clock, near) = cache(10, 100);
        let near = Arc::new(near);
        let key = CacheKey::entity("Person", 1);
        near.put(key.clone(), 1);
        clock.advance(Duration::from_millis(200));

        let (tx, rx) = std::sync::mpsc::channel();
        let reader = near.clone();
        std::thread::spawn(move || {
            let _ = tx.send(reader.get(&key));
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(None));
        assert!(near.is_empty());
    }

    #[test]
    fn test_fill_refused_after_key_invalidated() {
        let (_, near) = cache(10, 10_000);
        let key = CacheKey::entity("Person", 1);
        let since = near.reserve();

        // Nothing was held, but the invalidation still counts.
        assert!(!near.invalidate_key(&key));
        assert!(!near.put_if_fresh(key.clone(), 1, since));
        assert!(near.get(&key).is_none());

        let other = CacheKey::entity("Person", 2);
        assert!(near.put_if_fresh(other, 2, since));
        assert!(near.put_if_fresh(key.clone(), 3, near.reserve()));
        assert_eq!(near.get(&key), Some(3));
    }

    #[test]
    fn test_fill_refused_after_clear_and_prune() {
        let (_, near) = cache(10, 10_000);
        let key = CacheKey::entity("Person", 1);

        let before_clear = near.reserve();
        near.clear();
        assert!(!near.put_if_fresh(key.clone(), 1, before_clear));

        let before_prune = near.reserve();
        near.evict(&CacheKey::entity("Person", 9));
        near.cleanup();
        assert!(!near.put_if_fresh(key.clone(), 1, before_prune));
        assert!(near.put_if_fresh(key.clone(), 2, near.reserve()));
        assert_eq!(near.get(&key), Some(2));
    }

    #[test]
    fn test_cleanup_trims_oldest_first() {
        let (clock, near) = cache(2, 10_000);
        for id in 0..4 {
            near.put(CacheKey::entity("Person", id), id as u32);
            clock.advance(Duration::from_millis(1));
        }

        let report = near.cleanup();
        assert_eq!(report, CleanupReport { expired: 0, trimmed: 2 });
        assert_eq!(near.len(), 2);
        assert!(near.get(&CacheKey::entity("Person", 0)).is_none());
        assert_eq!(near.get(&CacheKey::entity("Person", 3)), Some(3));
    }

    #[test]
    fn test_cleanup_drops_expired_before_trimming() {
        let (clock, near) = cache(1, 50);
        near.put(CacheKey::entity("Person", 1), 1);
        clock.advance(Duration::from_millis(60));
        near.put(CacheKey::entity("Person", 2), 2);

        let report = near.cleanup();
        assert_eq!(report.expired, 1);
        assert_eq!(report.trimmed, 0);
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn test_local_invalidation() {
        let (_, near) = cache(10, 10_000);
        let key = CacheKey::entity("Person", 1);
        near.put(key.clone(), 1);
        near.put(CacheKey::entity("Person", 2), 2);

        assert!(near.invalidate_key(&key));
        assert!(!near.invalidate_key(&key));
        assert_eq!(near.invalidate_all(), 1);
        assert!(near.is_empty());
    }
}
