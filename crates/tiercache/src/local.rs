//! Local (L1) tier: a bounded, TTL-aware, LRU-evicting in-process cache.
//!
//! Backed by moka with the LRU eviction policy and a per-entry expiry, so
//! memory stays bounded by `max_entries` regardless of traffic. Expiry is
//! additionally checked against the injected [`Clock`](crate::Clock) on every
//! read, which lets tests move time forward without sleeping.

use moka::Expiry;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::SharedClock;
use crate::key;
use crate::metrics::{self, Tier};

/// Number of keys removed between yields during prefix invalidation.
const INVALIDATION_BATCH: usize = 256;

/// A cached entry with TTL support.
///
/// The data is wrapped in `Arc` so cache hits are cheap to clone.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at_ms: u64,
    pub ttl: Duration,
}

impl CachedEntry {
    pub fn new(data: Arc<Vec<u8>>, cached_at_ms: u64, ttl: Duration) -> Self {
        Self {
            data,
            cached_at_ms,
            ttl,
        }
    }

    /// Check if this entry has expired at `now_ms`.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.cached_at_ms) as u128 > self.ttl.as_millis()
    }

    /// Time left before expiry at `now_ms`.
    pub fn remaining_at(&self, now_ms: u64) -> Duration {
        let elapsed = Duration::from_millis(now_ms.saturating_sub(self.cached_at_ms));
        self.ttl.saturating_sub(elapsed)
    }
}

/// Per-entry expiry: every write carries its own TTL.
struct EntryExpiry;

impl Expiry<String, CachedEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

#[derive(Clone)]
pub struct LocalCache {
    entries: Cache<String, CachedEntry>,
    capacity: u64,
    clock: SharedClock,
}

impl LocalCache {
    pub fn new(capacity: u64, clock: SharedClock) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry)
            .build();

        Self {
            entries,
            capacity,
            clock,
        }
    }

    /// Look up a live entry, dropping it if it has expired.
    pub async fn get(&self, key: &str) -> Option<CachedEntry> {
        let entry = self.entries.get(key).await?;
        if entry.is_expired_at(self.clock.now_ms()) {
            self.entries.invalidate(key).await;
            return None;
        }
        Some(entry)
    }

    /// Insert or replace an entry; refreshes its recency.
    pub async fn insert(&self, key: impl Into<String>, data: Arc<Vec<u8>>, ttl: Duration) {
        let entry = CachedEntry::new(data, self.clock.now_ms(), ttl);
        self.entries.insert(key.into(), entry).await;
    }

    /// Remove an entry. Returns whether a live entry was present.
    pub async fn remove(&self, key: &str) -> bool {
        match self.entries.remove(key).await {
            Some(entry) => !entry.is_expired_at(self.clock.now_ms()),
            None => false,
        }
    }

    /// Remove `base` and every key below it.
    ///
    /// Matching keys are collected in one pass over the bounded key set and
    /// removed in batches, yielding between batches.
    pub async fn invalidate_prefix(&self, base: &str) -> usize {
        let matching: Vec<Arc<String>> = self
            .entries
            .iter()
            .filter(|(k, _)| key::is_under(k, base))
            .map(|(k, _)| k)
            .collect();

        let mut removed = 0;
        for batch in matching.chunks(INVALIDATION_BATCH) {
            for k in batch {
                if self.entries.remove(k.as_str()).await.is_some() {
                    removed += 1;
                }
            }
            tokio::task::yield_now().await;
        }

        tracing::debug!(prefix = %base, removed, "local prefix invalidation");
        removed
    }

    /// Approximate number of entries (pending maintenance is not applied).
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Apply pending evictions/expirations so `entry_count` is exact.
    pub async fn sync(&self) {
        self.entries.run_pending_tasks().await;
        metrics::set_cache_entries(Tier::Local, self.entries.entry_count());
    }

    pub async fn clear(&self) {
        self.entries.invalidate_all();
        self.sync().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn data(s: &str) -> Arc<Vec<u8>> {
        Arc::new(s.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let cache = LocalCache::new(100, ManualClock::new(0));
        cache.insert("a", data("1"), Duration::from_secs(60)).await;

        let entry = cache.get("a").await.expect("entry present");
        assert_eq!(entry.data.as_slice(), b"1");
        assert!(cache.get("b").await.is_none());
    }

    #[tokio::test]
    async fn test_expiry_follows_clock() {
        let clock = ManualClock::new(10_000);
        let cache = LocalCache::new(100, clock.clone());
        cache.insert("a", data("1"), Duration::from_secs(1)).await;

        clock.advance(Duration::from_millis(999));
        assert!(cache.get("a").await.is_some());

        clock.advance(Duration::from_millis(2));
        assert!(cache.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let cache = LocalCache::new(10, ManualClock::new(0));
        for i in 0..100 {
            cache.insert(format!("k{i}"), data("v"), Duration::from_secs(60)).await;
        }
        cache.sync().await;
        assert!(cache.entry_count() <= 10);
    }

    #[tokio::test]
    async fn test_recently_read_key_survives_eviction() {
        let cache = LocalCache::new(10, ManualClock::new(0));
        cache.insert("hot", data("v"), Duration::from_secs(60)).await;

        for i in 0..50 {
            cache.insert(format!("k{i}"), data("v"), Duration::from_secs(60)).await;
            assert!(cache.get("hot").await.is_some(), "hot key evicted at k{i}");
            cache.sync().await;
        }

        assert!(cache.entry_count() <= 10);
        assert!(cache.get("k0").await.is_none());
        assert!(cache.get("k49").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_prefix_scope() {
        let cache = LocalCache::new(100, ManualClock::new(0));
        for k in ["ns|u1", "ns|u1|r1", "ns|u1|r2", "ns|u10|r1", "other|u1"] {
            cache.insert(k, data("v"), Duration::from_secs(60)).await;
        }

        let removed = cache.invalidate_prefix("ns|u1").await;
        assert_eq!(removed, 3);
        assert!(cache.get("ns|u1|r1").await.is_none());
        assert!(cache.get("ns|u10|r1").await.is_some());
        assert!(cache.get("other|u1").await.is_some());
    }

    #[tokio::test]
    async fn test_remove_reports_presence() {
        let cache = LocalCache::new(100, ManualClock::new(0));
        cache.insert("a", data("1"), Duration::from_secs(60)).await;
        assert!(cache.remove("a").await);
        assert!(!cache.remove("a").await);
    }

    #[test]
    fn test_remaining_ttl() {
        let entry = CachedEntry::new(data("x"), 1_000, Duration::from_secs(10));
        assert_eq!(entry.remaining_at(4_000), Duration::from_secs(7));
        assert_eq!(entry.remaining_at(20_000), Duration::ZERO);
        assert!(entry.is_expired_at(11_001));
        assert!(!entry.is_expired_at(11_000));
    }
}
