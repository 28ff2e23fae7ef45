//! Windowed rate counters on the cache's remote connection.
//!
//! Counters live in the shared store while it is reachable so every instance
//! sees the same count. When it is not, each process falls back to its own
//! fixed-window counter: limits are then enforced per instance rather than
//! not at all.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::CacheBackend;
use crate::clock::SharedClock;
use crate::error::CacheResult;
use crate::key::{KeyPart, build_key};
use crate::remote::RemoteClient;

/// State of a counter after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterValue {
    pub count: i64,
    /// Time until the window resets.
    pub reset_in: Duration,
    /// Whether the shared store served the increment.
    pub remote: bool,
}

#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    count: i64,
    started_at_ms: u64,
    window: Duration,
}

impl LocalWindow {
    fn elapsed(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.started_at_ms))
    }

    fn is_over(&self, now_ms: u64) -> bool {
        self.elapsed(now_ms) >= self.window
    }
}

#[derive(Clone)]
pub struct RateCounter {
    remote: RemoteClient,
    local: Arc<DashMap<String, LocalWindow>>,
    clock: SharedClock,
}

impl RateCounter {
    pub fn new(remote: RemoteClient, clock: SharedClock) -> Self {
        Self {
            remote,
            local: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// A counter sharing `cache`'s remote connection and clock.
    pub fn for_backend(cache: &CacheBackend) -> Self {
        Self::new(cache.remote().clone(), cache.clock().clone())
    }

    /// Count one event in the current window of `(namespace, parts)`.
    ///
    /// The window starts at the first event and lasts `window`.
    pub async fn increment(
        &self,
        namespace: &str,
        parts: &[KeyPart],
        window: Duration,
    ) -> CacheResult<CounterValue> {
        let key = build_key(namespace, parts)?;

        if let Some((count, reset_in)) = self.remote.incr(&key, window).await {
            return Ok(CounterValue {
                count,
                reset_in,
                remote: true,
            });
        }

        let now = self.clock.now_ms();
        let mut entry = self.local.entry(key).or_insert(LocalWindow {
            count: 0,
            started_at_ms: now,
            window,
        });
        if entry.is_over(now) {
            *entry = LocalWindow {
                count: 0,
                started_at_ms: now,
                window,
            };
        }
        entry.count += 1;

        Ok(CounterValue {
            count: entry.count,
            reset_in: entry.window.saturating_sub(entry.elapsed(now)),
            remote: false,
        })
    }

    /// Clear the counter in both places.
    pub async fn reset(&self, namespace: &str, parts: &[KeyPart]) -> CacheResult<()> {
        let key = build_key(namespace, parts)?;
        self.local.remove(&key);
        self.remote.del(&key).await;
        Ok(())
    }

    /// Drop local windows that have ended. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.local.len();
        self.local.retain(|_, w| !w.is_over(now));
        before.saturating_sub(self.local.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::key_parts;
    use crate::remote::MemoryStore;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_local_fixed_window() {
        let clock = ManualClock::new(0);
        let counter = RateCounter::new(RemoteClient::disabled(clock.clone()), clock.clone());

        for expected in 1..=3 {
            let v = counter.increment("ratelimit:ai", &key_parts!["u1"], MINUTE).await.unwrap();
            assert_eq!((v.count, v.remote), (expected, false));
        }

        clock.advance(Duration::from_secs(45));
        let v = counter.increment("ratelimit:ai", &key_parts!["u1"], MINUTE).await.unwrap();
        assert_eq!(v.count, 4);
        assert_eq!(v.reset_in, Duration::from_secs(15));

        clock.advance(Duration::from_secs(15));
        let v = counter.increment("ratelimit:ai", &key_parts!["u1"], MINUTE).await.unwrap();
        assert_eq!(v.count, 1);
    }

    #[tokio::test]
    async fn test_reset_and_purge() {
        let clock = ManualClock::new(0);
        let counter = RateCounter::new(RemoteClient::disabled(clock.clone()), clock.clone());
        counter.increment("rl", &key_parts!["a"], MINUTE).await.unwrap();
        counter.increment("rl", &key_parts!["b"], MINUTE).await.unwrap();

        counter.reset("rl", &key_parts!["a"]).await.unwrap();
        let v = counter.increment("rl", &key_parts!["a"], MINUTE).await.unwrap();
        assert_eq!(v.count, 1);

        clock.advance(MINUTE * 2);
        assert_eq!(counter.purge_expired(), 2);
    }

    #[tokio::test]
    async fn test_remote_counter_is_shared() {
        let store = MemoryStore::new();
        let mut config = CacheConfig::default();
        config.redis.enabled = true;
        config.redis.url = "memory://".into();

        let mut counters = Vec::new();
        for _ in 0..2 {
            let cache = CacheBackend::builder(config.clone())
                .connector(Arc::new(store.connector()))
                .build()
                .await
                .unwrap();
            counters.push(RateCounter::for_backend(&cache));
        }

        let a = counters[0].increment("rl", &key_parts!["u1"], MINUTE).await.unwrap();
        let b = counters[1].increment("rl", &key_parts!["u1"], MINUTE).await.unwrap();
        assert_eq!((a.count, a.remote), (1, true));
        assert_eq!((b.count, b.remote), (2, true));
        assert!(b.reset_in <= MINUTE);

        store.set_available(false);
        let c = counters[0].increment("rl", &key_parts!["u1"], MINUTE).await.unwrap();
        assert_eq!((c.count, c.remote), (1, false));
    }
}
