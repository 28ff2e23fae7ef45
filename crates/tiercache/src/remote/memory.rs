//! In-process stand-in for the shared store.
//!
//! Shared between several cache instances it behaves like one Redis server,
//! and its availability can be switched off and on to exercise the
//! degradation paths without a network.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::store::{Connector, DynRemoteStore, RemoteError, RemoteStore, RemoteValue};

struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
    /// Write sequence; doubles as the SCAN cursor position.
    seq: u64,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// A keyspace held in memory.
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    available: AtomicBool,
    operations: AtomicU64,
    next_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            operations: AtomicU64::new(0),
            next_seq: AtomicU64::new(1),
        })
    }

    /// Simulate an outage (`false`) or a recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Whether a live key exists, bypassing availability.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries.get(key).is_some_and(|v| v.is_live(now))
    }

    /// Number of live keys, bypassing availability.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Operations served so far (failed ones excluded).
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// A connector that hands out this store.
    pub fn connector(self: &Arc<Self>) -> MemoryConnector {
        MemoryConnector {
            store: Arc::clone(self),
        }
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.is_available() {
            self.operations.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(RemoteError::Connection("connection refused".into()))
        }
    }

    fn stored(&self, data: Vec<u8>, expires_at: Instant) -> StoredValue {
        StoredValue {
            data,
            expires_at: Some(expires_at),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<RemoteValue>, RemoteError> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| RemoteValue {
                data: v.data.clone(),
                ttl: v.expires_at.map(|at| at.saturating_duration_since(now)),
            }))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), RemoteError> {
        self.check()?;
        let value = self.stored(value.to_vec(), Instant::now() + ttl);
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, RemoteError> {
        self.check()?;
        let now = Instant::now();
        Ok(keys
            .iter()
            .filter_map(|k| self.entries.remove(k))
            .filter(|(_, v)| v.is_live(now))
            .count() as u64)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), RemoteError> {
        self.check()?;
        // The cursor is a write sequence number, so keys deleted between steps
        // never shift the position. Like Redis, a step may return fewer
        // matches than `count`.
        let now = Instant::now();
        let mut keys: Vec<(u64, String)> = self
            .entries
            .iter()
            .filter(|e| e.value().seq >= cursor && e.value().is_live(now))
            .map(|e| (e.value().seq, e.key().clone()))
            .collect();
        keys.sort_unstable();

        let step = count.max(1).min(keys.len());
        let next = match keys.get(step) {
            Some((seq, _)) => *seq,
            None => 0,
        };
        let batch = keys
            .into_iter()
            .take(step)
            .map(|(_, k)| k)
            .filter(|k| glob_match(pattern, k))
            .collect();
        Ok((next, batch))
    }

    async fn incr(&self, key: &str, window: Duration) -> Result<(i64, Duration), RemoteError> {
        self.check()?;
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| self.stored(b"0".to_vec(), now + window));
        if !entry.is_live(now) {
            *entry = self.stored(b"0".to_vec(), now + window);
        }
        let current: i64 = std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RemoteError::Protocol("value is not an integer".into()))?;
        let next = current + 1;
        entry.data = next.to_string().into_bytes();
        let remaining = entry
            .expires_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(window);
        Ok((next, remaining))
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.check()
    }

    async fn memory_usage(&self) -> Result<Option<String>, RemoteError> {
        self.check()?;
        let bytes: usize = self
            .entries
            .iter()
            .map(|e| e.key().len() + e.value().data.len())
            .sum();
        Ok(Some(format!("{bytes}B")))
    }
}

/// Connector handing out a shared [`MemoryStore`]; fails while it is down.
#[derive(Clone)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<DynRemoteStore, RemoteError> {
        if !self.store.is_available() {
            return Err(RemoteError::Connection("connection refused".into()));
        }
        let store: DynRemoteStore = self.store.clone();
        Ok(store)
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

/// Redis-style glob matching for `*`, `?` and backslash escapes.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_at(&p, &t)
}

fn glob_match_at(p: &[char], t: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('*') => (0..=t.len()).any(|i| glob_match_at(&p[1..], &t[i..])),
        Some('?') => !t.is_empty() && glob_match_at(&p[1..], &t[1..]),
        Some('\\') if p.len() > 1 => {
            t.first() == Some(&p[1]) && glob_match_at(&p[2..], &t[1..])
        }
        Some(c) => t.first() == Some(c) && glob_match_at(&p[1..], &t[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("ns|a|*", "ns|a|b"));
        assert!(!glob_match("ns|a|*", "ns|ab"));
        assert!(glob_match("a\\*b", "a*b"));
        assert!(!glob_match("a\\*b", "axb"));
        assert!(glob_match("k?", "k1"));
    }

    #[tokio::test]
    async fn test_scan_visits_every_key() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store
                .set(&format!("ns|{i}"), b"v", Duration::from_secs(60))
                .await
                .unwrap();
        }
        store.set("other|1", b"v", Duration::from_secs(60)).await.unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, keys) = store.scan(cursor, "ns|*", 10).await.unwrap();
            seen.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 25);
    }

    #[tokio::test]
    async fn test_scan_survives_deletes_between_steps() {
        let store = MemoryStore::new();
        for i in 0..10 {
            store
                .set(&format!("ns|{i}"), b"v", Duration::from_secs(60))
                .await
                .unwrap();
        }

        let mut cursor = 0;
        let mut removed = 0;
        loop {
            let (next, keys) = store.scan(cursor, "ns|*", 3).await.unwrap();
            removed += store.del(&keys).await.unwrap();
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(removed, 10);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_operations() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(RemoteError::Connection(_))
        ));
        assert!(store.connector().connect().await.is_err());
    }

    #[tokio::test]
    async fn test_incr_counts_within_window() {
        let store = MemoryStore::new();
        let (first, _) = store.incr("c", Duration::from_secs(60)).await.unwrap();
        let (second, ttl) = store.incr("c", Duration::from_secs(60)).await.unwrap();
        assert_eq!((first, second), (1, 2));
        assert!(ttl <= Duration::from_secs(60));
    }
}
