//! Cache metrics.
//!
//! Every event is recorded twice: through the `metrics` facade (picked up by
//! whatever exporter the host process installs) and in process-local atomic
//! counters that back [`crate::CacheStats`].

use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_ENTRIES: &str = "cache_entries";
    pub const CACHE_REMOTE_ERRORS_TOTAL: &str = "cache_remote_errors_total";
    pub const CACHE_REMOTE_RECONNECTS_TOTAL: &str = "cache_remote_reconnects_total";
}

/// Which tier served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Remote,
}

impl Tier {
    pub fn label(self) -> &'static str {
        match self {
            Tier::Local => "L1",
            Tier::Remote => "L2",
        }
    }
}

/// Monotonic hit/miss counters of one cache instance.
#[derive(Debug, Default)]
pub struct CacheCounters {
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheCounters {
    pub fn record_hit(&self, tier: Tier) {
        match tier {
            Tier::Local => self.local_hits.fetch_add(1, Ordering::Relaxed),
            Tier::Remote => self.remote_hits.fetch_add(1, Ordering::Relaxed),
        };
        counter!(names::CACHE_HITS_TOTAL, "tier" => tier.label()).increment(1);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_MISSES_TOTAL).increment(1);
    }

    pub fn local_hits(&self) -> u64 {
        self.local_hits.load(Ordering::Relaxed)
    }

    pub fn remote_hits(&self) -> u64 {
        self.remote_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Monotonic counters of the remote client.
#[derive(Debug, Default)]
pub struct RemoteCounters {
    errors: AtomicU64,
    reconnects: AtomicU64,
}

impl RemoteCounters {
    /// Returns the error count including this one.
    pub fn record_error(&self) -> u64 {
        counter!(names::CACHE_REMOTE_ERRORS_TOTAL).increment(1);
        self.errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_reconnect(&self) {
        counter!(names::CACHE_REMOTE_RECONNECTS_TOTAL).increment(1);
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

/// Publish the current entry count of a tier.
pub fn set_cache_entries(tier: Tier, count: u64) {
    gauge!(names::CACHE_ENTRIES, "tier" => tier.label()).set(count as f64);
}
