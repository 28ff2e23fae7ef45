//! Two-tier caching with graceful degradation.
//!
//! ## Architecture
//!
//! - **L1 (moka)**: in-memory, bounded, LRU, microsecond latency, per-instance
//! - **L2 (Redis)**: network, millisecond latency, shared across instances
//!
//! ## Cache Hierarchy
//!
//! ```text
//! get → L1 (moka) → L2 (Redis) → caller computes (wrap)
//!           ↓            ↓               ↓
//!       <1µs latency  ~5ms latency   whatever fetch costs
//! ```
//!
//! ## Graceful Degradation
//!
//! If Redis is disabled, unreachable or slow, every remote operation becomes
//! a silent miss and the cache runs L1-only. Remote errors never reach the
//! caller; only [`CacheError`] (bad namespace, unserializable value) and the
//! caller's own fetch errors do.
//!
//! ```no_run
//! use std::time::Duration;
//! use tiercache::{CacheBackend, CacheConfig, SetOptions, key_parts};
//!
//! # async fn demo() -> Result<(), tiercache::CacheError> {
//! let cache = CacheBackend::from_config(CacheConfig::default()).await?;
//! let parts = key_parts!["user1", "resume1"];
//! cache
//!     .set("job:analysis", &parts, &42u32, SetOptions::ttl(Duration::from_secs(60)))
//!     .await?;
//! let score: Option<u32> = cache.get("job:analysis", &parts).await?;
//! assert_eq!(score, Some(42));
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod clock;
pub mod config;
pub mod counter;
pub mod error;
pub mod key;
pub mod local;
pub mod metrics;
pub mod observability;
pub mod policy;
pub mod remote;
pub mod wrap;

pub use backend::{
    CacheBackend, CacheBackendBuilder, CacheMode, CacheStats, InvalidationReport, Recommendation,
    RecommendationLevel, SetOptions,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{CacheConfig, LocalCacheConfig, PolicyConfig, RedisConfig};
pub use counter::{CounterValue, RateCounter};
pub use error::{CacheError, CacheResult};
pub use key::{KEY_SEPARATOR, KeyPart, build_key, key_prefix};
pub use local::{CachedEntry, LocalCache};
pub use observability::{
    apply_logging_level, cache_directives, init_tracing, init_tracing_with_level,
};
pub use policy::{BatchGet, BatchSet, Revalidated, StoredAs, SwrOptions};
pub use remote::{ConnectionState, HealthReport, MemoryStore, RemoteClient};
pub use wrap::{WrapOptions, Wrapped};
