//! Two-tier cache façade: local (L1) moka cache in front of the remote (L2)
//! client.

use dashmap::{DashMap, DashSet};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::clock::{SharedClock, system_clock};
use crate::config::CacheConfig;
use crate::error::CacheResult;
use crate::key::{KeyPart, build_key, key_prefix};
use crate::local::LocalCache;
use crate::metrics::{CacheCounters, Tier};
use crate::remote::{ConnectionState, Connector, HealthReport, RemoteClient};

/// Per-write options for [`CacheBackend::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Explicit TTL; the namespace default applies when `None`.
    pub ttl: Option<Duration>,
    /// Write the local tier only.
    pub skip_remote: bool,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            skip_remote: false,
        }
    }

    pub fn local_only() -> Self {
        Self {
            ttl: None,
            skip_remote: true,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_skip_remote(mut self, skip_remote: bool) -> Self {
        self.skip_remote = skip_remote;
        self
    }
}

/// Deployment mode of a cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Single instance: local tier only.
    Local,
    /// Local tier in front of a shared Redis tier.
    Redis,
}

/// Entries removed by [`CacheBackend::invalidate_namespace`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub local: usize,
    /// `None` when the remote tier was skipped or became unavailable.
    pub remote: Option<u64>,
}

/// Severity of a [`Recommendation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationLevel {
    Critical,
    High,
    Medium,
}

/// Operational advice derived from a stats snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub level: RecommendationLevel,
    pub message: String,
    pub action: String,
}

/// Point-in-time snapshot of a cache instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub mode: CacheMode,
    pub local_entries: u64,
    pub local_capacity: u64,
    pub remote_state: ConnectionState,
    pub local_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub remote_errors: u64,
    pub remote_reconnects: u64,
    /// Remote deletes waiting for the store to come back.
    pub pending_invalidations: usize,
    pub last_health: Option<HealthReport>,
}

impl CacheStats {
    /// Hits over lookups, `0.0` before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.local_hits + self.remote_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Local tier fill level in percent.
    pub fn local_usage_percent(&self) -> f64 {
        if self.local_capacity == 0 {
            return 0.0;
        }
        self.local_entries as f64 * 100.0 / self.local_capacity as f64
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        let mut out = Vec::new();

        if self.mode == CacheMode::Local {
            out.push(Recommendation {
                level: RecommendationLevel::High,
                message: "Redis is not enabled. Enable it to share cached results across instances."
                    .into(),
                action: "Set redis.enabled and redis.url".into(),
            });
        }

        if matches!(
            self.remote_state,
            ConnectionState::Error | ConnectionState::Failed
        ) {
            out.push(Recommendation {
                level: RecommendationLevel::Critical,
                message: "Redis connection error. Check Redis server status.".into(),
                action: "Verify Redis connection and credentials".into(),
            });
        }

        let usage = self.local_usage_percent();
        if usage > 80.0 {
            out.push(Recommendation {
                level: RecommendationLevel::Medium,
                message: format!(
                    "Local cache is {usage:.0}% full. Consider increasing capacity."
                ),
                action: "Increase local.max_entries".into(),
            });
        }

        out
    }
}

/// Two-tier cache: local moka cache (L1) + optional remote store (L2).
///
/// ## Lookup Order
///
/// 1. L1, microsecond latency
/// 2. L2, millisecond latency; a hit is promoted into L1 with the remaining
///    remote TTL
/// 3. absent
///
/// Remote problems never surface here: the remote client absorbs them and
/// the cache behaves as local-only until it recovers.
///
/// Cheap to clone; clones share both tiers.
#[derive(Clone)]
pub struct CacheBackend {
    local: LocalCache,
    remote: RemoteClient,
    config: Arc<CacheConfig>,
    counters: Arc<CacheCounters>,
    mode: CacheMode,
    clock: SharedClock,
    /// Per-key locks held by single-flight `wrap` leaders.
    pub(crate) flights: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Keys with a stale-while-revalidate refresh in flight.
    pub(crate) refreshing: Arc<DashSet<String>>,
    /// Cancels background refreshes on shutdown.
    pub(crate) background: CancellationToken,
}

impl std::fmt::Debug for CacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBackend")
            .field("mode", &self.mode)
            .field("local_capacity", &self.local.capacity())
            .field("remote", &self.remote)
            .finish()
    }
}

impl CacheBackend {
    /// A local-only cache with default settings.
    pub fn new_local() -> Self {
        Self::assemble(
            CacheConfig::default(),
            RemoteClient::disabled(system_clock()),
            system_clock(),
        )
    }

    pub fn builder(config: CacheConfig) -> CacheBackendBuilder {
        CacheBackendBuilder {
            config,
            clock: None,
            connector: None,
        }
    }

    /// Validate `config`, build both tiers and start the remote client.
    pub async fn from_config(config: CacheConfig) -> CacheResult<Self> {
        Self::builder(config).build().await
    }

    fn assemble(config: CacheConfig, remote: RemoteClient, clock: SharedClock) -> Self {
        let mode = if remote.is_configured() || config.redis.enabled {
            CacheMode::Redis
        } else {
            CacheMode::Local
        };

        Self {
            local: LocalCache::new(config.local.max_entries, clock.clone()),
            remote,
            config: Arc::new(config),
            counters: Arc::new(CacheCounters::default()),
            mode,
            clock,
            flights: Arc::new(DashMap::new()),
            refreshing: Arc::new(DashSet::new()),
            background: CancellationToken::new(),
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// The remote client shared with sibling components such as rate counters.
    pub fn remote(&self) -> &RemoteClient {
        &self.remote
    }

    /// TTL applied to writes in `namespace` without an explicit TTL.
    pub fn default_ttl(&self, namespace: &str) -> Duration {
        self.config.local.ttl_for(namespace)
    }

    /// Get a value, checking L1 then L2.
    ///
    /// A stored payload that no longer decodes as `T` is reported as a miss.
    pub async fn get<T: DeserializeOwned>(
        &self,
        namespace: &str,
        parts: &[KeyPart],
    ) -> CacheResult<Option<T>> {
        let key = build_key(namespace, parts)?;
        let Some(data) = self.lookup(namespace, &key).await else {
            return Ok(None);
        };

        match serde_json::from_slice(&data) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cached payload failed to decode");
                Ok(None)
            }
        }
    }

    /// Get the stored bytes without decoding.
    pub async fn get_raw(
        &self,
        namespace: &str,
        parts: &[KeyPart],
    ) -> CacheResult<Option<Arc<Vec<u8>>>> {
        let key = build_key(namespace, parts)?;
        Ok(self.lookup(namespace, &key).await)
    }

    /// Store a value in L1 and, unless opted out, L2.
    ///
    /// Returns `false` without storing anything when `value` serializes to
    /// JSON `null`. The remote write is awaited; its failure is logged by the
    /// remote client and otherwise ignored.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        parts: &[KeyPart],
        value: &T,
        options: SetOptions,
    ) -> CacheResult<bool> {
        let key = build_key(namespace, parts)?;
        let data = serde_json::to_vec(value)?;
        if data == b"null" {
            tracing::debug!(key = %key, "skipping cache write of null value");
            return Ok(false);
        }
        self.store(namespace, &key, data, options).await;
        Ok(true)
    }

    /// Store bytes as-is.
    pub async fn set_raw(
        &self,
        namespace: &str,
        parts: &[KeyPart],
        data: Vec<u8>,
        options: SetOptions,
    ) -> CacheResult<()> {
        let key = build_key(namespace, parts)?;
        self.store(namespace, &key, data, options).await;
        Ok(())
    }

    /// Remove a key from both tiers. Returns whether either tier held it.
    pub async fn delete(&self, namespace: &str, parts: &[KeyPart]) -> CacheResult<bool> {
        let key = build_key(namespace, parts)?;
        let local = self.local.remove(&key).await;
        let remote = self.remote.del(&key).await.unwrap_or(0) > 0;
        tracing::debug!(key = %key, local, remote, "cache delete");
        Ok(local || remote)
    }

    /// Remove the key of `(namespace, parts)` and every key below it from
    /// both tiers.
    ///
    /// With empty `parts` this clears the whole namespace. The remote side is
    /// a cursor scan deleting batch by batch. When the remote tier is
    /// unavailable the remote part is queued until it reconnects.
    pub async fn invalidate_namespace(
        &self,
        namespace: &str,
        parts: &[KeyPart],
    ) -> CacheResult<InvalidationReport> {
        let prefix = key_prefix(namespace, parts)?;
        let local = self.local.invalidate_prefix(&prefix).await;
        let remote = self.remote.delete_tree(&prefix).await;

        tracing::info!(
            prefix = %prefix,
            local,
            remote = ?remote,
            "cache namespace invalidated"
        );
        Ok(InvalidationReport { local, remote })
    }

    /// Snapshot of both tiers and the counters.
    pub async fn stats(&self) -> CacheStats {
        self.local.sync().await;
        let remote = self.remote.counters();
        CacheStats {
            mode: self.mode,
            local_entries: self.local.entry_count(),
            local_capacity: self.local.capacity(),
            remote_state: self.remote.state(),
            local_hits: self.counters.local_hits(),
            remote_hits: self.counters.remote_hits(),
            misses: self.counters.misses(),
            remote_errors: remote.errors(),
            remote_reconnects: remote.reconnects(),
            pending_invalidations: self.remote.pending_invalidations(),
            last_health: self.remote.last_health(),
        }
    }

    /// Probe the remote tier. `None` in local mode.
    pub async fn health_check(&self) -> Option<HealthReport> {
        if self.mode == CacheMode::Local {
            return None;
        }
        Some(self.remote.health_check().await)
    }

    /// Drop every local entry. The remote tier is untouched.
    pub async fn clear_local(&self) {
        self.local.clear().await;
    }

    /// Cancel background work and close the remote client.
    pub async fn shutdown(&self) {
        self.background.cancel();
        self.remote.close().await;
        tracing::info!("Cache shut down");
    }

    /// Local-tier read that records a hit but never a miss.
    pub(crate) async fn peek_local<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.local.get(key).await?;
        let value = serde_json::from_slice(&entry.data).ok()?;
        self.counters.record_hit(Tier::Local);
        Some(value)
    }

    async fn lookup(&self, namespace: &str, key: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(entry) = self.local.get(key).await {
            tracing::debug!(key = %key, "cache hit (L1)");
            self.counters.record_hit(Tier::Local);
            return Some(entry.data);
        }

        if let Some(value) = self.remote.get(key).await {
            tracing::debug!(key = %key, "cache hit (L2)");
            self.counters.record_hit(Tier::Remote);

            let ttl = value.ttl.unwrap_or_else(|| self.default_ttl(namespace));
            let data = Arc::new(value.data);
            self.local.insert(key, Arc::clone(&data), ttl).await;
            return Some(data);
        }

        tracing::debug!(key = %key, "cache miss");
        self.counters.record_miss();
        None
    }

    async fn store(&self, namespace: &str, key: &str, data: Vec<u8>, options: SetOptions) {
        let ttl = options.ttl.unwrap_or_else(|| self.default_ttl(namespace));
        let data = Arc::new(data);
        self.local.insert(key, Arc::clone(&data), ttl).await;

        if options.skip_remote {
            tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache set (L1)");
            return;
        }

        let mirrored = self.remote.set(key, &data, ttl).await;
        tracing::debug!(
            key = %key,
            ttl_ms = ttl.as_millis() as u64,
            mirrored,
            "cache set"
        );
    }
}

/// Assembles a [`CacheBackend`] with an injected clock or remote connector.
pub struct CacheBackendBuilder {
    config: CacheConfig,
    clock: Option<SharedClock>,
    connector: Option<Arc<dyn Connector>>,
}

impl CacheBackendBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `connector` for the remote tier instead of the configured Redis URL.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Validate the configuration, build the tiers and start the remote
    /// client (connecting now unless `lazy_connect` is set).
    pub async fn build(self) -> CacheResult<CacheBackend> {
        let config = self.config.checked()?;
        let clock = self.clock.unwrap_or_else(system_clock);

        let remote = match self.connector {
            Some(connector) => RemoteClient::new(config.redis.clone(), connector, clock.clone()),
            None => RemoteClient::from_config(&config.redis, clock.clone()),
        };
        remote.start().await;

        let backend = CacheBackend::assemble(config, remote, clock);
        tracing::info!(
            mode = ?backend.mode,
            max_entries = backend.local.capacity(),
            remote_state = %backend.remote.state(),
            "Cache initialized"
        );
        Ok(backend)
    }
}
