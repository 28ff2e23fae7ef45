use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{CacheError, CacheResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    /// Local (L1) tier configuration
    #[serde(default)]
    pub local: LocalCacheConfig,
    /// Redis (L2) tier configuration
    #[serde(default)]
    pub redis: RedisConfig,
    /// Compression, single-flight and stale-while-revalidate settings
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.local.max_entries == 0 {
            return Err("local.max_entries must be > 0".into());
        }
        if self.local.default_ttl_ms == 0 {
            return Err("local.default_ttl_ms must be > 0".into());
        }
        if let Some((ns, _)) = self.local.ttl_overrides_ms.iter().find(|(_, ttl)| **ttl == 0) {
            return Err(format!("local.ttl_overrides_ms.{ns} must be > 0"));
        }
        if self.redis.enabled {
            if self.redis.url.trim().is_empty() {
                return Err("redis.url must be set when redis is enabled".into());
            }
            if self.redis.timeout_ms == 0 {
                return Err("redis.timeout_ms must be > 0".into());
            }
            if self.redis.scan_batch_size == 0 {
                return Err("redis.scan_batch_size must be > 0".into());
            }
            if self.redis.reconnect_interval_ms == 0 {
                return Err("redis.reconnect_interval_ms must be > 0".into());
            }
        }
        if !(0.0..=1.0).contains(&self.policy.stale_ratio) {
            return Err("policy.stale_ratio must be within 0.0..=1.0".into());
        }
        Ok(())
    }

    /// Validate, mapping failures into the cache error taxonomy.
    pub fn checked(self) -> CacheResult<Self> {
        self.validate().map_err(CacheError::Configuration)?;
        Ok(self)
    }
}

/// Local (in-process) tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCacheConfig {
    /// Maximum number of entries held in memory
    #[serde(default = "default_local_max_entries")]
    pub max_entries: u64,

    /// TTL applied when a write does not specify one
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Per-namespace TTL overrides, e.g. `"resume:parse" = 2592000000`
    #[serde(default)]
    pub ttl_overrides_ms: HashMap<String, u64>,
}

fn default_local_max_entries() -> u64 {
    10_000
}

fn default_ttl_ms() -> u64 {
    3_600_000 // 1 hour
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_local_max_entries(),
            default_ttl_ms: default_ttl_ms(),
            ttl_overrides_ms: HashMap::new(),
        }
    }
}

impl LocalCacheConfig {
    /// TTL for writes into `namespace` that do not carry their own.
    pub fn ttl_for(&self, namespace: &str) -> Duration {
        let ms = self
            .ttl_overrides_ms
            .get(namespace)
            .copied()
            .unwrap_or(self.default_ttl_ms);
        Duration::from_millis(ms)
    }
}

/// Redis configuration for the shared tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades without it)
    /// Default: false (local-only)
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Force TLS (`rediss://`) even when the URL says `redis://`
    #[serde(default)]
    pub tls: bool,

    /// Prefix prepended to every remote key
    #[serde(default)]
    pub key_prefix: String,

    /// Defer connecting until the first cache operation
    #[serde(default)]
    pub lazy_connect: bool,

    /// Base reconnect delay; attempt N waits N times this value
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Upper bound for a single reconnect delay
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Consecutive failed attempts before the client gives up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Interval of the supervisory connection check
    #[serde(default = "default_supervisor_interval_ms")]
    pub supervisor_interval_ms: u64,

    /// COUNT hint for SCAN during namespace invalidation
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,

    /// Log one in N remote errors
    #[serde(default = "default_error_log_sample_rate")]
    pub error_log_sample_rate: u64,

    /// Deletes/invalidations remembered during an outage and replayed on
    /// reconnect; the oldest are dropped beyond this
    #[serde(default = "default_max_pending_invalidations")]
    pub max_pending_invalidations: usize,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_reconnect_interval_ms() -> u64 {
    500
}

fn default_max_reconnect_delay_ms() -> u64 {
    10_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_redis_timeout_ms() -> u64 {
    2_000
}

fn default_supervisor_interval_ms() -> u64 {
    30_000
}

fn default_scan_batch_size() -> usize {
    100
}

fn default_error_log_sample_rate() -> u64 {
    50
}

fn default_max_pending_invalidations() -> usize {
    1_000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            tls: false,
            key_prefix: String::new(),
            lazy_connect: false,
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            timeout_ms: default_redis_timeout_ms(),
            supervisor_interval_ms: default_supervisor_interval_ms(),
            scan_batch_size: default_scan_batch_size(),
            error_log_sample_rate: default_error_log_sample_rate(),
            max_pending_invalidations: default_max_pending_invalidations(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let ms = self
            .reconnect_interval_ms
            .saturating_mul(u64::from(attempt.max(1)))
            .min(self.max_reconnect_delay_ms);
        Duration::from_millis(ms)
    }

    /// Connection URL with the TLS flag applied.
    pub fn effective_url(&self) -> String {
        match self.url.strip_prefix("redis://") {
            Some(rest) if self.tls => format!("rediss://{rest}"),
            _ => self.url.clone(),
        }
    }
}

/// Policy knobs shared by the specialized cache helpers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Serialized size above which values are stored compressed
    #[serde(default = "default_compression_threshold_bytes")]
    pub compression_threshold_bytes: usize,

    /// Collapse concurrent misses on one key into a single fetch
    #[serde(default = "default_single_flight")]
    pub single_flight: bool,

    /// Fraction of the TTL after which a hit is considered stale
    #[serde(default = "default_stale_ratio")]
    pub stale_ratio: f64,
}

fn default_compression_threshold_bytes() -> usize {
    100 * 1024
}

fn default_single_flight() -> bool {
    true
}

fn default_stale_ratio() -> f64 {
    0.8
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            compression_threshold_bytes: default_compression_threshold_bytes(),
            single_flight: default_single_flight(),
            stale_ratio: default_stale_ratio(),
        }
    }
}

pub mod loader {
    use super::CacheConfig;
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    pub fn load_config(path: Option<&str>) -> Result<CacheConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                let default_path = PathBuf::from("tiercache.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., TIERCACHE__REDIS__ENABLED=true
        builder = builder.add_source(
            Environment::with_prefix("TIERCACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: CacheConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_config_with_default_path<P: AsRef<Path>>(
        path: Option<P>,
    ) -> Result<CacheConfig, String> {
        let p = path
            .as_ref()
            .map(|p| p.as_ref().to_string_lossy().to_string());
        load_config(p.as_deref())
    }

    /// Parse an inline TOML document (no environment overrides).
    pub fn from_toml_str(content: &str) -> Result<CacheConfig, String> {
        let cfg: CacheConfig =
            toml::from_str(content).map_err(|e| format!("config parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
