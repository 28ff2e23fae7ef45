//! Stale-while-revalidate.
//!
//! Values are stored inside a [`Stamped`] envelope carrying the time they
//! were cached. A hit older than the stale threshold is returned at once and
//! one background task per key recomputes it. Refresh failures are logged
//! only; the caller already has its value.

use dashmap::DashSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::backend::{CacheBackend, SetOptions};
use crate::error::{CacheError, CacheResult};
use crate::key::{KeyPart, build_key};

/// Stored form of a revalidated value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub value: T,
    pub cached_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwrOptions {
    pub namespace: String,
    pub key_parts: Vec<KeyPart>,
    /// Full lifetime of an entry; the namespace default when `None`.
    pub ttl: Option<Duration>,
    /// Age after which a hit triggers a refresh; `policy.stale_ratio × ttl`
    /// when `None`.
    pub stale_after: Option<Duration>,
}

impl SwrOptions {
    pub fn new(namespace: impl Into<String>, key_parts: Vec<KeyPart>) -> Self {
        Self {
            namespace: namespace.into(),
            key_parts,
            ttl: None,
            stale_after: None,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }
}

/// Result of [`CacheBackend::get_or_revalidate`].
#[derive(Debug)]
pub struct Revalidated<T> {
    pub value: T,
    pub hit: bool,
    pub stale: bool,
    /// The background refresh started by this call, if any.
    pub refresh: Option<JoinHandle<()>>,
}

impl CacheBackend {
    /// Serve from cache, refreshing stale hits in the background.
    ///
    /// On a miss `fetch` runs inline and its error is returned unchanged. On a
    /// stale hit `fetch` moves into a background task unless a refresh of the
    /// same key is already running.
    pub async fn get_or_revalidate<T, E, F, Fut>(
        &self,
        options: SwrOptions,
        fetch: F,
    ) -> Result<Revalidated<T>, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: From<CacheError> + Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = build_key(&options.namespace, &options.key_parts)?;
        let ttl = options
            .ttl
            .unwrap_or_else(|| self.default_ttl(&options.namespace));
        let stale_after = options
            .stale_after
            .unwrap_or_else(|| ttl.mul_f64(self.config().policy.stale_ratio));

        let cached: Option<Stamped<T>> = self.get(&options.namespace, &options.key_parts).await?;
        if let Some(stamped) = cached {
            let age = self.clock().now_ms().saturating_sub(stamped.cached_at_ms);
            let stale = u128::from(age) > stale_after.as_millis();
            let refresh = if stale {
                self.spawn_refresh(key, options, ttl, fetch)
            } else {
                None
            };
            return Ok(Revalidated {
                value: stamped.value,
                hit: true,
                stale,
                refresh,
            });
        }

        let value = fetch().await?;
        store_stamped(self, &options, ttl, &value).await?;
        Ok(Revalidated {
            value,
            hit: false,
            stale: false,
            refresh: None,
        })
    }

    fn spawn_refresh<T, E, F, Fut>(
        &self,
        key: String,
        options: SwrOptions,
        ttl: Duration,
        fetch: F,
    ) -> Option<JoinHandle<()>>
    where
        T: Serialize + Send + Sync + 'static,
        E: Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if !self.refreshing.insert(key.clone()) {
            tracing::debug!(key = %key, "refresh already in flight");
            return None;
        }
        let slot = RefreshSlot {
            refreshing: Arc::clone(&self.refreshing),
            key: key.clone(),
        };

        let cache = self.clone();
        Some(tokio::spawn(async move {
            let _slot = slot;
            tokio::select! {
                _ = cache.background.cancelled() => {
                    tracing::debug!(key = %key, "background refresh cancelled");
                }
                result = fetch() => match result {
                    Ok(value) => match store_stamped(&cache, &options, ttl, &value).await {
                        Ok(()) => tracing::debug!(key = %key, "background refresh stored"),
                        Err(e) => tracing::warn!(key = %key, error = %e, "background refresh not stored"),
                    },
                    Err(e) => tracing::warn!(key = %key, error = %e, "background refresh failed"),
                },
            }
        }))
    }
}

/// Marks a key as refreshing until dropped, including when the refresh
/// panics or its task is aborted.
struct RefreshSlot {
    refreshing: Arc<DashSet<String>>,
    key: String,
}

impl Drop for RefreshSlot {
    fn drop(&mut self) {
        self.refreshing.remove(&self.key);
    }
}

async fn store_stamped<T: Serialize>(
    cache: &CacheBackend,
    options: &SwrOptions,
    ttl: Duration,
    value: &T,
) -> CacheResult<()> {
    let stamped = Stamped {
        value,
        cached_at_ms: cache.clock().now_ms(),
    };
    cache
        .set(
            &options.namespace,
            &options.key_parts,
            &stamped,
            SetOptions::ttl(ttl),
        )
        .await?;
    Ok(())
}
