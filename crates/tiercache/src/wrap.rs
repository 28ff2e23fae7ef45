//! Read-through helper: compute on miss, populate, return.

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::backend::{CacheBackend, SetOptions};
use crate::error::CacheError;
use crate::key::{KeyPart, build_key};

/// What to look up and how to store a freshly computed value.
#[derive(Debug, Clone, PartialEq)]
pub struct WrapOptions {
    pub namespace: String,
    pub key_parts: Vec<KeyPart>,
    pub ttl: Option<Duration>,
    /// Skip the lookup and always compute.
    pub force_refresh: bool,
    pub skip_remote: bool,
}

impl WrapOptions {
    pub fn new(namespace: impl Into<String>, key_parts: Vec<KeyPart>) -> Self {
        Self {
            namespace: namespace.into(),
            key_parts,
            ttl: None,
            force_refresh: false,
            skip_remote: false,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn skip_remote(mut self, skip_remote: bool) -> Self {
        self.skip_remote = skip_remote;
        self
    }

    fn set_options(&self) -> SetOptions {
        SetOptions {
            ttl: self.ttl,
            skip_remote: self.skip_remote,
        }
    }
}

type Flights = DashMap<String, Arc<Mutex<()>>>;

/// Membership in the single-flight group of one key.
///
/// Dropping the last member removes the key's lock from the map, also when
/// the `wrap` future is cancelled mid-fetch.
struct Flight {
    flights: Arc<Flights>,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl Flight {
    fn join(flights: &Arc<Flights>, key: String) -> Self {
        let lock = Arc::clone(flights.entry(key.clone()).or_default().value());
        Self {
            flights: Arc::clone(flights),
            key,
            lock,
        }
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        // Release our handle first so the map holds the only other one.
        drop(std::mem::take(&mut self.lock));
        self.flights
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// A value returned by [`CacheBackend::wrap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wrapped<T> {
    pub value: T,
    /// Whether the value came from the cache rather than `fetch`.
    pub hit: bool,
}

impl CacheBackend {
    /// Return the cached value or compute, store and return it.
    ///
    /// `fetch` runs at most once per call. Its error is returned unchanged and
    /// nothing is cached. With `policy.single_flight` enabled, concurrent
    /// misses on one key queue behind the first caller and then re-read the
    /// cache, so a burst of misses costs one computation. A waiter whose
    /// leader failed runs its own `fetch`.
    pub async fn wrap<T, E, F, Fut>(&self, options: WrapOptions, fetch: F) -> Result<Wrapped<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = build_key(&options.namespace, &options.key_parts)?;

        if !options.force_refresh {
            if let Some(value) = self.get(&options.namespace, &options.key_parts).await? {
                return Ok(Wrapped { value, hit: true });
            }
        }

        if !self.config().policy.single_flight {
            return self.fetch_and_store(&options, fetch).await;
        }

        let flight = Flight::join(&self.flights, key);
        self.fly(&flight, &options, fetch).await
    }

    async fn fly<T, E, F, Fut>(
        &self,
        flight: &Flight,
        options: &WrapOptions,
        fetch: F,
    ) -> Result<Wrapped<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _leader = flight.lock.lock().await;

        // A previous leader may have stored the value after this caller's
        // miss, whether or not the lock was contended.
        if !options.force_refresh {
            if let Some(value) = self.peek_local(&flight.key).await {
                tracing::debug!(key = %flight.key, "single-flight caller served from cache");
                return Ok(Wrapped { value, hit: true });
            }
        }

        self.fetch_and_store(options, fetch).await
    }

    async fn fetch_and_store<T, E, F, Fut>(
        &self,
        options: &WrapOptions,
        fetch: F,
    ) -> Result<Wrapped<T>, E>
    where
        T: Serialize,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let value = fetch().await?;
        self.set(
            &options.namespace,
            &options.key_parts,
            &value,
            options.set_options(),
        )
        .await?;
        Ok(Wrapped { value, hit: false })
    }
}
