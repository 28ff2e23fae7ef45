//! Remote (L2) tier client.
//!
//! ## Connection lifecycle
//!
//! ```text
//! Disabled ──► Connecting ──► Ready ◄──────────────┐
//!                  │            │                  │
//!                  ▼            ▼ (network error)  │
//!                Error ──► Reconnecting ───────────┘
//!                               │ (attempts exhausted / unrecoverable)
//!                               ▼
//!                             Failed
//!
//! any state ──► Closed (shutdown)
//! ```
//!
//! Reconnect attempt `n` waits `min(n × reconnect_interval, max_reconnect_delay)`.
//! A supervisory timer pings the connection periodically, catching sockets
//! that died silently, and revives a client that gave up after exhausting
//! its attempts.
//!
//! ## Graceful degradation
//!
//! Every operation is guarded: when the client is not `Ready` the call is a
//! no-op that reports a miss. Operations are bounded by `timeout_ms`; errors
//! are counted and logged at a sampled rate so an outage does not flood the
//! logs.
//!
//! Deletes and prefix invalidations that could not reach the store are
//! queued (bounded by `max_pending_invalidations`) and replayed on the new
//! connection before it is published as `Ready`, so a delete issued during
//! an outage still takes effect once the store is back.

pub mod memory;
pub mod redis;
pub mod store;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::clock::SharedClock;
use crate::config::RedisConfig;
use crate::key::KEY_SEPARATOR;
use crate::metrics::RemoteCounters;

pub use memory::{MemoryConnector, MemoryStore};
pub use redis::{RedisConnector, RedisStore};
pub use store::{Connector, DynRemoteStore, RemoteError, RemoteStore, RemoteValue, escape_glob};

/// Connection state of the remote client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not configured, or configured for lazy connect and not used yet.
    Disabled,
    Connecting,
    Ready,
    Reconnecting,
    /// The connection was lost; a reconnect cycle is about to start.
    Error,
    /// Shut down; terminal.
    Closed,
    /// Gave up reconnecting, or hit an unrecoverable error.
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disabled => "disabled",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the last health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub latency_ms: u64,
    pub used_memory: Option<String>,
    pub checked_at_ms: u64,
    pub error: Option<String>,
}

/// A delete that could not be applied to the store yet. Keys are prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingInvalidation {
    Key(String),
    Tree(String),
}

/// An established connection and the generation that produced it.
struct Connection {
    store: DynRemoteStore,
    generation: u64,
}

struct Inner {
    connector: Option<Arc<dyn Connector>>,
    config: RedisConfig,
    clock: SharedClock,
    state: Mutex<ConnectionState>,
    connection: ArcSwapOption<Connection>,
    generation: AtomicU64,
    reconnecting: AtomicBool,
    fatal: AtomicBool,
    failed_attempts: AtomicU32,
    connect_lock: tokio::sync::Mutex<()>,
    counters: RemoteCounters,
    last_health: Mutex<Option<HealthReport>>,
    pending: Mutex<VecDeque<PendingInvalidation>>,
    supervisor_started: AtomicBool,
    cancel: CancellationToken,
}

/// Client for the shared key-value tier.
///
/// Cheap to clone; clones share one connection and one state machine.
/// Call [`RemoteClient::close`] to stop background tasks.
#[derive(Clone)]
pub struct RemoteClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("state", &self.state())
            .field("key_prefix", &self.inner.config.key_prefix)
            .finish()
    }
}

impl RemoteClient {
    /// A client with no remote store; every operation is a miss.
    pub fn disabled(clock: SharedClock) -> Self {
        Self::build(None, RedisConfig::default(), clock, ConnectionState::Disabled)
    }

    /// A client that will connect through `connector`. Nothing happens until
    /// [`start`](Self::start) (or, with `lazy_connect`, the first operation).
    pub fn new(config: RedisConfig, connector: Arc<dyn Connector>, clock: SharedClock) -> Self {
        Self::build(Some(connector), config, clock, ConnectionState::Disabled)
    }

    /// Build a Redis client from configuration. Disabled configs and invalid
    /// URLs yield a client that never connects.
    pub fn from_config(config: &RedisConfig, clock: SharedClock) -> Self {
        if !config.enabled {
            tracing::info!("Redis disabled, using local cache only");
            return Self::disabled(clock);
        }

        match RedisConnector::from_config(config) {
            Ok(connector) => Self::new(config.clone(), Arc::new(connector), clock),
            Err(e) => {
                tracing::warn!(error = %e, "Invalid Redis configuration. Falling back to local cache.");
                let client = Self::build(None, config.clone(), clock, ConnectionState::Failed);
                client.inner.fatal.store(true, Ordering::SeqCst);
                client
            }
        }
    }

    fn build(
        connector: Option<Arc<dyn Connector>>,
        config: RedisConfig,
        clock: SharedClock,
        initial: ConnectionState,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                clock,
                state: Mutex::new(initial),
                connection: ArcSwapOption::empty(),
                generation: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                fatal: AtomicBool::new(false),
                failed_attempts: AtomicU32::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                counters: RemoteCounters::default(),
                last_health: Mutex::new(None),
                pending: Mutex::new(VecDeque::new()),
                supervisor_started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Connect (unless lazy) and start the supervisory timer.
    ///
    /// A failed initial connection is not an error: the client falls back to
    /// reconnecting in the background.
    pub async fn start(&self) {
        let Some(connector) = self.inner.connector.as_ref() else {
            return;
        };

        if !self.inner.config.lazy_connect && self.state() == ConnectionState::Disabled {
            tracing::info!(url = %connector.describe(), "Connecting to Redis");
            match self.connect_attempt().await {
                Ok(()) => tracing::info!("Connected to Redis"),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Failed to connect to Redis. Falling back to local cache."
                    );
                    self.handle_connect_failure(&e);
                }
            }
        }

        self.spawn_supervisor();
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Whether a remote store is configured at all.
    pub fn is_configured(&self) -> bool {
        self.inner.connector.is_some()
    }

    pub fn counters(&self) -> &RemoteCounters {
        &self.inner.counters
    }

    pub fn last_health(&self) -> Option<HealthReport> {
        self.inner.last_health.lock().clone()
    }

    pub fn key_prefix(&self) -> &str {
        &self.inner.config.key_prefix
    }

    /// Deletes waiting for the store to come back.
    pub fn pending_invalidations(&self) -> usize {
        self.inner.pending.lock().len()
    }

    // ---------------------------------------------------------------------
    // Guarded operations
    // ---------------------------------------------------------------------

    pub async fn get(&self, key: &str) -> Option<RemoteValue> {
        let key = self.prefixed(key);
        let key = &key;
        self.guarded("get", |s| async move { s.get(key).await })
            .await
            .flatten()
    }

    /// Returns whether the write was performed.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> bool {
        let key = self.prefixed(key);
        let key = &key;
        self.guarded("set", |s| async move { s.set(key, value, ttl).await })
            .await
            .is_some()
    }

    /// Returns the number of keys removed, or `None` if not performed, in
    /// which case the delete is queued for replay.
    pub async fn del(&self, key: &str) -> Option<u64> {
        self.invalidate(PendingInvalidation::Key(self.prefixed(key)))
            .await
    }

    /// Delete `base` and every key below it using incremental SCAN.
    ///
    /// Each SCAN step returns at most about `scan_batch_size` keys, which are
    /// deleted before the next step. Returns `None` if the remote tier was or
    /// became unavailable; the invalidation is then queued for replay.
    pub async fn delete_tree(&self, base: &str) -> Option<u64> {
        self.invalidate(PendingInvalidation::Tree(self.prefixed(base)))
            .await
    }

    /// Increment a windowed counter. Returns the count and the time left in
    /// the window, or `None` if not performed.
    pub async fn incr(&self, key: &str, window: Duration) -> Option<(i64, Duration)> {
        let key = self.prefixed(key);
        let key = &key;
        self.guarded("incr", |s| async move { s.incr(key, window).await })
            .await
    }

    /// Ping and memory probe for operational tooling. Not for the hot path.
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let result = self
            .guarded_result("health_check", |s| async move {
                s.ping().await?;
                s.memory_usage().await
            })
            .await;

        let report = match result {
            Ok(used_memory) => HealthReport {
                healthy: true,
                latency_ms: started.elapsed().as_millis() as u64,
                used_memory,
                checked_at_ms: self.inner.clock.now_ms(),
                error: None,
            },
            Err(e) => HealthReport {
                healthy: false,
                latency_ms: started.elapsed().as_millis() as u64,
                used_memory: None,
                checked_at_ms: self.inner.clock.now_ms(),
                error: Some(e.to_string()),
            },
        };

        *self.inner.last_health.lock() = Some(report.clone());
        report
    }

    /// Stop background tasks and drop the connection. Terminal.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Closed {
                tracing::info!(from = %*state, "Remote cache client closed");
            }
            *state = ConnectionState::Closed;
        }
        self.inner.connection.store(None);
    }

    fn prefixed(&self, key: &str) -> String {
        let prefix = &self.inner.config.key_prefix;
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}{key}")
        }
    }

    async fn guarded<T, F, Fut>(&self, op: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(DynRemoteStore) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.guarded_result(op, f).await.ok()
    }

    async fn guarded_result<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, RemoteError>
    where
        F: FnOnce(DynRemoteStore) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let conn = self.ready_connection().await.ok_or(RemoteError::Unavailable)?;
        let result = with_timeout(self.inner.config.timeout(), f(Arc::clone(&conn.store))).await;

        if let Err(e) = &result {
            self.on_operation_error(op, conn.generation, e);
        }
        result
    }

    async fn ready_connection(&self) -> Option<Arc<Connection>> {
        match self.state() {
            ConnectionState::Ready => self.inner.connection.load_full(),
            ConnectionState::Disabled if self.inner.config.lazy_connect => {
                self.inner.connector.as_ref()?;
                if let Err(e) = self.connect_attempt().await {
                    tracing::warn!(error = %e, "Lazy Redis connection failed");
                    self.handle_connect_failure(&e);
                    return None;
                }
                self.inner.connection.load_full()
            }
            _ => None,
        }
    }

    fn on_operation_error(&self, op: &'static str, generation: u64, e: &RemoteError) {
        let errors = self.inner.counters.record_error();
        let rate = self.inner.config.error_log_sample_rate;
        if should_log(errors, rate) {
            tracing::warn!(
                op,
                error = %e,
                errors_total = errors,
                sample_rate = rate,
                "remote cache operation failed"
            );
        }

        if e.is_fatal() {
            self.inner.fatal.store(true, Ordering::SeqCst);
            self.inner.connection.store(None);
            self.transition(ConnectionState::Failed);
        } else if e.is_connection_loss() {
            self.mark_broken(generation);
        }
    }

    /// Drop connection `generation` and start reconnecting, unless a newer
    /// connection has already replaced it.
    fn mark_broken(&self, generation: u64) {
        {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Ready
                || self.inner.generation.load(Ordering::SeqCst) != generation
            {
                return;
            }
            tracing::info!(from = %*state, to = %ConnectionState::Error, "Remote cache state change");
            *state = ConnectionState::Error;
        }
        self.inner.connection.store(None);
        self.spawn_reconnect();
    }

    /// Apply `op` now, or queue it until the store is reachable again.
    async fn invalidate(&self, mut op: PendingInvalidation) -> Option<u64> {
        let mut retried = false;
        loop {
            if let Some(removed) = self.apply_invalidation(&op).await {
                return Some(removed);
            }
            // The client may have become Ready between the failed attempt
            // and the enqueue; retry once before queueing regardless.
            match self.queue_invalidation(op, retried) {
                Ok(()) => return None,
                Err(back) => {
                    op = back;
                    retried = true;
                }
            }
        }
    }

    async fn apply_invalidation(&self, op: &PendingInvalidation) -> Option<u64> {
        match op {
            PendingInvalidation::Key(key) => {
                self.guarded("del", |s| async move { s.del(std::slice::from_ref(key)).await })
                    .await
            }
            PendingInvalidation::Tree(base) => {
                let conn = self.ready_connection().await?;
                let result = scan_delete(
                    conn.store.as_ref(),
                    base,
                    self.inner.config.scan_batch_size,
                    self.inner.config.timeout(),
                )
                .await;
                match result {
                    Ok(removed) => {
                        tracing::debug!(prefix = %base, removed, "remote prefix invalidation");
                        Some(removed)
                    }
                    Err(e) => {
                        self.on_operation_error("delete_tree", conn.generation, &e);
                        None
                    }
                }
            }
        }
    }

    /// Queue `op` for replay on the next connection.
    ///
    /// Hands `op` back when the client is `Ready` so the caller can apply it
    /// directly, unless `force` is set; forced entries are drained by the
    /// supervisor. The `pending` lock is taken before the state lock, the
    /// same order `connect_attempt` uses when publishing `Ready`.
    fn queue_invalidation(
        &self,
        op: PendingInvalidation,
        force: bool,
    ) -> Result<(), PendingInvalidation> {
        if !self.is_configured() || self.inner.fatal.load(Ordering::SeqCst) {
            return Ok(());
        }

        let limit = self.inner.config.max_pending_invalidations;
        if limit == 0 {
            return Ok(());
        }
        let mut pending = self.inner.pending.lock();
        match *self.inner.state.lock() {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Ready if !force => return Err(op),
            _ => {}
        }
        if pending.len() >= limit {
            if let Some(dropped) = pending.pop_front() {
                tracing::warn!(dropped = ?dropped, limit, "pending invalidation queue full, dropping oldest");
            }
        }
        pending.push_back(op);
        Ok(())
    }

    /// Apply queued invalidations on a fresh connection.
    ///
    /// On failure the unapplied entries go back to the front of the queue.
    async fn replay_pending(&self, store: &dyn RemoteStore) -> Result<(), RemoteError> {
        let pending: Vec<PendingInvalidation> = self.inner.pending.lock().drain(..).collect();
        if pending.is_empty() {
            return Ok(());
        }

        let timeout = self.inner.config.timeout();
        let batch = self.inner.config.scan_batch_size;
        let total = pending.len();
        let mut ops = pending.into_iter();
        while let Some(op) = ops.next() {
            let result = match &op {
                PendingInvalidation::Key(key) => {
                    with_timeout(timeout, store.del(std::slice::from_ref(key))).await
                }
                PendingInvalidation::Tree(base) => scan_delete(store, base, batch, timeout).await,
            };
            if let Err(e) = result {
                let mut queue = self.inner.pending.lock();
                for op in std::iter::once(op).chain(ops).rev() {
                    queue.push_front(op);
                }
                return Err(e);
            }
        }

        tracing::info!(replayed = total, "Replayed invalidations queued during remote outage");
        Ok(())
    }

    /// Replay entries queued while the client was already `Ready`.
    async fn drain_pending(&self) {
        if self.inner.pending.lock().is_empty() {
            return;
        }
        let Some(conn) = self.inner.connection.load_full() else {
            return;
        };
        if let Err(e) = self.replay_pending(conn.store.as_ref()).await {
            self.on_operation_error("replay", conn.generation, &e);
        }
    }

    // ---------------------------------------------------------------------
    // Connection state machine
    // ---------------------------------------------------------------------

    fn transition(&self, to: ConnectionState) -> bool {
        let mut state = self.inner.state.lock();
        if *state == ConnectionState::Closed {
            return false;
        }
        if *state != to {
            tracing::info!(from = %*state, to = %to, "Remote cache state change");
            *state = to;
        }
        true
    }

    /// One connection attempt bounded by the operation timeout.
    async fn connect_attempt(&self) -> Result<(), RemoteError> {
        let connector = self
            .inner
            .connector
            .as_ref()
            .ok_or(RemoteError::Unavailable)?;

        let _guard = self.inner.connect_lock.lock().await;
        match self.state() {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Closed => return Err(RemoteError::Unavailable),
            ConnectionState::Disabled => {
                self.transition(ConnectionState::Connecting);
            }
            _ => {}
        }

        let store = with_timeout(self.inner.config.timeout(), connector.connect()).await?;

        // Deletes issued while a replay runs land in the queue again, so
        // drain until it is empty under the lock that publishes Ready.
        loop {
            self.replay_pending(store.as_ref()).await?;
            if let Some(published) = self.publish_if_drained(&store) {
                return published;
            }
        }
    }

    /// Publish `store` as the `Ready` connection if nothing is queued.
    fn publish_if_drained(&self, store: &DynRemoteStore) -> Option<Result<(), RemoteError>> {
        let pending = self.inner.pending.lock();
        if !pending.is_empty() {
            return None;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.connection.store(Some(Arc::new(Connection {
            store: Arc::clone(store),
            generation,
        })));
        self.inner.failed_attempts.store(0, Ordering::SeqCst);

        if !self.transition(ConnectionState::Ready) {
            // Closed while connecting.
            self.inner.connection.store(None);
            return Some(Err(RemoteError::Unavailable));
        }
        Some(Ok(()))
    }

    fn handle_connect_failure(&self, e: &RemoteError) {
        self.inner.counters.record_error();
        if e.is_fatal() {
            self.inner.fatal.store(true, Ordering::SeqCst);
            self.transition(ConnectionState::Failed);
            return;
        }
        if self.transition(ConnectionState::Error) {
            self.spawn_reconnect();
        }
    }

    /// Start the reconnect loop unless one is already running.
    fn spawn_reconnect(&self) {
        if self
            .inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let client = self.clone();
        tokio::spawn(async move {
            client.reconnect_loop().await;
            client.inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(&self) {
        if !self.transition(ConnectionState::Reconnecting) {
            return;
        }

        let max_attempts = self.inner.config.max_reconnect_attempts;
        loop {
            let attempt = self.inner.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > max_attempts {
                tracing::error!(
                    attempts = max_attempts,
                    "Redis reconnect attempts exhausted, remote cache disabled"
                );
                self.transition(ConnectionState::Failed);
                return;
            }

            let delay = self.inner.config.reconnect_delay(attempt);
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connect_attempt().await {
                Ok(()) => {
                    self.inner.counters.record_reconnect();
                    tracing::info!(attempt, "Reconnected to Redis");
                    return;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Unrecoverable Redis error, remote cache disabled");
                    self.inner.fatal.store(true, Ordering::SeqCst);
                    self.transition(ConnectionState::Failed);
                    return;
                }
                Err(e) => {
                    let errors = self.inner.counters.record_error();
                    if should_log(errors, self.inner.config.error_log_sample_rate) {
                        tracing::warn!(
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Redis reconnect attempt failed"
                        );
                    }
                    if self.state() == ConnectionState::Closed {
                        return;
                    }
                }
            }
        }
    }

    fn spawn_supervisor(&self) {
        if self
            .inner
            .supervisor_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let period = Duration::from_millis(self.inner.config.supervisor_interval_ms.max(1));
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = client.inner.cancel.cancelled() => return,
                    _ = ticker.tick() => client.supervise().await,
                }
            }
        });
    }

    /// One supervisory pass.
    async fn supervise(&self) {
        match self.state() {
            ConnectionState::Ready => {
                // Errors are routed through the normal error path, which
                // starts a reconnect on connection loss.
                let _ = self.guarded("ping", |s| async move { s.ping().await }).await;
                self.drain_pending().await;
            }
            ConnectionState::Failed if !self.inner.fatal.load(Ordering::SeqCst) => {
                tracing::info!("Supervisor retrying failed Redis connection");
                self.inner.failed_attempts.store(0, Ordering::SeqCst);
                self.spawn_reconnect();
            }
            ConnectionState::Error => self.spawn_reconnect(),
            _ => {}
        }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(timeout)),
    }
}

/// Delete `base` and every `base|*` key, one SCAN step at a time.
async fn scan_delete(
    store: &dyn RemoteStore,
    base: &str,
    batch: usize,
    timeout: Duration,
) -> Result<u64, RemoteError> {
    let mut removed = with_timeout(timeout, store.del(std::slice::from_ref(&base.to_string()))).await?;

    let pattern = format!("{}{}*", escape_glob(base), KEY_SEPARATOR);
    let mut cursor = 0u64;
    loop {
        let (next, keys) = with_timeout(timeout, store.scan(cursor, &pattern, batch)).await?;
        if !keys.is_empty() {
            removed += with_timeout(timeout, store.del(&keys)).await?;
        }
        if next == 0 {
            return Ok(removed);
        }
        cursor = next;
        tokio::task::yield_now().await;
    }
}

/// Log the first error and then one in `rate`.
fn should_log(count: u64, rate: u64) -> bool {
    rate <= 1 || count == 1 || count % rate == 0
}
