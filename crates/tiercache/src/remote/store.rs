//! The seam between the remote client and the key-value store it talks to.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the remote tier. Never surfaced past the façade.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The client is not in the `Ready` state.
    #[error("remote cache unavailable")]
    Unavailable,

    #[error("remote operation timed out after {0:?}")]
    Timeout(Duration),

    /// Network-level failure; the connection should be re-established.
    #[error("remote connection error: {0}")]
    Connection(String),

    /// The server answered with an error; the connection itself is fine.
    #[error("remote protocol error: {0}")]
    Protocol(String),

    /// Reconnecting cannot help (bad credentials, invalid configuration).
    #[error("remote unrecoverable error: {0}")]
    Fatal(String),
}

impl RemoteError {
    /// Whether this failure means the connection is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, RemoteError::Connection(_) | RemoteError::Timeout(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RemoteError::Fatal(_))
    }
}

/// A value read from the remote tier together with its remaining TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteValue {
    pub data: Vec<u8>,
    pub ttl: Option<Duration>,
}

/// Operations the cache needs from a shared key-value store.
///
/// Keys passed here already carry the configured key prefix.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// GET plus the key's remaining TTL.
    async fn get(&self, key: &str) -> Result<Option<RemoteValue>, RemoteError>;

    /// SET with a millisecond expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), RemoteError>;

    /// DEL; returns the number of keys removed.
    async fn del(&self, keys: &[String]) -> Result<u64, RemoteError>;

    /// One SCAN step. A returned cursor of 0 means the iteration is complete.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), RemoteError>;

    /// INCR, setting `window` as expiry when the counter is created.
    /// Returns the new count and the time left in the window.
    async fn incr(&self, key: &str, window: Duration) -> Result<(i64, Duration), RemoteError>;

    async fn ping(&self) -> Result<(), RemoteError>;

    /// Human readable memory usage reported by the server, if any.
    async fn memory_usage(&self) -> Result<Option<String>, RemoteError>;
}

/// Shared handle to an established store connection.
pub type DynRemoteStore = Arc<dyn RemoteStore>;

/// Establishes connections for the remote client's state machine.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<DynRemoteStore, RemoteError>;

    /// Short description used in logs (never includes credentials).
    fn describe(&self) -> String;
}

/// Escape glob metacharacters so `value` matches itself literally in SCAN MATCH.
pub fn escape_glob(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\' | '^') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
