//! Redis implementation of the remote store seam.
//!
//! Uses a multiplexed async connection: one socket, cloned per call, so
//! unrelated operations are pipelined rather than serialized behind a lock.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, ErrorKind, RedisError};
use std::sync::Arc;
use std::time::Duration;

use super::store::{Connector, DynRemoteStore, RemoteError, RemoteStore, RemoteValue};
use crate::config::RedisConfig;

/// Opens multiplexed connections to the configured Redis server.
pub struct RedisConnector {
    client: Client,
    display_url: String,
}

impl RedisConnector {
    pub fn from_config(config: &RedisConfig) -> Result<Self, RemoteError> {
        let url = config.effective_url();
        let client = Client::open(url.as_str()).map_err(classify)?;
        Ok(Self {
            client,
            display_url: redact_url(&url),
        })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<DynRemoteStore, RemoteError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)?;
        let store: DynRemoteStore = Arc::new(RedisStore { conn });
        Ok(store)
    }

    fn describe(&self) -> String {
        self.display_url.clone()
    }
}

/// An established Redis connection.
pub struct RedisStore {
    conn: MultiplexedConnection,
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<RemoteValue>, RemoteError> {
        let mut conn = self.conn.clone();
        let (data, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        Ok(data.map(|data| RemoteValue {
            data,
            ttl: (pttl > 0).then(|| Duration::from_millis(pttl as u64)),
        }))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), RemoteError> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, RemoteError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(classify)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), RemoteError> {
        let mut conn = self.conn.clone();
        redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(classify)
    }

    async fn incr(&self, key: &str, window: Duration) -> Result<(i64, Duration), RemoteError> {
        let mut conn = self.conn.clone();
        let (count, pttl): (i64, i64) = redis::pipe()
            .cmd("INCR")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        if pttl > 0 {
            return Ok((count, Duration::from_millis(pttl as u64)));
        }

        // New counter (or one that lost its expiry): start the window now.
        let window_ms = window.as_millis().max(1) as u64;
        let _: () = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(window_ms)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok((count, window))
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn memory_usage(&self) -> Result<Option<String>, RemoteError> {
        let mut conn = self.conn.clone();
        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(parse_used_memory(&info))
    }
}

/// Map a redis error onto the remote error taxonomy.
pub fn classify(e: RedisError) -> RemoteError {
    match e.kind() {
        ErrorKind::AuthenticationFailed | ErrorKind::InvalidClientConfig => {
            RemoteError::Fatal(e.to_string())
        }
        _ if e.is_timeout() => RemoteError::Connection(format!("timeout: {e}")),
        _ if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() => {
            RemoteError::Connection(e.to_string())
        }
        _ => RemoteError::Protocol(e.to_string()),
    }
}

fn parse_used_memory(info: &str) -> Option<String> {
    info.lines()
        .find_map(|line| line.strip_prefix("used_memory_human:"))
        .map(|v| v.trim().to_string())
}

/// Drop credentials from a connection URL for logging.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
