//! Feature-level policies built on the public [`CacheBackend`](crate::CacheBackend) API.
//!
//! - [`ttl`]: TTL as a pure function of a quality signal
//! - [`compression`]: gzip large payloads under a suffixed key
//! - [`swr`]: serve stale hits while refreshing in the background
//! - [`cascade`]: invalidate related namespaces together
//! - [`batch`]: concurrent multi-key reads and writes

pub mod batch;
pub mod cascade;
pub mod compression;
pub mod swr;
pub mod ttl;

pub use batch::{BatchGet, BatchSet};
pub use compression::{COMPRESSED_SUFFIX, StoredAs};
pub use swr::{Revalidated, SwrOptions};
