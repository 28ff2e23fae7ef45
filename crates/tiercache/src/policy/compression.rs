//! Compression above a size threshold.
//!
//! Payloads whose JSON encoding exceeds `policy.compression_threshold_bytes`
//! are gzipped, base64 encoded and stored as `{"compressed":true,"data":..}`
//! under the key parts plus [`COMPRESSED_SUFFIX`]. Reads try the suffixed key
//! first and fall back to the plain key.
//!
//! Keys written through [`CacheBackend::set_compressed`] must be removed with
//! [`CacheBackend::delete_compressed`]; a plain `delete` leaves the suffixed
//! copy readable.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::backend::{CacheBackend, SetOptions};
use crate::error::{CacheError, CacheResult};
use crate::key::KeyPart;

/// Final key part marking a compressed payload.
pub const COMPRESSED_SUFFIX: &str = "__compressed";

/// How [`CacheBackend::set_compressed`] stored a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredAs {
    /// The value serialized to `null`; nothing was written.
    Skipped,
    Plain,
    Compressed { original_bytes: usize, compressed_bytes: usize },
}

#[derive(Debug, Serialize, Deserialize)]
struct CompressedPayload {
    compressed: bool,
    data: String,
}

/// gzip + base64.
pub fn compress(data: &[u8]) -> std::io::Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(STANDARD.encode(encoder.finish()?))
}

/// Inverse of [`compress`].
pub fn decompress(encoded: &str) -> std::io::Result<Vec<u8>> {
    let gz = STANDARD
        .decode(encoded)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut out = Vec::with_capacity(gz.len() * 4);
    GzDecoder::new(gz.as_slice()).read_to_end(&mut out)?;
    Ok(out)
}

fn suffixed(parts: &[KeyPart]) -> Vec<KeyPart> {
    let mut parts = parts.to_vec();
    parts.push(KeyPart::from(COMPRESSED_SUFFIX));
    parts
}

impl CacheBackend {
    /// Store `value`, compressing it when its encoding exceeds the threshold.
    ///
    /// Writing a plain value also drops any compressed copy of the key so the
    /// suffixed-first read path cannot return an older payload.
    pub async fn set_compressed<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        parts: &[KeyPart],
        value: &T,
        options: SetOptions,
    ) -> CacheResult<StoredAs> {
        let data = serde_json::to_vec(value)?;
        if data == b"null" {
            return Ok(StoredAs::Skipped);
        }

        let threshold = self.config().policy.compression_threshold_bytes;
        if data.len() <= threshold {
            self.delete(namespace, &suffixed(parts)).await?;
            self.set_raw(namespace, parts, data, options).await?;
            return Ok(StoredAs::Plain);
        }

        let encoded = compress(&data).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let stored = StoredAs::Compressed {
            original_bytes: data.len(),
            compressed_bytes: encoded.len(),
        };
        tracing::info!(
            namespace,
            original_bytes = data.len(),
            compressed_bytes = encoded.len(),
            "Caching with compression"
        );

        let payload = CompressedPayload {
            compressed: true,
            data: encoded,
        };
        self.set(namespace, &suffixed(parts), &payload, options).await?;
        Ok(stored)
    }

    /// Read a value written by [`set_compressed`](Self::set_compressed).
    ///
    /// A compressed payload that fails to decode is treated as a miss.
    pub async fn get_decompressed<T: DeserializeOwned>(
        &self,
        namespace: &str,
        parts: &[KeyPart],
    ) -> CacheResult<Option<T>> {
        let payload: Option<CompressedPayload> = self.get(namespace, &suffixed(parts)).await?;

        if let Some(payload) = payload.filter(|p| p.compressed) {
            let decoded = decompress(&payload.data)
                .map_err(|e| e.to_string())
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()));
            return match decoded {
                Ok(value) => Ok(Some(value)),
                Err(error) => {
                    tracing::warn!(namespace, error = %error, "compressed payload failed to decode");
                    Ok(None)
                }
            };
        }

        self.get(namespace, parts).await
    }

    /// Remove both the plain and the compressed copy from both tiers.
    /// Returns whether either copy was held.
    pub async fn delete_compressed(&self, namespace: &str, parts: &[KeyPart]) -> CacheResult<bool> {
        let compressed = self.delete(namespace, &suffixed(parts)).await?;
        let plain = self.delete(namespace, parts).await?;
        Ok(compressed || plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_parts;

    fn embedding(n: usize) -> Vec<i64> {
        (0..n as i64).map(|i| (i * 7919) % 100_003).collect()
    }

    #[test]
    fn test_compress_decompress() {
        let data = b"{\"score\":42}".repeat(100);
        let encoded = compress(&data).unwrap();
        assert!(encoded.len() < data.len());
        assert_eq!(decompress(&encoded).unwrap(), data);
        assert!(decompress("not base64!").is_err());
    }

    #[tokio::test]
    async fn test_large_value_round_trip() {
        let cache = CacheBackend::new_local();
        let vector = embedding(30_000);
        let parts = key_parts!["resume-hash"];

        let stored = cache
            .set_compressed("resume:embedding", &parts, &vector, SetOptions::default())
            .await
            .unwrap();
        assert!(matches!(stored, StoredAs::Compressed { .. }));
        assert!(cache.get_raw("resume:embedding", &parts).await.unwrap().is_none());

        let back: Vec<i64> = cache
            .get_decompressed("resume:embedding", &parts)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back, vector);
    }

    #[tokio::test]
    async fn test_small_value_stays_plain_and_replaces_compressed_copy() {
        let cache = CacheBackend::new_local();
        let parts = key_parts!["r1"];

        cache
            .set_compressed("emb", &parts, &embedding(30_000), SetOptions::default())
            .await
            .unwrap();
        let stored = cache
            .set_compressed("emb", &parts, &vec![1i64, 2], SetOptions::default())
            .await
            .unwrap();
        assert_eq!(stored, StoredAs::Plain);

        let back: Vec<i64> = cache.get_decompressed("emb", &parts).await.unwrap().unwrap();
        assert_eq!(back, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_delete_compressed_removes_both_copies() {
        let cache = CacheBackend::new_local();
        let parts = key_parts!["r1"];
        cache
            .set_compressed("emb", &parts, &embedding(30_000), SetOptions::default())
            .await
            .unwrap();

        assert!(cache.delete_compressed("emb", &parts).await.unwrap());
        assert!(cache.get_decompressed::<Vec<i64>>("emb", &parts).await.unwrap().is_none());
        assert!(!cache.delete_compressed("emb", &parts).await.unwrap());

        cache
            .set_compressed("emb", &parts, &vec![1i64], SetOptions::default())
            .await
            .unwrap();
        assert!(cache.delete_compressed("emb", &parts).await.unwrap());
        assert!(cache.get_decompressed::<Vec<i64>>("emb", &parts).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidation_covers_compressed_key() {
        let cache = CacheBackend::new_local();
        let parts = key_parts!["r1"];
        cache
            .set_compressed("emb", &parts, &embedding(30_000), SetOptions::default())
            .await
            .unwrap();

        cache.invalidate_namespace("emb", &parts).await.unwrap();
        assert!(cache.get_decompressed::<Vec<i64>>("emb", &parts).await.unwrap().is_none());
    }
}
