//! Concurrent multi-key reads and writes.

use futures_util::future::join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backend::{CacheBackend, SetOptions};
use crate::error::CacheResult;
use crate::key::KeyPart;

/// One lookup of a [`CacheBackend::batch_get`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchGet {
    pub namespace: String,
    pub key_parts: Vec<KeyPart>,
}

impl BatchGet {
    pub fn new(namespace: impl Into<String>, key_parts: Vec<KeyPart>) -> Self {
        Self {
            namespace: namespace.into(),
            key_parts,
        }
    }
}

/// One write of a [`CacheBackend::batch_set`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSet<T> {
    pub namespace: String,
    pub key_parts: Vec<KeyPart>,
    pub value: T,
    pub options: SetOptions,
}

impl CacheBackend {
    /// Run every lookup concurrently; results are in request order.
    pub async fn batch_get<T: DeserializeOwned>(
        &self,
        requests: &[BatchGet],
    ) -> Vec<CacheResult<Option<T>>> {
        join_all(
            requests
                .iter()
                .map(|r| self.get(&r.namespace, &r.key_parts)),
        )
        .await
    }

    /// Run every write concurrently; results are in request order.
    pub async fn batch_set<T: Serialize>(&self, operations: &[BatchSet<T>]) -> Vec<CacheResult<bool>> {
        join_all(
            operations
                .iter()
                .map(|op| self.set(&op.namespace, &op.key_parts, &op.value, op.options)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_parts;

    #[tokio::test]
    async fn test_batch_round_trip_preserves_order() {
        let cache = CacheBackend::new_local();
        let writes: Vec<BatchSet<u32>> = (0..5)
            .map(|i| BatchSet {
                namespace: "job:analysis".into(),
                key_parts: key_parts![format!("jd{i}")],
                value: i * 10,
                options: SetOptions::default(),
            })
            .collect();
        assert!(cache.batch_set(&writes).await.into_iter().all(|r| r == Ok(true)));

        let mut reads: Vec<BatchGet> = (0..5)
            .map(|i| BatchGet::new("job:analysis", key_parts![format!("jd{i}")]))
            .collect();
        reads.push(BatchGet::new("job:analysis", key_parts!["missing"]));
        reads.push(BatchGet::new("", vec![]));

        let results = cache.batch_get::<u32>(&reads).await;
        let values: Vec<Option<u32>> = results[..6].iter().map(|r| r.clone().unwrap()).collect();
        assert_eq!(values, vec![Some(0), Some(10), Some(20), Some(30), Some(40), None]);
        assert!(results[6].is_err());
    }
}
