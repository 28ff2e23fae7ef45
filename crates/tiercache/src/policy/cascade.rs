//! Cascading invalidation across related namespaces.

use crate::backend::{CacheBackend, InvalidationReport};
use crate::error::CacheResult;
use crate::key::KeyPart;

impl CacheBackend {
    /// Invalidate `namespace` and then every namespace in `cascade_to`, all
    /// under the same `parts`.
    ///
    /// Every namespace is validated before anything is removed. Returns one
    /// report per namespace, primary first.
    pub async fn invalidate_with_cascade(
        &self,
        namespace: &str,
        parts: &[KeyPart],
        cascade_to: &[&str],
    ) -> CacheResult<Vec<(String, InvalidationReport)>> {
        let targets: Vec<&str> = std::iter::once(namespace)
            .chain(cascade_to.iter().copied())
            .collect();
        for target in &targets {
            crate::key::key_prefix(target, parts)?;
        }

        let mut reports = Vec::with_capacity(targets.len());
        for target in targets {
            let report = self.invalidate_namespace(target, parts).await?;
            reports.push((target.to_string(), report));
        }

        tracing::info!(
            namespace,
            cascaded = cascade_to.len(),
            "Cascade invalidation completed"
        );
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SetOptions;
    use crate::key_parts;

    #[tokio::test]
    async fn test_cascade_reaches_related_namespaces() {
        let cache = CacheBackend::new_local();
        for ns in ["resume:data", "ats:score", "resume:embedding", "job:analysis"] {
            cache
                .set(ns, &key_parts!["u1", "r1"], &1u8, SetOptions::default())
                .await
                .unwrap();
            cache
                .set(ns, &key_parts!["u2", "r1"], &1u8, SetOptions::default())
                .await
                .unwrap();
        }

        let reports = cache
            .invalidate_with_cascade("resume:data", &key_parts!["u1"], &["ats:score", "resume:embedding"])
            .await
            .unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|(_, r)| r.local == 1));

        for ns in ["resume:data", "ats:score", "resume:embedding"] {
            assert!(cache.get::<u8>(ns, &key_parts!["u1", "r1"]).await.unwrap().is_none());
            assert!(cache.get::<u8>(ns, &key_parts!["u2", "r1"]).await.unwrap().is_some());
        }
        assert!(cache.get::<u8>("job:analysis", &key_parts!["u1", "r1"]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_related_namespace_removes_nothing() {
        let cache = CacheBackend::new_local();
        cache
            .set("a", &key_parts!["u1"], &1u8, SetOptions::default())
            .await
            .unwrap();

        assert!(cache
            .invalidate_with_cascade("a", &key_parts!["u1"], &["bad|ns"])
            .await
            .is_err());
        assert!(cache.get::<u8>("a", &key_parts!["u1"]).await.unwrap().is_some());
    }
}
