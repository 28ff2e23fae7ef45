//! Behaviour of the two-tier cache against an in-process remote store.
//!
//! `MemoryStore` stands in for Redis and can be switched off to simulate an
//! outage; `ManualClock` drives local expiry.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tiercache::{
    CacheBackend, CacheConfig, CacheMode, ConnectionState, ManualClock, MemoryStore,
    SetOptions, WrapOptions, build_key, key_parts,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Analysis {
    score: u32,
}

fn tiered_config() -> CacheConfig {
    let mut config = CacheConfig::default();
    config.redis.enabled = true;
    config.redis.url = "memory://".into();
    config.redis.key_prefix = "test:".into();
    config
}

async fn tiered(store: &Arc<MemoryStore>, clock: Arc<ManualClock>) -> CacheBackend {
    tiercache::init_tracing_with_level("warn");
    CacheBackend::builder(tiered_config())
        .clock(clock)
        .connector(Arc::new(store.connector()))
        .build()
        .await
        .expect("cache builds")
}

#[tokio::test]
async fn test_job_analysis_example() {
    let cache = CacheBackend::new_local();

    cache
        .set(
            "job:analysis",
            &key_parts!["user1", "resume1"],
            &Analysis { score: 42 },
            SetOptions::ttl(Duration::from_millis(1000)),
        )
        .await
        .unwrap();
    cache
        .set(
            "job:analysis",
            &key_parts!["user2", "resume1"],
            &Analysis { score: 7 },
            SetOptions::ttl(Duration::from_millis(1000)),
        )
        .await
        .unwrap();

    let value: Option<Analysis> = cache
        .get("job:analysis", &key_parts!["user1", "resume1"])
        .await
        .unwrap();
    assert_eq!(value, Some(Analysis { score: 42 }));

    cache
        .invalidate_namespace("job:analysis", &key_parts!["user1"])
        .await
        .unwrap();

    let gone: Option<Analysis> = cache
        .get("job:analysis", &key_parts!["user1", "resume1"])
        .await
        .unwrap();
    assert!(gone.is_none());

    let other: Option<Analysis> = cache
        .get("job:analysis", &key_parts!["user2", "resume1"])
        .await
        .unwrap();
    assert_eq!(other, Some(Analysis { score: 7 }));
}

#[tokio::test]
async fn test_keys_are_deterministic() {
    let a = build_key("resume:parse", &key_parts!["sha256-abc", 3u8]).unwrap();
    let b = build_key("resume:parse", &key_parts!["sha256-abc", 3u8]).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, "resume:parse|sha256-abc|3");
}

#[tokio::test]
async fn test_ttl_expiry_with_controlled_clock() {
    let clock = ManualClock::new(1_000_000);
    let cache = CacheBackend::builder(CacheConfig::default())
        .clock(clock.clone())
        .build()
        .await
        .unwrap();

    cache
        .set("draft", &key_parts!["d1"], &"body", SetOptions::ttl(Duration::from_millis(50)))
        .await
        .unwrap();

    clock.advance(Duration::from_millis(40));
    assert!(cache.get::<String>("draft", &key_parts!["d1"]).await.unwrap().is_some());

    clock.advance(Duration::from_millis(20));
    assert!(cache.get::<String>("draft", &key_parts!["d1"]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_namespace_invalidation_reaches_both_tiers() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(0);
    let writer = tiered(&store, clock.clone()).await;
    let reader = tiered(&store, clock.clone()).await;

    for user in ["u1", "u2"] {
        for resume in 0..5 {
            writer
                .set("ats:score", &key_parts![user, resume], &resume, SetOptions::default())
                .await
                .unwrap();
        }
    }
    writer
        .set("ats:scores", &key_parts!["u1", 0], &0, SetOptions::default())
        .await
        .unwrap();

    let report = writer
        .invalidate_namespace("ats:score", &key_parts!["u1"])
        .await
        .unwrap();
    assert_eq!(report.local, 5);
    assert_eq!(report.remote, Some(5));

    // Another instance only ever had the remote copy.
    for resume in 0..5 {
        assert!(reader
            .get::<i32>("ats:score", &key_parts!["u1", resume])
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            reader.get::<i32>("ats:score", &key_parts!["u2", resume]).await.unwrap(),
            Some(resume)
        );
    }
    assert!(reader
        .get::<i32>("ats:scores", &key_parts!["u1", 0])
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_remote_outage_degrades_to_local() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(0);
    let cache = tiered(&store, clock.clone()).await;
    assert_eq!(cache.mode(), CacheMode::Redis);

    store.set_available(false);

    // Nothing fails; the local tier keeps working.
    cache
        .set("draft", &key_parts!["d1"], &"v1", SetOptions::default())
        .await
        .unwrap();
    assert_eq!(
        cache.get::<String>("draft", &key_parts!["d1"]).await.unwrap().as_deref(),
        Some("v1")
    );
    assert!(cache.get::<String>("draft", &key_parts!["d2"]).await.unwrap().is_none());
    cache.delete("draft", &key_parts!["d1"]).await.unwrap();
    let report = cache
        .invalidate_namespace("draft", &[])
        .await
        .unwrap();
    assert_eq!(report.remote, None);

    let stats = cache.stats().await;
    assert_ne!(stats.remote_state, ConnectionState::Ready);
    assert!(stats.remote_errors >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_delete_is_reflected_after_recovery() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(0);
    let cache = tiered(&store, clock.clone()).await;

    cache
        .set("draft", &key_parts!["d1"], &"v1", SetOptions::default())
        .await
        .unwrap();
    assert!(store.contains("test:draft|d1"));

    // Outage: the delete reaches only the local tier and is queued.
    store.set_available(false);
    cache.delete("draft", &key_parts!["d1"]).await.unwrap();
    assert!(store.contains("test:draft|d1"));
    assert_eq!(cache.stats().await.pending_invalidations, 1);

    store.set_available(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(cache.remote().state(), ConnectionState::Ready);

    // The queued delete was replayed before the connection went live.
    assert!(!store.contains("test:draft|d1"));
    assert!(cache.get::<String>("draft", &key_parts!["d1"]).await.unwrap().is_none());
    assert_eq!(cache.stats().await.pending_invalidations, 0);
}

#[tokio::test]
async fn test_wrap_fetch_counts_across_instances() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(0);
    let a = tiered(&store, clock.clone()).await;
    let b = tiered(&store, clock.clone()).await;
    let options = WrapOptions::new("job:analysis", key_parts!["jd-hash"]).ttl(Duration::from_secs(60));

    let first = a
        .wrap(options.clone(), || async { Ok::<_, anyhow::Error>(Analysis { score: 80 }) })
        .await
        .unwrap();
    assert!(!first.hit);

    let second = b
        .wrap(options.clone(), || async {
            Err::<Analysis, _>(anyhow::anyhow!("must not be called"))
        })
        .await
        .unwrap();
    assert!(second.hit);
    assert_eq!(second.value, Analysis { score: 80 });

    let forced = b
        .wrap(options.force_refresh(true), || async {
            Ok::<_, anyhow::Error>(Analysis { score: 81 })
        })
        .await
        .unwrap();
    assert!(!forced.hit);
    assert_eq!(forced.value.score, 81);
}

#[tokio::test]
async fn test_shutdown_closes_remote_tier() {
    let store = MemoryStore::new();
    let cache = tiered(&store, ManualClock::new(0)).await;

    let health = cache.health_check().await.expect("tiered mode probes");
    assert!(health.healthy);

    cache.shutdown().await;
    assert_eq!(cache.remote().state(), ConnectionState::Closed);

    // Still usable as a local cache.
    cache
        .set("draft", &key_parts!["d1"], &1u8, SetOptions::default())
        .await
        .unwrap();
    assert!(!store.contains("test:draft|d1"));
}
