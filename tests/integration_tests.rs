//! tiercache Integration Tests
//!
//! End-to-end behaviour against the in-memory remote store:
//! - Multi-tier caching: TTL, eviction, compression, degraded mode
//! - Deduplication of concurrent misses
//! - Strategy selection
//! - Invalidation, warming, cleanup and the service lifecycle

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use tiercache::cache::{
    CacheConfig, InMemoryRemoteStore, MemoryTierConfig, RemoteTier, StrategyConfig, TierId,
};
use tiercache::{CacheRegistry, KeyCodec, MultiTierCache, StrategyTable, WorkloadClass};

fn strategy(ttl_seconds: u64, tiers: &[TierId], compress: bool) -> StrategyConfig {
    StrategyConfig {
        ttl_seconds,
        tiers: tiers.to_vec(),
        priority: 5,
        compress,
    }
}

fn cache_over(store: Arc<InMemoryRemoteStore>, config: CacheConfig) -> MultiTierCache {
    MultiTierCache::with_config(
        "file",
        config,
        Arc::new(RemoteTier::new(store)),
        Arc::new(StrategyTable::new()),
    )
}

// =============================================================================
// Multi-Tier Cache
// =============================================================================

mod cache_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ttl_correctness_across_tiers() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let cache = cache_over(Arc::clone(&store), CacheConfig::default());
        let both = strategy(60, &[TierId::Memory, TierId::Remote], false);

        cache
            .set("doc:merge:ttl:h", Bytes::from_static(b"merged"), &both)
            .await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(
            cache.get("doc:merge:ttl:h").await,
            Some(Bytes::from_static(b"merged"))
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("doc:merge:ttl:h").await, None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_under_capacity() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let cache = cache_over(
            store,
            CacheConfig::with_memory(MemoryTierConfig::with_capacity(3)),
        );
        let memory_only = strategy(3600, &[TierId::Memory], false);

        for i in 1..=3 {
            let key = format!("image:resize:k{}:h", i);
            cache.set(&key, Bytes::from(vec![i as u8]), &memory_only).await;
        }
        assert!(cache.get("image:resize:k2:h").await.is_some());
        assert!(cache.get("image:resize:k3:h").await.is_some());

        cache
            .set("image:resize:k4:h", Bytes::from_static(&[4]), &memory_only)
            .await;

        assert_eq!(cache.get("image:resize:k1:h").await, None);
        for i in 2..=4 {
            assert!(cache.get(&format!("image:resize:k{}:h", i)).await.is_some());
        }
        assert_eq!(cache.memory().evictions(), 1);
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Analysis {
        pages: u32,
        summary: String,
        tokens: Vec<String>,
    }

    #[tokio::test]
    async fn test_round_trip_under_compression() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let cache = cache_over(Arc::clone(&store), CacheConfig::default());
        let remote_only = strategy(3600, &[TierId::Remote], true);

        let value = Analysis {
            pages: 42,
            summary: "quarterly report ".repeat(200),
            tokens: (0..300).map(|i| format!("token-{}", i % 17)).collect(),
        };
        cache
            .set_json("doc:analyze:r:h", &value, &remote_only)
            .await
            .unwrap();

        let stats = cache.remote().stats();
        assert_eq!(stats.compressed_writes, 1);
        assert!(stats.bytes_saved > 0);

        let back: Analysis = cache.get_json("doc:analyze:r:h").await.unwrap();
        assert_eq!(back, value);
    }

    #[tokio::test]
    async fn test_degraded_mode_serves_from_memory() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let cache = cache_over(Arc::clone(&store), CacheConfig::default());
        let both = strategy(600, &[TierId::Memory, TierId::Remote], false);
        store.set_available(false);

        let outcome = cache
            .set("doc:merge:d:h", Bytes::from_static(b"local"), &both)
            .await;
        assert!(outcome.memory);
        assert!(!outcome.remote);
        assert_eq!(cache.metrics().errors, 1);

        assert_eq!(
            cache.get("doc:merge:d:h").await,
            Some(Bytes::from_static(b"local"))
        );

        // A miss consults the remote tier and counts the failure
        assert_eq!(cache.get("doc:merge:other:h").await, None);
        assert_eq!(cache.metrics().errors, 2);
    }

    #[tokio::test]
    async fn test_remote_hit_promotes_to_memory() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let writer = cache_over(Arc::clone(&store), CacheConfig::default());
        let reader = cache_over(Arc::clone(&store), CacheConfig::default());
        let key = KeyCodec::build_key(WorkloadClass::Doc, "merge", "p", &["a", "b"]).unwrap();
        let doc_tiny = StrategyTable::new().select(WorkloadClass::Doc, 10);

        writer
            .set(key.as_str(), Bytes::from_static(b"pdf"), &doc_tiny)
            .await;

        let first = reader.lookup(key.as_str()).await.unwrap();
        assert_eq!(first.tier, TierId::Remote);
        let second = reader.lookup(key.as_str()).await.unwrap();
        assert_eq!(second.tier, TierId::Memory);
    }
}

// =============================================================================
// Deduplication
// =============================================================================

mod dedup_tests {
    use super::*;
    use futures::future::join_all;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Thumbnail {
        width: u32,
        height: u32,
        run: usize,
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifty_concurrent_misses_run_once() {
        let cache = Arc::new(MultiTierCache::in_memory("file"));
        let key = KeyCodec::build_key(
            WorkloadClass::Image,
            "resize",
            "photo-1",
            &serde_json::json!({"width": 320, "height": 200}),
        )
        .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..50).map(|_| {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            let calls = Arc::clone(&calls);
            async move {
                cache
                    .get_or_compute(&key, WorkloadClass::Image, move || async move {
                        let run = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Thumbnail {
                            width: 320,
                            height: 200,
                            run,
                        })
                    })
                    .await
            }
        });
        let results = join_all(callers).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().unwrap().clone();
        assert_eq!(first.run, 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap() == &first));

        let (executions, joined) = cache.dedup_counts();
        assert_eq!(executions, 1);
        assert_eq!(joined, 49);

        // Cached afterwards: no further producer runs
        let again: Thumbnail = cache
            .get_or_compute(&key, WorkloadClass::Image, || async {
                Err(anyhow::anyhow!("must not run"))
            })
            .await
            .unwrap();
        assert_eq!(again, first);
    }

    #[tokio::test]
    async fn test_producer_failure_is_not_cached() {
        let cache = MultiTierCache::in_memory("file");
        let key = KeyCodec::build_key(WorkloadClass::Video, "trim", "clip", &()).unwrap();

        let failed = cache
            .get_or_compute::<String, _, _>(&key, WorkloadClass::Video, || async {
                Err(anyhow::anyhow!("ffmpeg exited with 1"))
            })
            .await;
        let err = failed.unwrap_err();
        assert!(err.to_string().contains("ffmpeg exited with 1"));
        assert!(!cache.has(key.as_str()).await);

        let ok: String = cache
            .get_or_compute(&key, WorkloadClass::Video, || async { Ok("trimmed".to_string()) })
            .await
            .unwrap();
        assert_eq!(ok, "trimmed");
    }
}

// =============================================================================
// Strategy Selection
// =============================================================================

mod strategy_tests {
    use super::*;
    use tiercache::SizeCategory;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_selection_is_pure() {
        let table = StrategyTable::new();
        for class in WorkloadClass::ALL {
            for size in [0, MB - 1, MB, 10 * MB, 50 * MB, 100 * MB, 500 * MB] {
                assert_eq!(table.select(class, size), table.select(class, size));
            }
        }
    }

    #[test]
    fn test_result_changes_only_at_boundaries() {
        let table = StrategyTable::new();
        let boundaries = [MB, 10 * MB, 50 * MB, 100 * MB];
        for class in WorkloadClass::ALL {
            for b in boundaries {
                assert_ne!(
                    SizeCategory::from_size(b - 1),
                    SizeCategory::from_size(b)
                );
                assert_ne!(table.select(class, b - 1), table.select(class, b));
            }
            assert_eq!(table.select(class, 0), table.select(class, MB - 1));
        }
    }

    #[test]
    fn test_unknown_class_fails_loudly() {
        let table = StrategyTable::new();
        assert!(table.select_by_name("audio", 10).is_err());
        assert!(table.select_by_name("doc", 10).is_ok());
    }
}

// =============================================================================
// Invalidation
// =============================================================================

mod invalidation_tests {
    use super::*;
    use tiercache::InvalidationManager;

    #[tokio::test]
    async fn test_pattern_invalidation_precision() {
        let cache = MultiTierCache::in_memory("file");
        let both = strategy(3600, &[TierId::Memory, TierId::Remote], false);
        for key in ["doc:merge:A", "doc:merge:B", "image:resize:C"] {
            cache.set(key, Bytes::from(key.to_string()), &both).await;
        }

        let removed = cache.invalidate("doc:merge:*").await;
        assert_eq!(removed, 2);

        assert_eq!(cache.get("doc:merge:A").await, None);
        assert_eq!(cache.get("doc:merge:B").await, None);
        assert_eq!(
            cache.get("image:resize:C").await,
            Some(Bytes::from_static(b"image:resize:C"))
        );
    }

    #[tokio::test]
    async fn test_subject_cascade_across_caches() {
        let registry = Arc::new(CacheRegistry::in_memory());
        let both = strategy(3600, &[TierId::Memory, TierId::Remote], false);
        let key = KeyCodec::build_key(WorkloadClass::Doc, "merge", "upload-7", &()).unwrap();
        let other = KeyCodec::build_key(WorkloadClass::Doc, "merge", "upload-8", &()).unwrap();

        registry.file().set(key.as_str(), Bytes::from_static(b"x"), &both).await;
        registry.file().set(other.as_str(), Bytes::from_static(b"y"), &both).await;
        registry
            .api()
            .set("file:metadata:upload-7", Bytes::from_static(b"{}"), &both)
            .await;

        let manager = InvalidationManager::new(Arc::clone(&registry));
        let result = manager.invalidate_by_subject("upload-7").await;
        assert!(result.entries_invalidated >= 2);
        assert_eq!(result.errors, 0);

        assert!(!registry.file().has(key.as_str()).await);
        assert!(!registry.api().has("file:metadata:upload-7").await);
        assert!(registry.file().has(other.as_str()).await);
    }
}

// =============================================================================
// Warming
// =============================================================================

mod warming_tests {
    use super::*;
    use chrono::Utc;
    use tiercache::warming::{RemoteUsageTracker, UsageRecord, UsageTracker, WarmingScheduler};

    #[tokio::test]
    async fn test_popular_usage_is_warmed_and_ranked() {
        let (remote, _) = RemoteTier::in_memory();
        let remote = Arc::new(remote);
        let registry = Arc::new(CacheRegistry::new(
            Arc::clone(&remote),
            Arc::new(StrategyTable::new()),
            None,
        ));
        let tracker = Arc::new(RemoteUsageTracker::new(Arc::clone(&remote)));
        let now = Utc::now();
        tracker
            .store(&UsageRecord::new(WorkloadClass::Image, "resize", 500, now))
            .await
            .unwrap();
        tracker
            .store(&UsageRecord::new(
                WorkloadClass::Video,
                "compress",
                2,
                now - chrono::Duration::days(30),
            ))
            .await
            .unwrap();

        let usage: Arc<dyn UsageTracker> = tracker;
        let scheduler = WarmingScheduler::new(Arc::clone(&registry), usage);
        let report = scheduler.trigger().await.unwrap();
        assert!(report.warmed > 0);
        assert_eq!(report.failed, 0);

        let ranked = scheduler.stats().popular_operations;
        let position = |class: WorkloadClass, op: &str| {
            ranked
                .iter()
                .position(|p| p.class == class && p.operation == op)
                .unwrap()
        };
        assert!(position(WorkloadClass::Image, "resize") < position(WorkloadClass::Video, "compress"));

        let resize = &ranked[position(WorkloadClass::Image, "resize")];
        let key = resize.cache_key(&scheduler.config().subject).unwrap();
        assert!(registry.file().has(key.as_str()).await);

        let warm: serde_json::Value = registry.file().get_json(key.as_str()).await.unwrap();
        assert_eq!(warm["warmed"], true);
    }
}

// =============================================================================
// Service Lifecycle
// =============================================================================

mod service_tests {
    use super::*;
    use tiercache::monitoring::HealthStatus;
    use tiercache::{CacheSystem, SystemConfig};

    #[tokio::test]
    async fn test_system_serves_and_reports() {
        let (system, store) = CacheSystem::in_memory(SystemConfig::default()).unwrap();
        system.start();

        let key = KeyCodec::build_key(WorkloadClass::Doc, "split", "s1", &[1, 2]).unwrap();
        let pages: Vec<u32> = system
            .registry()
            .file()
            .get_or_compute(&key, WorkloadClass::Doc, || async { Ok(vec![1, 2]) })
            .await
            .unwrap();
        assert_eq!(pages, vec![1, 2]);

        let sample = system.monitor().collect().await;
        assert!(sample.aggregate.misses >= 1);

        let cleanup = system.cleanup().emergency_cleanup().await.unwrap();
        assert!(cleanup.triggered);

        store.set_available(false);
        let health = system.health_check().await;
        assert_eq!(health.status, HealthStatus::Degraded);

        system.stop().await;
        assert!(!system.is_running());
    }
}
