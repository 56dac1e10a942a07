//! Multi-Tier Cache
//!
//! Composes the memory tier, the remote tier and the strategy table into one
//! logical cache.
//!
//! # Read path
//!
//! ```text
//! get(key) ──► Memory ──hit──► value
//!                │
//!              miss
//!                ▼
//!              Remote ──hit──► promote to Memory (remaining TTL) ──► value
//!                │
//!          miss / error ──► miss
//! ```
//!
//! Remote failures never surface from reads or writes: they are logged,
//! counted in the error metric and treated as a miss (reads) or a skipped
//! tier (writes).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::Either;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dedup::RequestDeduplicator;
use super::key::{CacheKey, WorkloadClass};
use super::memory::{MemoryTier, MemoryTierConfig};
use super::metrics::{CacheMetrics, MetricsSnapshot};
use super::remote::{KeyTtl, RemoteTier};
use super::strategy::{StrategyConfig, StrategyTable, TierId};
use super::ttl;
use crate::error::{Error, Result};
use crate::warming::UsageTracker;

/// Name of the API response cache
pub const API_CACHE: &str = "api";

/// Name of the processed-file result cache
pub const FILE_CACHE: &str = "file";

/// Name of the user data cache
pub const USER_CACHE: &str = "user";

// =============================================================================
// Configuration
// =============================================================================

/// Logical cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Memory tier sizing
    pub memory: MemoryTierConfig,
    /// Keys per DEL during pattern invalidation
    pub invalidation_batch_size: usize,
    /// Copy remote hits into the memory tier
    pub promote_on_hit: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: MemoryTierConfig::default(),
            invalidation_batch_size: 100,
            promote_on_hit: true,
        }
    }
}

impl CacheConfig {
    /// Configuration with the given memory tier sizing
    pub fn with_memory(memory: MemoryTierConfig) -> Self {
        Self {
            memory,
            ..Default::default()
        }
    }
}

/// A successful lookup
#[derive(Debug, Clone)]
pub struct CacheLookup {
    /// Serialized value
    pub data: Bytes,
    /// Tier that served the value
    pub tier: TierId,
    /// Time spent in the lookup
    pub latency: Duration,
}

/// Which tiers accepted a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOutcome {
    pub memory: bool,
    pub remote: bool,
}

impl StoreOutcome {
    /// True when at least one tier holds the value
    pub fn stored(&self) -> bool {
        self.memory || self.remote
    }
}

// =============================================================================
// Tiers
// =============================================================================

/// State shared with in-flight producer futures
struct Tiers {
    name: String,
    memory: Arc<MemoryTier>,
    remote: Arc<RemoteTier>,
    strategies: Arc<StrategyTable>,
    metrics: CacheMetrics,
    config: CacheConfig,
}

impl Tiers {
    async fn lookup(&self, key: &str) -> Option<CacheLookup> {
        let start = Instant::now();

        if let Some(data) = self.memory.get(key) {
            let latency = start.elapsed();
            self.metrics.record_hit(latency);
            return Some(CacheLookup {
                data,
                tier: TierId::Memory,
                latency,
            });
        }

        match self.remote.get(key).await {
            Ok(Some(envelope)) => {
                let compressed = envelope.algorithm.is_compressed();
                if self.config.promote_on_hit {
                    self.promote(key, envelope.body.clone(), compressed).await;
                }
                let latency = start.elapsed();
                self.metrics.record_hit(latency);
                Some(CacheLookup {
                    data: envelope.body,
                    tier: TierId::Remote,
                    latency,
                })
            }
            Ok(None) => {
                self.metrics.record_miss(start.elapsed());
                None
            }
            Err(e) => {
                self.metrics.record_error();
                self.metrics.record_miss(start.elapsed());
                if let Error::CorruptPayload { .. } = e {
                    warn!("Cache {} dropping unreadable entry {}: {}", self.name, key, e);
                    let _ = self.remote.del(&[key.to_string()]).await;
                } else {
                    warn!("Cache {} remote read of {} failed: {}", self.name, key, e);
                }
                None
            }
        }
    }

    /// Copy a remote value into memory without outliving the remote copy
    async fn promote(&self, key: &str, data: Bytes, compressed: bool) {
        let parsed = CacheKey::from_raw(key);
        let cap = match parsed.class() {
            Some(class) => {
                let strategy = self.strategies.select(class, data.len() as u64);
                if !strategy.uses(TierId::Memory) {
                    return;
                }
                strategy.ttl_seconds
            }
            None => ttl::SHORT,
        };

        let remaining = match self.remote.ttl(key).await {
            Ok(KeyTtl::Expires(secs)) => secs.min(cap),
            Ok(KeyTtl::Persistent) => cap,
            Ok(KeyTtl::Missing) => return,
            Err(e) => {
                debug!("Cache {} skipped promotion of {}: {}", self.name, key, e);
                return;
            }
        };

        if self
            .memory
            .set_promoted(key, data, Duration::from_secs(remaining), compressed)
        {
            debug!("Cache {} promoted {} for {}s", self.name, key, remaining);
        }
    }

    async fn store(&self, key: &str, data: Bytes, strategy: &StrategyConfig) -> StoreOutcome {
        let mut outcome = StoreOutcome::default();

        for tier in &strategy.tiers {
            match tier {
                TierId::Memory => {
                    outcome.memory = self.memory.set(
                        key,
                        data.clone(),
                        Duration::from_secs(strategy.ttl_seconds),
                    );
                }
                TierId::Remote => {
                    match self
                        .remote
                        .set_with_ttl(key, &data, strategy.ttl_seconds, strategy.compress)
                        .await
                    {
                        Ok(_) => outcome.remote = true,
                        Err(e) => {
                            self.metrics.record_error();
                            warn!("Cache {} remote write of {} failed: {}", self.name, key, e);
                        }
                    }
                }
                reserved => {
                    debug!("Cache {} skipping reserved tier {} for {}", self.name, reserved, key);
                }
            }
        }

        outcome
    }
}

// =============================================================================
// Multi-Tier Cache
// =============================================================================

/// One logical cache over the memory and remote tiers
pub struct MultiTierCache {
    tiers: Arc<Tiers>,
    dedup: RequestDeduplicator<Bytes>,
    usage: Option<Arc<dyn UsageTracker>>,
    /// Memory tiers of other caches over the same remote tier
    peers: Vec<Arc<MemoryTier>>,
}

impl MultiTierCache {
    /// Create a cache with default configuration
    pub fn new(
        name: impl Into<String>,
        remote: Arc<RemoteTier>,
        strategies: Arc<StrategyTable>,
    ) -> Self {
        Self::with_config(name, CacheConfig::default(), remote, strategies)
    }

    /// Create a cache with custom configuration
    pub fn with_config(
        name: impl Into<String>,
        config: CacheConfig,
        remote: Arc<RemoteTier>,
        strategies: Arc<StrategyTable>,
    ) -> Self {
        let name = name.into();
        let memory = Arc::new(MemoryTier::with_config(name.clone(), config.memory.clone()));
        Self {
            tiers: Arc::new(Tiers {
                name,
                memory,
                remote,
                strategies,
                metrics: CacheMetrics::new(),
                config,
            }),
            dedup: RequestDeduplicator::new(),
            usage: None,
            peers: Vec::new(),
        }
    }

    /// Self-contained cache over an in-memory remote store
    pub fn in_memory(name: impl Into<String>) -> Self {
        let (remote, _) = RemoteTier::in_memory();
        Self::new(name, Arc::new(remote), Arc::new(StrategyTable::new()))
    }

    /// Record (class, operation) usage on every `get_or_compute`
    pub fn with_usage_tracker(mut self, tracker: Arc<dyn UsageTracker>) -> Self {
        self.usage = Some(tracker);
        self
    }

    /// Keep `peers` in step on delete and invalidate. Each peer must cache
    /// the same remote tier; this cache's own memory tier is ignored.
    pub fn with_peers(mut self, peers: &[Arc<MemoryTier>]) -> Self {
        self.peers = peers
            .iter()
            .filter(|m| !Arc::ptr_eq(m, &self.tiers.memory))
            .cloned()
            .collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.tiers.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.tiers.config
    }

    pub fn memory(&self) -> &Arc<MemoryTier> {
        &self.tiers.memory
    }

    pub fn remote(&self) -> &Arc<RemoteTier> {
        &self.tiers.remote
    }

    pub fn strategies(&self) -> &Arc<StrategyTable> {
        &self.tiers.strategies
    }

    /// Look up a key, reporting the tier that served it
    pub async fn lookup(&self, key: &str) -> Option<CacheLookup> {
        self.tiers.lookup(key).await
    }

    /// Serialized value for `key`, or None on a miss
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.lookup(key).await.map(|hit| hit.data)
    }

    /// Deserialized value for `key`; undecodable values count as a miss
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let hit = self.lookup(key).await?;
        match serde_json::from_slice(&hit.data) {
            Ok(value) => Some(value),
            Err(e) => {
                self.tiers.metrics.record_error();
                warn!("Cache {} could not decode {}: {}", self.name(), key, e);
                None
            }
        }
    }

    /// Write serialized bytes to every implemented tier the strategy lists
    pub async fn set(&self, key: &str, data: Bytes, strategy: &StrategyConfig) -> StoreOutcome {
        self.tiers.store(key, data, strategy).await
    }

    /// Serialize and write a value
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        strategy: &StrategyConfig,
    ) -> Result<StoreOutcome> {
        let data = Bytes::from(serde_json::to_vec(value)?);
        Ok(self.set(key, data, strategy).await)
    }

    /// Return the cached value or run `producer` once for all concurrent callers.
    ///
    /// The produced value is placed according to the strategy for `class` and
    /// its serialized size. Producer failures reach every waiting caller and
    /// are never cached.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &CacheKey,
        class: WorkloadClass,
        producer: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.track_usage(key);

        if let Some(hit) = self.lookup(key.as_str()).await {
            match serde_json::from_slice(&hit.data) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    self.tiers.metrics.record_error();
                    warn!("Cache {} discarding undecodable {}: {}", self.name(), key, e);
                    self.tiers.memory.delete(key.as_str());
                }
            }
        }

        let tiers = Arc::clone(&self.tiers);
        let store_key = key.as_str().to_string();
        let data = self
            .dedup
            .dedupe(key.as_str(), move || {
                // Another execution may have stored the value since the lookup
                let pending = match tiers.memory.peek(&store_key) {
                    Some(entry) => Either::Left(entry.data),
                    None => Either::Right(producer()),
                };
                async move {
                    let fut = match pending {
                        Either::Left(data) => return Ok(data),
                        Either::Right(fut) => fut,
                    };
                    let data = match fut.await {
                        Ok(value) => Bytes::from(serde_json::to_vec(&value)?),
                        Err(e) => {
                            tiers.metrics.record_error();
                            return Err(Error::producer(e));
                        }
                    };
                    let strategy = tiers.strategies.select(class, data.len() as u64);
                    let outcome = tiers.store(&store_key, data.clone(), &strategy).await;
                    debug!(
                        "Cache {} stored {} ({} bytes, memory={}, remote={})",
                        tiers.name,
                        store_key,
                        data.len(),
                        outcome.memory,
                        outcome.remote
                    );
                    Ok(data)
                }
            })
            .await?;

        Ok(serde_json::from_slice(&data)?)
    }

    fn track_usage(&self, key: &CacheKey) {
        let (Some(tracker), Some(class), Some(operation)) =
            (self.usage.as_ref(), key.class(), key.operation())
        else {
            return;
        };
        tracker.track_usage(class, operation);
    }

    /// Remove one key from both tiers and from peer memory tiers; true if
    /// this cache held it
    pub async fn delete(&self, key: &str) -> bool {
        let in_memory = self.tiers.memory.delete(key);
        for peer in &self.peers {
            peer.delete(key);
        }
        let in_remote = match self.tiers.remote.del(&[key.to_string()]).await {
            Ok(n) => n > 0,
            Err(e) => {
                self.tiers.metrics.record_error();
                warn!("Cache {} remote delete of {} failed: {}", self.name(), key, e);
                false
            }
        };
        in_memory || in_remote
    }

    /// Whether either tier holds a live value (not counted as a request)
    pub async fn has(&self, key: &str) -> bool {
        if self.tiers.memory.has(key) {
            return true;
        }
        match self.tiers.remote.ttl(key).await {
            Ok(ttl) => ttl != KeyTtl::Missing,
            Err(e) => {
                self.tiers.metrics.record_error();
                debug!("Cache {} remote existence check failed: {}", self.name(), e);
                false
            }
        }
    }

    /// Drop this and every peer memory tier wholesale and delete remote keys
    /// matching `pattern`.
    ///
    /// Returns the number of remote keys removed.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let cleared = self.tiers.memory.clear()
            + self.peers.iter().map(|p| p.clear()).sum::<usize>();
        match self
            .tiers
            .remote
            .delete_matching(pattern, self.tiers.config.invalidation_batch_size)
            .await
        {
            Ok(report) => {
                info!(
                    "Cache {} invalidated {}: {} remote keys, {} memory entries",
                    self.name(),
                    pattern,
                    report.removed,
                    cleared
                );
                report.removed
            }
            Err(e) => {
                self.tiers.metrics.record_error();
                warn!("Cache {} invalidation of {} failed: {}", self.name(), pattern, e);
                0
            }
        }
    }

    /// Producer executions started and callers that joined one
    pub fn dedup_counts(&self) -> (u64, u64) {
        (self.dedup.executions(), self.dedup.joined())
    }

    /// Current metrics
    pub fn metrics(&self) -> MetricsSnapshot {
        self.tiers.metrics.snapshot(
            self.name(),
            self.tiers.memory.size_bytes(),
            self.tiers.memory.evictions(),
        )
    }
}

// =============================================================================
// Cache Registry
// =============================================================================

/// The standard logical caches, sharing one remote tier and strategy table
pub struct CacheRegistry {
    api: Arc<MultiTierCache>,
    file: Arc<MultiTierCache>,
    user: Arc<MultiTierCache>,
    remote: Arc<RemoteTier>,
    strategies: Arc<StrategyTable>,
}

impl CacheRegistry {
    /// Build the api, file and user caches
    pub fn new(
        remote: Arc<RemoteTier>,
        strategies: Arc<StrategyTable>,
        usage: Option<Arc<dyn UsageTracker>>,
    ) -> Self {
        let build = |name: &str, memory: MemoryTierConfig| {
            let cache = MultiTierCache::with_config(
                name,
                CacheConfig::with_memory(memory),
                Arc::clone(&remote),
                Arc::clone(&strategies),
            );
            match &usage {
                Some(tracker) => cache.with_usage_tracker(Arc::clone(tracker)),
                None => cache,
            }
        };

        let caches = [
            build(API_CACHE, MemoryTierConfig::api()),
            build(FILE_CACHE, MemoryTierConfig::file()),
            build(USER_CACHE, MemoryTierConfig::user()),
        ];
        let memories: Vec<Arc<MemoryTier>> =
            caches.iter().map(|c| Arc::clone(c.memory())).collect();
        let [api, file, user] = caches.map(|c| Arc::new(c.with_peers(&memories)));

        Self {
            api,
            file,
            user,
            remote,
            strategies,
        }
    }

    /// Registry over an in-memory remote store
    pub fn in_memory() -> Self {
        let (remote, _) = RemoteTier::in_memory();
        Self::new(Arc::new(remote), Arc::new(StrategyTable::new()), None)
    }

    pub fn api(&self) -> &Arc<MultiTierCache> {
        &self.api
    }

    pub fn file(&self) -> &Arc<MultiTierCache> {
        &self.file
    }

    pub fn user(&self) -> &Arc<MultiTierCache> {
        &self.user
    }

    /// Look up a cache by name
    pub fn get(&self, name: &str) -> Option<&Arc<MultiTierCache>> {
        self.caches().into_iter().find(|c| c.name() == name)
    }

    /// Every cache, in registration order
    pub fn caches(&self) -> [&Arc<MultiTierCache>; 3] {
        [&self.api, &self.file, &self.user]
    }

    pub fn remote(&self) -> &Arc<RemoteTier> {
        &self.remote
    }

    pub fn strategies(&self) -> &Arc<StrategyTable> {
        &self.strategies
    }

    /// Per-cache metrics
    pub fn metrics(&self) -> Vec<MetricsSnapshot> {
        self.caches().iter().map(|c| c.metrics()).collect()
    }

    /// Metrics summed across every cache
    pub fn aggregate_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot::aggregate(&self.metrics())
    }

    /// Clear every memory tier and delete matching remote keys once.
    ///
    /// Returns the number of remote keys removed.
    pub async fn invalidate(&self, pattern: &str) -> Result<usize> {
        let cleared = self.clear_memory();
        let batch_size = self.api.config().invalidation_batch_size;
        let report = self.remote.delete_matching(pattern, batch_size).await?;
        info!(
            "Invalidated {}: {} remote keys, {} memory entries",
            pattern, report.removed, cleared
        );
        Ok(report.removed)
    }

    /// Remove specific keys from every memory tier
    pub fn evict_from_memory(&self, keys: &[String]) -> usize {
        let caches = self.caches();
        keys.iter()
            .map(|k| caches.iter().filter(|c| c.memory().delete(k)).count())
            .sum()
    }

    /// Drop every memory tier entry; returns how many were held
    pub fn clear_memory(&self) -> usize {
        self.caches().iter().map(|c| c.memory().clear()).sum()
    }

    /// Bytes held across memory tiers
    pub fn memory_bytes(&self) -> u64 {
        self.caches().iter().map(|c| c.memory().size_bytes()).sum()
    }

    /// Highest memory tier utilization, in percent
    pub fn memory_utilization_percent(&self) -> f64 {
        self.caches()
            .iter()
            .map(|c| c.memory().utilization_percent())
            .fold(0.0, f64::max)
    }

    /// Start the expiry sweep of every memory tier
    pub fn spawn_sweepers(&self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.caches()
            .iter()
            .map(|c| Arc::clone(c.memory()).spawn_sweeper(token.child_token()))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::remote::{InMemoryRemoteStore, RemoteMemoryInfo, RemoteStore};
    use crate::cache::strategy::SizeCategory;
    use crate::cache::KeyCodec;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cache_with_store(capacity: usize) -> (MultiTierCache, Arc<InMemoryRemoteStore>) {
        let (remote, store) = RemoteTier::in_memory();
        let cache = MultiTierCache::with_config(
            "test",
            CacheConfig::with_memory(MemoryTierConfig::with_capacity(capacity)),
            Arc::new(remote),
            Arc::new(StrategyTable::new()),
        );
        (cache, store)
    }

    fn hot(ttl_seconds: u64) -> StrategyConfig {
        StrategyConfig {
            ttl_seconds,
            tiers: vec![TierId::Memory, TierId::Remote, TierId::Cdn],
            priority: 5,
            compress: true,
        }
    }

    #[tokio::test]
    async fn test_set_then_get_from_memory() {
        let (cache, _) = cache_with_store(10);
        let outcome = cache
            .set_json("doc:merge:f1:aa", &json!({"pages": 3}), &hot(60))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome { memory: true, remote: true });

        let hit = cache.lookup("doc:merge:f1:aa").await.unwrap();
        assert_eq!(hit.tier, TierId::Memory);
        let value: serde_json::Value = cache.get_json("doc:merge:f1:aa").await.unwrap();
        assert_eq!(value["pages"], 3);
    }

    #[tokio::test]
    async fn test_remote_hit_is_promoted() {
        let (cache, _) = cache_with_store(10);
        cache.set_json("doc:merge:f1:aa", &"x", &hot(60)).await.unwrap();
        cache.memory().clear();

        let hit = cache.lookup("doc:merge:f1:aa").await.unwrap();
        assert_eq!(hit.tier, TierId::Remote);
        assert!(cache.memory().has("doc:merge:f1:aa"));

        let entry = cache.memory().peek("doc:merge:f1:aa").unwrap();
        assert!(entry.ttl <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_remote_only_strategy_skips_memory() {
        let (cache, _) = cache_with_store(10);
        let strategy = cache.strategies().get(WorkloadClass::Doc, SizeCategory::Medium);
        let outcome = cache.set("doc:merge:f1:aa", Bytes::from_static(b"1"), &strategy).await;
        assert_eq!(outcome, StoreOutcome { memory: false, remote: true });
        assert!(!cache.memory().has("doc:merge:f1:aa"));
    }

    #[tokio::test]
    async fn test_edge_only_strategy_stores_nothing() {
        let (cache, _) = cache_with_store(10);
        let strategy = cache.strategies().get(WorkloadClass::Video, SizeCategory::Xlarge);
        let outcome = cache.set("video:convert:f:aa", Bytes::from_static(b"1"), &strategy).await;
        assert!(!outcome.stored());
        assert!(cache.get("video:convert:f:aa").await.is_none());
    }

    #[tokio::test]
    async fn test_remote_outage_degrades_to_memory() {
        let (cache, store) = cache_with_store(10);
        store.set_available(false);

        let outcome = cache.set_json("image:resize:f:aa", &1, &hot(60)).await.unwrap();
        assert_eq!(outcome, StoreOutcome { memory: true, remote: false });
        assert_eq!(cache.get_json::<i32>("image:resize:f:aa").await, Some(1));
        assert!(cache.get("image:resize:f:missing").await.is_none());
        assert!(cache.metrics().errors >= 2);
    }

    #[tokio::test]
    async fn test_get_or_compute_caches_result() {
        let (cache, _) = cache_with_store(10);
        let key = KeyCodec::build_key(WorkloadClass::Image, "resize", "f1", &json!({"width": 800}))
            .unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value: String = cache
                .get_or_compute(&key, WorkloadClass::Image, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("resized".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "resized");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().hits, 2);
    }

    /// Delegates to the in-memory store, with every GET taking `delay`
    struct SlowReads {
        inner: InMemoryRemoteStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl RemoteStore for SlowReads {
        fn name(&self) -> &'static str {
            "slow-reads"
        }

        async fn get(&self, key: &str) -> Result<Option<Bytes>> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(key).await
        }

        async fn get_range(&self, key: &str, start: usize, end: usize) -> Result<Option<Bytes>> {
            self.inner.get_range(key, start, end).await
        }

        async fn set_ex(&self, key: &str, value: Bytes, ttl_seconds: u64) -> Result<()> {
            self.inner.set_ex(key, value, ttl_seconds).await
        }

        async fn del(&self, keys: &[String]) -> Result<u64> {
            self.inner.del(keys).await
        }

        async fn ttl(&self, key: &str) -> Result<KeyTtl> {
            self.inner.ttl(key).await
        }

        async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
            self.inner.expire(key, ttl_seconds).await
        }

        async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
            self.inner.keys_matching(pattern).await
        }

        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }

        async fn memory_info(&self) -> Result<RemoteMemoryInfo> {
            self.inner.memory_info().await
        }

        async fn db_size(&self) -> Result<u64> {
            self.inner.db_size().await
        }

        async fn purge_memory(&self) -> Result<bool> {
            self.inner.purge_memory().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_compute_uses_value_stored_during_lookup() {
        let store = SlowReads {
            inner: InMemoryRemoteStore::new(),
            delay: Duration::from_secs(1),
        };
        let cache = Arc::new(MultiTierCache::with_config(
            "test",
            CacheConfig::with_memory(MemoryTierConfig::with_capacity(10)),
            Arc::new(RemoteTier::new(Arc::new(store))),
            Arc::new(StrategyTable::new()),
        ));
        let key = CacheKey::from_raw("doc:merge:f1:aa");
        let calls = Arc::new(AtomicU32::new(0));

        let lookup = {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_compute::<String, _, _>(&key, WorkloadClass::Doc, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok("recomputed".to_string())
                    })
                    .await
            })
        };

        // Land the value while the remote read is still outstanding
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.memory().set(
            key.as_str(),
            Bytes::from_static(b"\"merged\""),
            Duration::from_secs(60),
        );

        assert_eq!(lookup.await.unwrap().unwrap(), "merged");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_or_compute_failure_not_cached() {
        let (cache, _) = cache_with_store(10);
        let key = CacheKey::from_raw("doc:split:f1:aa");

        let err = cache
            .get_or_compute::<String, _, _>(&key, WorkloadClass::Doc, || async {
                Err(anyhow::anyhow!("converter exited"))
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::Producer(_));
        assert!(!cache.has("doc:split:f1:aa").await);

        let value: String = cache
            .get_or_compute(&key, WorkloadClass::Doc, || async { Ok("ok".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "ok");
    }

    #[tokio::test]
    async fn test_invalidate_clears_memory_and_matching_remote() {
        let (cache, _) = cache_with_store(10);
        cache.set_json("doc:merge:a:1", &1, &hot(60)).await.unwrap();
        cache.set_json("doc:merge:b:2", &2, &hot(60)).await.unwrap();
        cache.set_json("image:resize:c:3", &3, &hot(60)).await.unwrap();

        assert_eq!(cache.invalidate("doc:merge:*").await, 2);
        assert!(cache.memory().is_empty());
        assert!(cache.get("doc:merge:a:1").await.is_none());
        assert!(cache.get("doc:merge:b:2").await.is_none());
        assert!(cache.get("image:resize:c:3").await.is_some());
    }

    #[tokio::test]
    async fn test_delete_and_has() {
        let (cache, _) = cache_with_store(10);
        cache.set_json("doc:merge:a:1", &1, &hot(60)).await.unwrap();
        assert!(cache.has("doc:merge:a:1").await);
        assert!(cache.delete("doc:merge:a:1").await);
        assert!(!cache.has("doc:merge:a:1").await);
        assert!(!cache.delete("doc:merge:a:1").await);
    }

    #[tokio::test]
    async fn test_registry() {
        let registry = CacheRegistry::in_memory();
        assert_eq!(registry.get(FILE_CACHE).unwrap().name(), FILE_CACHE);
        assert!(registry.get("nope").is_none());

        registry.api().set_json("api:config:doc", &1, &hot(60)).await.unwrap();
        registry.file().set_json("doc:merge:a:1", &1, &hot(60)).await.unwrap();
        assert_eq!(registry.memory_bytes(), 2);

        registry.file().get("doc:merge:a:1").await;
        registry.user().get("user:profile:u1").await;
        let agg = registry.aggregate_metrics();
        assert_eq!(agg.hits, 1);
        assert_eq!(agg.misses, 1);

        assert_eq!(registry.invalidate("doc:*").await.unwrap(), 1);
        assert_eq!(registry.memory_bytes(), 0);
        assert!(registry.api().get("api:config:doc").await.is_some());
    }

    #[tokio::test]
    async fn test_sibling_memory_tiers_follow_delete_and_invalidate() {
        let registry = CacheRegistry::in_memory();
        registry.file().set_json("doc:merge:a:1", &1, &hot(60)).await.unwrap();
        registry.file().set_json("doc:merge:b:2", &2, &hot(60)).await.unwrap();
        registry.user().set_json("user:profile:u1", &3, &hot(60)).await.unwrap();

        assert!(registry.api().delete("doc:merge:a:1").await);
        assert!(!registry.file().memory().has("doc:merge:a:1"));
        assert!(registry.file().get("doc:merge:a:1").await.is_none());

        assert_eq!(registry.api().invalidate("doc:*").await, 1);
        assert!(registry.file().memory().is_empty());
        assert!(registry.user().memory().is_empty());
        assert!(registry.file().get("doc:merge:b:2").await.is_none());
        assert!(registry.user().get("user:profile:u1").await.is_some());
    }
}
