//! Remote Tier - Shared TTL-Native Store
//!
//! Key/value tier shared by every process instance. The [`RemoteStore`]
//! trait is the port; [`InMemoryRemoteStore`] and
//! [`RedisRemoteStore`](super::redis::RedisRemoteStore) are the adapters.
//!
//! [`RemoteTier`] wraps a store with:
//!
//! - the payload envelope (compression tag + write time)
//! - a per-command timeout
//! - operation counters
//!
//! Every operation returns `Err` with [`Error::RemoteUnavailable`] or
//! [`Error::RemoteTimeout`] when the store cannot be reached. Callers that
//! treat the cache as optional check [`Error::is_unavailable`] and degrade.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use super::compression::{self, CompressionAlgorithm, CompressionConfig, Envelope, PayloadCodec};
use super::pattern::glob_match;
use crate::error::{Error, Result};

// =============================================================================
// Store Port
// =============================================================================

/// Remaining lifetime of a remote key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist
    Missing,
    /// Key exists without an expiry
    Persistent,
    /// Key expires after this many seconds
    Expires(u64),
}

/// Memory figures reported by the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RemoteMemoryInfo {
    /// Bytes in use
    pub used_bytes: u64,
    /// Configured limit, 0 when unlimited
    pub max_bytes: u64,
}

/// Shared key/value store with native TTLs
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Adapter name for logs
    fn name(&self) -> &'static str;

    /// GET
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// GETRANGE (inclusive bounds); None when the key is missing
    async fn get_range(&self, key: &str, start: usize, end: usize) -> Result<Option<Bytes>>;

    /// SETEX
    async fn set_ex(&self, key: &str, value: Bytes, ttl_seconds: u64) -> Result<()>;

    /// DEL; returns the number of keys removed
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// TTL
    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// EXPIRE; false when the key does not exist
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool>;

    /// Keys matching a glob pattern
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>>;

    /// PING
    async fn ping(&self) -> Result<()>;

    /// INFO memory
    async fn memory_info(&self) -> Result<RemoteMemoryInfo>;

    /// DBSIZE
    async fn db_size(&self) -> Result<u64>;

    /// MEMORY PURGE; Ok(false) when unsupported
    async fn purge_memory(&self) -> Result<bool>;
}

// =============================================================================
// In-Memory Store
// =============================================================================

#[derive(Debug, Clone)]
struct StoredValue {
    data: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process store with Redis semantics, for tests and single-node runs.
///
/// Can be switched unavailable to exercise degraded mode.
pub struct InMemoryRemoteStore {
    data: DashMap<String, StoredValue>,
    available: AtomicBool,
    max_bytes: u64,
    purges: AtomicU64,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::with_max_memory(0)
    }
}

impl InMemoryRemoteStore {
    /// Create an unlimited store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store reporting `max_bytes` as its memory limit
    pub fn with_max_memory(max_bytes: u64) -> Self {
        Self {
            data: DashMap::new(),
            available: AtomicBool::new(true),
            max_bytes,
            purges: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (false) or recovery (true)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Write a key without a TTL (as a foreign writer might)
    pub fn set_persistent(&self, key: &str, value: Bytes) {
        self.data.insert(
            key.to_string(),
            StoredValue {
                data: value,
                expires_at: None,
            },
        );
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| e.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many purge hints were received
    pub fn purge_count(&self) -> u64 {
        self.purges.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::RemoteUnavailable("in-memory store offline".into()))
        }
    }

    fn live(&self, key: &str) -> Option<StoredValue> {
        let now = Instant::now();
        let value = self.data.get(key).map(|v| v.value().clone())?;
        if value.is_live(now) {
            Some(value)
        } else {
            self.data.remove_if(key, |_, v| !v.is_live(now));
            None
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check()?;
        Ok(self.live(key).map(|v| v.data))
    }

    async fn get_range(&self, key: &str, start: usize, end: usize) -> Result<Option<Bytes>> {
        self.check()?;
        Ok(self.live(key).map(|v| {
            let len = v.data.len();
            if start >= len || start > end {
                Bytes::new()
            } else {
                v.data.slice(start..=end.min(len - 1))
            }
        }))
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl_seconds: u64) -> Result<()> {
        self.check()?;
        if ttl_seconds == 0 {
            return Err(Error::Config("SETEX requires a positive ttl".into()));
        }
        self.data.insert(
            key.to_string(),
            StoredValue {
                data: value,
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        self.check()?;
        let now = Instant::now();
        let removed = keys
            .iter()
            .filter_map(|k| self.data.remove(k))
            .filter(|(_, v)| v.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.check()?;
        let now = Instant::now();
        Ok(match self.live(key) {
            None => KeyTtl::Missing,
            Some(StoredValue {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(StoredValue {
                expires_at: Some(at),
                ..
            }) => {
                // Round up like Redis does for sub-second remainders
                let remaining = at.saturating_duration_since(now);
                let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                KeyTtl::Expires(secs)
            }
        })
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        match self.data.get_mut(key) {
            Some(mut v) if v.is_live(now) => {
                v.expires_at = Some(now + Duration::from_secs(ttl_seconds));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|e| e.value().is_live(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn memory_info(&self) -> Result<RemoteMemoryInfo> {
        self.check()?;
        let now = Instant::now();
        let used_bytes = self
            .data
            .iter()
            .filter(|e| e.value().is_live(now))
            .map(|e| (e.key().len() + e.value().data.len()) as u64)
            .sum();
        Ok(RemoteMemoryInfo {
            used_bytes,
            max_bytes: self.max_bytes,
        })
    }

    async fn db_size(&self) -> Result<u64> {
        self.check()?;
        Ok(self.len() as u64)
    }

    async fn purge_memory(&self) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        self.data.retain(|_, v| v.is_live(now));
        self.purges.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }
}

// =============================================================================
// Remote Tier
// =============================================================================

/// Remote tier configuration
#[derive(Debug, Clone)]
pub struct RemoteTierConfig {
    /// Per-command timeout
    pub command_timeout: Duration,
    /// Envelope compression settings
    pub compression: CompressionConfig,
}

impl Default for RemoteTierConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(3000),
            compression: CompressionConfig::default(),
        }
    }
}

/// Remote tier statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RemoteTierStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub failures: u64,
    pub compressed_writes: u64,
    pub bytes_saved: u64,
}

/// Outcome of a pattern-scoped delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkDelete {
    pub found: usize,
    pub removed: usize,
    pub errors: usize,
}

/// Envelope-aware wrapper around a [`RemoteStore`]
pub struct RemoteTier {
    store: Arc<dyn RemoteStore>,
    codec: PayloadCodec,
    config: RemoteTierConfig,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    failures: AtomicU64,
    compressed_writes: AtomicU64,
    bytes_saved: AtomicU64,
}

impl RemoteTier {
    /// Wrap a store with default settings
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self::with_config(store, RemoteTierConfig::default())
    }

    /// Wrap a store with custom settings
    pub fn with_config(store: Arc<dyn RemoteStore>, config: RemoteTierConfig) -> Self {
        Self {
            store,
            codec: PayloadCodec::with_config(config.compression.clone()),
            config,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            compressed_writes: AtomicU64::new(0),
            bytes_saved: AtomicU64::new(0),
        }
    }

    /// Fresh tier over an [`InMemoryRemoteStore`]
    pub fn in_memory() -> (Self, Arc<InMemoryRemoteStore>) {
        let store = Arc::new(InMemoryRemoteStore::new());
        (Self::new(store.clone()), store)
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let result = match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::RemoteTimeout {
                operation: operation.to_string(),
                timeout_ms: self.config.command_timeout.as_millis() as u64,
            }),
        };
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Read and unwrap an envelope
    pub async fn get(&self, key: &str) -> Result<Option<Envelope>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let raw = self.timed("GET", self.store.get(key)).await?;
        match raw {
            None => Ok(None),
            Some(raw) => self.codec.decode(key, &raw).map(Some),
        }
    }

    /// Read the stored bytes as-is
    pub async fn get_raw(&self, key: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.timed("GET", self.store.get(key)).await
    }

    /// Write `body` with a TTL, compressing when `compress` and large enough
    pub async fn set_with_ttl(
        &self,
        key: &str,
        body: &[u8],
        ttl_seconds: u64,
        compress: bool,
    ) -> Result<CompressionAlgorithm> {
        if ttl_seconds == 0 {
            return Err(Error::Config(format!("refusing to write {} without a ttl", key)));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        let (payload, algorithm) = self.codec.encode(body, compress, Utc::now());
        if algorithm == CompressionAlgorithm::Lz4 {
            self.compressed_writes.fetch_add(1, Ordering::Relaxed);
            let saved = (body.len() + compression::HEADER_LEN).saturating_sub(payload.len());
            self.bytes_saved.fetch_add(saved as u64, Ordering::Relaxed);
        }
        self.timed("SETEX", self.store.set_ex(key, payload, ttl_seconds))
            .await?;
        Ok(algorithm)
    }

    /// Serialize `value` as JSON and write it
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl_seconds: u64,
    ) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.set_with_ttl(key, &body, ttl_seconds, true).await?;
        Ok(())
    }

    /// Read and deserialize a JSON value
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            None => Ok(None),
            Some(envelope) => Ok(Some(serde_json::from_slice(&envelope.body)?)),
        }
    }

    /// Delete keys
    pub async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.deletes.fetch_add(keys.len() as u64, Ordering::Relaxed);
        self.timed("DEL", self.store.del(keys)).await
    }

    /// Remaining TTL of a key
    pub async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.timed("TTL", self.store.ttl(key)).await
    }

    /// Set a new TTL on an existing key
    pub async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        self.timed("EXPIRE", self.store.expire(key, ttl_seconds))
            .await
    }

    /// Keys matching a glob pattern
    pub async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        self.timed("SCAN", self.store.keys_matching(pattern)).await
    }

    /// Delete every key matching `pattern`, `batch_size` keys per DEL.
    ///
    /// A failed batch is counted and skipped; only a failed scan is an error.
    pub async fn delete_matching(&self, pattern: &str, batch_size: usize) -> Result<BulkDelete> {
        let keys = self.keys_matching(pattern).await?;
        let mut report = BulkDelete {
            found: keys.len(),
            ..Default::default()
        };
        for batch in keys.chunks(batch_size.max(1)) {
            match self.del(batch).await {
                Ok(n) => report.removed += n as usize,
                Err(e) => {
                    tracing::warn!("Bulk delete batch for {} failed: {}", pattern, e);
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// True when the store answers PING in time
    pub async fn ping(&self) -> bool {
        self.timed("PING", self.store.ping()).await.is_ok()
    }

    /// Write time of an enveloped value, read from its header only.
    ///
    /// `Ok(None)` when the key is missing or was not written through the
    /// envelope.
    pub async fn stored_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let header = self
            .timed(
                "GETRANGE",
                self.store.get_range(key, 0, compression::HEADER_LEN - 1),
            )
            .await?;
        Ok(header
            .and_then(|h| compression::parse_header(&h))
            .map(|(_, at)| at))
    }

    pub async fn memory_info(&self) -> Result<RemoteMemoryInfo> {
        self.timed("INFO", self.store.memory_info()).await
    }

    pub async fn db_size(&self) -> Result<u64> {
        self.timed("DBSIZE", self.store.db_size()).await
    }

    pub async fn purge_memory(&self) -> Result<bool> {
        self.timed("MEMORY PURGE", self.store.purge_memory()).await
    }

    /// Get tier statistics
    pub fn stats(&self) -> RemoteTierStats {
        RemoteTierStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            compressed_writes: self.compressed_writes.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let (tier, _) = RemoteTier::in_memory();
        tier.set_with_ttl("k", b"hello", 60, true).await.unwrap();
        let envelope = tier.get("k").await.unwrap().unwrap();
        assert_eq!(envelope.body.as_ref(), b"hello");
        assert_eq!(envelope.algorithm, CompressionAlgorithm::None);
        assert!(tier.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_large_value_compressed_transparently() {
        let (tier, store) = RemoteTier::in_memory();
        let pages: Vec<_> = (0..200).map(|i| json!({"page": i, "text": "lorem ipsum"})).collect();
        let body = serde_json::to_vec(&pages).unwrap();

        let algorithm = tier.set_with_ttl("doc", &body, 60, true).await.unwrap();
        assert_eq!(algorithm, CompressionAlgorithm::Lz4);

        let raw = store.get("doc").await.unwrap().unwrap();
        assert!(raw.len() < body.len());

        let back: Vec<serde_json::Value> = tier.get_json("doc").await.unwrap().unwrap();
        assert_eq!(back, pages);
        assert_eq!(tier.stats().compressed_writes, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_refused() {
        let (tier, _) = RemoteTier::in_memory();
        assert_matches!(
            tier.set_with_ttl("k", b"v", 0, false).await,
            Err(Error::Config(_))
        );
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let (tier, store) = RemoteTier::in_memory();
        store.set_available(false);

        let err = tier.get("k").await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(tier.set_with_ttl("k", b"v", 60, false).await.is_err());
        assert!(!tier.ping().await);
        assert_eq!(tier.stats().failures, 3);

        store.set_available(true);
        assert!(tier.ping().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_and_expire() {
        let (tier, store) = RemoteTier::in_memory();
        tier.set_with_ttl("k", b"v", 10, false).await.unwrap();
        assert_eq!(tier.ttl("k").await.unwrap(), KeyTtl::Expires(10));

        tokio::time::advance(Duration::from_millis(4500)).await;
        assert_eq!(tier.ttl("k").await.unwrap(), KeyTtl::Expires(6));

        assert!(tier.expire("k", 1).await.unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(tier.ttl("k").await.unwrap(), KeyTtl::Missing);
        assert!(!tier.expire("k", 5).await.unwrap());

        store.set_persistent("p", Bytes::from_static(b"x"));
        assert_eq!(tier.ttl("p").await.unwrap(), KeyTtl::Persistent);
    }

    #[tokio::test]
    async fn test_keys_matching_and_del() {
        let (tier, _) = RemoteTier::in_memory();
        for key in ["doc:merge:a:1", "doc:merge:b:2", "image:resize:c:3"] {
            tier.set_with_ttl(key, b"v", 60, false).await.unwrap();
        }
        let keys = tier.keys_matching("doc:merge:*").await.unwrap();
        assert_eq!(keys, vec!["doc:merge:a:1", "doc:merge:b:2"]);

        assert_eq!(tier.del(&keys).await.unwrap(), 2);
        assert_eq!(tier.del(&keys).await.unwrap(), 0);
        assert_eq!(tier.keys_matching("*").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_matching_batches() {
        let (tier, _) = RemoteTier::in_memory();
        for i in 0..7 {
            tier.set_with_ttl(&format!("video:trim:s{}:h", i), b"v", 60, false)
                .await
                .unwrap();
        }
        tier.set_with_ttl("doc:merge:s:h", b"v", 60, false).await.unwrap();

        let report = tier.delete_matching("video:*", 3).await.unwrap();
        assert_eq!(report, BulkDelete { found: 7, removed: 7, errors: 0 });
        assert_eq!(tier.stats().deletes, 7);
        assert!(tier.get("doc:merge:s:h").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stored_at_header_only() {
        let (tier, store) = RemoteTier::in_memory();
        let before = Utc::now();
        tier.set_with_ttl("k", &vec![b'a'; 4096], 60, true).await.unwrap();
        let at = tier.stored_at("k").await.unwrap().unwrap();
        assert!(at.timestamp_millis() >= before.timestamp_millis());

        store.set_persistent("foreign", Bytes::from_static(b"{\"raw\":true}"));
        assert!(tier.stored_at("foreign").await.unwrap().is_none());
        assert!(tier.stored_at("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_value_is_error_not_panic() {
        let (tier, store) = RemoteTier::in_memory();
        store.set_persistent("bad", Bytes::from_static(&[0xC1, 0, 0, 0, 0, 0, 0, 0, 1, 0xFF, 0xFF]));
        assert!(tier.get("bad").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_info_and_purge() {
        let store = Arc::new(InMemoryRemoteStore::with_max_memory(1024));
        let tier = RemoteTier::new(store.clone());
        tier.set_with_ttl("k", b"12345", 60, false).await.unwrap();
        let info = tier.memory_info().await.unwrap();
        assert_eq!(info.max_bytes, 1024);
        assert!(info.used_bytes > 5);
        assert_eq!(tier.db_size().await.unwrap(), 1);
        assert!(tier.purge_memory().await.unwrap());
        assert_eq!(store.purge_count(), 1);
    }
}
