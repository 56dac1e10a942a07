//! Memory Tier - Process-Local Hot Cache
//!
//! Bounded store for recently seen results. Never the only copy of a value:
//! everything here is either also in the remote tier or was placed by a
//! strategy that skips the remote tier entirely.
//!
//! # Design
//!
//! - Entry-count capacity plus a byte budget
//! - Eviction removes the entry with the lowest hit count, oldest first on ties
//! - Ordered index `(hits, insertion seq, key)` keeps eviction at O(log n)
//! - Lazy expiry on read plus a periodic background sweep

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Memory tier configuration
#[derive(Debug, Clone)]
pub struct MemoryTierConfig {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Byte budget; single values larger than this are not stored
    pub max_bytes: u64,
    /// Interval of the background expiry sweep
    pub sweep_interval: Duration,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_bytes: 256 * 1024 * 1024,              // 256MB
            sweep_interval: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl MemoryTierConfig {
    /// API responses: many small entries
    pub fn api() -> Self {
        Self {
            max_entries: 500,
            max_bytes: 50 * 1024 * 1024,
            ..Default::default()
        }
    }

    /// Processed file results: few, larger entries
    pub fn file() -> Self {
        Self {
            max_entries: 100,
            max_bytes: 200 * 1024 * 1024,
            ..Default::default()
        }
    }

    /// Per-user data
    pub fn user() -> Self {
        Self {
            max_entries: 1000,
            max_bytes: 20 * 1024 * 1024,
            ..Default::default()
        }
    }

    /// Fixed entry capacity with the default byte budget
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Default::default()
        }
    }
}

/// A cached value with its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Serialized value
    pub data: Bytes,
    /// When the entry was stored
    pub stored_at: Instant,
    /// Time to live
    pub ttl: Duration,
    /// Reads served since storage
    pub hit_count: u64,
    /// Size of `data`
    pub size_bytes: u64,
    /// Whether the value arrived compressed from the remote tier
    pub compressed: bool,
    seq: u64,
}

impl CacheEntry {
    /// Expired once `now - stored_at >= ttl`
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) >= self.ttl
    }

    /// Remaining lifetime
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.stored_at))
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    /// Eviction order: lowest hits first, then oldest
    order: BTreeSet<(u64, u64, String)>,
    bytes: u64,
    next_seq: u64,
}

impl Inner {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order
            .remove(&(entry.hit_count, entry.seq, key.to_string()));
        self.bytes = self.bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn evict_one(&mut self) -> Option<String> {
        let (_, _, key) = self.order.pop_first()?;
        if let Some(entry) = self.entries.remove(&key) {
            self.bytes = self.bytes.saturating_sub(entry.size_bytes);
        }
        Some(key)
    }
}

/// Bounded in-process cache tier
pub struct MemoryTier {
    name: String,
    config: MemoryTierConfig,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl MemoryTier {
    /// Create a tier with default configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, MemoryTierConfig::default())
    }

    /// Create a tier with custom configuration
    pub fn with_config(name: impl Into<String>, config: MemoryTierConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read a value, counting the hit. Expired entries are removed and miss.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.is_expired_at(now),
        };

        if expired {
            inner.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let Inner { entries, order, .. } = &mut *inner;
        let entry = entries.get_mut(key)?;
        order.remove(&(entry.hit_count, entry.seq, key.to_string()));
        entry.hit_count += 1;
        order.insert((entry.hit_count, entry.seq, key.to_string()));
        self.hits.fetch_add(1, Ordering::Relaxed);

        Some(entry.data.clone())
    }

    /// Store a value, evicting low-value entries first if full.
    ///
    /// Returns false if the value can never fit or the TTL is zero.
    pub fn set(&self, key: &str, data: Bytes, ttl: Duration) -> bool {
        self.set_entry(key, data, ttl, false)
    }

    /// Store a value promoted from the remote tier
    pub fn set_promoted(&self, key: &str, data: Bytes, ttl: Duration, compressed: bool) -> bool {
        self.set_entry(key, data, ttl, compressed)
    }

    fn set_entry(&self, key: &str, data: Bytes, ttl: Duration, compressed: bool) -> bool {
        let size = data.len() as u64;
        if ttl.is_zero() || size > self.config.max_bytes || self.config.max_entries == 0 {
            return false;
        }

        let mut inner = self.inner.lock();
        inner.remove(key);

        let mut evicted = 0u64;
        while inner.entries.len() >= self.config.max_entries
            || inner.bytes + size > self.config.max_bytes
        {
            match inner.evict_one() {
                Some(victim) => {
                    debug!("Memory tier {} evicted {}", self.name, victim);
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert((0, seq, key.to_string()));
        inner.bytes += size;
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                data,
                stored_at: Instant::now(),
                ttl,
                hit_count: 0,
                size_bytes: size,
                compressed,
                seq,
            },
        );
        true
    }

    /// Whether a live entry exists (does not count as a hit)
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|e| !e.is_expired_at(now))
            .unwrap_or(false)
    }

    /// Inspect an entry without touching its hit count
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(key)
            .filter(|e| !e.is_expired_at(now))
            .cloned()
    }

    /// Remove an entry
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Drop every entry, returning how many were held
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.order.clear();
        inner.bytes = 0;
        count
    }

    /// Remove all expired entries
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Run the expiry sweep until `token` is cancelled
    pub fn spawn_sweeper(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.sweep_interval);
            // First tick completes immediately
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let removed = self.sweep_expired();
                        if removed > 0 {
                            debug!("Memory tier {} swept {} expired entries", self.name, removed);
                        }
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held
    pub fn size_bytes(&self) -> u64 {
        self.inner.lock().bytes
    }

    pub fn capacity(&self) -> usize {
        self.config.max_entries
    }

    pub fn config(&self) -> &MemoryTierConfig {
        &self.config
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Hit ratio (0.0 - 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Byte usage against the budget, in percent
    pub fn utilization_percent(&self) -> f64 {
        if self.config.max_bytes == 0 {
            return 0.0;
        }
        self.size_bytes() as f64 / self.config.max_bytes as f64 * 100.0
    }

    /// Get tier statistics
    pub fn stats(&self) -> MemoryTierStats {
        let (entries, bytes) = {
            let inner = self.inner.lock();
            (inner.entries.len(), inner.bytes)
        };
        MemoryTierStats {
            name: self.name.clone(),
            entries,
            bytes,
            capacity: self.config.max_entries,
            max_bytes: self.config.max_bytes,
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
            expirations: self.expirations(),
        }
    }
}

/// Memory tier statistics
#[derive(Debug, Clone, Serialize)]
pub struct MemoryTierStats {
    pub name: String,
    pub entries: usize,
    pub bytes: u64,
    pub capacity: usize,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

// =============================================================================
// Tests
// =============================================================================
