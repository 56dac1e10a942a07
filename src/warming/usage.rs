//! Usage Tracking
//!
//! Records how often each (class, operation) pair is requested. The caches
//! report usage through the [`UsageTracker`] port, which counts in memory;
//! the warming scheduler flushes those counts into the stored records before
//! reading them back to rank operations by popularity.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::{ttl, KeyCodec, RemoteTier, WorkloadClass};
use crate::error::Result;

/// Seconds per day, for recency decay
const DAY_SECONDS: f64 = 86_400.0;

/// Usage of one (class, operation) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// `class:operation`
    pub key: String,
    pub hits: u64,
    pub last_used_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(
        class: WorkloadClass,
        operation: &str,
        hits: u64,
        last_used_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: format!("{}:{}", class, operation),
            hits,
            last_used_at,
        }
    }

    pub fn class(&self) -> Option<WorkloadClass> {
        self.key.split_once(':').and_then(|(c, _)| c.parse().ok())
    }

    pub fn operation(&self) -> Option<&str> {
        self.key.split_once(':').map(|(_, op)| op)
    }

    /// Days since last use, never negative
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        let secs = now.signed_duration_since(self.last_used_at).num_seconds().max(0);
        secs as f64 / DAY_SECONDS
    }

    /// Popularity: frequent and recent ranks higher
    pub fn score(&self, now: DateTime<Utc>) -> f64 {
        self.hits as f64 / (1.0 + self.age_days(now))
    }

    /// Warming priority derived from the hit count (0..=10)
    pub fn priority(&self) -> u8 {
        (self.hits / 10).min(10) as u8
    }
}

/// Sink and source of usage records
#[async_trait]
pub trait UsageTracker: Send + Sync {
    /// Count one use; held in memory until the next flush
    fn track_usage(&self, class: WorkloadClass, operation: &str);

    /// Merge pending counts into the stored records.
    ///
    /// Returns the number of records written. Counts that fail to persist
    /// stay pending; failures are logged, never returned.
    async fn flush(&self) -> usize;

    /// Every live record
    async fn records(&self) -> Result<Vec<UsageRecord>>;

    /// Record of one pair
    async fn record(&self, class: WorkloadClass, operation: &str) -> Result<Option<UsageRecord>>;
}

/// Uses counted since the last flush
#[derive(Debug, Clone, Copy)]
struct PendingUsage {
    hits: u64,
    last_used_at: DateTime<Utc>,
}

impl PendingUsage {
    fn merge(&mut self, other: PendingUsage) {
        self.hits += other.hits;
        self.last_used_at = self.last_used_at.max(other.last_used_at);
    }
}

/// Usage records persisted in the remote tier under `usage:{class}:{op}`
pub struct RemoteUsageTracker {
    remote: Arc<RemoteTier>,
    ttl_seconds: u64,
    pending: DashMap<(WorkloadClass, String), PendingUsage>,
    /// Serializes the read-modify-write of stored records
    flush_lock: Mutex<()>,
}

impl RemoteUsageTracker {
    /// Records expire 30 days after their last update
    pub fn new(remote: Arc<RemoteTier>) -> Self {
        Self::with_ttl(remote, ttl::MONTH)
    }

    pub fn with_ttl(remote: Arc<RemoteTier>, ttl_seconds: u64) -> Self {
        Self {
            remote,
            ttl_seconds,
            pending: DashMap::new(),
            flush_lock: Mutex::new(()),
        }
    }

    /// Pairs with counts not yet flushed
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn requeue(&self, key: (WorkloadClass, String), usage: PendingUsage) {
        self.pending
            .entry(key)
            .and_modify(|p| p.merge(usage))
            .or_insert(usage);
    }

    async fn persist(
        &self,
        class: WorkloadClass,
        operation: &str,
        usage: PendingUsage,
    ) -> Result<()> {
        let updated = match self.record(class, operation).await? {
            Some(mut record) => {
                record.hits += usage.hits;
                record.last_used_at = record.last_used_at.max(usage.last_used_at);
                record
            }
            None => UsageRecord::new(class, operation, usage.hits, usage.last_used_at),
        };
        self.store(&updated).await
    }

    /// Overwrite a record
    pub async fn store(&self, record: &UsageRecord) -> Result<()> {
        self.remote
            .set_json(&format!("usage:{}", record.key), record, self.ttl_seconds)
            .await
    }
}

#[async_trait]
impl UsageTracker for RemoteUsageTracker {
    fn track_usage(&self, class: WorkloadClass, operation: &str) {
        self.requeue(
            (class, operation.to_string()),
            PendingUsage {
                hits: 1,
                last_used_at: Utc::now(),
            },
        );
    }

    async fn flush(&self) -> usize {
        let _flushing = self.flush_lock.lock().await;

        let keys: Vec<_> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut written = 0;
        for key in keys {
            let Some((key, usage)) = self.pending.remove(&key) else {
                continue;
            };
            match self.persist(key.0, &key.1, usage).await {
                Ok(()) => written += 1,
                Err(e) => {
                    debug!("Usage flush for {}:{} failed: {}", key.0, key.1, e);
                    self.requeue(key, usage);
                }
            }
        }
        written
    }

    async fn records(&self) -> Result<Vec<UsageRecord>> {
        let keys = self.remote.keys_matching("usage:*").await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match self.remote.get_json::<UsageRecord>(&key).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => debug!("Skipping unreadable usage record {}: {}", key, e),
            }
        }
        Ok(records)
    }

    async fn record(&self, class: WorkloadClass, operation: &str) -> Result<Option<UsageRecord>> {
        self.remote
            .get_json(&KeyCodec::usage_key(class, operation))
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================
