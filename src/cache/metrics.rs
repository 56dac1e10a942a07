//! Cache Metrics Collection
//!
//! Per-cache counters plus a serializable [`MetricsSnapshot`] consumed by
//! the monitor, the optimizer and the ops endpoints.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Name used for the derived aggregate snapshot
pub const AGGREGATE_NAME: &str = "aggregate";

/// EMA smoothing factor for response times
const LATENCY_ALPHA: f64 = 0.1;

/// Counters for one logical cache
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    /// Exponential moving average, microseconds
    response_time_us: AtomicU64,
    /// Unix millis of the last recorded request
    last_updated_ms: AtomicI64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, elapsed: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.record_latency(elapsed);
    }

    pub fn record_miss(&self, elapsed: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.record_latency(elapsed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        self.last_updated_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn record_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;

        loop {
            let current = self.response_time_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us.max(1)
            } else {
                ((1.0 - LATENCY_ALPHA) * current as f64 + LATENCY_ALPHA * new_us as f64) as u64
            };

            if self
                .response_time_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        self.touch();
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// hits / total requests (0.0 - 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }

    /// Rolling average response time
    pub fn avg_response_time(&self) -> Duration {
        Duration::from_micros(self.response_time_us.load(Ordering::Relaxed))
    }

    /// Snapshot combined with tier-owned figures
    pub fn snapshot(&self, name: &str, memory_usage_bytes: u64, evictions: u64) -> MetricsSnapshot {
        let last = self.last_updated_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            name: name.to_string(),
            hits: self.hits(),
            misses: self.misses(),
            hit_rate: self.hit_rate(),
            total_requests: self.total_requests(),
            avg_response_time_ms: self.avg_response_time().as_secs_f64() * 1000.0,
            memory_usage_bytes,
            evictions,
            errors: self.errors(),
            last_updated: Utc
                .timestamp_millis_opt(last)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Point-in-time metrics of one logical cache (or the aggregate)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub name: String,
    pub hits: u64,
    pub misses: u64,
    /// 0.0 - 1.0
    pub hit_rate: f64,
    pub total_requests: u64,
    pub avg_response_time_ms: f64,
    pub memory_usage_bytes: u64,
    pub evictions: u64,
    pub errors: u64,
    pub last_updated: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Empty snapshot
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            hits: 0,
            misses: 0,
            hit_rate: 0.0,
            total_requests: 0,
            avg_response_time_ms: 0.0,
            memory_usage_bytes: 0,
            evictions: 0,
            errors: 0,
            last_updated: Utc::now(),
        }
    }

    /// Errors per request, in percent
    pub fn error_rate_percent(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.total_requests as f64 * 100.0
        }
    }

    pub fn hit_rate_percent(&self) -> f64 {
        self.hit_rate * 100.0
    }

    /// Sum of several caches; response time weighted by request count
    pub fn aggregate(snapshots: &[MetricsSnapshot]) -> MetricsSnapshot {
        let mut agg = MetricsSnapshot::empty(AGGREGATE_NAME);
        let mut weighted_ms = 0.0;
        let mut latest: Option<DateTime<Utc>> = None;

        for s in snapshots {
            agg.hits += s.hits;
            agg.misses += s.misses;
            agg.total_requests += s.total_requests;
            agg.memory_usage_bytes += s.memory_usage_bytes;
            agg.evictions += s.evictions;
            agg.errors += s.errors;
            weighted_ms += s.avg_response_time_ms * s.total_requests as f64;
            latest = Some(latest.map_or(s.last_updated, |l| l.max(s.last_updated)));
        }

        if agg.total_requests > 0 {
            agg.hit_rate = agg.hits as f64 / agg.total_requests as f64;
            agg.avg_response_time_ms = weighted_ms / agg.total_requests as f64;
        }
        if let Some(latest) = latest {
            agg.last_updated = latest;
        }
        agg
    }
}

// =============================================================================
// Tests
// =============================================================================
