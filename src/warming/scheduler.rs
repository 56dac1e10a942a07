//! Warming Scheduler
//!
//! Pre-populates the caches with placeholder results for popular
//! operations, so the first real request for a popular transformation finds
//! its template entry instead of a cold cache.
//!
//! A cycle ranks operations from usage records and a static list of known
//! popular operations, then warms the top entries with bounded concurrency.
//! One failed entry never aborts the rest of the batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::usage::UsageTracker;
use crate::cache::{
    ttl, CacheKey, CacheRegistry, KeyCodec, SizeCategory, StrategyConfig, TierId, WorkloadClass,
};
use crate::error::{Error, Result};

/// Warming configuration
#[derive(Debug, Clone)]
pub struct WarmingConfig {
    pub enabled: bool,
    /// Delay between the end of one cycle and the next
    pub interval: Duration,
    /// Entries warmed in parallel
    pub max_concurrent_warmups: usize,
    /// Run one cycle shortly after start
    pub warm_on_startup: bool,
    pub startup_delay: Duration,
    /// Operations warmed per cycle
    pub top_n: usize,
    /// Subject id used in warm keys
    pub subject: String,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600), // 1 hour
            max_concurrent_warmups: 3,
            warm_on_startup: true,
            startup_delay: Duration::from_secs(5),
            top_n: 20,
            subject: "warmup".to_string(),
        }
    }
}

/// An operation selected for warming
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopularOperation {
    pub class: WorkloadClass,
    pub operation: String,
    pub params: Value,
    pub priority: u8,
    /// Ranking score; higher warms first
    pub score: f64,
    /// Hits recorded by usage tracking
    pub hits: u64,
}

impl PopularOperation {
    fn fixed(class: WorkloadClass, operation: &str, params: Value, priority: u8) -> Self {
        Self {
            class,
            operation: operation.to_string(),
            params,
            priority,
            score: priority as f64,
            hits: 0,
        }
    }

    /// Key of the warm entry
    pub fn cache_key(&self, subject: &str) -> Result<CacheKey> {
        KeyCodec::build_key(self.class, &self.operation, subject, &self.params)
    }
}

/// Operations warmed regardless of observed usage
pub fn static_popular_operations() -> Vec<PopularOperation> {
    use WorkloadClass::*;
    vec![
        PopularOperation::fixed(Doc, "merge", json!({}), 10),
        PopularOperation::fixed(Doc, "split", json!({}), 9),
        PopularOperation::fixed(Image, "resize", json!({"width": 800, "height": 600}), 10),
        PopularOperation::fixed(Image, "convert", json!({"format": "webp"}), 9),
        PopularOperation::fixed(Video, "compress", json!({"quality": "medium"}), 8),
        PopularOperation::fixed(Video, "convert", json!({"format": "mp4"}), 7),
    ]
}

/// Outcome of one warming cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmingReport {
    pub warmed: usize,
    /// Already present, left untouched
    pub skipped: usize,
    pub failed: usize,
    pub metadata_entries: usize,
    pub duration_ms: u64,
}

/// Cumulative warming statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmingStats {
    pub total_operations: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_warm_time_ms: f64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_report: Option<WarmingReport>,
    pub popular_operations: Vec<PopularOperation>,
}

/// Resets the in-progress flag when a cycle ends
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum WarmOutcome {
    Warmed,
    Skipped,
}

/// Periodically warms popular operations
pub struct WarmingScheduler {
    config: WarmingConfig,
    registry: Arc<CacheRegistry>,
    usage: Arc<dyn UsageTracker>,
    in_progress: AtomicBool,
    stats: Mutex<WarmingStats>,
}

impl WarmingScheduler {
    pub fn new(registry: Arc<CacheRegistry>, usage: Arc<dyn UsageTracker>) -> Self {
        Self::with_config(registry, usage, WarmingConfig::default())
    }

    pub fn with_config(
        registry: Arc<CacheRegistry>,
        usage: Arc<dyn UsageTracker>,
        config: WarmingConfig,
    ) -> Self {
        Self {
            config,
            registry,
            usage,
            in_progress: AtomicBool::new(false),
            stats: Mutex::new(WarmingStats::default()),
        }
    }

    pub fn config(&self) -> &WarmingConfig {
        &self.config
    }

    /// Ranked operations: usage-derived entries merged with the static list.
    ///
    /// Pending usage counts are flushed first.
    pub async fn popular_operations(&self) -> Vec<PopularOperation> {
        let flushed = self.usage.flush().await;
        if flushed > 0 {
            debug!("Flushed {} usage records", flushed);
        }
        let now = Utc::now();
        let mut merged: HashMap<(WorkloadClass, String), PopularOperation> =
            static_popular_operations()
                .into_iter()
                .map(|op| ((op.class, op.operation.clone()), op))
                .collect();

        match self.usage.records().await {
            Ok(records) => {
                for record in records {
                    let (Some(class), Some(operation)) = (record.class(), record.operation())
                    else {
                        continue;
                    };
                    let score = record.score(now);
                    merged
                        .entry((class, operation.to_string()))
                        .and_modify(|op| {
                            op.score += score;
                            op.hits = record.hits;
                            op.priority = op.priority.max(record.priority());
                        })
                        .or_insert_with(|| PopularOperation {
                            class,
                            operation: operation.to_string(),
                            params: json!({}),
                            priority: record.priority(),
                            score,
                            hits: record.hits,
                        });
                }
            }
            Err(e) => warn!("Usage records unavailable, ranking static operations only: {}", e),
        }

        let mut ranked: Vec<_> = merged.into_values().collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| (a.class, &a.operation).cmp(&(b.class, &b.operation)))
        });
        ranked
    }

    /// Run one cycle now; refused while another cycle is running
    #[instrument(skip(self))]
    pub async fn trigger(&self) -> Result<WarmingReport> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::WarmingInProgress);
        }
        let _guard = CycleGuard(&self.in_progress);

        let start = Instant::now();
        let mut ranked = self.popular_operations().await;
        ranked.truncate(self.config.top_n);

        let outcomes: Vec<(Duration, Result<WarmOutcome>)> = stream::iter(ranked.clone())
            .map(|op| async move {
                let started = Instant::now();
                let outcome = self.warm(&op).await;
                (started.elapsed(), outcome)
            })
            .buffer_unordered(self.config.max_concurrent_warmups.max(1))
            .collect()
            .await;

        let mut report = WarmingReport::default();
        let mut warm_time = Duration::ZERO;
        for (elapsed, outcome) in outcomes {
            match outcome {
                Ok(WarmOutcome::Warmed) => {
                    report.warmed += 1;
                    warm_time += elapsed;
                }
                Ok(WarmOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    debug!("Warming entry failed: {}", e);
                }
            }
        }
        report.metadata_entries = self.warm_metadata().await;
        report.duration_ms = start.elapsed().as_millis() as u64;

        self.record(&report, warm_time, ranked);
        info!(
            "Warming cycle: {} warmed, {} skipped, {} failed, {} metadata entries in {}ms",
            report.warmed, report.skipped, report.failed, report.metadata_entries, report.duration_ms
        );
        Ok(report)
    }

    async fn warm(&self, op: &PopularOperation) -> Result<WarmOutcome> {
        let key = op.cache_key(&self.config.subject)?;
        let cache = self.registry.file();
        if cache.has(key.as_str()).await {
            return Ok(WarmOutcome::Skipped);
        }

        let strategy = self.registry.strategies().get(op.class, SizeCategory::Tiny);
        let outcome = cache
            .set_json(key.as_str(), &placeholder(op), &strategy)
            .await?;
        if outcome.stored() {
            debug!("Warmed {}", key);
            Ok(WarmOutcome::Warmed)
        } else {
            Err(Error::Internal(format!("no tier accepted warm entry {}", key)))
        }
    }

    /// Descriptive payloads for the API cache; returns entries written
    async fn warm_metadata(&self) -> usize {
        let strategy = StrategyConfig {
            ttl_seconds: ttl::LONG,
            tiers: vec![TierId::Memory, TierId::Remote],
            priority: 10,
            compress: true,
        };
        let api = self.registry.api();

        let mut entries = vec![("api:metadata:tools".to_string(), tool_catalogue())];
        entries.extend(
            WorkloadClass::ALL
                .iter()
                .map(|class| (format!("api:config:{}", class), engine_config(*class))),
        );

        let mut written = 0;
        for (key, payload) in entries {
            match api.set_json(&key, &payload, &strategy).await {
                Ok(outcome) if outcome.stored() => written += 1,
                Ok(_) => debug!("Metadata entry {} not stored", key),
                Err(e) => debug!("Metadata entry {} failed: {}", key, e),
            }
        }
        written
    }

    fn record(&self, report: &WarmingReport, warm_time: Duration, ranked: Vec<PopularOperation>) {
        let mut stats = self.stats.lock();
        let attempted = (report.warmed + report.failed) as u64;
        let prior_successes = stats.successful;

        stats.total_operations += attempted;
        stats.successful += report.warmed as u64;
        stats.failed += report.failed as u64;
        if report.warmed > 0 {
            let batch_avg = warm_time.as_secs_f64() * 1000.0 / report.warmed as f64;
            stats.average_warm_time_ms = (stats.average_warm_time_ms * prior_successes as f64
                + batch_avg * report.warmed as f64)
                / stats.successful as f64;
        }

        let now = Utc::now();
        stats.last_run = Some(now);
        stats.next_run = chrono::Duration::from_std(self.config.interval)
            .ok()
            .map(|d| now + d);
        stats.last_report = Some(report.clone());
        stats.popular_operations = ranked;
    }

    pub fn stats(&self) -> WarmingStats {
        self.stats.lock().clone()
    }

    /// Whether a cycle is running
    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Warm after the startup delay, then on every interval, until cancelled
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run(token).await })
    }

    #[instrument(skip(self, token))]
    async fn run(self: Arc<Self>, token: CancellationToken) {
        info!("Starting warming scheduler with {:?}", self.config);

        if self.config.warm_on_startup {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.config.startup_delay) => self.cycle().await,
            }
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => self.cycle().await,
            }
        }
        info!("Warming scheduler stopped");
    }

    async fn cycle(&self) {
        if let Err(e) = self.trigger().await {
            error!("Warming cycle failed: {}", e);
        }
    }
}

fn placeholder(op: &PopularOperation) -> Value {
    let (formats, max_size_mb, processing_time) = match op.class {
        WorkloadClass::Doc => (json!(["pdf", "docx", "txt", "html"]), 100, "fast"),
        WorkloadClass::Image => (json!(["jpeg", "png", "webp", "gif", "avif"]), 50, "fast"),
        WorkloadClass::Video => (json!(["mp4", "webm", "mov", "mkv"]), 2048, "slow"),
    };
    let features = match (op.class, op.operation.as_str()) {
        (WorkloadClass::Doc, "merge") => json!(["page_order", "bookmarks"]),
        (WorkloadClass::Doc, "split") => json!(["page_ranges", "every_n_pages"]),
        (WorkloadClass::Image, "resize") => json!(["aspect_ratio", "upscale_guard"]),
        (WorkloadClass::Image, "convert") => json!(["lossless", "quality"]),
        (WorkloadClass::Video, "compress") => json!(["crf", "two_pass"]),
        (WorkloadClass::Video, "convert") => json!(["container", "codec"]),
        _ => json!([]),
    };
    json!({
        "warmed": true,
        "template": true,
        "class": op.class,
        "operation": op.operation,
        "params": op.params,
        "supported_formats": formats,
        "max_file_size": max_size_mb * 1024 * 1024,
        "processing_time": processing_time,
        "features": features,
        "warmed_at": Utc::now(),
    })
}

fn tool_catalogue() -> Value {
    let tools: Vec<Value> = static_popular_operations()
        .iter()
        .map(|op| json!({"class": op.class, "operation": op.operation}))
        .collect();
    json!({ "tools": tools, "warmed": true })
}

fn engine_config(class: WorkloadClass) -> Value {
    let timeout_seconds = match class {
        WorkloadClass::Doc => 60,
        WorkloadClass::Image => 30,
        WorkloadClass::Video => 600,
    };
    json!({
        "class": class,
        "timeout_seconds": timeout_seconds,
        "warmed": true,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryRemoteStore, RemoteTier, StrategyTable};
    use crate::warming::{RemoteUsageTracker, UsageRecord};
    use assert_matches::assert_matches;

    struct Fixture {
        scheduler: Arc<WarmingScheduler>,
        registry: Arc<CacheRegistry>,
        tracker: Arc<RemoteUsageTracker>,
        store: Arc<InMemoryRemoteStore>,
    }

    fn setup(config: WarmingConfig) -> Fixture {
        let (remote, store) = RemoteTier::in_memory();
        let remote = Arc::new(remote);
        let tracker = Arc::new(RemoteUsageTracker::new(Arc::clone(&remote)));
        let usage: Arc<dyn UsageTracker> = tracker.clone();
        let registry = Arc::new(CacheRegistry::new(
            remote,
            Arc::new(StrategyTable::new()),
            Some(Arc::clone(&usage)),
        ));
        let scheduler = Arc::new(WarmingScheduler::with_config(
            Arc::clone(&registry),
            usage,
            config,
        ));
        Fixture {
            scheduler,
            registry,
            tracker,
            store,
        }
    }

    #[tokio::test]
    async fn test_static_ranking_without_usage() {
        let f = setup(WarmingConfig::default());
        let ranked = f.scheduler.popular_operations().await;
        assert_eq!(ranked.len(), 6);
        assert_eq!(ranked[0].priority, 10);
        assert_eq!(ranked.last().unwrap().operation, "convert");
        assert_eq!(ranked.last().unwrap().class, WorkloadClass::Video);
    }

    #[tokio::test]
    async fn test_usage_outranks_static_priority() {
        let f = setup(WarmingConfig::default());
        let now = Utc::now();
        f.tracker
            .store(&UsageRecord::new(WorkloadClass::Video, "trim", 400, now))
            .await
            .unwrap();

        let ranked = f.scheduler.popular_operations().await;
        assert_eq!(ranked.len(), 7);
        assert_eq!(ranked[0].operation, "trim");
        assert_eq!(ranked[0].hits, 400);
        assert_eq!(ranked[0].priority, 10);
        assert_eq!(ranked[0].params, json!({}));
    }

    #[tokio::test]
    async fn test_tracked_usage_flushed_before_ranking() {
        let f = setup(WarmingConfig::default());
        for _ in 0..3 {
            f.tracker.track_usage(WorkloadClass::Doc, "watermark");
        }

        let scheduler = Arc::clone(&f.scheduler);
        let report = tokio::spawn(async move { scheduler.trigger().await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.tracker.pending(), 0);
        assert_eq!(report.warmed, 7);

        let ranked = f.scheduler.stats().popular_operations;
        assert!(ranked
            .iter()
            .any(|op| op.operation == "watermark" && op.hits == 3));
    }

    #[tokio::test]
    async fn test_cycle_warms_and_skips_present_entries() {
        let f = setup(WarmingConfig::default());

        let report = f.scheduler.trigger().await.unwrap();
        assert_eq!(report.warmed, 6);
        assert_eq!(report.failed, 0);
        assert_eq!(report.metadata_entries, 4);

        let resize = &static_popular_operations()[2];
        let key = resize.cache_key("warmup").unwrap();
        let value: Value = f.registry.file().get_json(key.as_str()).await.unwrap();
        assert_eq!(value["warmed"], true);
        assert_eq!(value["params"]["width"], 800);
        assert!(f.registry.api().has("api:metadata:tools").await);
        assert!(f.registry.api().has("api:config:video").await);

        let again = f.scheduler.trigger().await.unwrap();
        assert_eq!(again.warmed, 0);
        assert_eq!(again.skipped, 6);

        let stats = f.scheduler.stats();
        assert_eq!(stats.successful, 6);
        assert_eq!(stats.total_operations, 6);
        assert!(stats.next_run > stats.last_run);
        assert_eq!(stats.popular_operations.len(), 6);
    }

    #[tokio::test]
    async fn test_top_n_limits_batch() {
        let f = setup(WarmingConfig {
            top_n: 2,
            ..Default::default()
        });
        let report = f.scheduler.trigger().await.unwrap();
        assert_eq!(report.warmed, 2);
    }

    #[tokio::test]
    async fn test_outage_counts_failures_without_aborting() {
        let f = setup(WarmingConfig::default());
        f.store.set_available(false);
        // Memory tier still accepts tiny entries
        let report = f.scheduler.trigger().await.unwrap();
        assert_eq!(report.warmed + report.failed, 6);
        assert!(!f.scheduler.is_running());
    }

    #[tokio::test]
    async fn test_concurrent_trigger_refused() {
        let f = setup(WarmingConfig::default());
        let (a, b) = tokio::join!(f.scheduler.trigger(), f.scheduler.trigger());
        let refused = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(Error::WarmingInProgress)))
            .count();
        assert!(refused <= 1);
        assert!(a.is_ok() || b.is_ok());
        assert_matches!(f.scheduler.trigger().await, Ok(_));
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_cycle_then_stop() {
        let f = setup(WarmingConfig {
            startup_delay: Duration::from_secs(5),
            ..Default::default()
        });
        let token = CancellationToken::new();
        let handle = f.scheduler.spawn(token.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(f.scheduler.stats().last_run.is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.scheduler.stats().successful, 6);

        token.cancel();
        handle.await.unwrap();
    }
}
