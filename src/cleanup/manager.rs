//! Cleanup Manager
//!
//! Memory-pressure driven reclamation, separate from TTL expiry. A pass runs
//! when the remote store or the memory tiers exceed their thresholds, when
//! the remote memory check fails, or unconditionally for an emergency pass.
//! A triggered pass sweeps expired memory tier entries, then:
//!
//! 1. deletes keys about to expire anyway
//! 2. gives TTL-less (orphaned) keys the default TTL
//! 3. removes the largest sampled values, up to a cap
//! 4. removes failed-job markers
//! 5. asks the store to reclaim freed memory
//!
//! In dry-run mode every action is reported but nothing is changed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{ttl, CacheRegistry, KeyTtl, RemoteTier};
use crate::error::{Error, Result};

/// Cleanup configuration
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// Delay between passes
    pub interval: Duration,
    /// Delay before the first pass
    pub initial_delay: Duration,
    /// Memory tier utilization that triggers a pass (percent)
    pub max_process_memory_percent: f64,
    /// Remote store usage that triggers a pass
    pub max_remote_memory_bytes: u64,
    /// TTL given to keys found without one
    pub orphan_ttl_seconds: u64,
    /// Keys per delete batch
    pub batch_size: usize,
    /// Report actions without performing them
    pub dry_run: bool,
    /// Keys expiring sooner than this are removed
    pub near_expiry_seconds: u64,
    /// Values at least this large are removal candidates
    pub large_value_bytes: u64,
    /// At most this many large values removed per pass
    pub max_large_removals: usize,
    /// Keys sampled for their size
    pub size_sample: usize,
    /// Failed-job markers
    pub failed_pattern: String,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600),     // 1 hour
            initial_delay: Duration::from_secs(30),
            max_process_memory_percent: 80.0,
            max_remote_memory_bytes: 1024 * 1024 * 1024, // 1GB
            orphan_ttl_seconds: ttl::VERY_LONG,
            batch_size: 100,
            dry_run: false,
            near_expiry_seconds: 60,
            large_value_bytes: 1024 * 1024, // 1MB
            max_large_removals: 10,
            size_sample: 1000,
            failed_pattern: "processing:*:failed".to_string(),
        }
    }
}

/// Kind of reclamation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupActionKind {
    NearExpiry,
    OrphanTtl,
    LargeValues,
    FailedJobs,
    MemorySweep,
    MemoryPurge,
}

/// One step of a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupAction {
    pub kind: CleanupActionKind,
    pub keys: Vec<String>,
    /// Known bytes affected
    pub bytes: u64,
    /// False in dry-run mode or when the step failed
    pub performed: bool,
}

/// Outcome of one pass
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub started_at: DateTime<Utc>,
    pub dry_run: bool,
    /// Whether a threshold was exceeded (always true for emergency passes)
    pub triggered: bool,
    pub remote_used_bytes: u64,
    pub process_memory_percent: f64,
    pub keys_scanned: usize,
    pub keys_removed: usize,
    pub bytes_freed: u64,
    pub errors: usize,
    pub actions: Vec<CleanupAction>,
    pub duration_ms: u64,
}

impl CleanupReport {
    fn new(dry_run: bool) -> Self {
        Self {
            started_at: Utc::now(),
            dry_run,
            triggered: false,
            remote_used_bytes: 0,
            process_memory_percent: 0.0,
            keys_scanned: 0,
            keys_removed: 0,
            bytes_freed: 0,
            errors: 0,
            actions: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Action of a given kind, if the pass took one
    pub fn action(&self, kind: CleanupActionKind) -> Option<&CleanupAction> {
        self.actions.iter().find(|a| a.kind == kind)
    }
}

/// Cumulative cleanup statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupStats {
    pub total_runs: u64,
    pub keys_scanned: u64,
    pub keys_removed: u64,
    pub memory_freed_bytes: u64,
    pub errors: u64,
    pub average_run_time_ms: f64,
    pub last_run: Option<DateTime<Utc>>,
}

struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Reclaims memory under pressure
pub struct CleanupManager {
    config: CleanupConfig,
    registry: Arc<CacheRegistry>,
    in_progress: AtomicBool,
    stats: Mutex<CleanupStats>,
}

impl CleanupManager {
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self::with_config(registry, CleanupConfig::default())
    }

    pub fn with_config(registry: Arc<CacheRegistry>, config: CleanupConfig) -> Self {
        Self {
            config,
            registry,
            in_progress: AtomicBool::new(false),
            stats: Mutex::new(CleanupStats::default()),
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    fn remote(&self) -> &Arc<RemoteTier> {
        self.registry.remote()
    }

    /// Pass gated on the memory thresholds
    #[instrument(skip(self))]
    pub async fn run_cleanup(&self) -> Result<CleanupReport> {
        self.pass(false).await
    }

    /// Pass that skips the threshold check
    #[instrument(skip(self))]
    pub async fn emergency_cleanup(&self) -> Result<CleanupReport> {
        warn!("Emergency cleanup requested");
        self.pass(true).await
    }

    async fn pass(&self, force: bool) -> Result<CleanupReport> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::CleanupInProgress);
        }
        let _guard = PassGuard(&self.in_progress);

        let start = Instant::now();
        let dry_run = self.config.dry_run;
        let mut report = CleanupReport::new(dry_run);

        // An unreadable remote counts as over its limit
        let remote_over = match self.remote().memory_info().await {
            Ok(info) => {
                report.remote_used_bytes = info.used_bytes;
                info.used_bytes > self.config.max_remote_memory_bytes
            }
            Err(e) => {
                warn!("Remote memory check failed, assuming pressure: {}", e);
                report.errors += 1;
                true
            }
        };
        report.process_memory_percent = self.registry.memory_utilization_percent();

        let process_over = report.process_memory_percent > self.config.max_process_memory_percent;
        report.triggered = force || remote_over || process_over;

        if !report.triggered {
            debug!(
                "Cleanup not needed: remote {} bytes, memory tiers {:.1}%",
                report.remote_used_bytes, report.process_memory_percent
            );
        } else {
            self.sweep_memory(&mut report);
            self.reclaim_remote(&mut report).await;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        self.record(&report);
        if report.triggered {
            info!(
                "Cleanup{}: scanned {}, removed {}, freed {} bytes, {} errors in {}ms",
                if dry_run { " (dry run)" } else { "" },
                report.keys_scanned,
                report.keys_removed,
                report.bytes_freed,
                report.errors,
                report.duration_ms
            );
        }
        Ok(report)
    }

    fn sweep_memory(&self, report: &mut CleanupReport) {
        let removed: usize = if report.dry_run {
            0
        } else {
            self.registry
                .caches()
                .iter()
                .map(|c| c.memory().sweep_expired())
                .sum()
        };
        report.actions.push(CleanupAction {
            kind: CleanupActionKind::MemorySweep,
            keys: Vec::new(),
            bytes: 0,
            performed: !report.dry_run,
        });
        debug!("Swept {} expired memory tier entries", removed);
    }

    async fn reclaim_remote(&self, report: &mut CleanupReport) {
        let keys = match self.remote().keys_matching("*").await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cleanup scan failed: {}", e);
                report.errors += 1;
                return;
            }
        };
        report.keys_scanned = keys.len();

        // 1 + 2: one TTL sweep finds both near-expiry and orphaned keys
        let mut near_expiry = Vec::new();
        let mut orphans = Vec::new();
        for key in &keys {
            match self.remote().ttl(key).await {
                Ok(KeyTtl::Expires(secs)) if secs < self.config.near_expiry_seconds => {
                    near_expiry.push(key.clone())
                }
                Ok(KeyTtl::Persistent) => orphans.push(key.clone()),
                Ok(_) => {}
                Err(_) => report.errors += 1,
            }
        }

        if !near_expiry.is_empty() {
            let action = self
                .remove(CleanupActionKind::NearExpiry, near_expiry, 0, report)
                .await;
            report.actions.push(action);
        }

        if !orphans.is_empty() {
            let mut performed = !report.dry_run;
            if !report.dry_run {
                for key in &orphans {
                    if let Err(e) = self.remote().expire(key, self.config.orphan_ttl_seconds).await {
                        debug!("Could not assign ttl to {}: {}", key, e);
                        report.errors += 1;
                        performed = false;
                    }
                }
            }
            info!(
                "{} orphaned keys {} ttl {}s",
                orphans.len(),
                if report.dry_run { "would get" } else { "given" },
                self.config.orphan_ttl_seconds
            );
            report.actions.push(CleanupAction {
                kind: CleanupActionKind::OrphanTtl,
                keys: orphans,
                bytes: 0,
                performed,
            });
        }

        // 3: largest sampled values
        let mut sized = Vec::new();
        for key in keys.iter().take(self.config.size_sample) {
            match self.remote().get_raw(key).await {
                Ok(Some(raw)) if raw.len() as u64 >= self.config.large_value_bytes => {
                    sized.push((raw.len() as u64, key.clone()))
                }
                Ok(_) => {}
                Err(_) => report.errors += 1,
            }
        }
        sized.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        sized.truncate(self.config.max_large_removals);
        if !sized.is_empty() {
            let bytes = sized.iter().map(|(size, _)| size).sum();
            let large = sized.into_iter().map(|(_, key)| key).collect();
            let action = self
                .remove(CleanupActionKind::LargeValues, large, bytes, report)
                .await;
            report.actions.push(action);
        }

        // 4: failed-job markers
        match self.remote().keys_matching(&self.config.failed_pattern).await {
            Ok(failed) if !failed.is_empty() => {
                let action = self
                    .remove(CleanupActionKind::FailedJobs, failed, 0, report)
                    .await;
                report.actions.push(action);
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Failed-job scan failed: {}", e);
                report.errors += 1;
            }
        }

        // 5: reclaim hint
        let purged = if report.dry_run {
            false
        } else {
            match self.remote().purge_memory().await {
                Ok(supported) => supported,
                Err(e) => {
                    debug!("Memory purge failed: {}", e);
                    report.errors += 1;
                    false
                }
            }
        };
        report.actions.push(CleanupAction {
            kind: CleanupActionKind::MemoryPurge,
            keys: Vec::new(),
            bytes: 0,
            performed: purged,
        });
    }

    /// Delete keys in batches, evicting memory copies too
    async fn remove(
        &self,
        kind: CleanupActionKind,
        keys: Vec<String>,
        bytes: u64,
        report: &mut CleanupReport,
    ) -> CleanupAction {
        if report.dry_run {
            info!("Dry run: would remove {} keys ({:?})", keys.len(), kind);
            return CleanupAction {
                kind,
                keys,
                bytes,
                performed: false,
            };
        }

        let mut performed = true;
        for batch in keys.chunks(self.config.batch_size.max(1)) {
            match self.remote().del(batch).await {
                Ok(n) => report.keys_removed += n as usize,
                Err(e) => {
                    warn!("Cleanup batch of {} keys failed: {}", batch.len(), e);
                    report.errors += 1;
                    performed = false;
                }
            }
        }
        self.registry.evict_from_memory(&keys);
        if performed {
            report.bytes_freed += bytes;
        }
        CleanupAction {
            kind,
            keys,
            bytes,
            performed,
        }
    }

    fn record(&self, report: &CleanupReport) {
        let mut stats = self.stats.lock();
        let prior_runs = stats.total_runs as f64;
        stats.total_runs += 1;
        stats.keys_scanned += report.keys_scanned as u64;
        stats.keys_removed += report.keys_removed as u64;
        stats.memory_freed_bytes += report.bytes_freed;
        stats.errors += report.errors as u64;
        stats.average_run_time_ms = (stats.average_run_time_ms * prior_runs
            + report.duration_ms as f64)
            / stats.total_runs as f64;
        stats.last_run = Some(report.started_at);
    }

    pub fn stats(&self) -> CleanupStats {
        self.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Run passes after the initial delay, then on every interval, until cancelled
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run(token).await })
    }

    #[instrument(skip(self, token))]
    async fn run(self: Arc<Self>, token: CancellationToken) {
        info!("Starting cleanup manager with {:?}", self.config);
        let mut delay = self.config.initial_delay;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.run_cleanup().await {
                        error!("Cleanup pass failed: {}", e);
                    }
                }
            }
            delay = self.config.interval;
        }
        info!("Cleanup manager stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
