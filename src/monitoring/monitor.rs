//! Cache Monitor
//!
//! Samples cache metrics and remote tier health on an interval, keeps a
//! retention-bounded history and raises alerts when a threshold is crossed.
//! Alerts are deduplicated by type: while one alert of a type is unresolved,
//! further breaches of that type raise nothing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::alerts::{Alert, AlertType};
use super::exporter::PrometheusExporter;
use crate::cache::{CacheRegistry, MetricsSnapshot};
use crate::error::{Error, Result};
use crate::warming::WarmingScheduler;

/// Monitor thresholds and timing
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sampling interval
    pub interval: Duration,
    /// Samples older than this are dropped
    pub retention: Duration,
    /// Alert when the hit rate falls below this (percent)
    pub min_hit_rate_percent: f64,
    /// Alert when the average lookup exceeds this
    pub max_response_time_ms: f64,
    /// Alert when errors per request exceed this (percent)
    pub max_error_rate_percent: f64,
    /// Alert when memory usage exceeds this (percent)
    pub max_memory_percent: f64,
    /// Resolved alerts beyond this count are forgotten
    pub max_alerts: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 3600), // 7 days
            min_hit_rate_percent: 90.0,
            max_response_time_ms: 200.0,
            max_error_rate_percent: 5.0,
            max_memory_percent: 80.0,
            max_alerts: 1000,
        }
    }
}

/// One monitoring sample
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSample {
    pub timestamp: DateTime<Utc>,
    pub aggregate: MetricsSnapshot,
    pub caches: Vec<MetricsSnapshot>,
    pub remote_connected: bool,
    pub remote_used_bytes: u64,
    /// Remote store usage against its limit, or memory tier utilization
    /// when the store reports no limit; whichever is higher
    pub memory_percent: f64,
}

/// Rollup for health endpoints
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub healthy: bool,
    /// Percent
    pub hit_rate: f64,
    pub response_time_ms: f64,
    pub active_alerts: usize,
    pub last_update: Option<DateTime<Utc>>,
}

/// Periodic sampler and alert evaluator
pub struct Monitor {
    config: MonitorConfig,
    registry: Arc<CacheRegistry>,
    warming: Option<Arc<WarmingScheduler>>,
    exporter: Option<Arc<PrometheusExporter>>,
    history: RwLock<VecDeque<MetricsSample>>,
    alerts: RwLock<Vec<Alert>>,
    /// Last warming run already evaluated
    warming_seen: Mutex<Option<DateTime<Utc>>>,
}

impl Monitor {
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self::with_config(registry, MonitorConfig::default())
    }

    pub fn with_config(registry: Arc<CacheRegistry>, config: MonitorConfig) -> Self {
        Self {
            config,
            registry,
            warming: None,
            exporter: None,
            history: RwLock::new(VecDeque::new()),
            alerts: RwLock::new(Vec::new()),
            warming_seen: Mutex::new(None),
        }
    }

    /// Also watch warming cycles for failures
    pub fn with_warming(mut self, warming: Arc<WarmingScheduler>) -> Self {
        self.warming = Some(warming);
        self
    }

    /// Push every sample to a Prometheus exporter
    pub fn with_exporter(mut self, exporter: Arc<PrometheusExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    // =========================================================================
    // Sampling
    // =========================================================================

    /// Take a sample, record it and evaluate the thresholds
    #[instrument(skip(self))]
    pub async fn collect(&self) -> MetricsSample {
        let remote = self.registry.remote();
        let remote_connected = remote.ping().await;

        let (remote_used_bytes, remote_percent) = match remote.memory_info().await {
            Ok(info) if info.max_bytes > 0 => (
                info.used_bytes,
                info.used_bytes as f64 / info.max_bytes as f64 * 100.0,
            ),
            Ok(info) => (info.used_bytes, 0.0),
            Err(e) => {
                debug!("Remote memory info unavailable: {}", e);
                (0, 0.0)
            }
        };

        let caches = self.registry.metrics();
        let sample = MetricsSample {
            timestamp: Utc::now(),
            aggregate: MetricsSnapshot::aggregate(&caches),
            caches,
            remote_connected,
            remote_used_bytes,
            memory_percent: remote_percent.max(self.registry.memory_utilization_percent()),
        };

        self.push(sample.clone());
        self.evaluate(&sample).await;

        if let Some(exporter) = &self.exporter {
            exporter.update(&sample, self.active_alerts().len());
        }
        sample
    }

    fn push(&self, sample: MetricsSample) {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let cutoff = sample.timestamp - retention;
        let mut history = self.history.write();
        history.push_back(sample);
        while history.front().is_some_and(|s| s.timestamp < cutoff) {
            history.pop_front();
        }
    }

    async fn evaluate(&self, sample: &MetricsSample) {
        let agg = &sample.aggregate;
        let cfg = &self.config;

        if agg.total_requests > 0 {
            let hit_rate = agg.hit_rate_percent();
            if hit_rate < cfg.min_hit_rate_percent {
                self.raise(
                    AlertType::LowHitRate,
                    format!("Hit rate {:.1}% below {:.1}%", hit_rate, cfg.min_hit_rate_percent),
                    hit_rate,
                    cfg.min_hit_rate_percent,
                )
                .await;
            }

            let error_rate = agg.error_rate_percent();
            if error_rate > cfg.max_error_rate_percent {
                self.raise(
                    AlertType::HighErrorRate,
                    format!(
                        "Error rate {:.1}% above {:.1}%",
                        error_rate, cfg.max_error_rate_percent
                    ),
                    error_rate,
                    cfg.max_error_rate_percent,
                )
                .await;
            }
        }

        if agg.avg_response_time_ms > cfg.max_response_time_ms {
            self.raise(
                AlertType::HighResponseTime,
                format!(
                    "Response time {:.1}ms above {:.0}ms",
                    agg.avg_response_time_ms, cfg.max_response_time_ms
                ),
                agg.avg_response_time_ms,
                cfg.max_response_time_ms,
            )
            .await;
        }

        if sample.memory_percent > cfg.max_memory_percent {
            self.raise(
                AlertType::HighMemoryUsage,
                format!(
                    "Memory usage {:.1}% above {:.0}%",
                    sample.memory_percent, cfg.max_memory_percent
                ),
                sample.memory_percent,
                cfg.max_memory_percent,
            )
            .await;
        }

        if !sample.remote_connected {
            self.raise(
                AlertType::RemoteConnectionFailed,
                "Remote tier did not answer PING",
                0.0,
                1.0,
            )
            .await;
        }

        if let Some(warming) = &self.warming {
            let stats = warming.stats();
            let fresh = {
                let mut seen = self.warming_seen.lock();
                let fresh = stats.last_run.is_some() && *seen != stats.last_run;
                *seen = stats.last_run;
                fresh
            };
            if let Some(report) = stats.last_report.filter(|r| fresh && r.failed > 0) {
                self.raise(
                    AlertType::WarmingFailed,
                    format!("{} warmups failed in the last cycle", report.failed),
                    report.failed as f64,
                    0.0,
                )
                .await;
            }
        }
    }

    // =========================================================================
    // Alerts
    // =========================================================================

    /// Raise an alert unless one of the same type is still active.
    ///
    /// Returns the new alert's id.
    pub async fn raise(
        &self,
        alert_type: AlertType,
        message: impl Into<String>,
        value: f64,
        threshold: f64,
    ) -> Option<String> {
        let alert = {
            let mut alerts = self.alerts.write();
            if alerts.iter().any(|a| !a.resolved && a.alert_type == alert_type) {
                return None;
            }
            let alert = Alert::new(alert_type, message, value, threshold);
            alerts.push(alert.clone());
            if alerts.len() > self.config.max_alerts {
                if let Some(pos) = alerts.iter().position(|a| a.resolved) {
                    alerts.remove(pos);
                }
            }
            alert
        };

        warn!(
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            "Alert raised: {}",
            alert.message
        );
        self.persist(&alert).await;
        Some(alert.id)
    }

    /// Mark an alert resolved
    pub async fn resolve_alert(&self, id: &str) -> Result<Alert> {
        let alert = {
            let mut alerts = self.alerts.write();
            let alert = alerts
                .iter_mut()
                .find(|a| a.id == id)
                .ok_or_else(|| Error::AlertNotFound(id.to_string()))?;
            if !alert.resolved {
                alert.resolve();
            }
            alert.clone()
        };
        info!("Resolved alert {} ({})", alert.id, alert.alert_type);
        self.persist(&alert).await;
        Ok(alert)
    }

    async fn persist(&self, alert: &Alert) {
        let ttl = self.config.retention.as_secs().max(1);
        if let Err(e) = self
            .registry
            .remote()
            .set_json(&alert.storage_key(), alert, ttl)
            .await
        {
            debug!("Could not persist alert {}: {}", alert.id, e);
        }
    }

    /// Unresolved alerts, newest first
    pub fn active_alerts(&self) -> Vec<Alert> {
        let alerts = self.alerts.read();
        alerts.iter().rev().filter(|a| !a.resolved).cloned().collect()
    }

    /// Every retained alert, newest first
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().iter().rev().cloned().collect()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Samples from the last `hours` hours, oldest first
    pub fn metrics_history(&self, hours: u32) -> Vec<MetricsSample> {
        let cutoff = Utc::now() - chrono::Duration::hours(i64::from(hours));
        self.history
            .read()
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn latest_sample(&self) -> Option<MetricsSample> {
        self.history.read().back().cloned()
    }

    /// Healthy when nothing is alerting and the hit rate meets its target.
    /// With no traffic yet the hit rate target counts as met.
    pub fn current_status(&self) -> MonitorStatus {
        let latest = self.latest_sample();
        let active_alerts = self.active_alerts().len();
        let (hit_rate, response_time_ms, served) = latest
            .as_ref()
            .map(|s| {
                (
                    s.aggregate.hit_rate_percent(),
                    s.aggregate.avg_response_time_ms,
                    s.aggregate.total_requests > 0,
                )
            })
            .unwrap_or((0.0, 0.0, false));

        MonitorStatus {
            healthy: active_alerts == 0
                && (!served || hit_rate >= self.config.min_hit_rate_percent),
            hit_rate,
            response_time_ms,
            active_alerts,
            last_update: latest.map(|s| s.timestamp),
        }
    }

    // =========================================================================
    // Background Loop
    // =========================================================================

    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run(token).await })
    }

    #[instrument(skip(self, token))]
    async fn run(self: Arc<Self>, token: CancellationToken) {
        info!("Starting monitor, interval {:?}", self.config.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {
                    let sample = self.collect().await;
                    if !sample.remote_connected {
                        error!("Remote tier unreachable");
                    }
                }
            }
        }
        info!("Monitor stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryRemoteStore, RemoteStore, RemoteTier, StrategyTable, WorkloadClass};
    use crate::monitoring::AlertSeverity;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    fn setup() -> (Arc<Monitor>, Arc<CacheRegistry>, Arc<InMemoryRemoteStore>) {
        let (remote, store) = RemoteTier::in_memory();
        let registry = Arc::new(CacheRegistry::new(
            Arc::new(remote),
            Arc::new(StrategyTable::new()),
            None,
        ));
        let monitor = Arc::new(Monitor::new(Arc::clone(&registry)));
        (monitor, registry, store)
    }

    async fn traffic(registry: &CacheRegistry, hits: usize, misses: usize) {
        let cache = registry.api();
        let strategy = registry.strategies().select(WorkloadClass::Doc, 10);
        cache.set("doc:merge:s:h", Bytes::from_static(b"v"), &strategy).await;
        for _ in 0..hits {
            cache.get("doc:merge:s:h").await;
        }
        for i in 0..misses {
            cache.get(&format!("doc:merge:missing:{}", i)).await;
        }
    }

    #[tokio::test]
    async fn test_no_alerts_without_traffic() {
        let (monitor, _, _) = setup();
        let sample = monitor.collect().await;
        assert!(sample.remote_connected);
        assert!(monitor.active_alerts().is_empty());
        let status = monitor.current_status();
        assert!(status.healthy);
        assert!(status.last_update.is_some());
    }

    #[tokio::test]
    async fn test_low_hit_rate_alert_deduplicated() {
        let (monitor, registry, store) = setup();
        traffic(&registry, 1, 4).await;

        monitor.collect().await;
        monitor.collect().await;
        let active = monitor.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].alert_type, AlertType::LowHitRate);
        assert_eq!(active[0].severity, AlertSeverity::High);
        assert!(!monitor.current_status().healthy);

        // Persisted best-effort
        assert!(store.get(&format!("alert:{}", active[0].id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resolve_allows_new_alert() {
        let (monitor, registry, _) = setup();
        traffic(&registry, 0, 3).await;
        monitor.collect().await;
        let id = monitor.active_alerts()[0].id.clone();

        let resolved = monitor.resolve_alert(&id).await.unwrap();
        assert!(resolved.resolved);
        assert!(monitor.active_alerts().is_empty());

        monitor.collect().await;
        assert_eq!(monitor.active_alerts().len(), 1);
        assert_ne!(monitor.active_alerts()[0].id, id);
        assert_eq!(monitor.alerts().len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_unknown_alert() {
        let (monitor, _, _) = setup();
        assert_matches!(
            monitor.resolve_alert("nope").await,
            Err(Error::AlertNotFound(id)) if id == "nope"
        );
    }

    #[tokio::test]
    async fn test_remote_outage_raises_critical() {
        let (monitor, _, store) = setup();
        store.set_available(false);
        let sample = monitor.collect().await;
        assert!(!sample.remote_connected);
        let active = monitor.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].alert_type, AlertType::RemoteConnectionFailed);
        assert_eq!(active[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_remote_memory_alert() {
        let (remote, store) = {
            let store = Arc::new(InMemoryRemoteStore::with_max_memory(64));
            (RemoteTier::new(store.clone()), store)
        };
        let registry = Arc::new(CacheRegistry::new(
            Arc::new(remote),
            Arc::new(StrategyTable::new()),
            None,
        ));
        store
            .set_ex("big", Bytes::from(vec![0u8; 128]), 3600)
            .await
            .unwrap();
        let monitor = Monitor::new(registry);
        let sample = monitor.collect().await;
        assert!(sample.memory_percent > 100.0);
        assert_eq!(monitor.active_alerts()[0].alert_type, AlertType::HighMemoryUsage);
    }

    #[tokio::test]
    async fn test_history_window() {
        let (monitor, _, _) = setup();
        monitor.collect().await;
        monitor.collect().await;
        assert_eq!(monitor.metrics_history(1).len(), 2);
        assert_eq!(monitor.latest_sample().unwrap().caches.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_samples_on_interval() {
        let (monitor, _, _) = setup();
        let token = CancellationToken::new();
        let handle = monitor.spawn(token.clone());

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(monitor.metrics_history(1).len(), 2);

        token.cancel();
        handle.await.unwrap();
    }
}
