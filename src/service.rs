//! Cache System
//!
//! The explicit service object: every component is built once here, shared
//! by `Arc`, and started or stopped as a unit.
//!
//! ```text
//!                    ┌────────────────────────┐
//!                    │      CacheSystem       │
//!                    └───────────┬────────────┘
//!      ┌──────────────┬──────────┼───────────┬─────────────┐
//!      ▼              ▼          ▼           ▼             ▼
//! Invalidation    Warming     Cleanup     Monitor      Optimizer
//!      │              │          │           │             │
//!      └──────────────┴──────────┼───────────┴─────────────┘
//!                                ▼
//!                  CacheRegistry (api, file, user)
//!                                │
//!                           RemoteTier
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::{
    CacheRegistry, InMemoryRemoteStore, MemoryTierStats, MetricsSnapshot, RemoteStore, RemoteTier,
    RemoteTierConfig, RemoteTierStats, StrategyTable,
};
use crate::cleanup::{CleanupConfig, CleanupManager, CleanupStats};
use crate::error::Result;
use crate::invalidation::{InvalidationConfig, InvalidationManager, InvalidationStats};
use crate::monitoring::{
    Alert, AlertSeverity, Component, ComponentHealth, HealthReport, Monitor, MonitorConfig,
    MonitorStatus, PrometheusExporter, Probes,
};
use crate::optimizer::{OptimizationRecord, Optimizer, OptimizerConfig};
use crate::warming::{RemoteUsageTracker, UsageTracker, WarmingConfig, WarmingScheduler, WarmingStats};

/// Whole-system configuration
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub remote: RemoteTierConfig,
    pub enable_warming: bool,
    pub enable_monitoring: bool,
    pub enable_invalidation: bool,
    pub enable_cleanup: bool,
    /// Periodic strategy optimization; `optimize()` works regardless
    pub enable_optimizer: bool,
    pub warming: WarmingConfig,
    pub monitor: MonitorConfig,
    pub cleanup: CleanupConfig,
    pub invalidation: InvalidationConfig,
    pub optimizer: OptimizerConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            remote: RemoteTierConfig::default(),
            enable_warming: true,
            enable_monitoring: true,
            enable_invalidation: true,
            enable_cleanup: true,
            enable_optimizer: false,
            warming: WarmingConfig::default(),
            monitor: MonitorConfig::default(),
            cleanup: CleanupConfig::default(),
            invalidation: InvalidationConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

/// Everything the `/status` endpoint reports
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub aggregate: MetricsSnapshot,
    pub caches: Vec<MetricsSnapshot>,
    pub memory_tiers: Vec<MemoryTierStats>,
    pub remote: RemoteTierStats,
    pub monitor: MonitorStatus,
    pub active_alerts: Vec<Alert>,
    pub warming: WarmingStats,
    pub cleanup: CleanupStats,
    pub invalidation: InvalidationStats,
    pub last_optimization: Option<OptimizationRecord>,
}

struct Running {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// The cache engine with its background services
pub struct CacheSystem {
    config: SystemConfig,
    registry: Arc<CacheRegistry>,
    usage: Arc<RemoteUsageTracker>,
    invalidation: Arc<InvalidationManager>,
    warming: Arc<WarmingScheduler>,
    cleanup: Arc<CleanupManager>,
    monitor: Arc<Monitor>,
    optimizer: Arc<Optimizer>,
    exporter: Arc<PrometheusExporter>,
    probes: Probes,
    running: Mutex<Option<Running>>,
}

impl CacheSystem {
    /// Wire every component over `store`
    pub fn new(config: SystemConfig, store: Arc<dyn RemoteStore>) -> Result<Self> {
        let remote = Arc::new(RemoteTier::with_config(store, config.remote.clone()));
        let usage = Arc::new(RemoteUsageTracker::new(Arc::clone(&remote)));
        let tracker: Arc<dyn UsageTracker> = usage.clone();
        let registry = Arc::new(CacheRegistry::new(
            remote,
            Arc::new(StrategyTable::new()),
            Some(Arc::clone(&tracker)),
        ));

        let invalidation = Arc::new(InvalidationManager::with_rules(
            Arc::clone(&registry),
            config.invalidation.clone(),
            crate::invalidation::default_rules(),
        ));
        let warming = Arc::new(WarmingScheduler::with_config(
            Arc::clone(&registry),
            tracker,
            config.warming.clone(),
        ));
        let cleanup = Arc::new(CleanupManager::with_config(
            Arc::clone(&registry),
            config.cleanup.clone(),
        ));
        let exporter = Arc::new(PrometheusExporter::new()?);
        let monitor = Arc::new(
            Monitor::with_config(Arc::clone(&registry), config.monitor.clone())
                .with_warming(Arc::clone(&warming))
                .with_exporter(Arc::clone(&exporter)),
        );
        let optimizer = Arc::new(Optimizer::with_config(
            Arc::clone(&registry),
            config.optimizer.clone(),
        ));

        Ok(Self {
            config,
            registry,
            usage,
            invalidation,
            warming,
            cleanup,
            monitor,
            optimizer,
            exporter,
            probes: Probes::new(),
            running: Mutex::new(None),
        })
    }

    /// System over a fresh in-memory remote store
    pub fn in_memory(config: SystemConfig) -> Result<(Self, Arc<InMemoryRemoteStore>)> {
        let store = Arc::new(InMemoryRemoteStore::new());
        let system = Self::new(config, store.clone())?;
        Ok((system, store))
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    pub fn usage(&self) -> &Arc<RemoteUsageTracker> {
        &self.usage
    }

    pub fn invalidation(&self) -> &Arc<InvalidationManager> {
        &self.invalidation
    }

    pub fn warming(&self) -> &Arc<WarmingScheduler> {
        &self.warming
    }

    pub fn cleanup(&self) -> &Arc<CleanupManager> {
        &self.cleanup
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn optimizer(&self) -> &Arc<Optimizer> {
        &self.optimizer
    }

    pub fn exporter(&self) -> &Arc<PrometheusExporter> {
        &self.exporter
    }

    pub fn probes(&self) -> &Probes {
        &self.probes
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the memory sweepers and every enabled background service
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let mut handles = self.registry.spawn_sweepers(&token);
        let mut started = vec!["memory-sweepers"];

        if self.config.enable_invalidation {
            self.invalidation.start();
            started.push("invalidation");
        }
        if self.config.enable_warming && self.warming.config().enabled {
            handles.push(self.warming.spawn(token.child_token()));
            started.push("warming");
        }
        if self.config.enable_cleanup && self.cleanup.config().enabled {
            handles.push(self.cleanup.spawn(token.child_token()));
            started.push("cleanup");
        }
        if self.config.enable_monitoring {
            handles.push(self.monitor.spawn(token.child_token()));
            started.push("monitoring");
        }
        if self.config.enable_optimizer {
            handles.push(self.optimizer.spawn(token.child_token()));
            started.push("optimizer");
        }

        *running = Some(Running { token, handles });
        self.probes.mark_ready(true);
        info!("Cache system started: {}", started.join(", "));
    }

    /// Stop every background service, letting in-flight cycles finish
    pub async fn stop(&self) {
        self.probes.mark_ready(false);
        let Some(Running { token, handles }) = self.running.lock().take() else {
            return;
        };

        token.cancel();
        self.invalidation.stop().await;
        for handle in handles {
            let _ = handle.await;
        }
        self.usage.flush().await;
        info!("Cache system stopped");
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Remote reachability, memory pressure, alert state and readiness
    pub async fn health_check(&self) -> HealthReport {
        let mut checks = Vec::with_capacity(4);

        let started = Instant::now();
        let remote = if self.registry.remote().ping().await {
            ComponentHealth::up(Component::Remote)
        } else {
            ComponentHealth::impaired(
                Component::Remote,
                "remote tier unreachable, serving from memory",
            )
        };
        checks.push(remote.timed(started));

        let utilization = self.registry.memory_utilization_percent();
        checks.push(if utilization > self.config.monitor.max_memory_percent {
            ComponentHealth::impaired(
                Component::Memory,
                format!("memory tiers at {:.1}%", utilization),
            )
        } else {
            ComponentHealth::up(Component::Memory)
                .detail(format!("{} bytes held", self.registry.memory_bytes()))
        });

        let status = self.monitor.current_status();
        let alerts = self.monitor.active_alerts();
        let critical = alerts
            .iter()
            .filter(|a| a.severity == AlertSeverity::Critical)
            .count();
        checks.push(if status.healthy {
            ComponentHealth::up(Component::Monitor)
        } else {
            ComponentHealth::impaired(
                Component::Monitor,
                format!(
                    "{} active alerts ({} critical), hit rate {:.1}%",
                    status.active_alerts, critical, status.hit_rate
                ),
            )
        });

        checks.push(self.probes.lifecycle());
        HealthReport::from_checks(checks, self.probes.uptime())
    }

    /// Snapshot of every component's statistics
    pub fn status(&self) -> SystemStatus {
        let caches = self.registry.metrics();
        SystemStatus {
            aggregate: MetricsSnapshot::aggregate(&caches),
            caches,
            memory_tiers: self
                .registry
                .caches()
                .iter()
                .map(|c| c.memory().stats())
                .collect(),
            remote: self.registry.remote().stats(),
            monitor: self.monitor.current_status(),
            active_alerts: self.monitor.active_alerts(),
            warming: self.warming.stats(),
            cleanup: self.cleanup.stats(),
            invalidation: self.invalidation.stats(),
            last_optimization: self.optimizer.latest(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
