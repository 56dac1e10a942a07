//! Strategy Optimizer
//!
//! Compares live cache metrics with target service levels and nudges the
//! strategy table towards them: longer TTLs when the hit rate lags, higher
//! priority when lookups are slow, shorter TTLs for big entries under memory
//! pressure. Every adjustment goes through [`StrategyTable::update`], so TTL
//! stays positive and priority stays within 1..=10.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::strategy::{MAX_PRIORITY, MIN_PRIORITY};
use crate::cache::{CacheRegistry, SizeCategory, StrategyTable, StrategyUpdate, WorkloadClass};

/// Service levels the optimizer steers towards
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OptimizationTargets {
    pub hit_rate_percent: f64,
    pub response_time_ms: f64,
    pub memory_usage_percent: f64,
    pub error_rate_percent: f64,
}

impl Default for OptimizationTargets {
    fn default() -> Self {
        Self {
            hit_rate_percent: 95.0,
            response_time_ms: 200.0,
            memory_usage_percent: 80.0,
            error_rate_percent: 1.0,
        }
    }
}

/// Optimizer configuration
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub targets: OptimizationTargets,
    /// Recommendations applied per run, highest impact first
    pub max_applied: usize,
    /// Audit records kept
    pub history_limit: usize,
    /// Delay between periodic runs
    pub interval: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            targets: OptimizationTargets::default(),
            max_applied: 10,
            history_limit: 20,
            interval: Duration::from_secs(6 * 3600), // 6 hours
        }
    }
}

/// Expected effect of a recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    Medium,
    High,
}

/// Metrics an optimization run starts from
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CurrentMetrics {
    pub hit_rate_percent: f64,
    pub response_time_ms: f64,
    pub memory_usage_percent: f64,
    pub error_rate_percent: f64,
    pub total_requests: u64,
}

/// Proposed change to one strategy entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub class: WorkloadClass,
    pub size: SizeCategory,
    pub current_ttl: u64,
    pub recommended_ttl: u64,
    pub current_priority: u8,
    pub recommended_priority: u8,
    pub reason: String,
    pub impact: Impact,
}

impl Recommendation {
    fn within_bounds(&self) -> bool {
        self.recommended_ttl > 0
            && (MIN_PRIORITY..=MAX_PRIORITY).contains(&self.recommended_priority)
    }

    fn changes_anything(&self) -> bool {
        self.recommended_ttl != self.current_ttl
            || self.recommended_priority != self.current_priority
    }
}

/// A change as applied, with the entry's values before and after
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedChange {
    pub class: WorkloadClass,
    pub size: SizeCategory,
    pub ttl_before: u64,
    pub ttl_after: u64,
    pub priority_before: u8,
    pub priority_after: u8,
    pub reason: String,
}

/// Rough projection of a run's effect
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EstimatedImpact {
    /// Percentage points, at most 20
    pub hit_rate_improvement: f64,
    /// Milliseconds, at most 200
    pub response_time_improvement_ms: f64,
    /// Percent, within -50..=50
    pub memory_impact_percent: f64,
}

impl EstimatedImpact {
    fn of(recommendations: &[Recommendation]) -> Self {
        let mut hit = 0.0_f64;
        let mut latency = 0.0_f64;
        let mut memory = 0.0_f64;

        for rec in recommendations {
            let longer = rec.recommended_ttl > rec.current_ttl;
            let shorter = rec.recommended_ttl < rec.current_ttl;
            let raised = rec.recommended_priority > rec.current_priority;
            let (hit_gain, memory_cost, latency_gain, memory_saved) = match rec.impact {
                Impact::High => (5.0, 10.0, 50.0, 0.0),
                Impact::Medium => (2.0, 5.0, 25.0, 5.0),
                Impact::Low => (1.0, 2.0, 10.0, 0.0),
            };
            if longer {
                hit += hit_gain;
                memory += memory_cost;
            }
            if shorter {
                memory -= memory_saved;
            }
            if raised {
                latency += latency_gain;
            }
        }

        Self {
            hit_rate_improvement: f64::min(hit, 20.0),
            response_time_improvement_ms: f64::min(latency, 200.0),
            memory_impact_percent: memory.clamp(-50.0, 50.0),
        }
    }
}

/// Audit entry for one run
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationRecord {
    pub timestamp: DateTime<Utc>,
    pub metrics: CurrentMetrics,
    pub recommendations: usize,
    pub applied: Vec<AppliedChange>,
    pub estimated_impact: EstimatedImpact,
}

/// Adjusts the strategy table from observed metrics
pub struct Optimizer {
    config: OptimizerConfig,
    registry: Arc<CacheRegistry>,
    history: RwLock<VecDeque<OptimizationRecord>>,
}

impl Optimizer {
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self::with_config(registry, OptimizerConfig::default())
    }

    pub fn with_config(registry: Arc<CacheRegistry>, config: OptimizerConfig) -> Self {
        Self {
            config,
            registry,
            history: RwLock::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    fn strategies(&self) -> &Arc<StrategyTable> {
        self.registry.strategies()
    }

    /// Aggregate metrics of every cache plus memory pressure
    pub async fn current_metrics(&self) -> CurrentMetrics {
        let agg = self.registry.aggregate_metrics();
        let remote_percent = match self.registry.remote().memory_info().await {
            Ok(info) if info.max_bytes > 0 => info.used_bytes as f64 / info.max_bytes as f64 * 100.0,
            Ok(_) => 0.0,
            Err(e) => {
                debug!("Remote memory info unavailable: {}", e);
                0.0
            }
        };

        CurrentMetrics {
            hit_rate_percent: agg.hit_rate_percent(),
            response_time_ms: agg.avg_response_time_ms,
            memory_usage_percent: remote_percent.max(self.registry.memory_utilization_percent()),
            error_rate_percent: agg.error_rate_percent(),
            total_requests: agg.total_requests,
        }
    }

    /// Recommendations for the current table, highest impact first.
    ///
    /// Hit-rate rules need traffic: with no requests there is no hit rate
    /// to fix.
    pub fn recommend(&self, metrics: &CurrentMetrics) -> Vec<Recommendation> {
        let targets = &self.config.targets;
        let hit_gap = if metrics.total_requests > 0 {
            targets.hit_rate_percent - metrics.hit_rate_percent
        } else {
            0.0
        };
        let response_gap = metrics.response_time_ms - targets.response_time_ms;
        let memory_gap = metrics.memory_usage_percent - targets.memory_usage_percent;

        let mut recs = Vec::new();
        for (class, size, cfg) in self.strategies().snapshot() {
            let rec = |ttl: u64, priority: u8, reason: String, impact: Impact| Recommendation {
                class,
                size,
                current_ttl: cfg.ttl_seconds,
                recommended_ttl: ttl,
                current_priority: cfg.priority,
                recommended_priority: priority,
                reason,
                impact,
            };
            let ttl = cfg.ttl_seconds as f64;

            if hit_gap > 10.0 {
                recs.push(rec(
                    (ttl * 1.5) as u64,
                    cfg.priority,
                    format!("Hit rate {:.1}% far below target, extend TTL", metrics.hit_rate_percent),
                    Impact::High,
                ));
            } else if hit_gap > 5.0 {
                recs.push(rec(
                    (ttl * 1.25) as u64,
                    cfg.priority,
                    format!("Hit rate {:.1}% below target, extend TTL", metrics.hit_rate_percent),
                    Impact::Medium,
                ));
            }

            if response_gap > 100.0 {
                recs.push(rec(
                    cfg.ttl_seconds,
                    cfg.priority.saturating_add(2).min(MAX_PRIORITY),
                    format!(
                        "Response time {:.1}ms over target {:.0}ms, raise priority",
                        metrics.response_time_ms, targets.response_time_ms
                    ),
                    Impact::High,
                ));
            }

            if memory_gap > 20.0 && matches!(size, SizeCategory::Large | SizeCategory::Xlarge) {
                recs.push(rec(
                    (ttl * 0.75) as u64,
                    cfg.priority,
                    format!(
                        "Memory at {:.1}%, shorten TTL of large entries",
                        metrics.memory_usage_percent
                    ),
                    Impact::Medium,
                ));
            }

            if class == WorkloadClass::Video && response_gap > 0.0 {
                recs.push(rec(
                    ((ttl * 0.8) as u64).max(300),
                    cfg.priority,
                    "Video lookups slow, favour fresher entries".to_string(),
                    Impact::Medium,
                ));
            }

            if class == WorkloadClass::Image && hit_gap > 0.0 {
                recs.push(rec(
                    cfg.ttl_seconds,
                    cfg.priority.saturating_add(1).min(MAX_PRIORITY),
                    "Images are requested often, raise priority".to_string(),
                    Impact::Low,
                ));
            }
        }

        recs.retain(|r| r.within_bounds() && r.changes_anything());
        // Stable: ties keep table order
        recs.sort_by(|a, b| b.impact.cmp(&a.impact));
        recs
    }

    /// Recommend, apply the top recommendations and record the run
    #[instrument(skip(self))]
    pub async fn optimize(&self) -> OptimizationRecord {
        let metrics = self.current_metrics().await;
        let recs = self.recommend(&metrics);
        let top: Vec<Recommendation> = recs.iter().take(self.config.max_applied).cloned().collect();

        // Recommendations share one snapshot; only write the fields each one changes
        let mut applied = Vec::with_capacity(top.len());
        for rec in &top {
            let update = StrategyUpdate {
                ttl_seconds: (rec.recommended_ttl != rec.current_ttl).then_some(rec.recommended_ttl),
                priority: (rec.recommended_priority != rec.current_priority)
                    .then_some(rec.recommended_priority),
            };
            match self.strategies().update(rec.class, rec.size, update) {
                Ok(before) => {
                    let after = self.strategies().get(rec.class, rec.size);
                    applied.push(AppliedChange {
                        class: rec.class,
                        size: rec.size,
                        ttl_before: before.ttl_seconds,
                        ttl_after: after.ttl_seconds,
                        priority_before: before.priority,
                        priority_after: after.priority,
                        reason: rec.reason.clone(),
                    });
                }
                Err(e) => warn!("Skipping recommendation for {}/{}: {}", rec.class, rec.size, e),
            }
        }

        let record = OptimizationRecord {
            timestamp: Utc::now(),
            metrics,
            recommendations: recs.len(),
            estimated_impact: EstimatedImpact::of(&top),
            applied,
        };
        info!(
            "Optimization applied {} of {} recommendations (est. +{:.1}% hit rate)",
            record.applied.len(),
            record.recommendations,
            record.estimated_impact.hit_rate_improvement
        );

        let mut history = self.history.write();
        history.push_back(record.clone());
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
        record
    }

    pub fn latest(&self) -> Option<OptimizationRecord> {
        self.history.read().back().cloned()
    }

    /// Audit records, oldest first
    pub fn history(&self) -> Vec<OptimizationRecord> {
        self.history.read().iter().cloned().collect()
    }

    pub fn reset_to_defaults(&self) {
        self.strategies().reset_to_defaults();
    }

    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let optimizer = Arc::clone(self);
        tokio::spawn(async move { optimizer.run(token).await })
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        info!("Starting optimizer, interval {:?}", self.config.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {
                    self.optimize().await;
                }
            }
        }
        info!("Optimizer stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
