//! Invalidation Rule Model

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{ttl, WorkloadClass};

/// How a rule removes the entries it selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationStrategy {
    /// Delete matching keys now, in batches
    Immediate,
    /// Give matching keys a very short TTL and let the store expire them
    Lazy,
    /// Immediate, run by the rule's own timer
    Scheduled,
    /// Matching keys plus records related to their subjects
    Cascade,
    /// Generic pattern invalidation across every cache
    Pattern,
}

impl fmt::Display for InvalidationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvalidationStrategy::Immediate => "immediate",
            InvalidationStrategy::Lazy => "lazy",
            InvalidationStrategy::Scheduled => "scheduled",
            InvalidationStrategy::Cascade => "cascade",
            InvalidationStrategy::Pattern => "pattern",
        };
        f.write_str(s)
    }
}

/// Filters applied to candidate keys before a rule acts on them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationConditions {
    /// Only entries at least this old (milliseconds)
    #[serde(default)]
    pub max_age_ms: Option<u64>,
    /// Only keys with one of these classes as a segment
    #[serde(default)]
    pub workload_classes: Vec<WorkloadClass>,
    /// Only keys with one of these operations as a segment
    #[serde(default)]
    pub operations: Vec<String>,
}

impl InvalidationConditions {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_ms.map(Duration::from_millis)
    }

    /// Class and operation filters. Max age needs the store and is checked
    /// separately.
    pub fn matches_key(&self, key: &str) -> bool {
        let has_segment = |wanted: &str| key.split(':').any(|seg| seg == wanted);

        let class_ok = self.workload_classes.is_empty()
            || self.workload_classes.iter().any(|c| has_segment(c.as_str()));
        let op_ok = self.operations.is_empty()
            || self.operations.iter().any(|op| has_segment(op.as_str()));

        class_ok && op_ok
    }
}

/// Timer settings of a scheduled rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Delay between the end of one run and the start of the next
    pub interval_ms: u64,
    /// Keys per delete batch
    pub max_batch_size: usize,
}

impl Schedule {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// A registered invalidation rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationRule {
    pub id: String,
    pub name: String,
    pub strategy: InvalidationStrategy,
    /// Glob over remote keys
    pub key_pattern: String,
    #[serde(default)]
    pub conditions: Option<InvalidationConditions>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    pub enabled: bool,
}

impl InvalidationRule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        strategy: InvalidationStrategy,
        key_pattern: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            strategy,
            key_pattern: key_pattern.into(),
            conditions: None,
            schedule: None,
            enabled: true,
        }
    }

    pub fn with_conditions(mut self, conditions: InvalidationConditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn with_schedule(mut self, interval: Duration, max_batch_size: usize) -> Self {
        self.schedule = Some(Schedule {
            interval_ms: interval.as_millis() as u64,
            max_batch_size,
        });
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether a timer drives this rule
    pub fn is_scheduled(&self) -> bool {
        self.strategy == InvalidationStrategy::Scheduled && self.schedule.is_some()
    }
}

/// Built-in rules
pub fn default_rules() -> Vec<InvalidationRule> {
    const HOUR: Duration = Duration::from_secs(ttl::LONG);
    const DAY: Duration = Duration::from_secs(ttl::VERY_LONG);

    vec![
        InvalidationRule::new(
            "expired-files",
            "Expired processed files",
            InvalidationStrategy::Scheduled,
            "*:*:*:*",
        )
        .with_conditions(InvalidationConditions {
            max_age_ms: Some(DAY.as_millis() as u64),
            ..Default::default()
        })
        .with_schedule(HOUR, 100),
        InvalidationRule::new(
            "large-video-cleanup",
            "Large video results",
            InvalidationStrategy::Lazy,
            "video:*:*:*",
        )
        .with_conditions(InvalidationConditions {
            max_age_ms: Some(ttl::MEDIUM * 1000),
            workload_classes: vec![WorkloadClass::Video],
            ..Default::default()
        }),
        InvalidationRule::new(
            "failed-processing-cleanup",
            "Failed processing markers",
            InvalidationStrategy::Immediate,
            "processing:*:failed",
        )
        .with_conditions(InvalidationConditions {
            max_age_ms: Some(ttl::SHORT * 1000),
            ..Default::default()
        }),
        InvalidationRule::new(
            "user-session-cleanup",
            "Stale user sessions",
            InvalidationStrategy::Scheduled,
            "session:*",
        )
        .with_conditions(InvalidationConditions {
            max_age_ms: Some(ttl::WEEK * 1000),
            ..Default::default()
        })
        .with_schedule(DAY, 50),
    ]
}

/// Outcome of one rule execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationResult {
    /// None for ad-hoc invalidations
    pub rule_id: Option<String>,
    pub strategy: InvalidationStrategy,
    pub pattern: String,
    pub entries_found: usize,
    pub entries_invalidated: usize,
    pub errors: usize,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl InvalidationResult {
    pub(crate) fn started(rule: &InvalidationRule, ad_hoc: bool) -> Self {
        Self {
            rule_id: (!ad_hoc).then(|| rule.id.clone()),
            strategy: rule.strategy,
            pattern: rule.key_pattern.clone(),
            entries_found: 0,
            entries_invalidated: 0,
            errors: 0,
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
