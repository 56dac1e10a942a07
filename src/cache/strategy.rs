//! Placement Strategy Table
//!
//! Maps (workload class, size category) to a [`StrategyConfig`]: TTL, the
//! ordered tier list, priority and the compression flag.
//!
//! Lookups are pure and total. The table is built complete (every class x
//! size pair present) and entries can only be adjusted in place, never
//! removed, so [`StrategyTable::select`] cannot fail.
//!
//! Mutation is process-local. Each process converges independently through
//! its own monitor/optimizer loop.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::key::WorkloadClass;
use super::ttl;
use crate::error::{Error, Result};

/// Lowest allowed priority
pub const MIN_PRIORITY: u8 = 1;

/// Highest allowed priority
pub const MAX_PRIORITY: u8 = 10;

const MB: u64 = 1024 * 1024;

// =============================================================================
// Size Category
// =============================================================================

/// Coarse size bucket of a cached result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeCategory {
    /// < 1MB
    Tiny,
    /// < 10MB
    Small,
    /// < 50MB
    Medium,
    /// < 100MB
    Large,
    /// >= 100MB
    Xlarge,
}

impl SizeCategory {
    /// Every category, smallest first
    pub const ALL: [SizeCategory; 5] = [
        SizeCategory::Tiny,
        SizeCategory::Small,
        SizeCategory::Medium,
        SizeCategory::Large,
        SizeCategory::Xlarge,
    ];

    /// Bucket a byte size
    pub fn from_size(size_bytes: u64) -> Self {
        if size_bytes < MB {
            SizeCategory::Tiny
        } else if size_bytes < 10 * MB {
            SizeCategory::Small
        } else if size_bytes < 50 * MB {
            SizeCategory::Medium
        } else if size_bytes < 100 * MB {
            SizeCategory::Large
        } else {
            SizeCategory::Xlarge
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SizeCategory::Tiny => "tiny",
            SizeCategory::Small => "small",
            SizeCategory::Medium => "medium",
            SizeCategory::Large => "large",
            SizeCategory::Xlarge => "xlarge",
        }
    }
}

impl fmt::Display for SizeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SizeCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tiny" => Ok(SizeCategory::Tiny),
            "small" => Ok(SizeCategory::Small),
            "medium" => Ok(SizeCategory::Medium),
            "large" => Ok(SizeCategory::Large),
            "xlarge" => Ok(SizeCategory::Xlarge),
            other => Err(Error::Config(format!("unknown size category: {}", other))),
        }
    }
}

// =============================================================================
// Tier Id
// =============================================================================

/// Physical location for cached values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierId {
    /// Process-local memory tier
    Memory,
    /// Shared remote key/value tier
    Remote,
    /// Reserved, no store behind it
    Cdn,
    /// Reserved, no store behind it
    Storage,
}

impl TierId {
    /// Whether a store backs this tier
    pub fn is_implemented(&self) -> bool {
        matches!(self, TierId::Memory | TierId::Remote)
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierId::Memory => write!(f, "memory"),
            TierId::Remote => write!(f, "remote"),
            TierId::Cdn => write!(f, "cdn"),
            TierId::Storage => write!(f, "storage"),
        }
    }
}

// =============================================================================
// Strategy Config
// =============================================================================

/// Placement policy for one (class, size) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Time to live in seconds
    pub ttl_seconds: u64,
    /// Ordered tiers to write to
    pub tiers: Vec<TierId>,
    /// Priority 1..=10
    pub priority: u8,
    /// Compress payloads above the compression threshold
    pub compress: bool,
}

impl StrategyConfig {
    fn new(ttl_seconds: u64, tiers: &[TierId], priority: u8, compress: bool) -> Self {
        Self {
            ttl_seconds,
            tiers: tiers.to_vec(),
            priority,
            compress,
        }
    }

    /// Whether the strategy writes to `tier`
    pub fn uses(&self, tier: TierId) -> bool {
        self.tiers.contains(&tier)
    }
}

/// Partial update applied to an existing entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyUpdate {
    pub ttl_seconds: Option<u64>,
    pub priority: Option<u8>,
}

/// One line of a strategy override file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyOverride {
    pub class: WorkloadClass,
    pub size: SizeCategory,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub priority: Option<u8>,
}

// =============================================================================
// Strategy Table
// =============================================================================

/// Lookup table of placement policies
#[derive(Debug)]
pub struct StrategyTable {
    entries: RwLock<HashMap<(WorkloadClass, SizeCategory), StrategyConfig>>,
}

impl StrategyTable {
    /// Table with the built-in defaults
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Self::default_entries()),
        }
    }

    /// Table from explicit entries; every (class, size) pair must be present
    pub fn with_entries(
        entries: HashMap<(WorkloadClass, SizeCategory), StrategyConfig>,
    ) -> Result<Self> {
        for class in WorkloadClass::ALL {
            for size in SizeCategory::ALL {
                let config = entries.get(&(class, size)).ok_or_else(|| {
                    Error::Config(format!("missing strategy for {}/{}", class, size))
                })?;
                validate(config.ttl_seconds, config.priority)?;
            }
        }
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Built-in policy table
    pub fn default_entries() -> HashMap<(WorkloadClass, SizeCategory), StrategyConfig> {
        use SizeCategory::*;
        use TierId::{Cdn, Memory, Remote};
        use WorkloadClass::*;

        let hot: &[TierId] = &[Memory, Remote, Cdn];
        let warm: &[TierId] = &[Remote, Cdn];
        let edge: &[TierId] = &[Cdn];

        let mut m = HashMap::new();

        m.insert((Doc, Tiny), StrategyConfig::new(ttl::VERY_LONG, hot, 10, true));
        m.insert((Doc, Small), StrategyConfig::new(ttl::LONG, hot, 8, true));
        m.insert((Doc, Medium), StrategyConfig::new(ttl::MEDIUM, warm, 6, true));
        m.insert((Doc, Large), StrategyConfig::new(ttl::SHORT, warm, 4, true));
        m.insert((Doc, Xlarge), StrategyConfig::new(ttl::VERY_SHORT, edge, 2, true));

        m.insert((Image, Tiny), StrategyConfig::new(ttl::WEEK, hot, 10, true));
        m.insert((Image, Small), StrategyConfig::new(ttl::VERY_LONG, hot, 9, true));
        m.insert((Image, Medium), StrategyConfig::new(ttl::LONG, warm, 7, true));
        m.insert((Image, Large), StrategyConfig::new(ttl::MEDIUM, warm, 5, true));
        m.insert((Image, Xlarge), StrategyConfig::new(ttl::SHORT, edge, 3, true));

        // Video payloads are already compressed codecs
        m.insert((Video, Tiny), StrategyConfig::new(ttl::LONG, hot, 8, false));
        m.insert((Video, Small), StrategyConfig::new(ttl::MEDIUM, warm, 6, false));
        m.insert((Video, Medium), StrategyConfig::new(ttl::SHORT, warm, 4, false));
        m.insert((Video, Large), StrategyConfig::new(ttl::VERY_SHORT, edge, 2, false));
        m.insert((Video, Xlarge), StrategyConfig::new(ttl::VERY_SHORT, edge, 1, false));

        m
    }

    /// Policy for a result of `size_bytes` produced by `class`
    pub fn select(&self, class: WorkloadClass, size_bytes: u64) -> StrategyConfig {
        self.get(class, SizeCategory::from_size(size_bytes))
    }

    /// Policy for a class given by name; unknown names are a caller error
    pub fn select_by_name(&self, class: &str, size_bytes: u64) -> Result<StrategyConfig> {
        let class: WorkloadClass = class.parse()?;
        Ok(self.select(class, size_bytes))
    }

    /// Policy for an explicit size category
    pub fn get(&self, class: WorkloadClass, size: SizeCategory) -> StrategyConfig {
        self.entries
            .read()
            .get(&(class, size))
            .cloned()
            .unwrap_or_else(|| fallback(class, size))
    }

    /// Adjust TTL and/or priority of an existing entry.
    ///
    /// Returns the entry as it was before the update. Tier composition and
    /// the compression flag are never touched.
    pub fn update(
        &self,
        class: WorkloadClass,
        size: SizeCategory,
        update: StrategyUpdate,
    ) -> Result<StrategyConfig> {
        if let Some(ttl) = update.ttl_seconds {
            if ttl == 0 {
                return Err(Error::Config(format!(
                    "ttl for {}/{} must be positive",
                    class, size
                )));
            }
        }
        if let Some(priority) = update.priority {
            validate(1, priority)?;
        }

        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&(class, size))
            .ok_or_else(|| Error::Config(format!("no strategy for {}/{}", class, size)))?;
        let before = entry.clone();

        if let Some(ttl) = update.ttl_seconds {
            entry.ttl_seconds = ttl;
        }
        if let Some(priority) = update.priority {
            entry.priority = priority;
        }

        debug!(
            "Strategy {}/{} updated: ttl {} -> {}, priority {} -> {}",
            class, size, before.ttl_seconds, entry.ttl_seconds, before.priority, entry.priority
        );
        Ok(before)
    }

    /// Apply overrides loaded from configuration
    pub fn apply_overrides(&self, overrides: &[StrategyOverride]) -> Result<usize> {
        for o in overrides {
            self.update(
                o.class,
                o.size,
                StrategyUpdate {
                    ttl_seconds: o.ttl_seconds,
                    priority: o.priority,
                },
            )?;
        }
        if !overrides.is_empty() {
            info!("Applied {} strategy overrides", overrides.len());
        }
        Ok(overrides.len())
    }

    /// Parse a YAML list of overrides
    pub fn parse_overrides(yaml: &str) -> Result<Vec<StrategyOverride>> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("invalid strategy overrides: {}", e)))
    }

    /// Restore the built-in defaults
    pub fn reset_to_defaults(&self) {
        *self.entries.write() = Self::default_entries();
        info!("Strategy table reset to defaults");
    }

    /// Snapshot of every entry, ordered by class then size
    pub fn snapshot(&self) -> Vec<(WorkloadClass, SizeCategory, StrategyConfig)> {
        let entries = self.entries.read();
        let mut out: Vec<_> = entries
            .iter()
            .map(|((c, s), cfg)| (*c, *s, cfg.clone()))
            .collect();
        out.sort_by_key(|(c, s, _)| (*c, *s));
        out
    }

    /// Longest TTL of any entry
    pub fn max_ttl_seconds(&self) -> u64 {
        self.entries
            .read()
            .values()
            .map(|c| c.ttl_seconds)
            .max()
            .unwrap_or(ttl::VERY_LONG)
    }
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(ttl_seconds: u64, priority: u8) -> Result<()> {
    if ttl_seconds == 0 {
        return Err(Error::Config("ttl must be positive".into()));
    }
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(Error::Config(format!(
            "priority {} outside {}..={}",
            priority, MIN_PRIORITY, MAX_PRIORITY
        )));
    }
    Ok(())
}

// Unreachable once construction has validated totality
fn fallback(class: WorkloadClass, size: SizeCategory) -> StrategyConfig {
    StrategyTable::default_entries()
        .remove(&(class, size))
        .unwrap_or_else(|| StrategyConfig::new(ttl::SHORT, &[TierId::Remote], MIN_PRIORITY, false))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn test_size_thresholds() {
        assert_eq!(SizeCategory::from_size(0), SizeCategory::Tiny);
        assert_eq!(SizeCategory::from_size(MB - 1), SizeCategory::Tiny);
        assert_eq!(SizeCategory::from_size(MB), SizeCategory::Small);
        assert_eq!(SizeCategory::from_size(10 * MB - 1), SizeCategory::Small);
        assert_eq!(SizeCategory::from_size(10 * MB), SizeCategory::Medium);
        assert_eq!(SizeCategory::from_size(50 * MB), SizeCategory::Large);
        assert_eq!(SizeCategory::from_size(100 * MB - 1), SizeCategory::Large);
        assert_eq!(SizeCategory::from_size(100 * MB), SizeCategory::Xlarge);
        assert_eq!(SizeCategory::from_size(u64::MAX), SizeCategory::Xlarge);
    }

    #[test]
    fn test_default_table_is_total() {
        let table = StrategyTable::new();
        assert_eq!(table.snapshot().len(), 15);
        assert!(StrategyTable::with_entries(StrategyTable::default_entries()).is_ok());
    }

    #[test]
    fn test_incomplete_table_rejected() {
        let mut entries = StrategyTable::default_entries();
        entries.remove(&(WorkloadClass::Video, SizeCategory::Large));
        assert_matches!(StrategyTable::with_entries(entries), Err(Error::Config(_)));
    }

    #[test]
    fn test_default_values() {
        let table = StrategyTable::new();
        let tiny_image = table.select(WorkloadClass::Image, 1024);
        assert_eq!(tiny_image.ttl_seconds, ttl::WEEK);
        assert_eq!(tiny_image.priority, 10);
        assert_eq!(
            tiny_image.tiers,
            vec![TierId::Memory, TierId::Remote, TierId::Cdn]
        );
        assert!(tiny_image.compress);

        let big_video = table.select(WorkloadClass::Video, 500 * MB);
        assert_eq!(big_video.tiers, vec![TierId::Cdn]);
        assert!(!big_video.compress);
    }

    #[test]
    fn test_select_by_name_unknown_class() {
        let table = StrategyTable::new();
        assert_matches!(
            table.select_by_name("audio", 10),
            Err(Error::UnknownWorkloadClass(_))
        );
        assert!(table.select_by_name("doc", 10).is_ok());
    }

    #[test]
    fn test_update_only_touches_ttl_and_priority() {
        let table = StrategyTable::new();
        let before = table
            .update(
                WorkloadClass::Doc,
                SizeCategory::Small,
                StrategyUpdate {
                    ttl_seconds: Some(7200),
                    priority: Some(9),
                },
            )
            .unwrap();
        assert_eq!(before.ttl_seconds, ttl::LONG);

        let after = table.get(WorkloadClass::Doc, SizeCategory::Small);
        assert_eq!(after.ttl_seconds, 7200);
        assert_eq!(after.priority, 9);
        assert_eq!(after.tiers, before.tiers);
        assert_eq!(after.compress, before.compress);
    }

    #[test]
    fn test_update_rejects_out_of_bounds() {
        let table = StrategyTable::new();
        let zero_ttl = StrategyUpdate {
            ttl_seconds: Some(0),
            priority: None,
        };
        let bad_priority = StrategyUpdate {
            ttl_seconds: None,
            priority: Some(11),
        };
        assert!(table
            .update(WorkloadClass::Doc, SizeCategory::Tiny, zero_ttl)
            .is_err());
        assert!(table
            .update(WorkloadClass::Doc, SizeCategory::Tiny, bad_priority)
            .is_err());
        assert_eq!(
            table.get(WorkloadClass::Doc, SizeCategory::Tiny).ttl_seconds,
            ttl::VERY_LONG
        );
    }

    #[test]
    fn test_reset_to_defaults() {
        let table = StrategyTable::new();
        table
            .update(
                WorkloadClass::Image,
                SizeCategory::Medium,
                StrategyUpdate {
                    ttl_seconds: Some(1),
                    priority: None,
                },
            )
            .unwrap();
        table.reset_to_defaults();
        assert_eq!(
            table.get(WorkloadClass::Image, SizeCategory::Medium).ttl_seconds,
            ttl::LONG
        );
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
- class: video
  size: tiny
  ttl_seconds: 120
- class: doc
  size: xlarge
  priority: 3
"#;
        let overrides = StrategyTable::parse_overrides(yaml).unwrap();
        let table = StrategyTable::new();
        assert_eq!(table.apply_overrides(&overrides).unwrap(), 2);
        assert_eq!(table.get(WorkloadClass::Video, SizeCategory::Tiny).ttl_seconds, 120);
        assert_eq!(table.get(WorkloadClass::Doc, SizeCategory::Xlarge).priority, 3);
    }

    proptest! {
        /// Identical arguments always produce identical policies.
        #[test]
        fn prop_select_is_pure(size in any::<u64>(), idx in 0usize..3) {
            let table = StrategyTable::new();
            let class = WorkloadClass::ALL[idx];
            prop_assert_eq!(table.select(class, size), table.select(class, size));
        }

        /// Within one size category the policy never changes.
        #[test]
        fn prop_constant_within_category(a in 0u64..(200 * MB), b in 0u64..(200 * MB), idx in 0usize..3) {
            let table = StrategyTable::new();
            let class = WorkloadClass::ALL[idx];
            if SizeCategory::from_size(a) == SizeCategory::from_size(b) {
                prop_assert_eq!(table.select(class, a), table.select(class, b));
            }
        }
    }

    #[test]
    fn test_changes_only_at_boundaries() {
        let table = StrategyTable::new();
        for class in WorkloadClass::ALL {
            for boundary in [MB, 10 * MB, 50 * MB, 100 * MB] {
                let below = table.select(class, boundary - 1);
                let at = table.select(class, boundary);
                assert_ne!(below, at, "{} at {}", class, boundary);
                assert_eq!(at, table.select(class, boundary + 1));
            }
        }
    }
}
