//! Cache Warming
//!
//! Usage tracking plus the scheduler that pre-populates popular entries.

mod scheduler;
mod usage;

pub use scheduler::{
    static_popular_operations, PopularOperation, WarmingConfig, WarmingReport, WarmingScheduler,
    WarmingStats,
};
pub use usage::{RemoteUsageTracker, UsageRecord, UsageTracker};
