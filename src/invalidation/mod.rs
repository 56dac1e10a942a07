//! Cache Invalidation
//!
//! Rule-driven removal of cached entries. Five strategies:
//!
//! - **Immediate**: scan, filter, delete in batches
//! - **Lazy**: scan, filter, shorten the TTL and let the store expire
//! - **Scheduled**: immediate, driven by the rule's own timer
//! - **Cascade**: matching keys plus the related records of their subjects
//! - **Pattern**: the generic bulk invalidation shared with the caches

mod manager;
mod rule;

pub use manager::{InvalidationConfig, InvalidationManager, InvalidationStats};
pub use rule::{
    default_rules, InvalidationConditions, InvalidationResult, InvalidationRule,
    InvalidationStrategy, Schedule,
};
