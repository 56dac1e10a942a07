//! Tiered Result Cache
//!
//! Caches the results of expensive processing operations (document merges,
//! image resizes, video transcodes) across two physical tiers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    MultiTierCache                        │
//! │  get / set / get_or_compute / invalidate                 │
//! ├──────────────┬───────────────────┬───────────────────────┤
//! │ StrategyTable│ RequestDeduplicator│ CacheMetrics         │
//! ├──────────────┴───────┬───────────┴───────────────────────┤
//! │  MemoryTier          │  RemoteTier                       │
//! │  per process, LFU    │  shared, TTL-native, LZ4 envelope │
//! └──────────────────────┴───────────────────────────────────┘
//! ```
//!
//! Placement (TTL, tiers, compression) is chosen per result from its
//! workload class and serialized size.

pub mod compression;
pub mod dedup;
pub mod key;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod pattern;
pub mod redis;
pub mod remote;
pub mod strategy;

pub use compression::{CompressionAlgorithm, CompressionConfig, Envelope, PayloadCodec};
pub use dedup::RequestDeduplicator;
pub use key::{CacheKey, KeyCodec, WorkloadClass};
pub use manager::{
    CacheConfig, CacheLookup, CacheRegistry, MultiTierCache, StoreOutcome, API_CACHE, FILE_CACHE,
    USER_CACHE,
};
pub use memory::{MemoryTier, MemoryTierConfig, MemoryTierStats};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use pattern::glob_match;
pub use redis::{RedisConfig, RedisRemoteStore, RemoteNamespace};
pub use remote::{
    BulkDelete, InMemoryRemoteStore, KeyTtl, RemoteMemoryInfo, RemoteStore, RemoteTier,
    RemoteTierConfig, RemoteTierStats,
};
pub use strategy::{
    SizeCategory, StrategyConfig, StrategyOverride, StrategyTable, StrategyUpdate, TierId,
};

/// TTL ladder, in seconds
pub mod ttl {
    pub const VERY_SHORT: u64 = 60; // 1 minute
    pub const SHORT: u64 = 300; // 5 minutes
    pub const MEDIUM: u64 = 1800; // 30 minutes
    pub const LONG: u64 = 3600; // 1 hour
    pub const VERY_LONG: u64 = 86_400; // 1 day
    pub const WEEK: u64 = 604_800;
    pub const MONTH: u64 = 2_592_000; // 30 days
}

// =============================================================================
// Tests
// =============================================================================
