//! tiercache - Adaptive Multi-Tier Result Cache
//!
//! Caches the output of expensive document, image and video transformations
//! in a per-process memory tier backed by a shared remote key/value tier.
//! Placement (TTL, tiers, priority, compression) is chosen per result from
//! its workload class and size, and is tuned at runtime by the optimizer.
//!
//! # Architecture
//!
//! ```text
//! caller ──► MultiTierCache ──► MemoryTier ──► RemoteTier
//!                 ▲
//!   Invalidation / Warming / Cleanup / Monitor / Optimizer
//! ```
//!
//! All components are owned by a [`CacheSystem`], built once at process
//! start and passed by reference to consumers.
//!
//! # Modules
//!
//! - [`cache`] - Keys, strategies, tiers and the multi-tier cache
//! - [`invalidation`] - Rule-driven invalidation
//! - [`warming`] - Usage tracking and cache warming
//! - [`cleanup`] - Memory-pressure cleanup
//! - [`monitoring`] - Metrics history, alerts, health, Prometheus export
//! - [`optimizer`] - Strategy tuning from observed metrics
//! - [`service`] - The service object wiring everything together
//! - [`error`] - Error types

pub mod cache;
pub mod cleanup;
pub mod error;
pub mod invalidation;
pub mod monitoring;
pub mod optimizer;
pub mod service;
pub mod warming;

// Re-export commonly used types
pub use cache::{
    CacheKey, CacheRegistry, KeyCodec, MultiTierCache, RemoteStore, RemoteTier, SizeCategory,
    StrategyConfig, StrategyTable, TierId, WorkloadClass,
};
pub use cleanup::CleanupManager;
pub use error::{Error, Result};
pub use invalidation::{InvalidationManager, InvalidationRule, InvalidationStrategy};
pub use monitoring::{Alert, Monitor};
pub use optimizer::Optimizer;
pub use service::{CacheSystem, SystemConfig};
pub use warming::{UsageTracker, WarmingScheduler};
