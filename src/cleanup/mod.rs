//! Memory-pressure cleanup

mod manager;

pub use manager::{
    CleanupAction, CleanupActionKind, CleanupConfig, CleanupManager, CleanupReport, CleanupStats,
};
