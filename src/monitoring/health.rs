//! Health Reporting
//!
//! Per-component checks rolled up into the body served by `/readyz` and
//! `/status`, plus the liveness and readiness flags flipped by the service
//! lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Ordered from best to worst so a rollup is a `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Still answering lookups, possibly from memory only
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Whether lookups are being served at all
    pub fn is_serving(&self) -> bool {
        *self != HealthStatus::Unhealthy
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parts of the cache system with their own check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// Shared key/value tier reachability
    Remote,
    /// Per-process memory tier pressure
    Memory,
    /// Alert state and hit rate
    Monitor,
    /// Background services started
    Lifecycle,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Remote => "remote",
            Component::Memory => "memory",
            Component::Monitor => "monitor",
            Component::Lifecycle => "lifecycle",
        };
        f.write_str(name)
    }
}

/// Outcome of checking one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: Component,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub latency_ms: u64,
}

impl ComponentHealth {
    fn with_status(component: Component, status: HealthStatus, detail: Option<String>) -> Self {
        Self {
            component,
            status,
            detail,
            latency_ms: 0,
        }
    }

    pub fn up(component: Component) -> Self {
        Self::with_status(component, HealthStatus::Healthy, None)
    }

    pub fn impaired(component: Component, detail: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Degraded, Some(detail.into()))
    }

    pub fn down(component: Component, detail: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unhealthy, Some(detail.into()))
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Record how long the check took
    pub fn timed(mut self, started: Instant) -> Self {
        self.latency_ms = started.elapsed().as_millis() as u64;
        self
    }
}

/// Body of the readiness and status endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst component status; healthy when nothing was checked
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub version: String,
    pub uptime_seconds: u64,
}

impl HealthReport {
    pub fn from_checks(components: Vec<ComponentHealth>, uptime: Duration) -> Self {
        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            components,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }

    pub fn component(&self, component: Component) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.component == component)
    }

    pub fn is_serving(&self) -> bool {
        self.status.is_serving()
    }
}

/// Liveness and readiness flags for the probe endpoints.
///
/// Live from construction; ready only between `start` and `stop`.
#[derive(Debug)]
pub struct Probes {
    started_at: Instant,
    live: AtomicBool,
    ready: AtomicBool,
}

impl Probes {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Lifecycle component check
    pub fn lifecycle(&self) -> ComponentHealth {
        if self.is_ready() {
            ComponentHealth::up(Component::Lifecycle)
        } else {
            ComponentHealth::down(Component::Lifecycle, "background services not started")
        }
    }
}

impl Default for Probes {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
