//! Monitoring and Alerting
//!
//! - [`Monitor`]: periodic sampling, threshold alerts, status rollup
//! - [`PrometheusExporter`]: text exposition of the latest sample
//! - [`health`]: component checks and probe flags

mod alerts;
mod exporter;
pub mod health;
mod monitor;

pub use alerts::{Alert, AlertSeverity, AlertType};
pub use exporter::PrometheusExporter;
pub use health::{Component, ComponentHealth, HealthReport, HealthStatus, Probes};
pub use monitor::{MetricsSample, Monitor, MonitorConfig, MonitorStatus};
