//! Alert model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Low => write!(f, "low"),
            AlertSeverity::Medium => write!(f, "medium"),
            AlertSeverity::High => write!(f, "high"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Condition an alert reports. At most one unresolved alert exists per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    LowHitRate,
    HighResponseTime,
    HighErrorRate,
    HighMemoryUsage,
    RemoteConnectionFailed,
    WarmingFailed,
}

impl AlertType {
    pub fn severity(&self) -> AlertSeverity {
        match self {
            AlertType::LowHitRate => AlertSeverity::High,
            AlertType::HighResponseTime => AlertSeverity::Medium,
            AlertType::HighErrorRate => AlertSeverity::High,
            AlertType::HighMemoryUsage => AlertSeverity::High,
            AlertType::RemoteConnectionFailed => AlertSeverity::Critical,
            AlertType::WarmingFailed => AlertSeverity::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::LowHitRate => "low_hit_rate",
            AlertType::HighResponseTime => "high_response_time",
            AlertType::HighErrorRate => "high_error_rate",
            AlertType::HighMemoryUsage => "high_memory_usage",
            AlertType::RemoteConnectionFailed => "remote_connection_failed",
            AlertType::WarmingFailed => "warming_failed",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A threshold breach
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    /// Observed value
    pub value: f64,
    /// Threshold that was crossed
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(alert_type: AlertType, message: impl Into<String>, value: f64, threshold: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            alert_type,
            severity: alert_type.severity(),
            message: message.into(),
            value,
            threshold,
            timestamp: Utc::now(),
            resolved: false,
            resolved_at: None,
        }
    }

    pub fn resolve(&mut self) {
        self.resolved = true;
        self.resolved_at = Some(Utc::now());
    }

    pub fn storage_key(&self) -> String {
        format!("alert:{}", self.id)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_per_type() {
        assert_eq!(AlertType::RemoteConnectionFailed.severity(), AlertSeverity::Critical);
        assert_eq!(AlertType::LowHitRate.severity(), AlertSeverity::High);
        assert_eq!(AlertType::WarmingFailed.severity(), AlertSeverity::Medium);
        assert!(AlertSeverity::Critical > AlertSeverity::High);
    }

    #[test]
    fn test_resolve_and_serialize() {
        let mut alert = Alert::new(AlertType::HighErrorRate, "errors at 7.5%", 7.5, 5.0);
        assert!(alert.storage_key().starts_with("alert:"));
        assert!(!alert.resolved);

        alert.resolve();
        assert!(alert.resolved);
        assert!(alert.resolved_at.is_some());

        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["type"], "high_error_rate");
        assert_eq!(json["severity"], "high");
        let back: Alert = serde_json::from_value(json).unwrap();
        assert_eq!(back, alert);
    }
}
