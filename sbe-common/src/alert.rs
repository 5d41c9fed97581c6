//! Alerts and the notification ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AlertId, DeviceId, RolloutId, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

/// Rule identifier an alert was raised by.
///
/// `(device_id, alert_type)` is unique among Active alerts, so a rule cannot
/// raise a second active alert for the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    DeviceOfflineWarning,
    DeviceOfflineCritical,
    DeviceUnhealthy,
    HighErrorRate,
    RolloutFailed,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceOfflineWarning => "device_offline_warning",
            Self::DeviceOfflineCritical => "device_offline_critical",
            Self::DeviceUnhealthy => "device_unhealthy",
            Self::HighErrorRate => "high_error_rate",
            Self::RolloutFailed => "rollout_failed",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "device_offline_warning" => Some(Self::DeviceOfflineWarning),
            "device_offline_critical" => Some(Self::DeviceOfflineCritical),
            "device_unhealthy" => Some(Self::DeviceUnhealthy),
            "high_error_rate" => Some(Self::HighErrorRate),
            "rollout_failed" => Some(Self::RolloutFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: AlertId,
    pub tenant_id: TenantId,
    pub severity: AlertSeverity,
    pub alert_type: AlertType,
    pub status: AlertStatus,
    pub title: String,
    pub description: String,
    pub device_id: Option<DeviceId>,
    pub rollout_id: Option<RolloutId>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Best-effort notification row; delivery is an external dispatcher's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: uuid::Uuid,
    pub tenant_id: TenantId,
    pub alert_id: AlertId,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_type_names_round_trip() {
        for ty in [
            AlertType::DeviceOfflineWarning,
            AlertType::DeviceOfflineCritical,
            AlertType::DeviceUnhealthy,
            AlertType::HighErrorRate,
            AlertType::RolloutFailed,
        ] {
            assert_eq!(AlertType::from_str_opt(ty.as_str()), Some(ty));
        }
        assert_eq!(AlertType::from_str_opt("bogus"), None);
    }

    #[test]
    fn severity_ordering() {
        assert!(AlertSeverity::Critical > AlertSeverity::Warning);
        assert!(AlertSeverity::Warning > AlertSeverity::Info);
    }
}
