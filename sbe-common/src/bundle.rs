//! Bundles, bundle versions, desired state, and the reported-status ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{BundleId, DeviceId, RolloutId, TenantId};

/// A named, versioned container specification set; the unit of deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub bundle_id: BundleId,
    pub tenant_id: TenantId,
    pub name: String,
    /// Highest version published so far, if any.
    pub latest_version: Option<semver::Version>,
    pub created_at: DateTime<Utc>,
}

/// Publication status of a bundle version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleVersionStatus {
    Draft,
    Published,
    Deprecated,
}

/// One immutable version of a bundle. `(bundle_id, version)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleVersion {
    pub bundle_id: BundleId,
    pub version: semver::Version,
    /// Ordered container specs handed to the agent verbatim.
    pub containers: Vec<ContainerSpec>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub release_notes: Option<String>,
    #[serde(default)]
    pub blob_uri: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    pub status: BundleVersionStatus,
}

/// A single container within a bundle version.
///
/// Opaque to the control plane except for transport to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub port_mappings: Vec<String>,
    #[serde(default)]
    pub volume_mounts: Vec<String>,
}

/// The authoritative desired bundle version for one device.
///
/// Exactly one row exists per device when a bundle is assigned; deletion
/// means "no bundle assigned".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    pub device_id: DeviceId,
    pub bundle_id: BundleId,
    pub version: semver::Version,
    pub assigned_at: DateTime<Utc>,
    pub assigned_by: String,
    pub reason: String,
}

/// Reconciliation state reported by the agent for one desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportState {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl ReportState {
    /// Terminal states end a reconciliation attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Whether a stored state may transition to `next` on an agent report.
    ///
    /// `Pending -> InProgress -> {Completed, Failed}` plus
    /// `Failed -> InProgress` on retry. Re-reporting the same terminal state
    /// is a no-op handled by the caller.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::InProgress) => true,
            (Self::Pending, Self::Completed | Self::Failed) => true,
            (Self::InProgress, Self::Completed | Self::Failed) => true,
            (Self::Failed, Self::InProgress) => true,
            (Self::Pending | Self::InProgress, Self::RolledBack) => true,
            _ => false,
        }
    }
}

/// One row of the append-only reported-status ledger.
///
/// `(device_id, bundle_id, version)` is unique; later reports for the same
/// tuple update the row in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedStatus {
    pub device_id: DeviceId,
    pub bundle_id: BundleId,
    pub version: semver::Version,
    pub rollout_id: Option<RolloutId>,
    pub state: ReportState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ReportState::Completed.is_terminal());
        assert!(ReportState::Failed.is_terminal());
        assert!(ReportState::RolledBack.is_terminal());
        assert!(!ReportState::Pending.is_terminal());
        assert!(!ReportState::InProgress.is_terminal());
    }

    #[test]
    fn report_transitions() {
        use ReportState::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(Failed.can_transition_to(InProgress));
        // A device may jump straight to a terminal outcome.
        assert!(Pending.can_transition_to(Failed));
        // Completed is terminal for good.
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn container_spec_round_trips_through_json() {
        let spec = ContainerSpec {
            name: "web".into(),
            image: "registry.example/web:1.2.0".into(),
            env: BTreeMap::from([("PORT".to_string(), "8080".to_string())]),
            port_mappings: vec!["8080:80".into()],
            volume_mounts: vec!["/data:/var/lib/app".into()],
        };
        let json = serde_json::to_string(&spec).unwrap();
        let back: ContainerSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
    }
}
