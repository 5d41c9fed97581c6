//! Rollouts, phases, and per-device assignments.
//!
//! A rollout owns an ordered list of phases; each phase owns the device
//! assignments made when it started. Readers get immutable snapshots; all
//! mutation goes through the rollout engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AssignmentId, BundleId, DeviceId, GroupId, PhaseId, RolloutId, TenantId};

/// Lifecycle state of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    RolledBack,
    Failed,
}

impl RolloutStatus {
    /// Terminal states carry a `completed_at` timestamp.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Failed)
    }

    /// States in which a rollout blocks another rollout of the same bundle.
    pub fn is_active(self) -> bool {
        matches!(self, Self::InProgress | Self::Paused)
    }
}

/// Lifecycle state of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Lifecycle state of a device assignment within a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Assigned,
    Reconciling,
    Succeeded,
    Failed,
}

impl AssignmentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// How candidate devices are enumerated at rollout creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityPolicy {
    /// All approved tenant devices whose current desired bundle matches.
    #[default]
    AllBundleUsers,
    /// Approved members of the target device group.
    GroupMembers,
}

/// Per-phase device target: exactly one of an absolute count or a
/// percentage of the still-uncovered candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseTarget {
    DeviceCount(u32),
    /// Percentage in `(0, 100]`.
    Percentage(f64),
}

impl PhaseTarget {
    /// Resolve the target against the remaining candidate count at phase
    /// start. Percentages round up; absolute counts clamp to what is left.
    pub fn resolve(&self, remaining: usize) -> usize {
        match *self {
            Self::DeviceCount(n) => (n as usize).min(remaining),
            Self::Percentage(p) => {
                let exact = p * remaining as f64 / 100.0;
                (exact.ceil() as usize).min(remaining)
            }
        }
    }
}

/// A scheduled transition of devices from one bundle version to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    pub rollout_id: RolloutId,
    pub tenant_id: TenantId,
    pub bundle_id: BundleId,
    pub target_version: semver::Version,
    pub previous_version: Option<semver::Version>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Failure-rate breach point in `[0, 1]`.
    pub failure_threshold: f64,
    pub status: RolloutStatus,
    /// 1-based index of the phase in flight; 0 before start.
    pub current_phase_number: u32,
    pub eligibility: EligibilityPolicy,
    /// Required when `eligibility` is `GroupMembers`.
    pub target_group_id: Option<GroupId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: String,
}

/// One phase of a rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutPhase {
    pub phase_id: PhaseId,
    pub rollout_id: RolloutId,
    /// 1-based, contiguous across the rollout.
    pub phase_number: u32,
    pub name: String,
    pub target: PhaseTarget,
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Count of assignments that reached Succeeded.
    pub success_count: u32,
    /// Cumulative count of observed failures; never decremented by retries.
    pub failure_count: u32,
    /// Dwell time all assignments must stay Succeeded before completion.
    pub min_healthy_duration_secs: Option<u64>,
    /// Set when the phase first became fully healthy; cleared if it regresses.
    pub healthy_since: Option<DateTime<Utc>>,
}

/// One device's participation in one rollout. `(rollout_id, device_id)` is
/// unique across the whole rollout, not just the phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutDeviceAssignment {
    pub assignment_id: AssignmentId,
    pub rollout_id: RolloutId,
    pub phase_id: PhaseId,
    pub device_id: DeviceId,
    pub status: AssignmentStatus,
    pub assigned_at: Option<DateTime<Utc>>,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}
