//! Core domain types: tenants, devices, groups, credentials, and telemetry.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{DeviceId, GroupId, KeyId, TenantId, TokenId};
use crate::tags::TagAtom;

/// Maximum length of the opaque device metadata blob, in bytes.
pub const MAX_METADATA_BYTES: usize = 4000;

/// Subscription tier of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantTier {
    Free,
    Paid,
}

/// Tenant view held locally for quota checks and retention.
///
/// Tenants are owned by the external identity service; this record is the
/// subset the control plane needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: TenantId,
    pub name: String,
    /// Maximum number of devices this tenant may register.
    pub max_devices: u32,
    /// Horizon for heartbeat/metric retention.
    pub data_retention_days: u32,
    pub tier: TenantTier,
}

/// Admin decision state for a device registration.
///
/// `Pending` is the initial state. `Rejected` is terminal for that
/// registration; `Approved` is terminal with respect to status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Pending,
    Approved,
    Rejected,
}

/// Derived liveness status of a device. Never written by users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnlineStatus {
    Online,
    Offline,
    Updating,
    Error,
}

impl Default for OnlineStatus {
    fn default() -> Self {
        Self::Offline
    }
}

/// A registered edge device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub tenant_id: TenantId,
    pub name: String,
    /// Opaque metadata blob; never parsed or indexed by the core.
    #[serde(default)]
    pub metadata: Option<String>,
    pub registration_status: RegistrationStatus,
    pub online_status: OnlineStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub tags: BTreeSet<TagAtom>,
    pub created_at: DateTime<Utc>,
}

/// Membership mode of a device group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    /// Explicit member set, mutated only by admin calls.
    Static,
    /// Membership recomputed from a tag query on a periodic tick.
    Dynamic,
}

/// A named set of devices within one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub group_id: GroupId,
    pub tenant_id: TenantId,
    pub name: String,
    pub group_type: GroupType,
    /// Tag-query expression; required for dynamic groups, absent for static.
    #[serde(default)]
    pub tag_query: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A single-use token an admin mints to admit a device into a tenant.
///
/// Only the KDF hash of the secret is stored; the plaintext is returned once
/// at issue time. Valid iff `!is_used && now < expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub token_id: TokenId,
    pub tenant_id: TenantId,
    /// First 8 characters of the secret, indexed for lookup.
    pub prefix: String,
    /// Cost-12 KDF hash of the secret.
    #[serde(skip_serializing)]
    pub hash: String,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub used_by_device_id: Option<DeviceId>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
}

impl RegistrationToken {
    /// A token may be redeemed iff it is unused and unexpired.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.is_used && now < self.expires_at
    }
}

/// A long-lived credential a device presents on every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceApiKey {
    pub key_id: KeyId,
    pub device_id: DeviceId,
    pub prefix: String,
    #[serde(skip_serializing)]
    pub hash: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeviceApiKey {
    /// A key authenticates iff it is not revoked and not expired.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.is_none_or(|exp| now < exp)
    }
}

/// One row of the append-only authentication audit ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthAttempt {
    pub id: uuid::Uuid,
    pub device_id: Option<DeviceId>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub at: DateTime<Utc>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub api_key_prefix: Option<String>,
}

/// A liveness sample posted by the device agent. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHeartbeat {
    pub device_id: DeviceId,
    pub at: DateTime<Utc>,
    /// Agent-reported status string (e.g. "ok", "error").
    pub status: Option<String>,
    pub ip_address: Option<String>,
    /// Opaque extras blob from the agent.
    #[serde(default)]
    pub extras: Option<serde_json::Value>,
}

/// A resource sample posted by the device agent. Append-only.
///
/// Percentages are validated into `[0, 100]` at ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub device_id: DeviceId,
    pub at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub uptime_seconds: u64,
    pub running_containers: u32,
    #[serde(default)]
    pub extras: Option<serde_json::Value>,
}

/// One computed health-score sample. Append-only.
///
/// Componentwise bounds: heartbeat 0..=40, reconciliation 0..=30,
/// resource 0..=30, and `total` is always their sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHealthScore {
    pub device_id: DeviceId,
    pub at: DateTime<Utc>,
    pub total: f64,
    pub heartbeat_score: f64,
    pub reconciliation_score: f64,
    pub resource_score: f64,
}

/// Health bucket derived from the total score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthBucket {
    Healthy,
    Degraded,
    Critical,
}

impl HealthBucket {
    /// Bucket boundaries: healthy >= 70, degraded 40..70, critical < 40.
    pub fn from_total(total: f64) -> Self {
        if total >= 70.0 {
            Self::Healthy
        } else if total >= 40.0 {
            Self::Degraded
        } else {
            Self::Critical
        }
    }
}
