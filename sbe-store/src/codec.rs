//! Column encoding helpers shared by the entity modules.
//!
//! Enums travel as their `snake_case` wire names, timestamps as unix
//! milliseconds, versions as canonical semver strings, ids as UUID strings.
//! Decode failures surface as conversion errors so corrupt rows fail closed
//! instead of being silently skipped.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use std::str::FromStr;

use sbe_common::alert::{AlertSeverity, AlertStatus, AlertType};
use sbe_common::bundle::{BundleVersionStatus, ReportState};
use sbe_common::rollout::{
    AssignmentStatus, EligibilityPolicy, PhaseStatus, PhaseTarget, RolloutStatus,
};
use sbe_common::types::{GroupType, OnlineStatus, RegistrationStatus, TenantTier};

/// Wrap a decode failure into a rusqlite conversion error.
pub(crate) fn corrupt(why: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, why.into())),
    )
}

pub fn dt_to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn ms_to_dt(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| corrupt(format!("timestamp out of range: {ms}")))
}

pub fn opt_ms_to_dt(ms: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(ms_to_dt).transpose()
}

pub fn parse_uuid<T: FromStr>(raw: &str) -> rusqlite::Result<T> {
    raw.parse().map_err(|_| corrupt(format!("malformed id: {raw}")))
}

pub fn opt_parse_uuid<T: FromStr>(raw: Option<String>) -> rusqlite::Result<Option<T>> {
    raw.as_deref().map(parse_uuid).transpose()
}

pub fn parse_version(raw: &str) -> rusqlite::Result<semver::Version> {
    semver::Version::parse(raw).map_err(|e| corrupt(format!("malformed version {raw}: {e}")))
}

pub fn opt_parse_version(raw: Option<String>) -> rusqlite::Result<Option<semver::Version>> {
    raw.as_deref().map(parse_version).transpose()
}

pub fn parse_json(raw: Option<String>) -> rusqlite::Result<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(&s).map_err(|e| corrupt(format!("malformed json: {e}"))))
        .transpose()
}

macro_rules! enum_codec {
    ($ty:ty, $to:ident, $from:ident, { $($variant:path => $name:literal),+ $(,)? }) => {
        pub fn $to(value: $ty) -> &'static str {
            match value {
                $($variant => $name,)+
            }
        }

        pub fn $from(raw: &str) -> rusqlite::Result<$ty> {
            match raw {
                $($name => Ok($variant),)+
                other => Err(corrupt(format!(
                    "unknown {} value: {other}",
                    stringify!($ty)
                ))),
            }
        }
    };
}

enum_codec!(RegistrationStatus, registration_status_str, parse_registration_status, {
    RegistrationStatus::Pending => "pending",
    RegistrationStatus::Approved => "approved",
    RegistrationStatus::Rejected => "rejected",
});

enum_codec!(OnlineStatus, online_status_str, parse_online_status, {
    OnlineStatus::Online => "online",
    OnlineStatus::Offline => "offline",
    OnlineStatus::Updating => "updating",
    OnlineStatus::Error => "error",
});

enum_codec!(TenantTier, tenant_tier_str, parse_tenant_tier, {
    TenantTier::Free => "free",
    TenantTier::Paid => "paid",
});

enum_codec!(GroupType, group_type_str, parse_group_type, {
    GroupType::Static => "static",
    GroupType::Dynamic => "dynamic",
});

enum_codec!(BundleVersionStatus, bundle_version_status_str, parse_bundle_version_status, {
    BundleVersionStatus::Draft => "draft",
    BundleVersionStatus::Published => "published",
    BundleVersionStatus::Deprecated => "deprecated",
});

enum_codec!(ReportState, report_state_str, parse_report_state, {
    ReportState::Pending => "pending",
    ReportState::InProgress => "in_progress",
    ReportState::Completed => "completed",
    ReportState::Failed => "failed",
    ReportState::RolledBack => "rolled_back",
});

enum_codec!(RolloutStatus, rollout_status_str, parse_rollout_status, {
    RolloutStatus::Pending => "pending",
    RolloutStatus::InProgress => "in_progress",
    RolloutStatus::Paused => "paused",
    RolloutStatus::Completed => "completed",
    RolloutStatus::RolledBack => "rolled_back",
    RolloutStatus::Failed => "failed",
});

enum_codec!(PhaseStatus, phase_status_str, parse_phase_status, {
    PhaseStatus::Pending => "pending",
    PhaseStatus::InProgress => "in_progress",
    PhaseStatus::Completed => "completed",
    PhaseStatus::Failed => "failed",
});

enum_codec!(AssignmentStatus, assignment_status_str, parse_assignment_status, {
    AssignmentStatus::Pending => "pending",
    AssignmentStatus::Assigned => "assigned",
    AssignmentStatus::Reconciling => "reconciling",
    AssignmentStatus::Succeeded => "succeeded",
    AssignmentStatus::Failed => "failed",
});

enum_codec!(EligibilityPolicy, eligibility_str, parse_eligibility, {
    EligibilityPolicy::AllBundleUsers => "all_bundle_users",
    EligibilityPolicy::GroupMembers => "group_members",
});

enum_codec!(AlertSeverity, alert_severity_str, parse_alert_severity, {
    AlertSeverity::Info => "info",
    AlertSeverity::Warning => "warning",
    AlertSeverity::Critical => "critical",
});

enum_codec!(AlertStatus, alert_status_str, parse_alert_status, {
    AlertStatus::Active => "active",
    AlertStatus::Acknowledged => "acknowledged",
    AlertStatus::Resolved => "resolved",
});

pub fn alert_type_str(ty: AlertType) -> &'static str {
    ty.as_str()
}

pub fn parse_alert_type(raw: &str) -> rusqlite::Result<AlertType> {
    AlertType::from_str_opt(raw).ok_or_else(|| corrupt(format!("unknown alert type: {raw}")))
}

/// Encode a phase target as `(kind, value)` columns.
pub fn phase_target_cols(target: PhaseTarget) -> (&'static str, f64) {
    match target {
        PhaseTarget::DeviceCount(n) => ("device_count", n as f64),
        PhaseTarget::Percentage(p) => ("percentage", p),
    }
}

pub fn parse_phase_target(kind: &str, value: f64) -> rusqlite::Result<PhaseTarget> {
    match kind {
        "device_count" => Ok(PhaseTarget::DeviceCount(value as u32)),
        "percentage" => Ok(PhaseTarget::Percentage(value)),
        other => Err(corrupt(format!("unknown phase target kind: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip() {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        assert_eq!(ms_to_dt(dt_to_ms(at)).unwrap(), at);
    }

    #[test]
    fn enum_round_trips() {
        assert_eq!(
            parse_rollout_status(rollout_status_str(RolloutStatus::RolledBack)).unwrap(),
            RolloutStatus::RolledBack
        );
        assert_eq!(
            parse_assignment_status(assignment_status_str(AssignmentStatus::Reconciling)).unwrap(),
            AssignmentStatus::Reconciling
        );
        assert!(parse_rollout_status("nonsense").is_err());
    }

    #[test]
    fn phase_target_round_trips() {
        let (kind, value) = phase_target_cols(PhaseTarget::DeviceCount(7));
        assert_eq!(parse_phase_target(kind, value).unwrap(), PhaseTarget::DeviceCount(7));
        let (kind, value) = phase_target_cols(PhaseTarget::Percentage(12.5));
        assert_eq!(parse_phase_target(kind, value).unwrap(), PhaseTarget::Percentage(12.5));
    }

    #[test]
    fn corrupt_rows_fail_closed() {
        assert!(parse_version("not.a.version").is_err());
        assert!(parse_uuid::<sbe_common::DeviceId>("garbage").is_err());
    }
}
