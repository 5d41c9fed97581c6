//! Desired-state assignments and the reported-status ledger.
//!
//! The desired state is the single authoritative record of what a device
//! should be running; the ledger records what the agent did about it. The
//! agent polls [`DesiredStateService::get_desired_for`] and posts reports
//! that move a ledger row through
//! `Pending -> InProgress -> {Completed, Failed}` (with
//! `Failed -> InProgress` on retry).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use sbe_common::bundle::{DesiredState, ReportState, ReportedStatus};
use sbe_common::clock::Clock;
use sbe_common::error::{CoreError, ErrorCode};
use sbe_common::ids::{BundleId, DeviceId, RolloutId, TenantId};
use sbe_store::{Store, bundles, desired, devices};

use crate::storage_err;

#[derive(Debug, Clone)]
pub struct AssignRequest {
    pub tenant_id: TenantId,
    pub device_id: DeviceId,
    pub bundle_id: BundleId,
    pub version: semver::Version,
    pub assigned_by: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub device_id: DeviceId,
    pub bundle_id: BundleId,
    pub version: semver::Version,
    pub state: ReportState,
    pub error_message: Option<String>,
    pub at: DateTime<Utc>,
    pub rollout_id: Option<RolloutId>,
}

#[derive(Clone)]
pub struct DesiredStateService {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl DesiredStateService {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Explicitly assign a bundle version to a device.
    pub fn assign(&self, req: AssignRequest) -> Result<DesiredState, CoreError> {
        let now = self.clock.now();
        let state = DesiredState {
            device_id: req.device_id,
            bundle_id: req.bundle_id,
            version: req.version.clone(),
            assigned_at: now,
            assigned_by: req.assigned_by.clone(),
            reason: req.reason.clone(),
        };

        let result = self.store.with_tx(|tx| {
            let Some(device) = devices::get(tx, req.device_id)? else {
                return Ok(Err(CoreError::device_not_found(req.device_id)));
            };
            let Some(bundle) = bundles::get(tx, req.bundle_id)? else {
                return Ok(Err(CoreError::bundle_not_found(req.bundle_id)));
            };
            if device.tenant_id != req.tenant_id || bundle.tenant_id != req.tenant_id {
                return Ok(Err(CoreError::new(
                    ErrorCode::TenantMismatch,
                    "device and bundle must belong to the caller's tenant",
                )));
            }
            if bundles::get_version(tx, req.bundle_id, &req.version)?.is_none() {
                return Ok(Err(CoreError::new(
                    ErrorCode::BundleNotFound,
                    format!("bundle {} has no version {}", req.bundle_id, req.version),
                )));
            }

            desired::upsert_desired(tx, &state)?;
            seed_pending_report(tx, &state, req.rollout_hint(), now)?;
            Ok(Ok(()))
        });

        match result {
            Ok(Ok(())) => {
                debug!(device = %req.device_id, version = %req.version, "desired state assigned");
                Ok(state)
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// The agent's polling read.
    pub fn get_desired_for(&self, device_id: DeviceId) -> Result<Option<DesiredState>, CoreError> {
        self.store.with_conn(|c| desired::get_desired(c, device_id)).map_err(storage_err)
    }

    /// Remove the assignment entirely ("no bundle assigned").
    pub fn unassign(&self, device_id: DeviceId) -> Result<bool, CoreError> {
        self.store.with_conn(|c| desired::delete_desired(c, device_id)).map_err(storage_err)
    }

    /// Apply one agent report to the ledger.
    ///
    /// Returns the stored row. `STALE_REPORT` means the row already holds a
    /// newer terminal outcome; the HTTP edge treats that as success for the
    /// device since retrying is pointless.
    pub fn report(&self, req: ReportRequest) -> Result<ReportedStatus, CoreError> {
        let result = self.store.with_tx(|tx| {
            let existing = desired::get_reported(tx, req.device_id, req.bundle_id, &req.version)?;
            let row = match existing {
                None => ReportedStatus {
                    device_id: req.device_id,
                    bundle_id: req.bundle_id,
                    version: req.version.clone(),
                    rollout_id: req.rollout_id,
                    state: req.state,
                    started_at: req.at,
                    completed_at: req.state.is_terminal().then_some(req.at),
                    error_message: req.error_message.clone(),
                    retry_count: 0,
                },
                Some(mut row) => {
                    // Same terminal state twice is a no-op after the first.
                    if row.state == req.state && row.state.is_terminal() {
                        return Ok(Ok(row));
                    }
                    // A report dated before the recorded completion is stale.
                    if let Some(completed_at) = row.completed_at {
                        if req.at < completed_at {
                            return Ok(Err(CoreError::new(
                                ErrorCode::StaleReport,
                                format!(
                                    "report at {} predates recorded completion at {}",
                                    req.at, completed_at
                                ),
                            )));
                        }
                    }
                    if !row.state.can_transition_to(req.state) {
                        return Ok(Err(CoreError::new(
                            ErrorCode::StaleReport,
                            format!("{:?} -> {:?} is not a legal transition", row.state, req.state),
                        )));
                    }
                    if row.state == ReportState::Failed && req.state == ReportState::InProgress {
                        row.retry_count += 1;
                    }
                    row.state = req.state;
                    row.completed_at = req.state.is_terminal().then_some(req.at);
                    row.error_message = req.error_message.clone();
                    if req.rollout_id.is_some() {
                        row.rollout_id = req.rollout_id;
                    }
                    row
                }
            };
            desired::put_reported(tx, &row)?;
            Ok(Ok(row))
        });

        match result {
            Ok(inner) => inner,
            Err(e) => Err(storage_err(e)),
        }
    }
}

impl AssignRequest {
    /// Rollout id parsed out of an engine-written reason, if any.
    fn rollout_hint(&self) -> Option<RolloutId> {
        let rest = self.reason.strip_prefix("rollout:").or_else(|| self.reason.strip_prefix("rollback:"))?;
        let id = rest.split(':').next()?;
        id.parse().ok()
    }
}

/// Seed a `Pending` ledger row for a fresh assignment, unless the tuple
/// already reconciled to a terminal outcome.
pub(crate) fn seed_pending_report(
    conn: &rusqlite::Connection,
    state: &DesiredState,
    rollout_id: Option<RolloutId>,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let existing = desired::get_reported(conn, state.device_id, state.bundle_id, &state.version)?;
    let retry_count = match &existing {
        Some(row) if row.state.is_terminal() => return Ok(()),
        Some(row) => row.retry_count,
        None => 0,
    };
    desired::put_reported(
        conn,
        &ReportedStatus {
            device_id: state.device_id,
            bundle_id: state.bundle_id,
            version: state.version.clone(),
            rollout_id: rollout_id.or_else(|| existing.and_then(|r| r.rollout_id)),
            state: ReportState::Pending,
            started_at: now,
            completed_at: None,
            error_message: None,
            retry_count,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sbe_common::bundle::{Bundle, BundleVersion, BundleVersionStatus};
    use sbe_common::clock::ManualClock;
    use sbe_common::types::{Device, OnlineStatus, RegistrationStatus};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
    }

    fn v(s: &str) -> semver::Version {
        semver::Version::parse(s).unwrap()
    }

    struct Fixture {
        service: DesiredStateService,
        tenant: TenantId,
        device: DeviceId,
        bundle: BundleId,
    }

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let tenant = TenantId::generate();
        let device = Device {
            device_id: DeviceId::generate(),
            tenant_id: tenant,
            name: "gw".into(),
            metadata: None,
            registration_status: RegistrationStatus::Approved,
            online_status: OnlineStatus::Online,
            last_seen_at: Some(start()),
            group_ids: Vec::new(),
            tags: Default::default(),
            created_at: start(),
        };
        let bundle = Bundle {
            bundle_id: BundleId::generate(),
            tenant_id: tenant,
            name: "stack".into(),
            latest_version: None,
            created_at: start(),
        };
        store
            .with_tx(|tx| {
                devices::insert(tx, &device)?;
                bundles::insert(tx, &bundle)?;
                for ver in ["1.0.0", "1.1.0"] {
                    bundles::insert_version(
                        tx,
                        &BundleVersion {
                            bundle_id: bundle.bundle_id,
                            version: v(ver),
                            containers: vec![],
                            created_at: start(),
                            release_notes: None,
                            blob_uri: None,
                            checksum: None,
                            size_bytes: None,
                            status: BundleVersionStatus::Published,
                        },
                    )?;
                }
                Ok(())
            })
            .unwrap();
        Fixture {
            service: DesiredStateService::new(store, clock),
            tenant,
            device: device.device_id,
            bundle: bundle.bundle_id,
        }
    }

    fn assign(fx: &Fixture, version: &str) -> Result<DesiredState, CoreError> {
        fx.service.assign(AssignRequest {
            tenant_id: fx.tenant,
            device_id: fx.device,
            bundle_id: fx.bundle,
            version: v(version),
            assigned_by: "admin".into(),
            reason: "manual".into(),
        })
    }

    fn report(fx: &Fixture, version: &str, state: ReportState, at: DateTime<Utc>) -> Result<ReportedStatus, CoreError> {
        fx.service.report(ReportRequest {
            device_id: fx.device,
            bundle_id: fx.bundle,
            version: v(version),
            state,
            error_message: None,
            at,
            rollout_id: None,
        })
    }

    #[test]
    fn assign_seeds_pending_report_and_polling_read() {
        let fx = fixture();
        assign(&fx, "1.0.0").unwrap();

        let polled = fx.service.get_desired_for(fx.device).unwrap().unwrap();
        assert_eq!(polled.version, v("1.0.0"));
        assert_eq!(polled.assigned_by, "admin");

        let row = report(&fx, "1.0.0", ReportState::InProgress, start()).unwrap();
        assert_eq!(row.state, ReportState::InProgress);
    }

    #[test]
    fn assign_validates_existence_and_tenancy() {
        let fx = fixture();
        let missing_version = fx
            .service
            .assign(AssignRequest {
                tenant_id: fx.tenant,
                device_id: fx.device,
                bundle_id: fx.bundle,
                version: v("9.9.9"),
                assigned_by: "admin".into(),
                reason: "manual".into(),
            })
            .unwrap_err();
        assert_eq!(missing_version.code, ErrorCode::BundleNotFound);

        let wrong_tenant = fx
            .service
            .assign(AssignRequest {
                tenant_id: TenantId::generate(),
                device_id: fx.device,
                bundle_id: fx.bundle,
                version: v("1.0.0"),
                assigned_by: "admin".into(),
                reason: "manual".into(),
            })
            .unwrap_err();
        assert_eq!(wrong_tenant.code, ErrorCode::TenantMismatch);
    }

    #[test]
    fn report_lifecycle_with_retry_counting() {
        let fx = fixture();
        assign(&fx, "1.0.0").unwrap();

        report(&fx, "1.0.0", ReportState::InProgress, start()).unwrap();
        let failed = report(&fx, "1.0.0", ReportState::Failed, start() + chrono::Duration::seconds(10)).unwrap();
        assert_eq!(failed.retry_count, 0);
        assert!(failed.completed_at.is_some());

        // Retry: Failed -> InProgress bumps the counter and clears completion.
        let retried = report(&fx, "1.0.0", ReportState::InProgress, start() + chrono::Duration::seconds(20)).unwrap();
        assert_eq!(retried.retry_count, 1);
        assert!(retried.completed_at.is_none());

        let done = report(&fx, "1.0.0", ReportState::Completed, start() + chrono::Duration::seconds(30)).unwrap();
        assert_eq!(done.retry_count, 1);
        assert_eq!(done.state, ReportState::Completed);
    }

    #[test]
    fn terminal_reports_are_idempotent() {
        let fx = fixture();
        assign(&fx, "1.0.0").unwrap();
        let first = report(&fx, "1.0.0", ReportState::Completed, start() + chrono::Duration::seconds(5)).unwrap();
        let second = report(&fx, "1.0.0", ReportState::Completed, start() + chrono::Duration::seconds(50)).unwrap();
        // No-op after the first: original completion timestamp preserved.
        assert_eq!(first.completed_at, second.completed_at);
    }

    #[test]
    fn stale_report_is_rejected() {
        let fx = fixture();
        assign(&fx, "1.0.0").unwrap();
        report(&fx, "1.0.0", ReportState::Completed, start() + chrono::Duration::minutes(10)).unwrap();

        // Failed at an earlier time than the recorded completion.
        let err = report(&fx, "1.0.0", ReportState::Failed, start() + chrono::Duration::minutes(9)).unwrap_err();
        assert_eq!(err.code, ErrorCode::StaleReport);

        // The ledger still shows the completion.
        let row = report(&fx, "1.0.0", ReportState::Completed, start() + chrono::Duration::minutes(10)).unwrap();
        assert_eq!(row.state, ReportState::Completed);
        assert_eq!(row.completed_at, Some(start() + chrono::Duration::minutes(10)));
    }

    #[test]
    fn reassign_does_not_clobber_terminal_outcome() {
        let fx = fixture();
        assign(&fx, "1.0.0").unwrap();
        report(&fx, "1.0.0", ReportState::Completed, start() + chrono::Duration::seconds(5)).unwrap();

        // Re-assigning the same version leaves the completed row alone.
        assign(&fx, "1.0.0").unwrap();
        let row = report(&fx, "1.0.0", ReportState::Completed, start() + chrono::Duration::seconds(5)).unwrap();
        assert_eq!(row.state, ReportState::Completed);

        // Assigning a new version seeds a fresh pending row for that tuple.
        assign(&fx, "1.1.0").unwrap();
        let row = report(&fx, "1.1.0", ReportState::InProgress, start() + chrono::Duration::seconds(10)).unwrap();
        assert_eq!(row.state, ReportState::InProgress);
    }

    #[test]
    fn unassign_clears_the_polling_read() {
        let fx = fixture();
        assign(&fx, "1.0.0").unwrap();
        assert!(fx.service.unassign(fx.device).unwrap());
        assert!(fx.service.get_desired_for(fx.device).unwrap().is_none());
        assert!(!fx.service.unassign(fx.device).unwrap());
    }
}
