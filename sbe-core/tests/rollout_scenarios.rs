//! End-to-end control-plane scenarios driving the real services against an
//! in-memory store with a manual clock.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};

use sbe_common::bundle::{Bundle, BundleVersion, BundleVersionStatus, ReportState};
use sbe_common::Clock;
use sbe_common::clock::ManualClock;
use sbe_common::ids::{BundleId, DeviceId, TenantId};
use sbe_common::rollout::{
    AssignmentStatus, EligibilityPolicy, PhaseStatus, PhaseTarget, RolloutStatus,
};
use sbe_common::types::{Device, OnlineStatus, RegistrationStatus, Tenant, TenantTier};
use sbe_core::alerts::{AlertConfig, AlertEngine};
use sbe_core::desired::{DesiredStateService, ReportRequest};
use sbe_core::events::EventBus;
use sbe_core::ingest::{IngestConfig, IngestService};
use sbe_core::rollout::{CreateRolloutRequest, PhaseSpec, RolloutConfig, RolloutEngine, TickOutcome};
use sbe_store::{Store, bundles, desired, devices, tenants};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn v(s: &str) -> semver::Version {
    semver::Version::parse(s).unwrap()
}

struct Fleet {
    store: Store,
    clock: Arc<ManualClock>,
    engine: RolloutEngine,
    reports: DesiredStateService,
    tenant: TenantId,
    bundle: BundleId,
    devices: Vec<DeviceId>,
}

/// Tenant with `n` approved devices, all running bundle version 1.0.0 with a
/// terminal `Completed` ledger row for it.
fn fleet(n: usize) -> Fleet {
    let store = Store::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(start()));
    let tenant = TenantId::generate();
    let bundle = BundleId::generate();

    store
        .with_tx(|tx| {
            tenants::upsert(
                tx,
                &Tenant {
                    tenant_id: tenant,
                    name: "acme".into(),
                    max_devices: 100,
                    data_retention_days: 30,
                    tier: TenantTier::Paid,
                },
            )?;
            bundles::insert(
                tx,
                &Bundle {
                    bundle_id: bundle,
                    tenant_id: tenant,
                    name: "edge-stack".into(),
                    latest_version: Some(v("1.1.0")),
                    created_at: start(),
                },
            )?;
            for version in ["1.0.0", "1.1.0"] {
                bundles::insert_version(
                    tx,
                    &BundleVersion {
                        bundle_id: bundle,
                        version: v(version),
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

    let mut ids = Vec::new();
    for i in 0..n {
        let device = Device {
            device_id: DeviceId::generate(),
            tenant_id: tenant,
            name: format!("edge-{i:02}"),
            metadata: None,
            registration_status: RegistrationStatus::Approved,
            online_status: OnlineStatus::Online,
            last_seen_at: Some(start()),
            group_ids: Vec::new(),
            tags: Default::default(),
            created_at: start(),
        };
        store
            .with_tx(|tx| {
                devices::insert(tx, &device)?;
                desired::upsert_desired(
                    tx,
                    &sbe_common::bundle::DesiredState {
                        device_id: device.device_id,
                        bundle_id: bundle,
                        version: v("1.0.0"),
                        assigned_at: start() - Duration::days(1),
                        assigned_by: "admin".into(),
                        reason: "initial install".into(),
                    },
                )?;
                desired::put_reported(
                    tx,
                    &sbe_common::bundle::ReportedStatus {
                        device_id: device.device_id,
                        bundle_id: bundle,
                        version: v("1.0.0"),
                        rollout_id: None,
                        state: ReportState::Completed,
                        started_at: start() - Duration::days(1),
                        completed_at: Some(start() - Duration::days(1)),
                        error_message: None,
                        retry_count: 0,
                    },
                )
            })
            .unwrap();
        ids.push(device.device_id);
    }

    let engine = RolloutEngine::new(
        store.clone(),
        clock.clone(),
        EventBus::default(),
        RolloutConfig {
            default_min_healthy: StdDuration::from_secs(300),
            default_failure_threshold: 0.05,
            max_retries: 3,
        },
    );
    let reports = DesiredStateService::new(store.clone(), clock.clone());
    Fleet { store, clock, engine, reports, tenant, bundle, devices: ids }
}

fn create_rollout(fleet: &Fleet, phases: Vec<PhaseSpec>, threshold: f64) -> sbe_common::ids::RolloutId {
    fleet
        .engine
        .create(CreateRolloutRequest {
            tenant_id: fleet.tenant,
            bundle_id: fleet.bundle,
            target_version: v("1.1.0"),
            previous_version: Some(v("1.0.0")),
            name: "canary-wave".into(),
            description: None,
            phases,
            failure_threshold: Some(threshold),
            eligibility: EligibilityPolicy::AllBundleUsers,
            target_group_id: None,
            created_by: "release-bot".into(),
        })
        .unwrap()
        .rollout
        .rollout_id
}

fn report(fleet: &Fleet, device: DeviceId, version: &str, state: ReportState) {
    fleet
        .reports
        .report(ReportRequest {
            device_id: device,
            bundle_id: fleet.bundle,
            version: v(version),
            state,
            error_message: (state == ReportState::Failed).then(|| "container crash loop".into()),
            at: fleet.clock.now(),
            rollout_id: None,
        })
        .unwrap();
}

fn desired_version(fleet: &Fleet, device: DeviceId) -> semver::Version {
    fleet
        .store
        .with_conn(|c| desired::get_desired(c, device))
        .unwrap()
        .unwrap()
        .version
}

#[test]
fn happy_path_two_phase_rollout() {
    let fleet = fleet(10);
    let rollout_id = create_rollout(
        &fleet,
        vec![
            PhaseSpec {
                name: "canary".into(),
                target: PhaseTarget::Percentage(10.0),
                min_healthy_duration_secs: Some(0),
            },
            PhaseSpec {
                name: "fleet".into(),
                target: PhaseTarget::Percentage(100.0),
                min_healthy_duration_secs: Some(0),
            },
        ],
        0.05,
    );

    // Start enters phase 1 with ceil(10% of 10) = 1 device.
    let snapshot = fleet.engine.start(rollout_id).unwrap();
    assert_eq!(snapshot.rollout.status, RolloutStatus::InProgress);
    assert_eq!(snapshot.rollout.current_phase_number, 1);
    assert_eq!(snapshot.assignments.len(), 1);
    let canary = snapshot.assignments[0].device_id;
    assert_eq!(desired_version(&fleet, canary), v("1.1.0"));

    // Canary applies the new version.
    fleet.clock.advance(Duration::seconds(1));
    report(&fleet, canary, "1.1.0", ReportState::Completed);

    // Tick completes phase 1 (dwell 0) and assigns the remaining 9.
    fleet.clock.advance(Duration::seconds(30));
    assert_eq!(fleet.engine.tick_rollout(rollout_id).unwrap(), TickOutcome::Advanced);
    let snapshot = fleet.engine.snapshot(rollout_id).unwrap();
    assert_eq!(snapshot.rollout.current_phase_number, 2);
    assert_eq!(snapshot.assignments.len(), 10);

    // Everyone else applies it too.
    fleet.clock.advance(Duration::seconds(5));
    for device in &fleet.devices {
        if *device != canary {
            report(&fleet, *device, "1.1.0", ReportState::Completed);
        }
    }
    fleet.clock.advance(Duration::seconds(30));
    assert_eq!(fleet.engine.tick_rollout(rollout_id).unwrap(), TickOutcome::Completed);

    let snapshot = fleet.engine.snapshot(rollout_id).unwrap();
    // Terminal status carries a completion timestamp.
    assert_eq!(snapshot.rollout.status, RolloutStatus::Completed);
    assert!(snapshot.rollout.completed_at.is_some());
    // Phase numbers are contiguous 1..N and all Completed.
    let numbers: Vec<u32> = snapshot.phases.iter().map(|p| p.phase_number).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert!(snapshot.phases.iter().all(|p| p.status == PhaseStatus::Completed));
    // One assignment per device across the whole rollout.
    let unique: BTreeSet<DeviceId> = snapshot.assignments.iter().map(|a| a.device_id).collect();
    assert_eq!(unique.len(), snapshot.assignments.len());
    assert!(snapshot.assignments.iter().all(|a| a.status == AssignmentStatus::Succeeded));
    // Every device ends on the target version.
    for device in &fleet.devices {
        assert_eq!(desired_version(&fleet, *device), v("1.1.0"));
    }

    // Re-entrancy: a further tick is a no-op on a terminal rollout.
    assert_eq!(fleet.engine.tick_rollout(rollout_id).unwrap(), TickOutcome::Idle);
}

#[test]
fn failure_gate_triggers_auto_rollback() {
    let fleet = fleet(10);
    let rollout_id = create_rollout(
        &fleet,
        vec![
            PhaseSpec {
                name: "canary".into(),
                target: PhaseTarget::DeviceCount(4),
                min_healthy_duration_secs: Some(0),
            },
            PhaseSpec {
                name: "fleet".into(),
                target: PhaseTarget::Percentage(100.0),
                min_healthy_duration_secs: Some(0),
            },
        ],
        0.25,
    );

    let snapshot = fleet.engine.start(rollout_id).unwrap();
    let assigned: Vec<DeviceId> = snapshot.assignments.iter().map(|a| a.device_id).collect();
    assert_eq!(assigned.len(), 4);

    // Two succeed, two fail: 2/4 = 0.5 > 0.25.
    fleet.clock.advance(Duration::seconds(5));
    report(&fleet, assigned[0], "1.1.0", ReportState::Completed);
    report(&fleet, assigned[1], "1.1.0", ReportState::Completed);
    report(&fleet, assigned[2], "1.1.0", ReportState::Failed);
    report(&fleet, assigned[3], "1.1.0", ReportState::Failed);

    fleet.clock.advance(Duration::seconds(30));
    assert_eq!(fleet.engine.tick_rollout(rollout_id).unwrap(), TickOutcome::RolledBack);

    let snapshot = fleet.engine.snapshot(rollout_id).unwrap();
    assert_eq!(snapshot.rollout.status, RolloutStatus::RolledBack);
    assert!(snapshot.rollout.completed_at.is_some());
    // Every previously assigned device is restored to the previous version.
    for device in &assigned {
        assert_eq!(desired_version(&fleet, *device), v("1.0.0"));
    }
    // Untouched devices never left 1.0.0.
    for device in fleet.devices.iter().filter(|d| !assigned.contains(d)) {
        assert_eq!(desired_version(&fleet, *device), v("1.0.0"));
    }
    // Non-terminal phases were failed.
    assert!(
        snapshot
            .phases
            .iter()
            .all(|p| matches!(p.status, PhaseStatus::Failed | PhaseStatus::Completed))
    );
    // A rollout_failed alert is active, and a fresh rollback ledger row asks
    // the devices to re-apply 1.0.0.
    let alerts = AlertEngine::new(
        fleet.store.clone(),
        fleet.clock.clone(),
        EventBus::default(),
        AlertConfig::default(),
    );
    let active = alerts.list(fleet.tenant, Some(sbe_common::alert::AlertStatus::Active)).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].alert_type, sbe_common::alert::AlertType::RolloutFailed);
    let row = fleet
        .store
        .with_conn(|c| desired::get_reported(c, assigned[0], fleet.bundle, &v("1.0.0")))
        .unwrap()
        .unwrap();
    assert_eq!(row.state, ReportState::Pending);
}

#[test]
fn pause_freezes_writes_and_resume_advances() {
    let fleet = fleet(10);
    let rollout_id = create_rollout(
        &fleet,
        vec![
            PhaseSpec {
                name: "half".into(),
                target: PhaseTarget::Percentage(50.0),
                min_healthy_duration_secs: Some(0),
            },
            PhaseSpec {
                name: "rest".into(),
                target: PhaseTarget::Percentage(100.0),
                min_healthy_duration_secs: Some(0),
            },
        ],
        0.05,
    );

    let snapshot = fleet.engine.start(rollout_id).unwrap();
    let assigned: Vec<DeviceId> = snapshot.assignments.iter().map(|a| a.device_id).collect();
    assert_eq!(assigned.len(), 5);

    fleet.engine.pause(rollout_id).unwrap();

    // Ticks while paused change nothing and write no desired state.
    let desired_before: Vec<_> =
        fleet.devices.iter().map(|d| desired_version(&fleet, *d)).collect();
    fleet.clock.advance(Duration::seconds(60));
    assert_eq!(fleet.engine.tick_rollout(rollout_id).unwrap(), TickOutcome::Idle);
    let desired_after: Vec<_> =
        fleet.devices.iter().map(|d| desired_version(&fleet, *d)).collect();
    assert_eq!(desired_before, desired_after);

    // In-flight reconciliations keep landing in the ledger while paused.
    for device in &assigned {
        report(&fleet, *device, "1.1.0", ReportState::Completed);
    }

    // Resume: the next tick sees the completions and advances.
    fleet.engine.resume(rollout_id).unwrap();
    fleet.clock.advance(Duration::seconds(30));
    assert_eq!(fleet.engine.tick_rollout(rollout_id).unwrap(), TickOutcome::Advanced);
    let snapshot = fleet.engine.snapshot(rollout_id).unwrap();
    assert_eq!(snapshot.rollout.current_phase_number, 2);
    assert_eq!(snapshot.assignments.len(), 10);
}

#[test]
fn failed_assignment_is_retried_then_terminal() {
    let fleet = fleet(2);
    let rollout_id = create_rollout(
        &fleet,
        vec![PhaseSpec {
            name: "all".into(),
            target: PhaseTarget::Percentage(100.0),
            min_healthy_duration_secs: Some(0),
        }],
        // Gate disabled so retries get exercised.
        1.0,
    );
    fleet.engine.start(rollout_id).unwrap();
    let snapshot = fleet.engine.snapshot(rollout_id).unwrap();
    let (lucky, unlucky) =
        (snapshot.assignments[0].device_id, snapshot.assignments[1].device_id);

    fleet.clock.advance(Duration::seconds(1));
    report(&fleet, lucky, "1.1.0", ReportState::Completed);
    report(&fleet, unlucky, "1.1.0", ReportState::Failed);

    // Tick 1: failure observed, retry 1 issued; ledger back to Pending.
    fleet.clock.advance(Duration::seconds(30));
    assert_eq!(fleet.engine.tick_rollout(rollout_id).unwrap(), TickOutcome::Refreshed);
    let snapshot = fleet.engine.snapshot(rollout_id).unwrap();
    let assignment =
        snapshot.assignments.iter().find(|a| a.device_id == unlucky).unwrap();
    assert_eq!(assignment.status, AssignmentStatus::Reconciling);
    assert_eq!(assignment.retry_count, 1);
    let row = fleet
        .store
        .with_conn(|c| desired::get_reported(c, unlucky, fleet.bundle, &v("1.1.0")))
        .unwrap()
        .unwrap();
    assert_eq!(row.state, ReportState::Pending);
    let reason = fleet
        .store
        .with_conn(|c| desired::get_desired(c, unlucky))
        .unwrap()
        .unwrap()
        .reason;
    assert!(reason.ends_with(":retry:1"), "reason was {reason}");

    // The device keeps failing through its retry budget.
    for round in 2..=3 {
        fleet.clock.advance(Duration::seconds(5));
        report(&fleet, unlucky, "1.1.0", ReportState::Failed);
        fleet.clock.advance(Duration::seconds(30));
        fleet.engine.tick_rollout(rollout_id).unwrap();
        let snapshot = fleet.engine.snapshot(rollout_id).unwrap();
        let assignment =
            snapshot.assignments.iter().find(|a| a.device_id == unlucky).unwrap();
        assert_eq!(assignment.retry_count, round);
    }

    // Budget exhausted: the final failure is terminal and the phase can
    // complete around it.
    fleet.clock.advance(Duration::seconds(5));
    report(&fleet, unlucky, "1.1.0", ReportState::Failed);
    fleet.clock.advance(Duration::seconds(30));
    assert_eq!(fleet.engine.tick_rollout(rollout_id).unwrap(), TickOutcome::Completed);
    let snapshot = fleet.engine.snapshot(rollout_id).unwrap();
    let assignment =
        snapshot.assignments.iter().find(|a| a.device_id == unlucky).unwrap();
    assert_eq!(assignment.status, AssignmentStatus::Failed);
    assert_eq!(assignment.retry_count, 3);
    // The cumulative failure counter kept every observation.
    assert!(snapshot.phases[0].failure_count >= 4);
}

#[test]
fn min_healthy_window_delays_completion() {
    let fleet = fleet(3);
    let rollout_id = create_rollout(
        &fleet,
        vec![PhaseSpec {
            name: "all".into(),
            target: PhaseTarget::Percentage(100.0),
            min_healthy_duration_secs: Some(120),
        }],
        0.05,
    );
    fleet.engine.start(rollout_id).unwrap();
    for device in fleet.devices.clone() {
        fleet.clock.advance(Duration::seconds(1));
        report(&fleet, device, "1.1.0", ReportState::Completed);
    }

    // All succeeded, but the dwell has not elapsed.
    assert_eq!(fleet.engine.tick_rollout(rollout_id).unwrap(), TickOutcome::Refreshed);
    let snapshot = fleet.engine.snapshot(rollout_id).unwrap();
    assert!(snapshot.phases[0].healthy_since.is_some());
    assert_eq!(snapshot.rollout.status, RolloutStatus::InProgress);

    // Re-running the tick without new events does not restart the window.
    fleet.clock.advance(Duration::seconds(60));
    assert_eq!(fleet.engine.tick_rollout(rollout_id).unwrap(), TickOutcome::Refreshed);

    fleet.clock.advance(Duration::seconds(61));
    assert_eq!(fleet.engine.tick_rollout(rollout_id).unwrap(), TickOutcome::Completed);
}

#[test]
fn active_rollout_blocks_a_second_one_for_the_bundle() {
    let fleet = fleet(4);
    let first = create_rollout(
        &fleet,
        vec![PhaseSpec {
            name: "all".into(),
            target: PhaseTarget::Percentage(100.0),
            min_healthy_duration_secs: Some(0),
        }],
        0.05,
    );
    fleet.engine.start(first).unwrap();

    let err = fleet
        .engine
        .create(CreateRolloutRequest {
            tenant_id: fleet.tenant,
            bundle_id: fleet.bundle,
            target_version: v("1.1.0"),
            previous_version: Some(v("1.0.0")),
            name: "second".into(),
            description: None,
            phases: vec![PhaseSpec {
                name: "all".into(),
                target: PhaseTarget::Percentage(100.0),
                min_healthy_duration_secs: Some(0),
            }],
            failure_threshold: None,
            eligibility: EligibilityPolicy::AllBundleUsers,
            target_group_id: None,
            created_by: "release-bot".into(),
        })
        .unwrap_err();
    assert_eq!(err.code, sbe_common::error::ErrorCode::ActiveRolloutExists);
}

#[test]
fn manual_rollback_requires_previous_version() {
    let fleet = fleet(2);
    let rollout_id = fleet
        .engine
        .create(CreateRolloutRequest {
            tenant_id: fleet.tenant,
            bundle_id: fleet.bundle,
            target_version: v("1.1.0"),
            previous_version: None,
            name: "no-prev".into(),
            description: None,
            phases: vec![PhaseSpec {
                name: "all".into(),
                target: PhaseTarget::Percentage(100.0),
                min_healthy_duration_secs: Some(0),
            }],
            failure_threshold: None,
            eligibility: EligibilityPolicy::AllBundleUsers,
            target_group_id: None,
            created_by: "release-bot".into(),
        })
        .unwrap()
        .rollout
        .rollout_id;
    fleet.engine.start(rollout_id).unwrap();

    let err = fleet.engine.rollback(rollout_id).unwrap_err();
    assert_eq!(err.code, sbe_common::error::ErrorCode::NoPreviousVersion);
}

#[test]
fn offline_detection_and_alert_lifecycle() {
    let fleet = fleet(1);
    let device = fleet.devices[0];
    let ingest = IngestService::new(
        fleet.store.clone(),
        fleet.clock.clone(),
        EventBus::default(),
        IngestConfig::default(),
    );
    let alerts = AlertEngine::new(
        fleet.store.clone(),
        fleet.clock.clone(),
        EventBus::default(),
        AlertConfig::default(),
    );

    // Heartbeats every 30 s for 2 minutes, then silence.
    for _ in 0..4 {
        ingest
            .post_heartbeat(sbe_common::types::DeviceHeartbeat {
                device_id: device,
                at: fleet.clock.now(),
                status: Some("ok".into()),
                ip_address: None,
                extras: None,
            })
            .unwrap();
        fleet.clock.advance(Duration::seconds(30));
    }

    // Past the 120 s threshold the detector flips the device offline, and
    // the Online invariant holds afterwards.
    fleet.clock.advance(Duration::seconds(120));
    assert_eq!(ingest.offline_tick().unwrap(), vec![device]);

    // Past 5 minutes of silence: warning. Past 30: critical joins it.
    fleet.clock.advance(Duration::minutes(4));
    alerts.tick().unwrap();
    let active = alerts.list(fleet.tenant, Some(sbe_common::alert::AlertStatus::Active)).unwrap();
    assert_eq!(active.len(), 1);

    fleet.clock.advance(Duration::minutes(26));
    alerts.tick().unwrap();
    let active = alerts.list(fleet.tenant, Some(sbe_common::alert::AlertStatus::Active)).unwrap();
    assert_eq!(active.len(), 2);

    // The device comes back: next alert tick resolves both.
    ingest
        .post_heartbeat(sbe_common::types::DeviceHeartbeat {
            device_id: device,
            at: fleet.clock.now(),
            status: Some("ok".into()),
            ip_address: None,
            extras: None,
        })
        .unwrap();
    let stats = alerts.tick().unwrap();
    assert_eq!(stats.resolved, 2);
    assert!(
        alerts
            .list(fleet.tenant, Some(sbe_common::alert::AlertStatus::Active))
            .unwrap()
            .is_empty()
    );
}
