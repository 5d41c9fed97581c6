//! The rollout control loop: refresh, gate, dwell, retry, advance, rollback.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Transaction;
use tracing::{debug, info, warn};

use sbe_common::alert::{Alert, AlertSeverity, AlertStatus, AlertType, Notification};
use sbe_common::bundle::{DesiredState, ReportState, ReportedStatus};
use sbe_common::error::CoreError;
use sbe_common::ids::{AlertId, AssignmentId, BundleId, DeviceId, RolloutId};
use sbe_common::rollout::{
    AssignmentStatus, PhaseStatus, Rollout, RolloutDeviceAssignment, RolloutPhase, RolloutStatus,
};
use sbe_store::{alerts, desired, rollouts};

use super::{RolloutEngine, selection};
use crate::desired::seed_pending_report;
use crate::storage_err;

/// What one tick did to one rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Rollout was not in a tickable state.
    Idle,
    /// Assignments refreshed; phase still in flight.
    Refreshed,
    /// The current phase completed and the next one started.
    Advanced,
    /// The final phase completed; the rollout is done.
    Completed,
    /// The failure gate fired (or a manual rollback landed first).
    RolledBack,
    /// An error was logged and the rollout left untouched this tick.
    Errored,
}

impl RolloutEngine {
    /// Process every `InProgress` rollout once. Errors are logged with
    /// rollout context and never abort the loop.
    pub fn tick(&self) -> Result<Vec<(RolloutId, TickOutcome)>, CoreError> {
        let in_progress = self
            .store
            .with_conn(|c| rollouts::list_by_status(c, RolloutStatus::InProgress))
            .map_err(storage_err)?;

        let mut outcomes = Vec::with_capacity(in_progress.len());
        for rollout_id in in_progress {
            let outcome = match self.tick_rollout(rollout_id) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(rollout = %rollout_id, "rollout tick failed: {e}");
                    TickOutcome::Errored
                }
            };
            outcomes.push((rollout_id, outcome));
        }
        Ok(outcomes)
    }

    /// Run the tick algorithm for a single rollout.
    ///
    /// Re-entrant: with no new reports, a second run reaches the same state.
    pub fn tick_rollout(&self, rollout_id: RolloutId) -> Result<TickOutcome, CoreError> {
        let lock = self.store.rollout_locks().for_rollout(rollout_id);
        let _held = lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        let max_retries = self.config.max_retries;
        let default_dwell = self.config.default_min_healthy.as_secs();

        let outcome = self
            .store
            .with_tx(|tx| {
                let Some(mut rollout) = rollouts::get_rollout(tx, rollout_id)? else {
                    return Ok(TickOutcome::Idle);
                };
                if rollout.status != RolloutStatus::InProgress {
                    return Ok(TickOutcome::Idle);
                }
                let mut phases = rollouts::phases_for_rollout(tx, rollout_id)?;

                if rollout.current_phase_number == 0 {
                    // Started but never entered a phase; recover by entering one.
                    enter_next_phase(tx, &mut rollout, &mut phases, now)?;
                    rollouts::update_rollout(tx, &rollout)?;
                    return Ok(TickOutcome::Advanced);
                }

                let Some(current_idx) =
                    phases.iter().position(|p| p.phase_number == rollout.current_phase_number)
                else {
                    // Phase table is inconsistent with the rollout row.
                    warn!(rollout = %rollout_id, phase = rollout.current_phase_number, "current phase missing; failing rollout");
                    rollout.status = RolloutStatus::Failed;
                    rollout.completed_at = Some(now);
                    fail_open_phases(tx, &mut phases, now)?;
                    rollouts::update_rollout(tx, &rollout)?;
                    raise_rollout_alert(tx, &rollout, now, "rollout phase table is inconsistent")?;
                    return Ok(TickOutcome::Errored);
                };

                let mut assignments =
                    rollouts::assignments_for_phase(tx, phases[current_idx].phase_id)?;
                refresh_assignments(tx, &rollout, &mut phases[current_idx], &mut assignments)?;

                // Failure gate: only meaningful once a majority (or the whole
                // phase, if smaller) has reached a terminal outcome.
                let attempted = (phases[current_idx].success_count
                    + phases[current_idx].failure_count) as usize;
                let gate_min = assignments.len().div_ceil(2).max(1);
                if attempted >= gate_min
                    && phases[current_idx].failure_count as f64 / attempted as f64
                        > rollout.failure_threshold
                {
                    info!(
                        rollout = %rollout_id,
                        failures = phases[current_idx].failure_count,
                        attempted,
                        threshold = rollout.failure_threshold,
                        "failure gate breached, rolling back"
                    );
                    rollouts::update_phase(tx, &phases[current_idx])?;
                    roll_back(tx, &mut rollout, now)?;
                    return Ok(TickOutcome::RolledBack);
                }

                retry_failed_assignments(
                    tx,
                    &rollout,
                    &phases[current_idx],
                    &mut assignments,
                    max_retries,
                    now,
                )?;

                // Min-healthy dwell: starts when nothing is left in flight and
                // every retry budget is spent or succeeded.
                let settled = !assignments.is_empty()
                    && assignments.iter().all(|a| match a.status {
                        AssignmentStatus::Succeeded => true,
                        AssignmentStatus::Failed => a.retry_count >= max_retries,
                        _ => false,
                    });
                if settled {
                    let healthy_since = *phases[current_idx].healthy_since.get_or_insert(now);
                    let dwell =
                        phases[current_idx].min_healthy_duration_secs.unwrap_or(default_dwell);
                    if now - healthy_since >= Duration::seconds(dwell as i64) {
                        phases[current_idx].status = PhaseStatus::Completed;
                        phases[current_idx].completed_at = Some(now);
                        rollouts::update_phase(tx, &phases[current_idx])?;
                        enter_next_phase(tx, &mut rollout, &mut phases, now)?;
                        rollouts::update_rollout(tx, &rollout)?;
                        return Ok(if rollout.status == RolloutStatus::Completed {
                            TickOutcome::Completed
                        } else {
                            TickOutcome::Advanced
                        });
                    }
                } else {
                    phases[current_idx].healthy_since = None;
                }
                rollouts::update_phase(tx, &phases[current_idx])?;
                Ok(TickOutcome::Refreshed)
            })
            .map_err(storage_err)?;

        if matches!(outcome, TickOutcome::Completed | TickOutcome::RolledBack) {
            self.store.rollout_locks().release(rollout_id);
            self.events.emit(
                "signalbeam.devices.events.rollout_finished",
                now,
                &serde_json::json!({ "rolloutId": rollout_id, "outcome": format!("{outcome:?}") }),
            );
        }
        Ok(outcome)
    }
}

/// Project the latest ledger rows onto the phase's assignments and maintain
/// the phase counters. The failure counter is cumulative: retries never
/// decrement it.
fn refresh_assignments(
    tx: &Transaction<'_>,
    rollout: &Rollout,
    phase: &mut RolloutPhase,
    assignments: &mut [RolloutDeviceAssignment],
) -> rusqlite::Result<()> {
    for assignment in assignments.iter_mut() {
        let report = desired::get_reported(
            tx,
            assignment.device_id,
            rollout.bundle_id,
            &rollout.target_version,
        )?;
        let Some(report) = report else { continue };
        let prior = assignment.status;
        match report.state {
            ReportState::Completed => {
                assignment.status = AssignmentStatus::Succeeded;
                assignment.reconciled_at = report.completed_at;
                assignment.error_message = None;
            }
            ReportState::Failed => {
                assignment.status = AssignmentStatus::Failed;
                assignment.reconciled_at = report.completed_at;
                assignment.error_message = report.error_message.clone();
                if prior != AssignmentStatus::Failed {
                    phase.failure_count += 1;
                }
            }
            ReportState::InProgress => {
                if matches!(prior, AssignmentStatus::Pending | AssignmentStatus::Assigned) {
                    assignment.status = AssignmentStatus::Reconciling;
                }
            }
            ReportState::Pending | ReportState::RolledBack => {}
        }
        if assignment.status != prior {
            debug!(
                device = %assignment.device_id,
                from = ?prior,
                to = ?assignment.status,
                "assignment state projected from ledger"
            );
        }
        rollouts::update_assignment(tx, assignment)?;
    }
    phase.success_count =
        assignments.iter().filter(|a| a.status == AssignmentStatus::Succeeded).count() as u32;
    Ok(())
}

/// Put failed assignments with remaining budget back in flight: bump the
/// retry counter, rewrite the desired state, and reset the ledger row to
/// `Pending`.
fn retry_failed_assignments(
    tx: &Transaction<'_>,
    rollout: &Rollout,
    phase: &RolloutPhase,
    assignments: &mut [RolloutDeviceAssignment],
    max_retries: u32,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    for assignment in assignments.iter_mut() {
        if assignment.status != AssignmentStatus::Failed || assignment.retry_count >= max_retries {
            continue;
        }
        assignment.retry_count += 1;
        assignment.status = AssignmentStatus::Reconciling;
        assignment.error_message = None;
        info!(
            device = %assignment.device_id,
            retry = assignment.retry_count,
            "retrying failed assignment"
        );

        desired::upsert_desired(
            tx,
            &DesiredState {
                device_id: assignment.device_id,
                bundle_id: rollout.bundle_id,
                version: rollout.target_version.clone(),
                assigned_at: now,
                assigned_by: "rollout".into(),
                reason: format!(
                    "rollout:{}:phase:{}:retry:{}",
                    rollout.rollout_id, phase.phase_number, assignment.retry_count
                ),
            },
        )?;
        force_pending_report(
            tx,
            assignment.device_id,
            rollout.bundle_id,
            &rollout.target_version,
            rollout.rollout_id,
            now,
        )?;
        rollouts::update_assignment(tx, assignment)?;
    }
    Ok(())
}

/// Enter the next `Pending` phase: resolve its target against the remaining
/// candidates, write desired state and assignments, and bump the phase
/// pointer. With no phase left, the rollout completes.
pub(super) fn enter_next_phase(
    tx: &Transaction<'_>,
    rollout: &mut Rollout,
    phases: &mut [RolloutPhase],
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let last_phase_number = phases.iter().map(|p| p.phase_number).max().unwrap_or(0);
    let Some(phase) = phases
        .iter_mut()
        .filter(|p| p.status == PhaseStatus::Pending)
        .min_by_key(|p| p.phase_number)
    else {
        rollout.status = RolloutStatus::Completed;
        rollout.completed_at = Some(now);
        info!(rollout = %rollout.rollout_id, "all phases complete");
        return Ok(());
    };

    let remaining = selection::remaining_candidates(tx, rollout)?;
    let count = if phase.phase_number == last_phase_number {
        // The final phase takes everything left, whatever it declared.
        remaining.len()
    } else {
        phase.target.resolve(remaining.len())
    };
    let selected = &remaining[..count];

    for device_id in selected {
        let state = DesiredState {
            device_id: *device_id,
            bundle_id: rollout.bundle_id,
            version: rollout.target_version.clone(),
            assigned_at: now,
            assigned_by: "rollout".into(),
            reason: format!("rollout:{}:phase:{}", rollout.rollout_id, phase.phase_number),
        };
        desired::upsert_desired(tx, &state)?;
        seed_pending_report(tx, &state, Some(rollout.rollout_id), now)?;
        rollouts::insert_assignment(
            tx,
            &RolloutDeviceAssignment {
                assignment_id: AssignmentId::generate(),
                rollout_id: rollout.rollout_id,
                phase_id: phase.phase_id,
                device_id: *device_id,
                status: AssignmentStatus::Assigned,
                assigned_at: Some(now),
                reconciled_at: None,
                error_message: None,
                retry_count: 0,
            },
        )?;
    }

    phase.status = PhaseStatus::InProgress;
    phase.started_at = Some(now);
    rollouts::update_phase(tx, phase)?;
    rollout.current_phase_number = phase.phase_number;
    info!(
        rollout = %rollout.rollout_id,
        phase = phase.phase_number,
        devices = count,
        "phase entered"
    );
    Ok(())
}

/// Roll the whole rollout back to the previous version (§ rollback
/// procedure): every assigned device across all phases gets the previous
/// version re-assigned and a fresh `Pending` ledger row; non-terminal phases
/// fail; the rollout terminates. Without a previous version the rollout can
/// only be marked `Failed`.
pub(super) fn roll_back(
    tx: &Transaction<'_>,
    rollout: &mut Rollout,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let mut phases = rollouts::phases_for_rollout(tx, rollout.rollout_id)?;

    match rollout.previous_version.clone() {
        Some(previous) => {
            let assignments = rollouts::assignments_for_rollout(tx, rollout.rollout_id)?;
            for assignment in &assignments {
                desired::upsert_desired(
                    tx,
                    &DesiredState {
                        device_id: assignment.device_id,
                        bundle_id: rollout.bundle_id,
                        version: previous.clone(),
                        assigned_at: now,
                        assigned_by: "rollout".into(),
                        reason: format!("rollback:{}", rollout.rollout_id),
                    },
                )?;
                force_pending_report(
                    tx,
                    assignment.device_id,
                    rollout.bundle_id,
                    &previous,
                    rollout.rollout_id,
                    now,
                )?;
            }
            rollout.status = RolloutStatus::RolledBack;
            info!(
                rollout = %rollout.rollout_id,
                devices = assignments.len(),
                previous = %previous,
                "rollout rolled back"
            );
        }
        None => {
            rollout.status = RolloutStatus::Failed;
            warn!(rollout = %rollout.rollout_id, "no previous version; marking rollout failed");
        }
    }
    rollout.completed_at = Some(now);
    fail_open_phases(tx, &mut phases, now)?;
    rollouts::update_rollout(tx, rollout)?;
    raise_rollout_alert(tx, rollout, now, "rollout failure threshold breached")?;
    Ok(())
}

fn fail_open_phases(
    tx: &Transaction<'_>,
    phases: &mut [RolloutPhase],
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    for phase in phases.iter_mut() {
        if matches!(phase.status, PhaseStatus::Pending | PhaseStatus::InProgress) {
            phase.status = PhaseStatus::Failed;
            phase.completed_at = Some(now);
            rollouts::update_phase(tx, phase)?;
        }
    }
    Ok(())
}

/// Reset the ledger row for a tuple to `Pending`, preserving its retry
/// counter. Unlike assignment seeding this overwrites terminal rows: the
/// device must re-apply the version.
fn force_pending_report(
    tx: &Transaction<'_>,
    device_id: DeviceId,
    bundle_id: BundleId,
    version: &semver::Version,
    rollout_id: RolloutId,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let retry_count = desired::get_reported(tx, device_id, bundle_id, version)?
        .map(|r| r.retry_count)
        .unwrap_or(0);
    desired::put_reported(
        tx,
        &ReportedStatus {
            device_id,
            bundle_id,
            version: version.clone(),
            rollout_id: Some(rollout_id),
            state: ReportState::Pending,
            started_at: now,
            completed_at: None,
            error_message: None,
            retry_count,
        },
    )
}

/// Raise the `rollout_failed` alert (deduplicated per rollout) and write a
/// best-effort notification row.
fn raise_rollout_alert(
    tx: &Transaction<'_>,
    rollout: &Rollout,
    now: DateTime<Utc>,
    description: &str,
) -> rusqlite::Result<()> {
    if alerts::active_exists_for_rollout(tx, rollout.rollout_id, AlertType::RolloutFailed)? {
        return Ok(());
    }
    let alert = Alert {
        alert_id: AlertId::generate(),
        tenant_id: rollout.tenant_id,
        severity: AlertSeverity::Critical,
        alert_type: AlertType::RolloutFailed,
        status: AlertStatus::Active,
        title: format!("rollout {} failed", rollout.name),
        description: description.to_string(),
        device_id: None,
        rollout_id: Some(rollout.rollout_id),
        created_at: now,
        acknowledged_at: None,
        acknowledged_by: None,
        resolved_at: None,
    };
    alerts::insert(tx, &alert)?;
    alerts::insert_notification(
        tx,
        &Notification {
            id: uuid::Uuid::new_v4(),
            tenant_id: rollout.tenant_id,
            alert_id: alert.alert_id,
            subject: alert.title.clone(),
            body: format!("rollout {} ({}): {description}", rollout.name, rollout.rollout_id),
            created_at: now,
        },
    )?;
    Ok(())
}
