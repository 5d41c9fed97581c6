//! Rollout, phase, and assignment queries.
//!
//! The engine loads a rollout as a snapshot (rollout + phases + assignments),
//! decides, and writes back full rows inside one transaction per tick.

use rusqlite::{Connection, OptionalExtension, params};

use sbe_common::ids::{BundleId, PhaseId, RolloutId, TenantId};
use sbe_common::rollout::{Rollout, RolloutDeviceAssignment, RolloutPhase, RolloutStatus};

use crate::codec;

pub fn insert_rollout(conn: &Connection, rollout: &Rollout) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO rollouts
             (rollout_id, tenant_id, bundle_id, target_version, previous_version, name,
              description, failure_threshold, status, current_phase_number, eligibility,
              target_group_id, created_at_ms, started_at_ms, completed_at_ms, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            rollout.rollout_id.to_string(),
            rollout.tenant_id.to_string(),
            rollout.bundle_id.to_string(),
            rollout.target_version.to_string(),
            rollout.previous_version.as_ref().map(|v| v.to_string()),
            rollout.name,
            rollout.description,
            rollout.failure_threshold,
            codec::rollout_status_str(rollout.status),
            rollout.current_phase_number,
            codec::eligibility_str(rollout.eligibility),
            rollout.target_group_id.map(|g| g.to_string()),
            codec::dt_to_ms(rollout.created_at),
            rollout.started_at.map(codec::dt_to_ms),
            rollout.completed_at.map(codec::dt_to_ms),
            rollout.created_by,
        ],
    )?;
    Ok(())
}

/// Write back every mutable column of a rollout row.
pub fn update_rollout(conn: &Connection, rollout: &Rollout) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE rollouts SET
             status = ?2, current_phase_number = ?3, started_at_ms = ?4, completed_at_ms = ?5
         WHERE rollout_id = ?1",
        params![
            rollout.rollout_id.to_string(),
            codec::rollout_status_str(rollout.status),
            rollout.current_phase_number,
            rollout.started_at.map(codec::dt_to_ms),
            rollout.completed_at.map(codec::dt_to_ms),
        ],
    )?;
    Ok(())
}

pub fn get_rollout(conn: &Connection, rollout_id: RolloutId) -> rusqlite::Result<Option<Rollout>> {
    conn.query_row(
        "SELECT rollout_id, tenant_id, bundle_id, target_version, previous_version, name,
                description, failure_threshold, status, current_phase_number, eligibility,
                target_group_id, created_at_ms, started_at_ms, completed_at_ms, created_by
         FROM rollouts WHERE rollout_id = ?1",
        params![rollout_id.to_string()],
        row_to_rollout,
    )
    .optional()
}

pub fn list_in_tenant(conn: &Connection, tenant_id: TenantId) -> rusqlite::Result<Vec<Rollout>> {
    let mut stmt = conn.prepare(
        "SELECT rollout_id, tenant_id, bundle_id, target_version, previous_version, name,
                description, failure_threshold, status, current_phase_number, eligibility,
                target_group_id, created_at_ms, started_at_ms, completed_at_ms, created_by
         FROM rollouts WHERE tenant_id = ?1 ORDER BY created_at_ms DESC, rollout_id",
    )?;
    let rows = stmt.query_map(params![tenant_id.to_string()], row_to_rollout)?;
    rows.collect()
}

/// Rollouts in a given status, oldest first (tick processing order).
pub fn list_by_status(conn: &Connection, status: RolloutStatus) -> rusqlite::Result<Vec<RolloutId>> {
    let mut stmt = conn.prepare(
        "SELECT rollout_id FROM rollouts WHERE status = ?1 ORDER BY created_at_ms, rollout_id",
    )?;
    let rows = stmt.query_map(params![codec::rollout_status_str(status)], |row| {
        row.get::<_, String>(0)
    })?;
    rows.map(|r| r.and_then(|s| codec::parse_uuid(&s))).collect()
}

/// Whether some rollout for this bundle is InProgress or Paused.
pub fn active_for_bundle(
    conn: &Connection,
    bundle_id: BundleId,
) -> rusqlite::Result<Option<RolloutId>> {
    conn.query_row(
        "SELECT rollout_id FROM rollouts
         WHERE bundle_id = ?1 AND status IN ('in_progress', 'paused')
         LIMIT 1",
        params![bundle_id.to_string()],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(|s| codec::parse_uuid(&s))
    .transpose()
}

pub fn insert_phase(conn: &Connection, phase: &RolloutPhase) -> rusqlite::Result<()> {
    let (kind, value) = codec::phase_target_cols(phase.target);
    conn.execute(
        "INSERT INTO rollout_phases
             (phase_id, rollout_id, phase_number, name, target_kind, target_value, status,
              started_at_ms, completed_at_ms, success_count, failure_count,
              min_healthy_duration_secs, healthy_since_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            phase.phase_id.to_string(),
            phase.rollout_id.to_string(),
            phase.phase_number,
            phase.name,
            kind,
            value,
            codec::phase_status_str(phase.status),
            phase.started_at.map(codec::dt_to_ms),
            phase.completed_at.map(codec::dt_to_ms),
            phase.success_count,
            phase.failure_count,
            phase.min_healthy_duration_secs.map(|n| n as i64),
            phase.healthy_since.map(codec::dt_to_ms),
        ],
    )?;
    Ok(())
}

pub fn update_phase(conn: &Connection, phase: &RolloutPhase) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE rollout_phases SET
             status = ?2, started_at_ms = ?3, completed_at_ms = ?4,
             success_count = ?5, failure_count = ?6, healthy_since_ms = ?7
         WHERE phase_id = ?1",
        params![
            phase.phase_id.to_string(),
            codec::phase_status_str(phase.status),
            phase.started_at.map(codec::dt_to_ms),
            phase.completed_at.map(codec::dt_to_ms),
            phase.success_count,
            phase.failure_count,
            phase.healthy_since.map(codec::dt_to_ms),
        ],
    )?;
    Ok(())
}

/// Phases of a rollout in declared order.
pub fn phases_for_rollout(
    conn: &Connection,
    rollout_id: RolloutId,
) -> rusqlite::Result<Vec<RolloutPhase>> {
    let mut stmt = conn.prepare(
        "SELECT phase_id, rollout_id, phase_number, name, target_kind, target_value, status,
                started_at_ms, completed_at_ms, success_count, failure_count,
                min_healthy_duration_secs, healthy_since_ms
         FROM rollout_phases WHERE rollout_id = ?1 ORDER BY phase_number",
    )?;
    let rows = stmt.query_map(params![rollout_id.to_string()], row_to_phase)?;
    rows.collect()
}

pub fn insert_assignment(
    conn: &Connection,
    assignment: &RolloutDeviceAssignment,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO rollout_assignments
             (assignment_id, rollout_id, phase_id, device_id, status,
              assigned_at_ms, reconciled_at_ms, error_message, retry_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            assignment.assignment_id.to_string(),
            assignment.rollout_id.to_string(),
            assignment.phase_id.to_string(),
            assignment.device_id.to_string(),
            codec::assignment_status_str(assignment.status),
            assignment.assigned_at.map(codec::dt_to_ms),
            assignment.reconciled_at.map(codec::dt_to_ms),
            assignment.error_message,
            assignment.retry_count,
        ],
    )?;
    Ok(())
}

pub fn update_assignment(
    conn: &Connection,
    assignment: &RolloutDeviceAssignment,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE rollout_assignments SET
             status = ?2, assigned_at_ms = ?3, reconciled_at_ms = ?4,
             error_message = ?5, retry_count = ?6
         WHERE assignment_id = ?1",
        params![
            assignment.assignment_id.to_string(),
            codec::assignment_status_str(assignment.status),
            assignment.assigned_at.map(codec::dt_to_ms),
            assignment.reconciled_at.map(codec::dt_to_ms),
            assignment.error_message,
            assignment.retry_count,
        ],
    )?;
    Ok(())
}

pub fn assignments_for_phase(
    conn: &Connection,
    phase_id: PhaseId,
) -> rusqlite::Result<Vec<RolloutDeviceAssignment>> {
    let mut stmt = conn.prepare(
        "SELECT assignment_id, rollout_id, phase_id, device_id, status,
                assigned_at_ms, reconciled_at_ms, error_message, retry_count
         FROM rollout_assignments WHERE phase_id = ?1 ORDER BY device_id",
    )?;
    let rows = stmt.query_map(params![phase_id.to_string()], row_to_assignment)?;
    rows.collect()
}

pub fn assignments_for_rollout(
    conn: &Connection,
    rollout_id: RolloutId,
) -> rusqlite::Result<Vec<RolloutDeviceAssignment>> {
    let mut stmt = conn.prepare(
        "SELECT assignment_id, rollout_id, phase_id, device_id, status,
                assigned_at_ms, reconciled_at_ms, error_message, retry_count
         FROM rollout_assignments WHERE rollout_id = ?1 ORDER BY device_id",
    )?;
    let rows = stmt.query_map(params![rollout_id.to_string()], row_to_assignment)?;
    rows.collect()
}

fn row_to_rollout(row: &rusqlite::Row<'_>) -> rusqlite::Result<Rollout> {
    Ok(Rollout {
        rollout_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        tenant_id: codec::parse_uuid(&row.get::<_, String>(1)?)?,
        bundle_id: codec::parse_uuid(&row.get::<_, String>(2)?)?,
        target_version: codec::parse_version(&row.get::<_, String>(3)?)?,
        previous_version: codec::opt_parse_version(row.get(4)?)?,
        name: row.get(5)?,
        description: row.get(6)?,
        failure_threshold: row.get(7)?,
        status: codec::parse_rollout_status(&row.get::<_, String>(8)?)?,
        current_phase_number: row.get(9)?,
        eligibility: codec::parse_eligibility(&row.get::<_, String>(10)?)?,
        target_group_id: codec::opt_parse_uuid(row.get(11)?)?,
        created_at: codec::ms_to_dt(row.get(12)?)?,
        started_at: codec::opt_ms_to_dt(row.get(13)?)?,
        completed_at: codec::opt_ms_to_dt(row.get(14)?)?,
        created_by: row.get(15)?,
    })
}

fn row_to_phase(row: &rusqlite::Row<'_>) -> rusqlite::Result<RolloutPhase> {
    let kind: String = row.get(4)?;
    let value: f64 = row.get(5)?;
    Ok(RolloutPhase {
        phase_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        rollout_id: codec::parse_uuid(&row.get::<_, String>(1)?)?,
        phase_number: row.get(2)?,
        name: row.get(3)?,
        target: codec::parse_phase_target(&kind, value)?,
        status: codec::parse_phase_status(&row.get::<_, String>(6)?)?,
        started_at: codec::opt_ms_to_dt(row.get(7)?)?,
        completed_at: codec::opt_ms_to_dt(row.get(8)?)?,
        success_count: row.get(9)?,
        failure_count: row.get(10)?,
        min_healthy_duration_secs: row.get::<_, Option<i64>>(11)?.map(|n| n as u64),
        healthy_since: codec::opt_ms_to_dt(row.get(12)?)?,
    })
}

fn row_to_assignment(row: &rusqlite::Row<'_>) -> rusqlite::Result<RolloutDeviceAssignment> {
    Ok(RolloutDeviceAssignment {
        assignment_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        rollout_id: codec::parse_uuid(&row.get::<_, String>(1)?)?,
        phase_id: codec::parse_uuid(&row.get::<_, String>(2)?)?,
        device_id: codec::parse_uuid(&row.get::<_, String>(3)?)?,
        status: codec::parse_assignment_status(&row.get::<_, String>(4)?)?,
        assigned_at: codec::opt_ms_to_dt(row.get(5)?)?,
        reconciled_at: codec::opt_ms_to_dt(row.get(6)?)?,
        error_message: row.get(7)?,
        retry_count: row.get(8)?,
    })
}
