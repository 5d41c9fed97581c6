//! Desired-state and reported-status queries.

#[cfg(test)]
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use sbe_common::bundle::{DesiredState, ReportState, ReportedStatus};
use sbe_common::ids::{BundleId, DeviceId};

use crate::codec;

pub fn upsert_desired(conn: &Connection, state: &DesiredState) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO desired_states
             (device_id, bundle_id, version, assigned_at_ms, assigned_by, reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (device_id) DO UPDATE SET
             bundle_id = excluded.bundle_id,
             version = excluded.version,
             assigned_at_ms = excluded.assigned_at_ms,
             assigned_by = excluded.assigned_by,
             reason = excluded.reason",
        params![
            state.device_id.to_string(),
            state.bundle_id.to_string(),
            state.version.to_string(),
            codec::dt_to_ms(state.assigned_at),
            state.assigned_by,
            state.reason,
        ],
    )?;
    Ok(())
}

pub fn get_desired(conn: &Connection, device_id: DeviceId) -> rusqlite::Result<Option<DesiredState>> {
    conn.query_row(
        "SELECT device_id, bundle_id, version, assigned_at_ms, assigned_by, reason
         FROM desired_states WHERE device_id = ?1",
        params![device_id.to_string()],
        row_to_desired,
    )
    .optional()
}

/// Remove the assignment; the device then has no bundle assigned.
pub fn delete_desired(conn: &Connection, device_id: DeviceId) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "DELETE FROM desired_states WHERE device_id = ?1",
        params![device_id.to_string()],
    )?;
    Ok(n > 0)
}

/// Devices whose current desired bundle is `bundle_id` (rollout candidates).
pub fn devices_with_desired_bundle(
    conn: &Connection,
    bundle_id: BundleId,
) -> rusqlite::Result<Vec<DeviceId>> {
    let mut stmt = conn.prepare(
        "SELECT device_id FROM desired_states WHERE bundle_id = ?1 ORDER BY device_id",
    )?;
    let rows = stmt.query_map(params![bundle_id.to_string()], |row| row.get::<_, String>(0))?;
    rows.map(|r| r.and_then(|s| codec::parse_uuid(&s))).collect()
}

/// Insert or fully replace the ledger row for the report's
/// `(device, bundle, version)` tuple. Transition legality is the service
/// layer's concern; the store keyes the upsert only.
pub fn put_reported(conn: &Connection, report: &ReportedStatus) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO reported_statuses
             (device_id, bundle_id, version, rollout_id, state, started_at_ms,
              completed_at_ms, error_message, retry_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT (device_id, bundle_id, version) DO UPDATE SET
             rollout_id = excluded.rollout_id,
             state = excluded.state,
             started_at_ms = excluded.started_at_ms,
             completed_at_ms = excluded.completed_at_ms,
             error_message = excluded.error_message,
             retry_count = excluded.retry_count",
        params![
            report.device_id.to_string(),
            report.bundle_id.to_string(),
            report.version.to_string(),
            report.rollout_id.map(|r| r.to_string()),
            codec::report_state_str(report.state),
            codec::dt_to_ms(report.started_at),
            report.completed_at.map(codec::dt_to_ms),
            report.error_message,
            report.retry_count,
        ],
    )?;
    Ok(())
}

pub fn get_reported(
    conn: &Connection,
    device_id: DeviceId,
    bundle_id: BundleId,
    version: &semver::Version,
) -> rusqlite::Result<Option<ReportedStatus>> {
    conn.query_row(
        "SELECT device_id, bundle_id, version, rollout_id, state, started_at_ms,
                completed_at_ms, error_message, retry_count
         FROM reported_statuses
         WHERE device_id = ?1 AND bundle_id = ?2 AND version = ?3",
        params![device_id.to_string(), bundle_id.to_string(), version.to_string()],
        row_to_reported,
    )
    .optional()
}

/// Terminal outcomes for a device, most recent first, bounded by `limit`.
/// Feeds the reconciliation component of the health score.
pub fn recent_terminal_states(
    conn: &Connection,
    device_id: DeviceId,
    limit: usize,
) -> rusqlite::Result<Vec<ReportState>> {
    let mut stmt = conn.prepare(
        "SELECT state FROM reported_statuses
         WHERE device_id = ?1 AND state IN ('completed', 'failed', 'rolled_back')
         ORDER BY COALESCE(completed_at_ms, started_at_ms) DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![device_id.to_string(), limit as i64], |row| {
        row.get::<_, String>(0)
    })?;
    rows.map(|r| r.and_then(|s| codec::parse_report_state(&s))).collect()
}

fn row_to_desired(row: &rusqlite::Row<'_>) -> rusqlite::Result<DesiredState> {
    Ok(DesiredState {
        device_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        bundle_id: codec::parse_uuid(&row.get::<_, String>(1)?)?,
        version: codec::parse_version(&row.get::<_, String>(2)?)?,
        assigned_at: codec::ms_to_dt(row.get(3)?)?,
        assigned_by: row.get(4)?,
        reason: row.get(5)?,
    })
}

fn row_to_reported(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReportedStatus> {
    Ok(ReportedStatus {
        device_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        bundle_id: codec::parse_uuid(&row.get::<_, String>(1)?)?,
        version: codec::parse_version(&row.get::<_, String>(2)?)?,
        rollout_id: codec::opt_parse_uuid(row.get(3)?)?,
        state: codec::parse_report_state(&row.get::<_, String>(4)?)?,
        started_at: codec::ms_to_dt(row.get(5)?)?,
        completed_at: codec::opt_ms_to_dt(row.get(6)?)?,
        error_message: row.get(7)?,
        retry_count: row.get(8)?,
    })
}
