//! Alert and notification queries.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use sbe_common::alert::{Alert, AlertStatus, AlertType, Notification};
use sbe_common::ids::{AlertId, DeviceId, RolloutId, TenantId};

use crate::codec;

pub fn insert(conn: &Connection, alert: &Alert) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO alerts
             (alert_id, tenant_id, severity, alert_type, status, title, description,
              device_id, rollout_id, created_at_ms, acknowledged_at_ms, acknowledged_by,
              resolved_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            alert.alert_id.to_string(),
            alert.tenant_id.to_string(),
            codec::alert_severity_str(alert.severity),
            codec::alert_type_str(alert.alert_type),
            codec::alert_status_str(alert.status),
            alert.title,
            alert.description,
            alert.device_id.map(|d| d.to_string()),
            alert.rollout_id.map(|r| r.to_string()),
            codec::dt_to_ms(alert.created_at),
            alert.acknowledged_at.map(codec::dt_to_ms),
            alert.acknowledged_by,
            alert.resolved_at.map(codec::dt_to_ms),
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, alert_id: AlertId) -> rusqlite::Result<Option<Alert>> {
    conn.query_row(
        &format!("{SELECT_COLS} FROM alerts WHERE alert_id = ?1"),
        params![alert_id.to_string()],
        row_to_alert,
    )
    .optional()
}

pub fn list_in_tenant(
    conn: &Connection,
    tenant_id: TenantId,
    status: Option<AlertStatus>,
) -> rusqlite::Result<Vec<Alert>> {
    match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLS} FROM alerts WHERE tenant_id = ?1 AND status = ?2
                 ORDER BY created_at_ms DESC, alert_id"
            ))?;
            let rows = stmt.query_map(
                params![tenant_id.to_string(), codec::alert_status_str(status)],
                row_to_alert,
            )?;
            rows.collect()
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLS} FROM alerts WHERE tenant_id = ?1
                 ORDER BY created_at_ms DESC, alert_id"
            ))?;
            let rows = stmt.query_map(params![tenant_id.to_string()], row_to_alert)?;
            rows.collect()
        }
    }
}

/// Every Active alert, for the auto-resolution pass.
pub fn list_active(conn: &Connection) -> rusqlite::Result<Vec<Alert>> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT_COLS} FROM alerts WHERE status = 'active' ORDER BY created_at_ms, alert_id"
    ))?;
    let rows = stmt.query_map([], row_to_alert)?;
    rows.collect()
}

/// The dedup probe: is there already an Active alert for this (device, type)?
pub fn active_exists_for_device(
    conn: &Connection,
    device_id: DeviceId,
    alert_type: AlertType,
) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM alerts
             WHERE device_id = ?1 AND alert_type = ?2 AND status = 'active' LIMIT 1",
            params![device_id.to_string(), codec::alert_type_str(alert_type)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn active_exists_for_rollout(
    conn: &Connection,
    rollout_id: RolloutId,
    alert_type: AlertType,
) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM alerts
             WHERE rollout_id = ?1 AND alert_type = ?2 AND status = 'active' LIMIT 1",
            params![rollout_id.to_string(), codec::alert_type_str(alert_type)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Acknowledge an Active alert. Idempotent-terminal: re-acknowledging keeps
/// the first acknowledgement.
pub fn acknowledge(
    conn: &Connection,
    alert_id: AlertId,
    by: &str,
    at: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE alerts SET status = 'acknowledged', acknowledged_by = ?2, acknowledged_at_ms = ?3
         WHERE alert_id = ?1 AND status = 'active'",
        params![alert_id.to_string(), by, codec::dt_to_ms(at)],
    )?;
    Ok(n > 0)
}

/// Resolve an alert unless already resolved. Idempotent-terminal.
pub fn resolve(conn: &Connection, alert_id: AlertId, at: DateTime<Utc>) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE alerts SET status = 'resolved', resolved_at_ms = ?2
         WHERE alert_id = ?1 AND status != 'resolved'",
        params![alert_id.to_string(), codec::dt_to_ms(at)],
    )?;
    Ok(n > 0)
}

pub fn insert_notification(conn: &Connection, notification: &Notification) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO notifications (id, tenant_id, alert_id, subject, body, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            notification.id.to_string(),
            notification.tenant_id.to_string(),
            notification.alert_id.to_string(),
            notification.subject,
            notification.body,
            codec::dt_to_ms(notification.created_at),
        ],
    )?;
    Ok(())
}

const SELECT_COLS: &str = "SELECT alert_id, tenant_id, severity, alert_type, status, title, \
     description, device_id, rollout_id, created_at_ms, acknowledged_at_ms, acknowledged_by, \
     resolved_at_ms";

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alert> {
    Ok(Alert {
        alert_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        tenant_id: codec::parse_uuid(&row.get::<_, String>(1)?)?,
        severity: codec::parse_alert_severity(&row.get::<_, String>(2)?)?,
        alert_type: codec::parse_alert_type(&row.get::<_, String>(3)?)?,
        status: codec::parse_alert_status(&row.get::<_, String>(4)?)?,
        title: row.get(5)?,
        description: row.get(6)?,
        device_id: codec::opt_parse_uuid(row.get(7)?)?,
        rollout_id: codec::opt_parse_uuid(row.get(8)?)?,
        created_at: codec::ms_to_dt(row.get(9)?)?,
        acknowledged_at: codec::opt_ms_to_dt(row.get(10)?)?,
        acknowledged_by: row.get(11)?,
        resolved_at: codec::opt_ms_to_dt(row.get(12)?)?,
    })
}
