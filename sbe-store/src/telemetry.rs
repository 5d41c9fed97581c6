//! Time-series queries: heartbeats, metrics, and health scores.
//!
//! All three tables are append-only; retention trims them in bounded
//! batches, oldest rows first.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use sbe_common::ids::{DeviceId, TenantId};
use sbe_common::types::{DeviceHealthScore, DeviceHeartbeat, DeviceMetrics};

use crate::codec;

pub fn insert_heartbeat(conn: &Connection, hb: &DeviceHeartbeat) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO heartbeats (device_id, at_ms, status, ip_address, extras)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            hb.device_id.to_string(),
            codec::dt_to_ms(hb.at),
            hb.status,
            hb.ip_address,
            hb.extras.as_ref().map(|v| v.to_string()),
        ],
    )?;
    Ok(())
}

pub fn latest_heartbeat(
    conn: &Connection,
    device_id: DeviceId,
) -> rusqlite::Result<Option<DeviceHeartbeat>> {
    conn.query_row(
        "SELECT device_id, at_ms, status, ip_address, extras
         FROM heartbeats WHERE device_id = ?1 ORDER BY at_ms DESC LIMIT 1",
        params![device_id.to_string()],
        row_to_heartbeat,
    )
    .optional()
}

/// Devices that posted at least one heartbeat at or after `since`.
pub fn device_ids_with_heartbeat_since(
    conn: &Connection,
    since: DateTime<Utc>,
) -> rusqlite::Result<Vec<DeviceId>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT device_id FROM heartbeats WHERE at_ms >= ?1 ORDER BY device_id",
    )?;
    let rows = stmt.query_map(params![codec::dt_to_ms(since)], |row| row.get::<_, String>(0))?;
    rows.map(|r| r.and_then(|s| codec::parse_uuid(&s))).collect()
}

/// Per-device `(total, error)` heartbeat counts in the window starting at
/// `since`. Feeds the high-error-rate alert rule.
pub fn heartbeat_counts_since(
    conn: &Connection,
    since: DateTime<Utc>,
) -> rusqlite::Result<Vec<(DeviceId, u64, u64)>> {
    let mut stmt = conn.prepare(
        "SELECT device_id,
                COUNT(*),
                SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END)
         FROM heartbeats WHERE at_ms >= ?1
         GROUP BY device_id ORDER BY device_id",
    )?;
    let rows = stmt.query_map(params![codec::dt_to_ms(since)], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
    })?;
    rows.map(|r| {
        r.and_then(|(id, total, errors)| {
            Ok((codec::parse_uuid(&id)?, total as u64, errors as u64))
        })
    })
    .collect()
}

pub fn insert_metrics(conn: &Connection, m: &DeviceMetrics) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO device_metrics
             (device_id, at_ms, cpu_percent, memory_percent, disk_percent,
              uptime_seconds, running_containers, extras)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            m.device_id.to_string(),
            codec::dt_to_ms(m.at),
            m.cpu_percent,
            m.memory_percent,
            m.disk_percent,
            m.uptime_seconds as i64,
            m.running_containers,
            m.extras.as_ref().map(|v| v.to_string()),
        ],
    )?;
    Ok(())
}

/// Latest metrics sample for a device at or after `not_before`.
pub fn latest_metrics_since(
    conn: &Connection,
    device_id: DeviceId,
    not_before: DateTime<Utc>,
) -> rusqlite::Result<Option<DeviceMetrics>> {
    conn.query_row(
        "SELECT device_id, at_ms, cpu_percent, memory_percent, disk_percent,
                uptime_seconds, running_containers, extras
         FROM device_metrics
         WHERE device_id = ?1 AND at_ms >= ?2
         ORDER BY at_ms DESC LIMIT 1",
        params![device_id.to_string(), codec::dt_to_ms(not_before)],
        row_to_metrics,
    )
    .optional()
}

pub fn insert_health_score(conn: &Connection, score: &DeviceHealthScore) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO health_scores
             (device_id, at_ms, total, heartbeat_score, reconciliation_score, resource_score)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            score.device_id.to_string(),
            codec::dt_to_ms(score.at),
            score.total,
            score.heartbeat_score,
            score.reconciliation_score,
            score.resource_score,
        ],
    )?;
    Ok(())
}

pub fn latest_health_score(
    conn: &Connection,
    device_id: DeviceId,
) -> rusqlite::Result<Option<DeviceHealthScore>> {
    conn.query_row(
        "SELECT device_id, at_ms, total, heartbeat_score, reconciliation_score, resource_score
         FROM health_scores WHERE device_id = ?1 ORDER BY at_ms DESC LIMIT 1",
        params![device_id.to_string()],
        row_to_score,
    )
    .optional()
}

/// Latest total score per device, one query for the whole fleet.
pub fn latest_totals(conn: &Connection) -> rusqlite::Result<HashMap<DeviceId, f64>> {
    let mut stmt = conn.prepare(
        "SELECT device_id, total FROM health_scores
         WHERE id IN (SELECT MAX(id) FROM health_scores GROUP BY device_id)",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;
    let mut totals = HashMap::new();
    for row in rows {
        let (id, total) = row?;
        totals.insert(codec::parse_uuid::<DeviceId>(&id)?, total);
    }
    Ok(totals)
}

/// Delete up to `batch` heartbeat rows older than `horizon` for one tenant's
/// devices, oldest first. Returns the number deleted.
pub fn delete_heartbeats_before(
    conn: &Connection,
    tenant_id: TenantId,
    horizon: DateTime<Utc>,
    batch: usize,
) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM heartbeats WHERE id IN (
             SELECT h.id FROM heartbeats h
             JOIN devices d ON d.device_id = h.device_id
             WHERE d.tenant_id = ?1 AND h.at_ms < ?2
             ORDER BY h.at_ms ASC LIMIT ?3)",
        params![tenant_id.to_string(), codec::dt_to_ms(horizon), batch as i64],
    )
}

/// Metric-row counterpart of [`delete_heartbeats_before`].
pub fn delete_metrics_before(
    conn: &Connection,
    tenant_id: TenantId,
    horizon: DateTime<Utc>,
    batch: usize,
) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM device_metrics WHERE id IN (
             SELECT m.id FROM device_metrics m
             JOIN devices d ON d.device_id = m.device_id
             WHERE d.tenant_id = ?1 AND m.at_ms < ?2
             ORDER BY m.at_ms ASC LIMIT ?3)",
        params![tenant_id.to_string(), codec::dt_to_ms(horizon), batch as i64],
    )
}

fn row_to_heartbeat(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceHeartbeat> {
    Ok(DeviceHeartbeat {
        device_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        at: codec::ms_to_dt(row.get(1)?)?,
        status: row.get(2)?,
        ip_address: row.get(3)?,
        extras: codec::parse_json(row.get(4)?)?,
    })
}

fn row_to_metrics(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceMetrics> {
    Ok(DeviceMetrics {
        device_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        at: codec::ms_to_dt(row.get(1)?)?,
        cpu_percent: row.get(2)?,
        memory_percent: row.get(3)?,
        disk_percent: row.get(4)?,
        uptime_seconds: row.get::<_, i64>(5)? as u64,
        running_containers: row.get::<_, i64>(6)? as u32,
        extras: codec::parse_json(row.get(7)?)?,
    })
}

fn row_to_score(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceHealthScore> {
    Ok(DeviceHealthScore {
        device_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        at: codec::ms_to_dt(row.get(1)?)?,
        total: row.get(2)?,
        heartbeat_score: row.get(3)?,
        reconciliation_score: row.get(4)?,
        resource_score: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices;
    use crate::store::Store;
    use chrono::TimeZone;
    use sbe_common::types::{Device, OnlineStatus, RegistrationStatus};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn hb(device_id: DeviceId, secs: i64, status: &str) -> DeviceHeartbeat {
        DeviceHeartbeat {
            device_id,
            at: at(secs),
            status: Some(status.into()),
            ip_address: None,
            extras: None,
        }
    }

    fn device(tenant_id: TenantId) -> Device {
        Device {
            device_id: DeviceId::generate(),
            tenant_id,
            name: "n".into(),
            metadata: None,
            registration_status: RegistrationStatus::Approved,
            online_status: OnlineStatus::Online,
            last_seen_at: None,
            group_ids: Vec::new(),
            tags: Default::default(),
            created_at: at(0),
        }
    }

    #[test]
    fn heartbeat_round_trip_and_latest() {
        let store = Store::open_in_memory().unwrap();
        let d = DeviceId::generate();
        store
            .with_tx(|tx| {
                insert_heartbeat(tx, &hb(d, 10, "ok"))?;
                insert_heartbeat(tx, &hb(d, 20, "error"))
            })
            .unwrap();
        let latest = store.with_conn(|c| latest_heartbeat(c, d)).unwrap().unwrap();
        assert_eq!(latest.at, at(20));
        assert_eq!(latest.status.as_deref(), Some("error"));
    }

    #[test]
    fn heartbeat_window_counts() {
        let store = Store::open_in_memory().unwrap();
        let d = DeviceId::generate();
        store
            .with_tx(|tx| {
                insert_heartbeat(tx, &hb(d, 10, "ok"))?;
                insert_heartbeat(tx, &hb(d, 20, "error"))?;
                insert_heartbeat(tx, &hb(d, 30, "ok"))?;
                // Outside the window.
                insert_heartbeat(tx, &hb(d, 1, "error"))
            })
            .unwrap();
        let counts = store.with_conn(|c| heartbeat_counts_since(c, at(10))).unwrap();
        assert_eq!(counts, vec![(d, 3, 1)]);
    }

    #[test]
    fn devices_with_recent_heartbeats() {
        let store = Store::open_in_memory().unwrap();
        let fresh = DeviceId::generate();
        let stale = DeviceId::generate();
        store
            .with_tx(|tx| {
                insert_heartbeat(tx, &hb(fresh, 100, "ok"))?;
                insert_heartbeat(tx, &hb(stale, 5, "ok"))
            })
            .unwrap();
        let found = store.with_conn(|c| device_ids_with_heartbeat_since(c, at(50))).unwrap();
        assert_eq!(found, vec![fresh]);
    }

    #[test]
    fn metrics_latest_since_respects_cutoff() {
        let store = Store::open_in_memory().unwrap();
        let d = DeviceId::generate();
        let sample = DeviceMetrics {
            device_id: d,
            at: at(100),
            cpu_percent: 55.0,
            memory_percent: 70.0,
            disk_percent: 30.0,
            uptime_seconds: 86_400,
            running_containers: 4,
            extras: None,
        };
        store.with_conn(|c| insert_metrics(c, &sample)).unwrap();

        let found = store.with_conn(|c| latest_metrics_since(c, d, at(50))).unwrap();
        assert_eq!(found, Some(sample));
        let none = store.with_conn(|c| latest_metrics_since(c, d, at(150))).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn health_scores_latest_and_fleet_totals() {
        let store = Store::open_in_memory().unwrap();
        let a = DeviceId::generate();
        let b = DeviceId::generate();
        let score = |d, secs, total| DeviceHealthScore {
            device_id: d,
            at: at(secs),
            total,
            heartbeat_score: 40.0,
            reconciliation_score: 30.0,
            resource_score: total - 70.0,
        };
        store
            .with_tx(|tx| {
                insert_health_score(tx, &score(a, 10, 80.0))?;
                insert_health_score(tx, &score(a, 20, 95.0))?;
                insert_health_score(tx, &score(b, 15, 72.0))
            })
            .unwrap();

        let latest = store.with_conn(|c| latest_health_score(c, a)).unwrap().unwrap();
        assert_eq!(latest.total, 95.0);

        let totals = store.with_conn(latest_totals).unwrap();
        assert_eq!(totals.get(&a), Some(&95.0));
        assert_eq!(totals.get(&b), Some(&72.0));
    }

    #[test]
    fn retention_deletes_in_batches_per_tenant() {
        let store = Store::open_in_memory().unwrap();
        let tenant = TenantId::generate();
        let other_tenant = TenantId::generate();
        let mine = device(tenant);
        let theirs = device(other_tenant);
        store
            .with_tx(|tx| {
                devices::insert(tx, &mine)?;
                devices::insert(tx, &theirs)?;
                for i in 0..5 {
                    insert_heartbeat(tx, &hb(mine.device_id, i, "ok"))?;
                    insert_heartbeat(tx, &hb(theirs.device_id, i, "ok"))?;
                }
                Ok(())
            })
            .unwrap();

        // Two batches of 2, then 1: only my tenant's old rows go.
        let deleted = store
            .with_conn(|c| delete_heartbeats_before(c, tenant, at(10), 2))
            .unwrap();
        assert_eq!(deleted, 2);
        let deleted = store
            .with_conn(|c| delete_heartbeats_before(c, tenant, at(10), 100))
            .unwrap();
        assert_eq!(deleted, 3);

        let counts = store.with_conn(|c| heartbeat_counts_since(c, at(0))).unwrap();
        assert_eq!(counts, vec![(theirs.device_id, 5, 0)]);
    }
}
