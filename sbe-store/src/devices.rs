//! Device registry queries.
//!
//! Tag filters are evaluated in memory against the loaded tag sets; user
//! input never reaches the SQL text.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use sbe_common::ids::{DeviceId, GroupId, TenantId};
use sbe_common::tags::TagAtom;
use sbe_common::types::{Device, OnlineStatus, RegistrationStatus};

use crate::codec;

pub fn insert(conn: &Connection, device: &Device) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO devices (device_id, tenant_id, name, metadata, registration_status,
                              online_status, last_seen_at_ms, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            device.device_id.to_string(),
            device.tenant_id.to_string(),
            device.name,
            device.metadata,
            codec::registration_status_str(device.registration_status),
            codec::online_status_str(device.online_status),
            device.last_seen_at.map(codec::dt_to_ms),
            codec::dt_to_ms(device.created_at),
        ],
    )?;
    for tag in &device.tags {
        conn.execute(
            "INSERT OR IGNORE INTO device_tags (device_id, tag) VALUES (?1, ?2)",
            params![device.device_id.to_string(), tag.to_string()],
        )?;
    }
    Ok(())
}

pub fn get(conn: &Connection, device_id: DeviceId) -> rusqlite::Result<Option<Device>> {
    let base = conn
        .query_row(
            "SELECT device_id, tenant_id, name, metadata, registration_status,
                    online_status, last_seen_at_ms, created_at_ms
             FROM devices WHERE device_id = ?1",
            params![device_id.to_string()],
            row_to_device,
        )
        .optional()?;
    match base {
        Some(mut device) => {
            device.tags = load_tags(conn, device_id)?;
            device.group_ids = load_group_ids(conn, device_id)?;
            Ok(Some(device))
        }
        None => Ok(None),
    }
}

/// Fetch a device scoped to one tenant. Cross-tenant lookups read as absent.
pub fn get_in_tenant(
    conn: &Connection,
    tenant_id: TenantId,
    device_id: DeviceId,
) -> rusqlite::Result<Option<Device>> {
    Ok(get(conn, device_id)?.filter(|d| d.tenant_id == tenant_id))
}

pub fn update_name_metadata(
    conn: &Connection,
    device_id: DeviceId,
    name: &str,
    metadata: Option<&str>,
) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE devices SET name = ?2, metadata = ?3 WHERE device_id = ?1",
        params![device_id.to_string(), name, metadata],
    )?;
    Ok(n > 0)
}

pub fn set_registration_status(
    conn: &Connection,
    device_id: DeviceId,
    status: RegistrationStatus,
) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE devices SET registration_status = ?2 WHERE device_id = ?1",
        params![device_id.to_string(), codec::registration_status_str(status)],
    )?;
    Ok(n > 0)
}

pub fn set_online_status(
    conn: &Connection,
    device_id: DeviceId,
    status: OnlineStatus,
) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE devices SET online_status = ?2 WHERE device_id = ?1",
        params![device_id.to_string(), codec::online_status_str(status)],
    )?;
    Ok(n > 0)
}

/// Advance `last_seen_at` to `at` if newer (never backwards) and return the
/// stored online status at the time of the call.
pub fn touch_last_seen(
    conn: &Connection,
    device_id: DeviceId,
    at: DateTime<Utc>,
) -> rusqlite::Result<Option<OnlineStatus>> {
    let status = conn
        .query_row(
            "SELECT online_status FROM devices WHERE device_id = ?1",
            params![device_id.to_string()],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    let Some(status) = status else { return Ok(None) };
    conn.execute(
        "UPDATE devices
         SET last_seen_at_ms = MAX(COALESCE(last_seen_at_ms, 0), ?2)
         WHERE device_id = ?1",
        params![device_id.to_string(), codec::dt_to_ms(at)],
    )?;
    Ok(Some(codec::parse_online_status(&status)?))
}

pub fn delete(conn: &Connection, device_id: DeviceId) -> rusqlite::Result<bool> {
    let id = device_id.to_string();
    conn.execute("DELETE FROM device_tags WHERE device_id = ?1", params![id])?;
    conn.execute("DELETE FROM device_group_members WHERE device_id = ?1", params![id])?;
    let n = conn.execute("DELETE FROM devices WHERE device_id = ?1", params![id])?;
    Ok(n > 0)
}

pub fn count_in_tenant(conn: &Connection, tenant_id: TenantId) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM devices WHERE tenant_id = ?1",
        params![tenant_id.to_string()],
        |row| row.get(0),
    )
}

/// All devices of a tenant, tags and groups loaded, ordered by creation.
pub fn list_in_tenant(conn: &Connection, tenant_id: TenantId) -> rusqlite::Result<Vec<Device>> {
    let mut stmt = conn.prepare(
        "SELECT device_id, tenant_id, name, metadata, registration_status,
                online_status, last_seen_at_ms, created_at_ms
         FROM devices WHERE tenant_id = ?1 ORDER BY created_at_ms, device_id",
    )?;
    let mut devices: Vec<Device> =
        stmt.query_map(params![tenant_id.to_string()], row_to_device)?.collect::<Result<_, _>>()?;
    for device in &mut devices {
        device.tags = load_tags(conn, device.device_id)?;
        device.group_ids = load_group_ids(conn, device.device_id)?;
    }
    Ok(devices)
}

/// Every device across tenants, without tags or groups loaded. Used by the
/// fleet-wide periodic ticks.
pub fn list_all_bare(conn: &Connection) -> rusqlite::Result<Vec<Device>> {
    let mut stmt = conn.prepare(
        "SELECT device_id, tenant_id, name, metadata, registration_status,
                online_status, last_seen_at_ms, created_at_ms
         FROM devices ORDER BY device_id",
    )?;
    let rows = stmt.query_map([], row_to_device)?;
    rows.collect()
}

/// Devices currently marked Online whose `last_seen_at` is older than the
/// cutoff. Feeds the offline-detector tick.
pub fn online_last_seen_before(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> rusqlite::Result<Vec<DeviceId>> {
    let mut stmt = conn.prepare(
        "SELECT device_id FROM devices
         WHERE online_status = 'online'
           AND (last_seen_at_ms IS NULL OR last_seen_at_ms < ?1)",
    )?;
    let rows = stmt.query_map(params![codec::dt_to_ms(cutoff)], |row| {
        row.get::<_, String>(0)
    })?;
    rows.map(|r| r.and_then(|s| codec::parse_uuid(&s))).collect()
}

pub fn add_tag(conn: &Connection, device_id: DeviceId, tag: &TagAtom) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO device_tags (device_id, tag) VALUES (?1, ?2)",
        params![device_id.to_string(), tag.to_string()],
    )?;
    Ok(())
}

pub fn remove_tag(conn: &Connection, device_id: DeviceId, tag: &TagAtom) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "DELETE FROM device_tags WHERE device_id = ?1 AND tag = ?2",
        params![device_id.to_string(), tag.to_string()],
    )?;
    Ok(n > 0)
}

pub fn load_tags(conn: &Connection, device_id: DeviceId) -> rusqlite::Result<BTreeSet<TagAtom>> {
    let mut stmt =
        conn.prepare("SELECT tag FROM device_tags WHERE device_id = ?1 ORDER BY tag")?;
    let rows = stmt.query_map(params![device_id.to_string()], |row| row.get::<_, String>(0))?;
    rows.map(|r| {
        r.and_then(|raw| {
            TagAtom::parse(&raw).map_err(|e| codec::corrupt(format!("stored tag: {e}")))
        })
    })
    .collect()
}

fn load_group_ids(conn: &Connection, device_id: DeviceId) -> rusqlite::Result<Vec<GroupId>> {
    let mut stmt = conn.prepare(
        "SELECT group_id FROM device_group_members WHERE device_id = ?1 ORDER BY group_id",
    )?;
    let rows = stmt.query_map(params![device_id.to_string()], |row| row.get::<_, String>(0))?;
    rows.map(|r| r.and_then(|s| codec::parse_uuid(&s))).collect()
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        device_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        tenant_id: codec::parse_uuid(&row.get::<_, String>(1)?)?,
        name: row.get(2)?,
        metadata: row.get(3)?,
        registration_status: codec::parse_registration_status(&row.get::<_, String>(4)?)?,
        online_status: codec::parse_online_status(&row.get::<_, String>(5)?)?,
        last_seen_at: codec::opt_ms_to_dt(row.get(6)?)?,
        group_ids: Vec::new(),
        tags: BTreeSet::new(),
        created_at: codec::ms_to_dt(row.get(7)?)?,
    })
}
