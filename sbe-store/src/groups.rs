//! Device-group queries: static membership and dynamic-group bookkeeping.

use rusqlite::{Connection, OptionalExtension, params};

use sbe_common::ids::{DeviceId, GroupId, TenantId};
use sbe_common::types::DeviceGroup;

use crate::codec;

pub fn insert(conn: &Connection, group: &DeviceGroup) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO device_groups (group_id, tenant_id, name, group_type, tag_query, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            group.group_id.to_string(),
            group.tenant_id.to_string(),
            group.name,
            codec::group_type_str(group.group_type),
            group.tag_query,
            codec::dt_to_ms(group.created_at),
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, group_id: GroupId) -> rusqlite::Result<Option<DeviceGroup>> {
    conn.query_row(
        "SELECT group_id, tenant_id, name, group_type, tag_query, created_at_ms
         FROM device_groups WHERE group_id = ?1",
        params![group_id.to_string()],
        row_to_group,
    )
    .optional()
}

pub fn list_in_tenant(conn: &Connection, tenant_id: TenantId) -> rusqlite::Result<Vec<DeviceGroup>> {
    let mut stmt = conn.prepare(
        "SELECT group_id, tenant_id, name, group_type, tag_query, created_at_ms
         FROM device_groups WHERE tenant_id = ?1 ORDER BY created_at_ms, group_id",
    )?;
    let rows = stmt.query_map(params![tenant_id.to_string()], row_to_group)?;
    rows.collect()
}

/// All dynamic groups across tenants, for the periodic sync tick.
pub fn list_dynamic(conn: &Connection) -> rusqlite::Result<Vec<DeviceGroup>> {
    let mut stmt = conn.prepare(
        "SELECT group_id, tenant_id, name, group_type, tag_query, created_at_ms
         FROM device_groups WHERE group_type = 'dynamic' ORDER BY group_id",
    )?;
    let rows = stmt.query_map([], row_to_group)?;
    rows.collect()
}

pub fn delete(conn: &Connection, group_id: GroupId) -> rusqlite::Result<bool> {
    conn.execute(
        "DELETE FROM device_group_members WHERE group_id = ?1",
        params![group_id.to_string()],
    )?;
    let n = conn.execute(
        "DELETE FROM device_groups WHERE group_id = ?1",
        params![group_id.to_string()],
    )?;
    Ok(n > 0)
}

pub fn members(conn: &Connection, group_id: GroupId) -> rusqlite::Result<Vec<DeviceId>> {
    let mut stmt = conn.prepare(
        "SELECT device_id FROM device_group_members WHERE group_id = ?1 ORDER BY device_id",
    )?;
    let rows = stmt.query_map(params![group_id.to_string()], |row| row.get::<_, String>(0))?;
    rows.map(|r| r.and_then(|s| codec::parse_uuid(&s))).collect()
}

pub fn add_member(conn: &Connection, group_id: GroupId, device_id: DeviceId) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO device_group_members (group_id, device_id) VALUES (?1, ?2)",
        params![group_id.to_string(), device_id.to_string()],
    )?;
    Ok(())
}

pub fn remove_member(
    conn: &Connection,
    group_id: GroupId,
    device_id: DeviceId,
) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "DELETE FROM device_group_members WHERE group_id = ?1 AND device_id = ?2",
        params![group_id.to_string(), device_id.to_string()],
    )?;
    Ok(n > 0)
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceGroup> {
    Ok(DeviceGroup {
        group_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        tenant_id: codec::parse_uuid(&row.get::<_, String>(1)?)?,
        name: row.get(2)?,
        group_type: codec::parse_group_type(&row.get::<_, String>(3)?)?,
        tag_query: row.get(4)?,
        created_at: codec::ms_to_dt(row.get(5)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use chrono::{TimeZone, Utc};
    use sbe_common::types::GroupType;

    fn group(tenant_id: TenantId, group_type: GroupType) -> DeviceGroup {
        DeviceGroup {
            group_id: GroupId::generate(),
            tenant_id,
            name: "edge-fleet".into(),
            group_type,
            tag_query: match group_type {
                GroupType::Dynamic => Some("env=production".into()),
                GroupType::Static => None,
            },
            created_at: Utc.timestamp_opt(1_000, 0).unwrap(),
        }
    }

    #[test]
    fn insert_get_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let g = group(TenantId::generate(), GroupType::Dynamic);
        store.with_conn(|c| insert(c, &g)).unwrap();
        let loaded = store.with_conn(|c| get(c, g.group_id)).unwrap().unwrap();
        assert_eq!(loaded, g);
    }

    #[test]
    fn membership_add_remove() {
        let store = Store::open_in_memory().unwrap();
        let g = group(TenantId::generate(), GroupType::Static);
        let d = DeviceId::generate();
        store.with_conn(|c| insert(c, &g)).unwrap();
        store.with_conn(|c| add_member(c, g.group_id, d)).unwrap();
        store.with_conn(|c| add_member(c, g.group_id, d)).unwrap();
        assert_eq!(store.with_conn(|c| members(c, g.group_id)).unwrap(), vec![d]);
        assert!(store.with_conn(|c| remove_member(c, g.group_id, d)).unwrap());
        assert!(!store.with_conn(|c| remove_member(c, g.group_id, d)).unwrap());
    }

    #[test]
    fn list_dynamic_filters_static_groups() {
        let store = Store::open_in_memory().unwrap();
        let tenant = TenantId::generate();
        let dynamic = group(tenant, GroupType::Dynamic);
        let fixed = group(tenant, GroupType::Static);
        store
            .with_tx(|tx| {
                insert(tx, &dynamic)?;
                insert(tx, &fixed)
            })
            .unwrap();
        let found = store.with_conn(list_dynamic).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].group_id, dynamic.group_id);
    }

    #[test]
    fn delete_clears_membership() {
        let store = Store::open_in_memory().unwrap();
        let g = group(TenantId::generate(), GroupType::Static);
        let d = DeviceId::generate();
        store
            .with_tx(|tx| {
                insert(tx, &g)?;
                add_member(tx, g.group_id, d)
            })
            .unwrap();
        assert!(store.with_conn(|c| delete(c, g.group_id)).unwrap());
        assert!(store.with_conn(|c| members(c, g.group_id)).unwrap().is_empty());
    }
}
