//! Tenant queries.

use rusqlite::{Connection, OptionalExtension, params};

use sbe_common::ids::TenantId;
use sbe_common::types::Tenant;

use crate::codec;

pub fn upsert(conn: &Connection, tenant: &Tenant) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO tenants (tenant_id, name, max_devices, data_retention_days, tier)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (tenant_id) DO UPDATE SET
             name = excluded.name,
             max_devices = excluded.max_devices,
             data_retention_days = excluded.data_retention_days,
             tier = excluded.tier",
        params![
            tenant.tenant_id.to_string(),
            tenant.name,
            tenant.max_devices,
            tenant.data_retention_days,
            codec::tenant_tier_str(tenant.tier),
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, tenant_id: TenantId) -> rusqlite::Result<Option<Tenant>> {
    conn.query_row(
        "SELECT tenant_id, name, max_devices, data_retention_days, tier
         FROM tenants WHERE tenant_id = ?1",
        params![tenant_id.to_string()],
        row_to_tenant,
    )
    .optional()
}

pub fn list(conn: &Connection) -> rusqlite::Result<Vec<Tenant>> {
    let mut stmt = conn.prepare(
        "SELECT tenant_id, name, max_devices, data_retention_days, tier FROM tenants",
    )?;
    let rows = stmt.query_map([], row_to_tenant)?;
    rows.collect()
}

fn row_to_tenant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        tenant_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        name: row.get(1)?,
        max_devices: row.get(2)?,
        data_retention_days: row.get(3)?,
        tier: codec::parse_tenant_tier(&row.get::<_, String>(4)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use sbe_common::types::TenantTier;

    fn tenant() -> Tenant {
        Tenant {
            tenant_id: TenantId::generate(),
            name: "acme".into(),
            max_devices: 25,
            data_retention_days: 30,
            tier: TenantTier::Paid,
        }
    }

    #[test]
    fn upsert_and_get() {
        let store = Store::open_in_memory().unwrap();
        let t = tenant();
        store.with_conn(|c| upsert(c, &t)).unwrap();
        let loaded = store.with_conn(|c| get(c, t.tenant_id)).unwrap().unwrap();
        assert_eq!(loaded, t);

        let updated = Tenant { max_devices: 50, ..t.clone() };
        store.with_conn(|c| upsert(c, &updated)).unwrap();
        let loaded = store.with_conn(|c| get(c, t.tenant_id)).unwrap().unwrap();
        assert_eq!(loaded.max_devices, 50);
    }

    #[test]
    fn get_missing_returns_none() {
        let store = Store::open_in_memory().unwrap();
        let missing = store.with_conn(|c| get(c, TenantId::generate())).unwrap();
        assert!(missing.is_none());
    }
}
