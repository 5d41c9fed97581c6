//! Bundle and bundle-version queries.

use rusqlite::{Connection, OptionalExtension, params};

use sbe_common::bundle::{Bundle, BundleVersion, ContainerSpec};
use sbe_common::ids::{BundleId, TenantId};

use crate::codec;

pub fn insert(conn: &Connection, bundle: &Bundle) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO bundles (bundle_id, tenant_id, name, latest_version, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            bundle.bundle_id.to_string(),
            bundle.tenant_id.to_string(),
            bundle.name,
            bundle.latest_version.as_ref().map(|v| v.to_string()),
            codec::dt_to_ms(bundle.created_at),
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, bundle_id: BundleId) -> rusqlite::Result<Option<Bundle>> {
    conn.query_row(
        "SELECT bundle_id, tenant_id, name, latest_version, created_at_ms
         FROM bundles WHERE bundle_id = ?1",
        params![bundle_id.to_string()],
        row_to_bundle,
    )
    .optional()
}

pub fn get_in_tenant(
    conn: &Connection,
    tenant_id: TenantId,
    bundle_id: BundleId,
) -> rusqlite::Result<Option<Bundle>> {
    Ok(get(conn, bundle_id)?.filter(|b| b.tenant_id == tenant_id))
}

pub fn list_in_tenant(conn: &Connection, tenant_id: TenantId) -> rusqlite::Result<Vec<Bundle>> {
    let mut stmt = conn.prepare(
        "SELECT bundle_id, tenant_id, name, latest_version, created_at_ms
         FROM bundles WHERE tenant_id = ?1 ORDER BY created_at_ms, bundle_id",
    )?;
    let rows = stmt.query_map(params![tenant_id.to_string()], row_to_bundle)?;
    rows.collect()
}

pub fn set_latest_version(
    conn: &Connection,
    bundle_id: BundleId,
    version: &semver::Version,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE bundles SET latest_version = ?2 WHERE bundle_id = ?1",
        params![bundle_id.to_string(), version.to_string()],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, bundle_id: BundleId) -> rusqlite::Result<bool> {
    conn.execute(
        "DELETE FROM bundle_versions WHERE bundle_id = ?1",
        params![bundle_id.to_string()],
    )?;
    let n = conn.execute("DELETE FROM bundles WHERE bundle_id = ?1", params![bundle_id.to_string()])?;
    Ok(n > 0)
}

pub fn insert_version(conn: &Connection, version: &BundleVersion) -> rusqlite::Result<()> {
    let containers = serde_json::to_string(&version.containers)
        .map_err(|e| codec::corrupt(format!("container specs: {e}")))?;
    conn.execute(
        "INSERT INTO bundle_versions
             (bundle_id, version, containers, created_at_ms, release_notes,
              blob_uri, checksum, size_bytes, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            version.bundle_id.to_string(),
            version.version.to_string(),
            containers,
            codec::dt_to_ms(version.created_at),
            version.release_notes,
            version.blob_uri,
            version.checksum,
            version.size_bytes.map(|n| n as i64),
            codec::bundle_version_status_str(version.status),
        ],
    )?;
    Ok(())
}

pub fn get_version(
    conn: &Connection,
    bundle_id: BundleId,
    version: &semver::Version,
) -> rusqlite::Result<Option<BundleVersion>> {
    conn.query_row(
        "SELECT bundle_id, version, containers, created_at_ms, release_notes,
                blob_uri, checksum, size_bytes, status
         FROM bundle_versions WHERE bundle_id = ?1 AND version = ?2",
        params![bundle_id.to_string(), version.to_string()],
        row_to_version,
    )
    .optional()
}

pub fn list_versions(conn: &Connection, bundle_id: BundleId) -> rusqlite::Result<Vec<BundleVersion>> {
    let mut stmt = conn.prepare(
        "SELECT bundle_id, version, containers, created_at_ms, release_notes,
                blob_uri, checksum, size_bytes, status
         FROM bundle_versions WHERE bundle_id = ?1",
    )?;
    let rows = stmt.query_map(params![bundle_id.to_string()], row_to_version)?;
    let mut versions: Vec<BundleVersion> = rows.collect::<Result<_, _>>()?;
    // Semver order, not lexicographic.
    versions.sort_by(|a, b| a.version.cmp(&b.version));
    Ok(versions)
}

fn row_to_bundle(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bundle> {
    Ok(Bundle {
        bundle_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        tenant_id: codec::parse_uuid(&row.get::<_, String>(1)?)?,
        name: row.get(2)?,
        latest_version: codec::opt_parse_version(row.get(3)?)?,
        created_at: codec::ms_to_dt(row.get(4)?)?,
    })
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<BundleVersion> {
    let containers_raw: String = row.get(2)?;
    let containers: Vec<ContainerSpec> = serde_json::from_str(&containers_raw)
        .map_err(|e| codec::corrupt(format!("container specs: {e}")))?;
    Ok(BundleVersion {
        bundle_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        version: codec::parse_version(&row.get::<_, String>(1)?)?,
        containers,
        created_at: codec::ms_to_dt(row.get(3)?)?,
        release_notes: row.get(4)?,
        blob_uri: row.get(5)?,
        checksum: row.get(6)?,
        size_bytes: row.get::<_, Option<i64>>(7)?.map(|n| n as u64),
        status: codec::parse_bundle_version_status(&row.get::<_, String>(8)?)?,
    })
}
