//! Registration-token, API-key, and auth-audit queries.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use sbe_common::ids::{DeviceId, KeyId, TokenId};
use sbe_common::types::{AuthAttempt, DeviceApiKey, RegistrationToken};

use crate::codec;

pub fn insert_token(conn: &Connection, token: &RegistrationToken) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO registration_tokens
             (token_id, tenant_id, prefix, hash, expires_at_ms, is_used,
              used_by_device_id, used_at_ms, created_by, created_at_ms, description)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            token.token_id.to_string(),
            token.tenant_id.to_string(),
            token.prefix,
            token.hash,
            codec::dt_to_ms(token.expires_at),
            token.is_used,
            token.used_by_device_id.map(|d| d.to_string()),
            token.used_at.map(codec::dt_to_ms),
            token.created_by,
            codec::dt_to_ms(token.created_at),
            token.description,
        ],
    )?;
    Ok(())
}

/// Look up a token by its 8-character prefix.
///
/// Prefixes are random; a collision simply makes redemption fail the hash
/// check for one of the holders, so the first match is taken.
pub fn token_by_prefix(
    conn: &Connection,
    prefix: &str,
) -> rusqlite::Result<Option<RegistrationToken>> {
    conn.query_row(
        "SELECT token_id, tenant_id, prefix, hash, expires_at_ms, is_used,
                used_by_device_id, used_at_ms, created_by, created_at_ms, description
         FROM registration_tokens WHERE prefix = ?1
         ORDER BY created_at_ms DESC LIMIT 1",
        params![prefix],
        row_to_token,
    )
    .optional()
}

pub fn get_token(conn: &Connection, token_id: TokenId) -> rusqlite::Result<Option<RegistrationToken>> {
    conn.query_row(
        "SELECT token_id, tenant_id, prefix, hash, expires_at_ms, is_used,
                used_by_device_id, used_at_ms, created_by, created_at_ms, description
         FROM registration_tokens WHERE token_id = ?1",
        params![token_id.to_string()],
        row_to_token,
    )
    .optional()
}

/// Consume a token for a device. Guarded on `is_used = 0` so a concurrent
/// redeem of the same token loses.
pub fn mark_token_used(
    conn: &Connection,
    token_id: TokenId,
    device_id: DeviceId,
    at: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE registration_tokens
         SET is_used = 1, used_by_device_id = ?2, used_at_ms = ?3
         WHERE token_id = ?1 AND is_used = 0",
        params![token_id.to_string(), device_id.to_string(), codec::dt_to_ms(at)],
    )?;
    Ok(n > 0)
}

pub fn insert_api_key(conn: &Connection, key: &DeviceApiKey) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO device_api_keys
             (key_id, device_id, prefix, hash, expires_at_ms, revoked_at_ms,
              last_used_at_ms, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            key.key_id.to_string(),
            key.device_id.to_string(),
            key.prefix,
            key.hash,
            key.expires_at.map(codec::dt_to_ms),
            key.revoked_at.map(codec::dt_to_ms),
            key.last_used_at.map(codec::dt_to_ms),
            codec::dt_to_ms(key.created_at),
        ],
    )?;
    Ok(())
}

/// Candidate keys for a presented prefix that are not revoked and not
/// expired at `now`. Several can match if prefixes collide.
pub fn live_keys_by_prefix(
    conn: &Connection,
    prefix: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<Vec<DeviceApiKey>> {
    let mut stmt = conn.prepare(
        "SELECT key_id, device_id, prefix, hash, expires_at_ms, revoked_at_ms,
                last_used_at_ms, created_at_ms
         FROM device_api_keys
         WHERE prefix = ?1 AND revoked_at_ms IS NULL
           AND (expires_at_ms IS NULL OR expires_at_ms > ?2)
         ORDER BY created_at_ms DESC",
    )?;
    let rows = stmt.query_map(params![prefix, codec::dt_to_ms(now)], row_to_key)?;
    rows.collect()
}

/// Active (non-revoked) keys for a device, newest first.
pub fn active_keys_for_device(
    conn: &Connection,
    device_id: DeviceId,
) -> rusqlite::Result<Vec<DeviceApiKey>> {
    let mut stmt = conn.prepare(
        "SELECT key_id, device_id, prefix, hash, expires_at_ms, revoked_at_ms,
                last_used_at_ms, created_at_ms
         FROM device_api_keys
         WHERE device_id = ?1 AND revoked_at_ms IS NULL
         ORDER BY created_at_ms DESC",
    )?;
    let rows = stmt.query_map(params![device_id.to_string()], row_to_key)?;
    rows.collect()
}

/// Every non-revoked key, for the expiry sweeper.
pub fn all_unrevoked_keys(conn: &Connection) -> rusqlite::Result<Vec<DeviceApiKey>> {
    let mut stmt = conn.prepare(
        "SELECT key_id, device_id, prefix, hash, expires_at_ms, revoked_at_ms,
                last_used_at_ms, created_at_ms
         FROM device_api_keys WHERE revoked_at_ms IS NULL",
    )?;
    let rows = stmt.query_map([], row_to_key)?;
    rows.collect()
}

pub fn revoke_key(conn: &Connection, key_id: KeyId, at: DateTime<Utc>) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE device_api_keys SET revoked_at_ms = ?2
         WHERE key_id = ?1 AND revoked_at_ms IS NULL",
        params![key_id.to_string(), codec::dt_to_ms(at)],
    )?;
    Ok(n > 0)
}

/// Best-effort usage stamp; failures are the caller's to ignore.
pub fn touch_key_last_used(
    conn: &Connection,
    key_id: KeyId,
    at: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE device_api_keys SET last_used_at_ms = ?2 WHERE key_id = ?1",
        params![key_id.to_string(), codec::dt_to_ms(at)],
    )?;
    Ok(())
}

pub fn insert_attempt(conn: &Connection, attempt: &AuthAttempt) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO auth_attempts
             (id, device_id, ip_address, user_agent, at_ms, success, failure_reason, api_key_prefix)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            attempt.id.to_string(),
            attempt.device_id.map(|d| d.to_string()),
            attempt.ip_address,
            attempt.user_agent,
            codec::dt_to_ms(attempt.at),
            attempt.success,
            attempt.failure_reason,
            attempt.api_key_prefix,
        ],
    )?;
    Ok(())
}

pub fn attempts_for_device(
    conn: &Connection,
    device_id: DeviceId,
    limit: usize,
) -> rusqlite::Result<Vec<AuthAttempt>> {
    let mut stmt = conn.prepare(
        "SELECT id, device_id, ip_address, user_agent, at_ms, success, failure_reason, api_key_prefix
         FROM auth_attempts WHERE device_id = ?1 ORDER BY at_ms DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![device_id.to_string(), limit as i64], row_to_attempt)?;
    rows.collect()
}

fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegistrationToken> {
    Ok(RegistrationToken {
        token_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        tenant_id: codec::parse_uuid(&row.get::<_, String>(1)?)?,
        prefix: row.get(2)?,
        hash: row.get(3)?,
        expires_at: codec::ms_to_dt(row.get(4)?)?,
        is_used: row.get(5)?,
        used_by_device_id: codec::opt_parse_uuid(row.get(6)?)?,
        used_at: codec::opt_ms_to_dt(row.get(7)?)?,
        created_by: row.get(8)?,
        created_at: codec::ms_to_dt(row.get(9)?)?,
        description: row.get(10)?,
    })
}

fn row_to_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceApiKey> {
    Ok(DeviceApiKey {
        key_id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        device_id: codec::parse_uuid(&row.get::<_, String>(1)?)?,
        prefix: row.get(2)?,
        hash: row.get(3)?,
        expires_at: codec::opt_ms_to_dt(row.get(4)?)?,
        revoked_at: codec::opt_ms_to_dt(row.get(5)?)?,
        last_used_at: codec::opt_ms_to_dt(row.get(6)?)?,
        created_at: codec::ms_to_dt(row.get(7)?)?,
    })
}

fn row_to_attempt(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuthAttempt> {
    Ok(AuthAttempt {
        id: codec::parse_uuid(&row.get::<_, String>(0)?)?,
        device_id: codec::opt_parse_uuid(row.get(1)?)?,
        ip_address: row.get(2)?,
        user_agent: row.get(3)?,
        at: codec::ms_to_dt(row.get(4)?)?,
        success: row.get(5)?,
        failure_reason: row.get(6)?,
        api_key_prefix: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use chrono::TimeZone;
    use sbe_common::ids::TenantId;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn token(prefix: &str) -> RegistrationToken {
        RegistrationToken {
            token_id: TokenId::generate(),
            tenant_id: TenantId::generate(),
            prefix: prefix.into(),
            hash: "$2b$12$fakehash".into(),
            expires_at: at(10_000),
            is_used: false,
            used_by_device_id: None,
            used_at: None,
            created_by: "admin@example.com".into(),
            created_at: at(0),
            description: Some("bench rack".into()),
        }
    }

    fn key(device_id: DeviceId, expires_at: Option<DateTime<Utc>>) -> DeviceApiKey {
        DeviceApiKey {
            key_id: KeyId::generate(),
            device_id,
            prefix: "0badcafe".into(),
            hash: "$2b$12$fakehash".into(),
            expires_at,
            revoked_at: None,
            last_used_at: None,
            created_at: at(0),
        }
    }

    #[test]
    fn token_round_trip_and_prefix_lookup() {
        let store = Store::open_in_memory().unwrap();
        let t = token("ab12cd34");
        store.with_conn(|c| insert_token(c, &t)).unwrap();

        let found = store.with_conn(|c| token_by_prefix(c, "ab12cd34")).unwrap().unwrap();
        assert_eq!(found, t);
        assert!(store.with_conn(|c| token_by_prefix(c, "zzzzzzzz")).unwrap().is_none());
    }

    #[test]
    fn mark_used_is_single_shot() {
        let store = Store::open_in_memory().unwrap();
        let t = token("ab12cd34");
        let device = DeviceId::generate();
        store.with_conn(|c| insert_token(c, &t)).unwrap();

        assert!(store.with_conn(|c| mark_token_used(c, t.token_id, device, at(5))).unwrap());
        // A second consumer loses.
        assert!(!store
            .with_conn(|c| mark_token_used(c, t.token_id, DeviceId::generate(), at(6)))
            .unwrap());

        let reloaded = store.with_conn(|c| get_token(c, t.token_id)).unwrap().unwrap();
        assert!(reloaded.is_used);
        assert_eq!(reloaded.used_by_device_id, Some(device));
        assert_eq!(reloaded.used_at, Some(at(5)));
    }

    #[test]
    fn live_keys_exclude_revoked_and_expired() {
        let store = Store::open_in_memory().unwrap();
        let device = DeviceId::generate();
        let live = key(device, Some(at(10_000)));
        let expired = DeviceApiKey { key_id: KeyId::generate(), expires_at: Some(at(10)), ..live.clone() };
        let mut revoked = DeviceApiKey { key_id: KeyId::generate(), ..live.clone() };
        store
            .with_tx(|tx| {
                insert_api_key(tx, &live)?;
                insert_api_key(tx, &expired)?;
                insert_api_key(tx, &revoked)
            })
            .unwrap();
        store.with_conn(|c| revoke_key(c, revoked.key_id, at(100))).unwrap();
        revoked.revoked_at = Some(at(100));

        let found = store.with_conn(|c| live_keys_by_prefix(c, "0badcafe", at(5_000))).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key_id, live.key_id);
    }

    #[test]
    fn revoke_is_idempotent_and_preserves_first_timestamp() {
        let store = Store::open_in_memory().unwrap();
        let k = key(DeviceId::generate(), None);
        store.with_conn(|c| insert_api_key(c, &k)).unwrap();

        assert!(store.with_conn(|c| revoke_key(c, k.key_id, at(50))).unwrap());
        assert!(!store.with_conn(|c| revoke_key(c, k.key_id, at(99))).unwrap());

        let keys = store.with_conn(|c| all_unrevoked_keys(c)).unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn attempts_ledger_appends_and_reads_back() {
        let store = Store::open_in_memory().unwrap();
        let device = DeviceId::generate();
        for (i, success) in [(1, false), (2, true)] {
            let attempt = AuthAttempt {
                id: uuid::Uuid::new_v4(),
                device_id: Some(device),
                ip_address: Some("10.0.0.7".into()),
                user_agent: Some("sbe-agent/1.2".into()),
                at: at(i),
                success,
                failure_reason: (!success).then(|| "hash mismatch".to_string()),
                api_key_prefix: Some("0badcafe".into()),
            };
            store.with_conn(|c| insert_attempt(c, &attempt)).unwrap();
        }

        let attempts = store.with_conn(|c| attempts_for_device(c, device, 10)).unwrap();
        assert_eq!(attempts.len(), 2);
        // Newest first.
        assert!(attempts[0].success);
        assert!(!attempts[1].success);
    }
}
