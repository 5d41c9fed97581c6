//! Connection ownership and the transactional seam.

use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use sbe_common::RolloutId;

use crate::schema;

/// Busy timeout for concurrent access from workers and request handlers.
const BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage poisoned: {0}")]
    Poisoned(String),
}

/// Handle to the logical database.
///
/// Cheap to clone; all clones share one connection guarded by a mutex. Query
/// work is short (per-request transactions, one transaction per rollout
/// tick), so a single writer connection in WAL mode is sufficient for the
/// fleet sizes this control plane targets.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    locks: RolloutLocks,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        Self::from_connection(conn)
    }

    /// Open an ephemeral in-memory database. Used by tests and `:memory:`
    /// deployments.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "wal").ok();
        conn.pragma_update(None, "synchronous", "normal")?;
        conn.pragma_update(None, "foreign_keys", "on")?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        schema::initialize(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), locks: RolloutLocks::default() })
    }

    fn guard(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    /// Run read-only or single-statement work against the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let conn = self.guard()?;
        Ok(f(&conn)?)
    }

    /// Run `f` inside an immediate transaction; commit on `Ok`, roll back on
    /// `Err`. This is the only way multi-statement writes happen.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut conn = self.guard()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Advisory per-rollout locks serializing rollout state transitions.
    pub fn rollout_locks(&self) -> &RolloutLocks {
        &self.locks
    }
}

/// Advisory lock table keyed by rollout id.
///
/// Two concurrent operations on the same rollout are linearized by holding
/// its entry for the duration of the mutation; different rollouts proceed
/// independently.
#[derive(Clone, Default)]
pub struct RolloutLocks {
    inner: Arc<Mutex<HashMap<RolloutId, Arc<Mutex<()>>>>>,
}

impl RolloutLocks {
    /// Fetch (or create) the lock for one rollout.
    pub fn for_rollout(&self, rollout_id: RolloutId) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(rollout_id).or_default().clone()
    }

    /// Drop the entry for a finished rollout.
    pub fn release(&self, rollout_id: RolloutId) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&rollout_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_initializes_schema() {
        let store = Store::open_in_memory().unwrap();
        let version = store.with_conn(schema::version).unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<(), StoreError> = store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO tenants (tenant_id, name, max_devices, data_retention_days, tier)
                 VALUES ('t1', 'acme', 10, 30, 'paid')",
                [],
            )?;
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(result.is_err());

        let count: i64 = store
            .with_conn(|c| c.query_row("SELECT COUNT(*) FROM tenants", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn rollout_locks_are_per_rollout() {
        let locks = RolloutLocks::default();
        let a = RolloutId::generate();
        let b = RolloutId::generate();
        let lock_a = locks.for_rollout(a);
        let _held = lock_a.lock().unwrap();
        // A different rollout's lock is acquirable while A is held.
        let lock_b = locks.for_rollout(b);
        assert!(lock_b.try_lock().is_ok());
        // The same rollout's lock is the same object.
        let lock_a2 = locks.for_rollout(a);
        assert!(lock_a2.try_lock().is_err());
    }

    #[test]
    fn open_creates_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.db");
        let store = Store::open(&path).unwrap();
        drop(store);
        assert!(path.exists());
    }
}
