//! Database schema.
//!
//! All timestamps are unix milliseconds (`*_ms` columns). Versions are
//! stored as canonical semver strings; status enums as their `snake_case`
//! wire names. The schema version is bumped on any incompatible change.

use rusqlite::Connection;

/// Current schema version, stored in `user_version`.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    tenant_id            TEXT PRIMARY KEY,
    name                 TEXT NOT NULL,
    max_devices          INTEGER NOT NULL,
    data_retention_days  INTEGER NOT NULL,
    tier                 TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS devices (
    device_id            TEXT PRIMARY KEY,
    tenant_id            TEXT NOT NULL,
    name                 TEXT NOT NULL,
    metadata             TEXT,
    registration_status  TEXT NOT NULL,
    online_status        TEXT NOT NULL,
    last_seen_at_ms      INTEGER,
    created_at_ms        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_devices_tenant ON devices(tenant_id);
CREATE INDEX IF NOT EXISTS idx_devices_liveness ON devices(online_status, last_seen_at_ms);

CREATE TABLE IF NOT EXISTS device_tags (
    device_id  TEXT NOT NULL,
    tag        TEXT NOT NULL,
    PRIMARY KEY (device_id, tag)
);

CREATE TABLE IF NOT EXISTS device_groups (
    group_id      TEXT PRIMARY KEY,
    tenant_id     TEXT NOT NULL,
    name          TEXT NOT NULL,
    group_type    TEXT NOT NULL,
    tag_query     TEXT,
    created_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_groups_tenant ON device_groups(tenant_id);

CREATE TABLE IF NOT EXISTS device_group_members (
    group_id  TEXT NOT NULL,
    device_id TEXT NOT NULL,
    PRIMARY KEY (group_id, device_id)
);
CREATE INDEX IF NOT EXISTS idx_group_members_device ON device_group_members(device_id);

CREATE TABLE IF NOT EXISTS registration_tokens (
    token_id           TEXT PRIMARY KEY,
    tenant_id          TEXT NOT NULL,
    prefix             TEXT NOT NULL,
    hash               TEXT NOT NULL,
    expires_at_ms      INTEGER NOT NULL,
    is_used            INTEGER NOT NULL DEFAULT 0,
    used_by_device_id  TEXT,
    used_at_ms         INTEGER,
    created_by         TEXT NOT NULL,
    created_at_ms      INTEGER NOT NULL,
    description        TEXT
);
CREATE INDEX IF NOT EXISTS idx_tokens_prefix ON registration_tokens(prefix);

CREATE TABLE IF NOT EXISTS device_api_keys (
    key_id          TEXT PRIMARY KEY,
    device_id       TEXT NOT NULL,
    prefix          TEXT NOT NULL,
    hash            TEXT NOT NULL,
    expires_at_ms   INTEGER,
    revoked_at_ms   INTEGER,
    last_used_at_ms INTEGER,
    created_at_ms   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON device_api_keys(prefix);
CREATE INDEX IF NOT EXISTS idx_api_keys_device ON device_api_keys(device_id);

CREATE TABLE IF NOT EXISTS auth_attempts (
    id             TEXT PRIMARY KEY,
    device_id      TEXT,
    ip_address     TEXT,
    user_agent     TEXT,
    at_ms          INTEGER NOT NULL,
    success        INTEGER NOT NULL,
    failure_reason TEXT,
    api_key_prefix TEXT
);
CREATE INDEX IF NOT EXISTS idx_auth_attempts_at ON auth_attempts(at_ms);

CREATE TABLE IF NOT EXISTS heartbeats (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id  TEXT NOT NULL,
    at_ms      INTEGER NOT NULL,
    status     TEXT,
    ip_address TEXT,
    extras     TEXT
);
CREATE INDEX IF NOT EXISTS idx_heartbeats_device_at ON heartbeats(device_id, at_ms);
CREATE INDEX IF NOT EXISTS idx_heartbeats_at ON heartbeats(at_ms);

CREATE TABLE IF NOT EXISTS device_metrics (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id          TEXT NOT NULL,
    at_ms              INTEGER NOT NULL,
    cpu_percent        REAL NOT NULL,
    memory_percent     REAL NOT NULL,
    disk_percent       REAL NOT NULL,
    uptime_seconds     INTEGER NOT NULL,
    running_containers INTEGER NOT NULL,
    extras             TEXT
);
CREATE INDEX IF NOT EXISTS idx_metrics_device_at ON device_metrics(device_id, at_ms);
CREATE INDEX IF NOT EXISTS idx_metrics_at ON device_metrics(at_ms);

CREATE TABLE IF NOT EXISTS health_scores (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id            TEXT NOT NULL,
    at_ms                INTEGER NOT NULL,
    total                REAL NOT NULL,
    heartbeat_score      REAL NOT NULL,
    reconciliation_score REAL NOT NULL,
    resource_score       REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_health_scores_device_at ON health_scores(device_id, at_ms);

CREATE TABLE IF NOT EXISTS bundles (
    bundle_id      TEXT PRIMARY KEY,
    tenant_id      TEXT NOT NULL,
    name           TEXT NOT NULL,
    latest_version TEXT,
    created_at_ms  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bundles_tenant ON bundles(tenant_id);

CREATE TABLE IF NOT EXISTS bundle_versions (
    bundle_id       TEXT NOT NULL,
    version         TEXT NOT NULL,
    containers      TEXT NOT NULL,
    created_at_ms   INTEGER NOT NULL,
    release_notes   TEXT,
    blob_uri        TEXT,
    checksum        TEXT,
    size_bytes      INTEGER,
    status          TEXT NOT NULL,
    PRIMARY KEY (bundle_id, version)
);

CREATE TABLE IF NOT EXISTS desired_states (
    device_id      TEXT PRIMARY KEY,
    bundle_id      TEXT NOT NULL,
    version        TEXT NOT NULL,
    assigned_at_ms INTEGER NOT NULL,
    assigned_by    TEXT NOT NULL,
    reason         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_desired_bundle ON desired_states(bundle_id);

CREATE TABLE IF NOT EXISTS reported_statuses (
    device_id      TEXT NOT NULL,
    bundle_id      TEXT NOT NULL,
    version        TEXT NOT NULL,
    rollout_id     TEXT,
    state          TEXT NOT NULL,
    started_at_ms  INTEGER NOT NULL,
    completed_at_ms INTEGER,
    error_message  TEXT,
    retry_count    INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (device_id, bundle_id, version)
);
CREATE INDEX IF NOT EXISTS idx_reported_device ON reported_statuses(device_id, started_at_ms);
CREATE INDEX IF NOT EXISTS idx_reported_rollout ON reported_statuses(rollout_id);

CREATE TABLE IF NOT EXISTS rollouts (
    rollout_id           TEXT PRIMARY KEY,
    tenant_id            TEXT NOT NULL,
    bundle_id            TEXT NOT NULL,
    target_version       TEXT NOT NULL,
    previous_version     TEXT,
    name                 TEXT NOT NULL,
    description          TEXT,
    failure_threshold    REAL NOT NULL,
    status               TEXT NOT NULL,
    current_phase_number INTEGER NOT NULL DEFAULT 0,
    eligibility          TEXT NOT NULL,
    target_group_id      TEXT,
    created_at_ms        INTEGER NOT NULL,
    started_at_ms        INTEGER,
    completed_at_ms      INTEGER,
    created_by           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rollouts_bundle_status ON rollouts(bundle_id, status);
CREATE INDEX IF NOT EXISTS idx_rollouts_status ON rollouts(status);

CREATE TABLE IF NOT EXISTS rollout_phases (
    phase_id                  TEXT PRIMARY KEY,
    rollout_id                TEXT NOT NULL,
    phase_number              INTEGER NOT NULL,
    name                      TEXT NOT NULL,
    target_kind               TEXT NOT NULL,
    target_value              REAL NOT NULL,
    status                    TEXT NOT NULL,
    started_at_ms             INTEGER,
    completed_at_ms           INTEGER,
    success_count             INTEGER NOT NULL DEFAULT 0,
    failure_count             INTEGER NOT NULL DEFAULT 0,
    min_healthy_duration_secs INTEGER,
    healthy_since_ms          INTEGER,
    UNIQUE (rollout_id, phase_number)
);

CREATE TABLE IF NOT EXISTS rollout_assignments (
    assignment_id   TEXT PRIMARY KEY,
    rollout_id      TEXT NOT NULL,
    phase_id        TEXT NOT NULL,
    device_id       TEXT NOT NULL,
    status          TEXT NOT NULL,
    assigned_at_ms  INTEGER,
    reconciled_at_ms INTEGER,
    error_message   TEXT,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    UNIQUE (rollout_id, device_id)
);
CREATE INDEX IF NOT EXISTS idx_assignments_phase ON rollout_assignments(phase_id);

CREATE TABLE IF NOT EXISTS alerts (
    alert_id           TEXT PRIMARY KEY,
    tenant_id          TEXT NOT NULL,
    severity           TEXT NOT NULL,
    alert_type         TEXT NOT NULL,
    status             TEXT NOT NULL,
    title              TEXT NOT NULL,
    description        TEXT NOT NULL,
    device_id          TEXT,
    rollout_id         TEXT,
    created_at_ms      INTEGER NOT NULL,
    acknowledged_at_ms INTEGER,
    acknowledged_by    TEXT,
    resolved_at_ms     INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_active_device_dedup
    ON alerts(device_id, alert_type) WHERE status = 'active' AND device_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_active_rollout_dedup
    ON alerts(rollout_id, alert_type) WHERE status = 'active' AND rollout_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_alerts_tenant_status ON alerts(tenant_id, status);

CREATE TABLE IF NOT EXISTS notifications (
    id            TEXT PRIMARY KEY,
    tenant_id     TEXT NOT NULL,
    alert_id      TEXT NOT NULL,
    subject       TEXT NOT NULL,
    body          TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
);
"#;

/// Create all tables and indexes, then stamp the schema version.
pub fn initialize(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Read the stored schema version.
pub fn version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}
