//! Heartbeat and metrics ingestion, offline detection, and retention.
//!
//! Heartbeats and metrics are append-only series. Ingesting a heartbeat
//! advances `last_seen_at` (never backwards) and flips the device Online if
//! it was not already. The offline detector is the single writer for the
//! Online -> Offline transition.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use sbe_common::clock::Clock;
use sbe_common::error::{CoreError, ErrorCode};
use sbe_common::ids::DeviceId;
use sbe_common::types::{DeviceHeartbeat, DeviceMetrics, OnlineStatus};
use sbe_store::{Store, devices, telemetry, tenants};

use crate::events::{EventBus, HEARTBEAT_SUBJECT, METRICS_SUBJECT, device_event_subject};
use crate::storage_err;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// How far in the future a reported timestamp may sit before rejection.
    pub max_clock_skew: StdDuration,
    /// Silence after which an Online device is flipped Offline.
    pub offline_threshold: StdDuration,
    /// Per-batch row cap for retention deletes.
    pub retention_batch: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_clock_skew: StdDuration::from_secs(5 * 60),
            offline_threshold: StdDuration::from_secs(120),
            retention_batch: 5_000,
        }
    }
}

/// Result of one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionStats {
    pub heartbeats_deleted: usize,
    pub metrics_deleted: usize,
}

#[derive(Clone)]
pub struct IngestService {
    store: Store,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: IngestConfig,
}

impl IngestService {
    pub fn new(store: Store, clock: Arc<dyn Clock>, events: EventBus, config: IngestConfig) -> Self {
        Self { store, clock, events, config }
    }

    /// Append a heartbeat and re-derive liveness.
    ///
    /// Idempotent in device state: the same `(device, at)` sample twice
    /// yields the same `last_seen_at` and the same transition decision.
    pub fn post_heartbeat(&self, hb: DeviceHeartbeat) -> Result<(), CoreError> {
        let now = self.clock.now();
        self.check_skew(hb.at, now)?;

        let transitioned = self
            .store
            .with_tx(|tx| {
                let Some(prior_status) = devices::touch_last_seen(tx, hb.device_id, hb.at)? else {
                    return Ok(None);
                };
                telemetry::insert_heartbeat(tx, &hb)?;
                if prior_status != OnlineStatus::Online {
                    devices::set_online_status(tx, hb.device_id, OnlineStatus::Online)?;
                    return Ok(Some(true));
                }
                Ok(Some(false))
            })
            .map_err(storage_err)?;

        match transitioned {
            None => Err(CoreError::device_not_found(hb.device_id)),
            Some(went_online) => {
                if went_online {
                    debug!(device = %hb.device_id, "device transitioned online");
                    self.events.emit(
                        &device_event_subject("online"),
                        now,
                        &serde_json::json!({ "deviceId": hb.device_id }),
                    );
                }
                self.events.emit(HEARTBEAT_SUBJECT, now, &hb);
                Ok(())
            }
        }
    }

    /// Append a metrics sample. Percentages must sit in `[0, 100]`.
    pub fn post_metrics(&self, m: DeviceMetrics) -> Result<(), CoreError> {
        let now = self.clock.now();
        self.check_skew(m.at, now)?;
        for (name, value) in [
            ("cpu", m.cpu_percent),
            ("memory", m.memory_percent),
            ("disk", m.disk_percent),
        ] {
            if !(0.0..=100.0).contains(&value) || !value.is_finite() {
                return Err(CoreError::new(
                    ErrorCode::InvalidMetrics,
                    format!("{name} percentage {value} outside [0, 100]"),
                ));
            }
        }

        let exists = self
            .store
            .with_tx(|tx| {
                if devices::get(tx, m.device_id)?.is_none() {
                    return Ok(false);
                }
                telemetry::insert_metrics(tx, &m)?;
                Ok(true)
            })
            .map_err(storage_err)?;
        if !exists {
            return Err(CoreError::device_not_found(m.device_id));
        }
        self.events.emit(METRICS_SUBJECT, now, &m);
        Ok(())
    }

    /// Offline detector tick: flip Online devices silent past the threshold
    /// to Offline. Single writer; re-running without new heartbeats is a
    /// no-op.
    pub fn offline_tick(&self) -> Result<Vec<DeviceId>, CoreError> {
        let now = self.clock.now();
        let threshold = Duration::from_std(self.config.offline_threshold)
            .unwrap_or_else(|_| Duration::seconds(120));
        let cutoff = now - threshold;

        let transitioned = self
            .store
            .with_tx(|tx| {
                let stale = devices::online_last_seen_before(tx, cutoff)?;
                for device_id in &stale {
                    devices::set_online_status(tx, *device_id, OnlineStatus::Offline)?;
                }
                Ok(stale)
            })
            .map_err(storage_err)?;

        for device_id in &transitioned {
            info!(device = %device_id, "device offline (no heartbeat)");
            self.events.emit(
                &device_event_subject("offline"),
                now,
                &serde_json::json!({ "deviceId": device_id }),
            );
        }
        Ok(transitioned)
    }

    /// Daily retention pass: delete heartbeat and metric rows older than
    /// each tenant's horizon, in capped batches, oldest first.
    pub fn retention_sweep(&self) -> Result<RetentionStats, CoreError> {
        let now = self.clock.now();
        let all_tenants = self.store.with_conn(tenants::list).map_err(storage_err)?;
        let mut stats = RetentionStats::default();

        for tenant in all_tenants {
            let horizon = now - Duration::days(tenant.data_retention_days as i64);
            loop {
                let deleted = self
                    .store
                    .with_conn(|c| {
                        telemetry::delete_heartbeats_before(
                            c,
                            tenant.tenant_id,
                            horizon,
                            self.config.retention_batch,
                        )
                    })
                    .map_err(storage_err)?;
                stats.heartbeats_deleted += deleted;
                if deleted < self.config.retention_batch {
                    break;
                }
            }
            loop {
                let deleted = self
                    .store
                    .with_conn(|c| {
                        telemetry::delete_metrics_before(
                            c,
                            tenant.tenant_id,
                            horizon,
                            self.config.retention_batch,
                        )
                    })
                    .map_err(storage_err)?;
                stats.metrics_deleted += deleted;
                if deleted < self.config.retention_batch {
                    break;
                }
            }
        }

        if stats.heartbeats_deleted + stats.metrics_deleted > 0 {
            info!(
                heartbeats = stats.heartbeats_deleted,
                metrics = stats.metrics_deleted,
                "retention sweep trimmed telemetry"
            );
        } else {
            debug!("retention sweep found nothing to trim");
        }
        Ok(stats)
    }

    fn check_skew(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), CoreError> {
        let skew =
            Duration::from_std(self.config.max_clock_skew).unwrap_or_else(|_| Duration::minutes(5));
        if at > now + skew {
            warn!("rejecting sample {}s in the future", (at - now).num_seconds());
            return Err(CoreError::new(
                ErrorCode::InvalidTimestamp,
                format!("timestamp {at} is more than {}s in the future", skew.num_seconds()),
            ));
        }
        Ok(())
    }
}
