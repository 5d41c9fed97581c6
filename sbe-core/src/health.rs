//! Periodic device health scoring.
//!
//! Every tick scores each device that heartbeat in the last 24 hours from
//! three bounded signals:
//!
//! - **heartbeat (0..=40)** — 40 when the last heartbeat is under a minute
//!   old, decaying linearly to 0 at ten minutes
//! - **reconciliation (0..=30)** — success ratio over the last ten terminal
//!   reconciliations, full marks when none exist yet
//! - **resource (0..=30)** — pressure penalties from the freshest metrics
//!   sample no older than five minutes
//!
//! `total` is always the exact sum, so every stored row satisfies the
//! componentwise bounds by construction.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use sbe_common::clock::Clock;
use sbe_common::error::CoreError;
use sbe_common::ids::DeviceId;
use sbe_common::types::DeviceHealthScore;
use sbe_common::bundle::ReportState;
use sbe_store::{Store, desired, telemetry};

use crate::storage_err;

/// Weight of the heartbeat component.
const HEARTBEAT_MAX: f64 = 40.0;
/// Weight of the reconciliation component.
const RECONCILIATION_MAX: f64 = 30.0;
/// Weight of the resource component.
const RESOURCE_MAX: f64 = 30.0;

/// Heartbeats younger than this score the full 40.
const FRESH_HEARTBEAT_SECS: i64 = 60;
/// Heartbeats older than this score 0.
const STALE_HEARTBEAT_SECS: i64 = 600;
/// Terminal reconciliations considered for the success ratio.
const RECONCILIATION_WINDOW: usize = 10;
/// Metrics older than this carry no pressure evidence.
const METRICS_FRESHNESS_SECS: i64 = 300;
/// Devices silent longer than this are not scored at all.
const SCORING_HORIZON_HOURS: i64 = 24;

#[derive(Clone)]
pub struct HealthScorer {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl HealthScorer {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Score every recently alive device and append the results.
    pub fn score_tick(&self) -> Result<Vec<DeviceHealthScore>, CoreError> {
        let now = self.clock.now();
        let horizon = now - Duration::hours(SCORING_HORIZON_HOURS);
        let device_ids = self
            .store
            .with_conn(|c| telemetry::device_ids_with_heartbeat_since(c, horizon))
            .map_err(storage_err)?;

        let mut scores = Vec::with_capacity(device_ids.len());
        for device_id in device_ids {
            let score = self.score_device(device_id, now)?;
            self.store
                .with_conn(|c| telemetry::insert_health_score(c, &score))
                .map_err(storage_err)?;
            debug!(device = %device_id, total = score.total, "health score appended");
            scores.push(score);
        }
        Ok(scores)
    }

    /// Compute one device's score at `now` without persisting it.
    pub fn score_device(
        &self,
        device_id: DeviceId,
        now: DateTime<Utc>,
    ) -> Result<DeviceHealthScore, CoreError> {
        let (heartbeat, terminals, metrics) = self
            .store
            .with_conn(|c| {
                let heartbeat = telemetry::latest_heartbeat(c, device_id)?;
                let terminals = desired::recent_terminal_states(c, device_id, RECONCILIATION_WINDOW)?;
                let metrics = telemetry::latest_metrics_since(
                    c,
                    device_id,
                    now - Duration::seconds(METRICS_FRESHNESS_SECS),
                )?;
                Ok((heartbeat, terminals, metrics))
            })
            .map_err(storage_err)?;

        let heartbeat_score = match heartbeat {
            Some(hb) => heartbeat_component((now - hb.at).num_seconds()),
            None => 0.0,
        };

        let reconciliation_score = if terminals.is_empty() {
            RECONCILIATION_MAX
        } else {
            let successes = terminals.iter().filter(|s| **s == ReportState::Completed).count();
            RECONCILIATION_MAX * successes as f64 / terminals.len() as f64
        };

        let resource_score = match metrics {
            Some(m) => {
                let penalties =
                    pressure_penalty(m.cpu_percent) + pressure_penalty(m.memory_percent) + pressure_penalty(m.disk_percent);
                (RESOURCE_MAX - 10.0 * penalties).clamp(0.0, RESOURCE_MAX)
            }
            // No fresh sample: no pressure evidence.
            None => RESOURCE_MAX,
        };

        Ok(DeviceHealthScore {
            device_id,
            at: now,
            total: heartbeat_score + reconciliation_score + resource_score,
            heartbeat_score,
            reconciliation_score,
            resource_score,
        })
    }
}

/// Linear decay from 40 at one minute to 0 at ten minutes.
fn heartbeat_component(age_secs: i64) -> f64 {
    if age_secs <= FRESH_HEARTBEAT_SECS {
        HEARTBEAT_MAX
    } else if age_secs >= STALE_HEARTBEAT_SECS {
        0.0
    } else {
        let span = (STALE_HEARTBEAT_SECS - FRESH_HEARTBEAT_SECS) as f64;
        HEARTBEAT_MAX * (STALE_HEARTBEAT_SECS - age_secs) as f64 / span
    }
}

/// Pressure penalty: 1.0 at >= 90%, 0.5 at >= 75%, else none.
fn pressure_penalty(percent: f64) -> f64 {
    if percent >= 90.0 {
        1.0
    } else if percent >= 75.0 {
        0.5
    } else {
        0.0
    }
}
