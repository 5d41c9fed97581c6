//! Alert engine: rule evaluation, deduplication, and auto-resolution.
//!
//! Each tick evaluates a fixed, ordered rule set against current state,
//! raising at most one Active alert per `(device, type)` (the dedup key) or
//! per `(rollout, type)`. A second pass walks currently Active alerts and
//! resolves those whose underlying condition no longer holds. Rules are
//! stateless beyond what they read from the database.
//!
//! | Rule | Condition | Severity |
//! |---|---|---|
//! | `device_offline_warning` | silent > 5 min | Warning |
//! | `device_offline_critical` | silent > 30 min | Critical |
//! | `device_unhealthy` | fresh health score < 40 | Critical |
//! | `high_error_rate` | error heartbeats >= threshold over window | Warning |
//! | `rollout_failed` | rollout Failed or RolledBack | Critical |

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use sbe_common::alert::{Alert, AlertSeverity, AlertStatus, AlertType, Notification};
use sbe_common::clock::Clock;
use sbe_common::error::CoreError;
use sbe_common::ids::{AlertId, DeviceId, TenantId};
use sbe_common::rollout::RolloutStatus;
use sbe_common::types::Device;
use sbe_store::{Store, alerts as alert_store, devices, rollouts, telemetry};

use crate::events::EventBus;
use crate::storage_err;

/// Silence beyond this raises the warning-severity offline alert.
const OFFLINE_WARNING_SECS: i64 = 5 * 60;
/// Silence beyond this raises the critical-severity offline alert.
const OFFLINE_CRITICAL_SECS: i64 = 30 * 60;
/// Health scores below this are unhealthy.
const UNHEALTHY_THRESHOLD: f64 = 40.0;
/// Only scores younger than this count for the unhealthy rule.
const UNHEALTHY_FRESHNESS_SECS: i64 = 10 * 60;

#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Sliding window for the high-error-rate rule.
    pub error_rate_window_minutes: u64,
    /// Error-heartbeat proportion (percent) at which the rule fires.
    pub error_rate_threshold_pct: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self { error_rate_window_minutes: 15, error_rate_threshold_pct: 10.0 }
    }
}

/// Counts from one alert tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertTickStats {
    pub raised: usize,
    pub resolved: usize,
}

#[derive(Clone)]
pub struct AlertEngine {
    store: Store,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: AlertConfig,
}

impl AlertEngine {
    pub fn new(store: Store, clock: Arc<dyn Clock>, events: EventBus, config: AlertConfig) -> Self {
        Self { store, clock, events, config }
    }

    /// Run one evaluation pass: raise new alerts, then auto-resolve cleared
    /// ones. Rule failures are logged and skipped, never fatal to the tick.
    pub fn tick(&self) -> Result<AlertTickStats, CoreError> {
        let now = self.clock.now();
        let mut stats = AlertTickStats::default();

        let fleet = self.store.with_conn(devices::list_all_bare).map_err(storage_err)?;
        let error_rates = self.error_rates(now)?;

        for device in &fleet {
            for candidate in self.device_rule_candidates(device, &error_rates, now)? {
                match self.raise_for_device(device, candidate, now) {
                    Ok(true) => stats.raised += 1,
                    Ok(false) => {}
                    Err(e) => warn!(device = %device.device_id, "alert raise failed: {e}"),
                }
            }
        }

        stats.raised += self.raise_rollout_alerts(now)?;
        stats.resolved = self.auto_resolve(&fleet, &error_rates, now)?;

        if stats.raised + stats.resolved > 0 {
            info!(raised = stats.raised, resolved = stats.resolved, "alert tick finished");
        } else {
            debug!("alert tick found nothing to do");
        }
        Ok(stats)
    }

    /// Admin acknowledge. Idempotent-terminal: the first acknowledgement's
    /// actor and timestamp stick.
    pub fn acknowledge(
        &self,
        tenant_id: TenantId,
        alert_id: AlertId,
        by: &str,
    ) -> Result<Alert, CoreError> {
        let now = self.clock.now();
        self.get_in_tenant(tenant_id, alert_id)?;
        self.store
            .with_conn(|c| alert_store::acknowledge(c, alert_id, by, now))
            .map_err(storage_err)?;
        self.get_in_tenant(tenant_id, alert_id)
    }

    /// Admin resolve. Idempotent-terminal.
    pub fn resolve(&self, tenant_id: TenantId, alert_id: AlertId) -> Result<Alert, CoreError> {
        let now = self.clock.now();
        self.get_in_tenant(tenant_id, alert_id)?;
        self.store
            .with_conn(|c| alert_store::resolve(c, alert_id, now))
            .map_err(storage_err)?;
        self.get_in_tenant(tenant_id, alert_id)
    }

    pub fn list(
        &self,
        tenant_id: TenantId,
        status: Option<AlertStatus>,
    ) -> Result<Vec<Alert>, CoreError> {
        self.store
            .with_conn(|c| alert_store::list_in_tenant(c, tenant_id, status))
            .map_err(storage_err)
    }

    fn get_in_tenant(&self, tenant_id: TenantId, alert_id: AlertId) -> Result<Alert, CoreError> {
        self.store
            .with_conn(|c| alert_store::get(c, alert_id))
            .map_err(storage_err)?
            .filter(|a| a.tenant_id == tenant_id)
            .ok_or_else(|| {
                CoreError::new(
                    sbe_common::error::ErrorCode::AlertNotFound,
                    format!("alert {alert_id} not found"),
                )
            })
    }

    /// Which device-scoped rules currently fire for one device.
    fn device_rule_candidates(
        &self,
        device: &Device,
        error_rates: &HashMap<DeviceId, f64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<(AlertType, AlertSeverity, String)>, CoreError> {
        let mut candidates = Vec::new();

        if let Some(last_seen) = device.last_seen_at {
            let silent = now - last_seen;
            if silent > Duration::seconds(OFFLINE_WARNING_SECS) {
                candidates.push((
                    AlertType::DeviceOfflineWarning,
                    AlertSeverity::Warning,
                    format!("no heartbeat for {} minutes", silent.num_minutes()),
                ));
            }
            if silent > Duration::seconds(OFFLINE_CRITICAL_SECS) {
                candidates.push((
                    AlertType::DeviceOfflineCritical,
                    AlertSeverity::Critical,
                    format!("no heartbeat for {} minutes", silent.num_minutes()),
                ));
            }
        }

        let score = self
            .store
            .with_conn(|c| telemetry::latest_health_score(c, device.device_id))
            .map_err(storage_err)?;
        if let Some(score) = score {
            if score.total < UNHEALTHY_THRESHOLD
                && now - score.at <= Duration::seconds(UNHEALTHY_FRESHNESS_SECS)
            {
                candidates.push((
                    AlertType::DeviceUnhealthy,
                    AlertSeverity::Critical,
                    format!("health score {:.0} below {UNHEALTHY_THRESHOLD:.0}", score.total),
                ));
            }
        }

        if let Some(rate) = error_rates.get(&device.device_id) {
            if *rate >= self.config.error_rate_threshold_pct {
                candidates.push((
                    AlertType::HighErrorRate,
                    AlertSeverity::Warning,
                    format!("{rate:.1}% of heartbeats reported errors"),
                ));
            }
        }
        Ok(candidates)
    }

    fn raise_for_device(
        &self,
        device: &Device,
        (alert_type, severity, description): (AlertType, AlertSeverity, String),
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let raised = self
            .store
            .with_tx(|tx| {
                if alert_store::active_exists_for_device(tx, device.device_id, alert_type)? {
                    return Ok(None);
                }
                let alert = Alert {
                    alert_id: AlertId::generate(),
                    tenant_id: device.tenant_id,
                    severity,
                    alert_type,
                    status: AlertStatus::Active,
                    title: format!("{} on {}", alert_type.as_str(), device.name),
                    description,
                    device_id: Some(device.device_id),
                    rollout_id: None,
                    created_at: now,
                    acknowledged_at: None,
                    acknowledged_by: None,
                    resolved_at: None,
                };
                alert_store::insert(tx, &alert)?;
                alert_store::insert_notification(
                    tx,
                    &Notification {
                        id: uuid::Uuid::new_v4(),
                        tenant_id: alert.tenant_id,
                        alert_id: alert.alert_id,
                        subject: alert.title.clone(),
                        body: alert.description.clone(),
                        created_at: now,
                    },
                )?;
                Ok(Some(alert))
            })
            .map_err(storage_err)?;

        if let Some(alert) = raised {
            info!(device = %device.device_id, rule = alert_type.as_str(), "alert raised");
            self.events.emit(
                "signalbeam.devices.events.alert_raised",
                now,
                &serde_json::json!({ "alertId": alert.alert_id, "type": alert_type.as_str() }),
            );
            return Ok(true);
        }
        Ok(false)
    }

    fn raise_rollout_alerts(&self, now: DateTime<Utc>) -> Result<usize, CoreError> {
        let mut raised = 0;
        for status in [RolloutStatus::Failed, RolloutStatus::RolledBack] {
            let ids = self
                .store
                .with_conn(|c| rollouts::list_by_status(c, status))
                .map_err(storage_err)?;
            for rollout_id in ids {
                let created = self
                    .store
                    .with_tx(|tx| {
                        if alert_store::active_exists_for_rollout(
                            tx,
                            rollout_id,
                            AlertType::RolloutFailed,
                        )? {
                            return Ok(false);
                        }
                        let Some(rollout) = rollouts::get_rollout(tx, rollout_id)? else {
                            return Ok(false);
                        };
                        let alert = Alert {
                            alert_id: AlertId::generate(),
                            tenant_id: rollout.tenant_id,
                            severity: AlertSeverity::Critical,
                            alert_type: AlertType::RolloutFailed,
                            status: AlertStatus::Active,
                            title: format!("rollout {} failed", rollout.name),
                            description: format!("rollout ended {:?}", rollout.status),
                            device_id: None,
                            rollout_id: Some(rollout_id),
                            created_at: now,
                            acknowledged_at: None,
                            acknowledged_by: None,
                            resolved_at: None,
                        };
                        alert_store::insert(tx, &alert)?;
                        alert_store::insert_notification(
                            tx,
                            &Notification {
                                id: uuid::Uuid::new_v4(),
                                tenant_id: alert.tenant_id,
                                alert_id: alert.alert_id,
                                subject: alert.title.clone(),
                                body: alert.description.clone(),
                                created_at: now,
                            },
                        )?;
                        Ok(true)
                    })
                    .map_err(storage_err)?;
                if created {
                    raised += 1;
                }
            }
        }
        Ok(raised)
    }

    /// Resolve Active alerts whose condition has cleared.
    fn auto_resolve(
        &self,
        fleet: &[Device],
        error_rates: &HashMap<DeviceId, f64>,
        now: DateTime<Utc>,
    ) -> Result<usize, CoreError> {
        let by_id: HashMap<DeviceId, &Device> =
            fleet.iter().map(|d| (d.device_id, d)).collect();
        let active = self.store.with_conn(alert_store::list_active).map_err(storage_err)?;

        let mut resolved = 0;
        for alert in active {
            let cleared = match (alert.alert_type, alert.device_id) {
                (AlertType::DeviceOfflineWarning, Some(device_id)) => {
                    heartbeat_within(by_id.get(&device_id), now, OFFLINE_WARNING_SECS)
                }
                (AlertType::DeviceOfflineCritical, Some(device_id)) => {
                    heartbeat_within(by_id.get(&device_id), now, OFFLINE_CRITICAL_SECS)
                }
                (AlertType::DeviceUnhealthy, Some(device_id)) => {
                    let score = self
                        .store
                        .with_conn(|c| telemetry::latest_health_score(c, device_id))
                        .map_err(storage_err)?;
                    score.is_some_and(|s| s.total >= UNHEALTHY_THRESHOLD)
                }
                (AlertType::HighErrorRate, Some(device_id)) => error_rates
                    .get(&device_id)
                    .copied()
                    .unwrap_or(0.0)
                    < self.config.error_rate_threshold_pct,
                (AlertType::RolloutFailed, _) => match alert.rollout_id {
                    Some(rollout_id) => {
                        let rollout = self
                            .store
                            .with_conn(|c| rollouts::get_rollout(c, rollout_id))
                            .map_err(storage_err)?;
                        match rollout {
                            // Deleted or re-rolled-forward.
                            None => true,
                            Some(r) => !matches!(
                                r.status,
                                RolloutStatus::Failed | RolloutStatus::RolledBack
                            ),
                        }
                    }
                    None => false,
                },
                _ => false,
            };

            if cleared {
                self.store
                    .with_conn(|c| alert_store::resolve(c, alert.alert_id, now))
                    .map_err(storage_err)?;
                debug!(alert = %alert.alert_id, rule = alert.alert_type.as_str(), "alert auto-resolved");
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    /// Per-device error-heartbeat percentage over the configured window.
    fn error_rates(&self, now: DateTime<Utc>) -> Result<HashMap<DeviceId, f64>, CoreError> {
        let since = now - Duration::minutes(self.config.error_rate_window_minutes as i64);
        let counts = self
            .store
            .with_conn(|c| telemetry::heartbeat_counts_since(c, since))
            .map_err(storage_err)?;
        Ok(counts
            .into_iter()
            .filter(|(_, total, _)| *total > 0)
            .map(|(device, total, errors)| (device, 100.0 * errors as f64 / total as f64))
            .collect())
    }
}

fn heartbeat_within(device: Option<&&Device>, now: DateTime<Utc>, secs: i64) -> bool {
    device
        .and_then(|d| d.last_seen_at)
        .is_some_and(|seen| now - seen <= Duration::seconds(secs))
}
