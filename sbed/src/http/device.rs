//! Device-facing handlers: registration, telemetry, polling, and reports.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sbe_common::bundle::{DesiredState, ReportState};
use sbe_common::error::{CoreError, ErrorCode};
use sbe_common::ids::{BundleId, DeviceId, RolloutId, TenantId};
use sbe_common::types::{DeviceHeartbeat, DeviceMetrics};
use sbe_core::credentials::RegisterDeviceRequest;
use sbe_core::desired::ReportRequest;

use super::AppState;
use super::auth::DeviceIdentity;
use super::error::ApiError;

use crate::metrics;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub tenant_id: TenantId,
    /// Device-proposed id; generated when absent.
    pub device_id: Option<DeviceId>,
    pub token: String,
    pub name: String,
    #[serde(default)]
    pub metadata: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub device_id: DeviceId,
    pub registration_status: String,
}

/// `POST /api/devices/register` - the registration token is the credential.
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.limiter.check(body.tenant_id, state.clock.now())?;
    let device = state.credentials.register_device(RegisterDeviceRequest {
        tenant_id: body.tenant_id,
        device_id: body.device_id.unwrap_or_else(DeviceId::generate),
        token_plaintext: body.token,
        name: body.name,
        metadata: body.metadata,
    })?;
    metrics::HTTP_REQUESTS.with_label_values(&["ok"]).inc();
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            device_id: device.device_id,
            registration_status: "pending".into(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatBody {
    /// Sample time; defaults to the server clock.
    pub at: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub ip_address: Option<String>,
    #[serde(default)]
    pub extras: Option<serde_json::Value>,
}

/// `POST /api/devices/{id}/heartbeat`
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
    identity: DeviceIdentity,
    Json(body): Json<HeartbeatBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_self(&identity, id)?;
    state.ingest.post_heartbeat(DeviceHeartbeat {
        device_id: id,
        at: body.at.unwrap_or_else(|| state.clock.now()),
        status: body.status,
        ip_address: body.ip_address,
        extras: body.extras,
    })?;
    metrics::HEARTBEATS_INGESTED.inc();
    metrics::HTTP_REQUESTS.with_label_values(&["ok"]).inc();
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsBody {
    pub at: Option<DateTime<Utc>>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub uptime_seconds: u64,
    pub running_containers: u32,
    #[serde(default)]
    pub extras: Option<serde_json::Value>,
}

/// `POST /api/devices/{id}/metrics`
pub async fn metrics(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
    identity: DeviceIdentity,
    Json(body): Json<MetricsBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_self(&identity, id)?;
    state.ingest.post_metrics(DeviceMetrics {
        device_id: id,
        at: body.at.unwrap_or_else(|| state.clock.now()),
        cpu_percent: body.cpu_percent,
        memory_percent: body.memory_percent,
        disk_percent: body.disk_percent,
        uptime_seconds: body.uptime_seconds,
        running_containers: body.running_containers,
        extras: body.extras,
    })?;
    metrics::METRICS_INGESTED.inc();
    metrics::HTTP_REQUESTS.with_label_values(&["ok"]).inc();
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredStateView {
    pub bundle_id: BundleId,
    pub version: String,
    pub assigned_at: DateTime<Utc>,
    pub reason: String,
}

impl From<DesiredState> for DesiredStateView {
    fn from(state: DesiredState) -> Self {
        Self {
            bundle_id: state.bundle_id,
            version: state.version.to_string(),
            assigned_at: state.assigned_at,
            reason: state.reason,
        }
    }
}

/// `GET /api/devices/{id}/desired-state` - the agent's polling endpoint.
/// `null` means no bundle assigned.
pub async fn desired_state(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
    identity: DeviceIdentity,
) -> Result<impl IntoResponse, ApiError> {
    require_self(&identity, id)?;
    let desired = state.desired.get_desired_for(id)?;
    metrics::HTTP_REQUESTS.with_label_values(&["ok"]).inc();
    Ok(Json(desired.map(DesiredStateView::from)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportBody {
    pub bundle_id: BundleId,
    pub version: String,
    pub state: ReportState,
    pub error_message: Option<String>,
    pub at: Option<DateTime<Utc>>,
    pub rollout_id: Option<RolloutId>,
}

/// `POST /api/devices/{id}/state` - reported reconciliation status.
///
/// A stale report reads as success to the device: it cannot do anything
/// useful by retrying it.
pub async fn report_state(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
    identity: DeviceIdentity,
    Json(body): Json<ReportBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_self(&identity, id)?;
    let version = semver::Version::parse(&body.version).map_err(|e| {
        CoreError::new(ErrorCode::InvalidVersion, format!("bad version {:?}: {e}", body.version))
    })?;
    let result = state.desired.report(ReportRequest {
        device_id: id,
        bundle_id: body.bundle_id,
        version,
        state: body.state,
        error_message: body.error_message,
        at: body.at.unwrap_or_else(|| state.clock.now()),
        rollout_id: body.rollout_id,
    });
    match result {
        Ok(_) => {}
        Err(e) if e.code == ErrorCode::StaleReport => {
            tracing::debug!(device = %id, "stale report swallowed");
        }
        Err(e) => return Err(e.into()),
    }
    metrics::HTTP_REQUESTS.with_label_values(&["ok"]).inc();
    Ok(StatusCode::ACCEPTED)
}

/// A device may only act on its own path id.
fn require_self(identity: &DeviceIdentity, path_id: DeviceId) -> Result<(), ApiError> {
    if identity.0.device_id != path_id {
        return Err(CoreError::new(
            ErrorCode::TenantMismatch,
            "API key does not belong to the addressed device",
        )
        .into());
    }
    Ok(())
}
