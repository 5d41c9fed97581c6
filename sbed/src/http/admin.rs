//! Admin handlers: credentials, registry, bundles, rollouts, and alerts.
//!
//! Every handler is scoped to the tenant carried by [`AdminIdentity`];
//! cross-tenant ids read as not-found.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sbe_common::alert::AlertStatus;
use sbe_common::bundle::ContainerSpec;
use sbe_common::error::{CoreError, ErrorCode};
use sbe_common::ids::{AlertId, BundleId, DeviceId, GroupId, RolloutId};
use sbe_common::rollout::{EligibilityPolicy, PhaseTarget};
use sbe_common::tags::TagAtom;
use sbe_common::types::{Device, GroupType, RegistrationStatus};
use sbe_core::bundles::CreateVersionRequest;
use sbe_core::desired::AssignRequest;
use sbe_core::registry::DeviceFilter;
use sbe_core::rollout::{CreateRolloutRequest, PhaseSpec, RolloutSnapshot};

use super::AppState;
use super::auth::AdminIdentity;
use super::error::ApiError;

fn parse_version(raw: &str) -> Result<semver::Version, ApiError> {
    semver::Version::parse(raw)
        .map_err(|e| CoreError::new(ErrorCode::InvalidVersion, format!("bad version {raw:?}: {e}")).into())
}

// ---- Credentials -----------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueTokenBody {
    pub validity_days: i64,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueTokenResponse {
    /// Returned exactly once; only the hash survives.
    pub token: String,
    pub prefix: String,
    pub expires_at: DateTime<Utc>,
}

/// `POST /api/registration-tokens`
pub async fn issue_token(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Json(body): Json<IssueTokenBody>,
) -> Result<impl IntoResponse, ApiError> {
    let issued = state.credentials.issue_registration_token(
        admin.tenant_id,
        body.validity_days,
        body.description,
        &admin.actor,
    )?;
    Ok((
        StatusCode::CREATED,
        Json(IssueTokenResponse {
            token: issued.plaintext,
            prefix: issued.token.prefix,
            expires_at: issued.token.expires_at,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveBody {
    #[serde(default)]
    pub api_key_expiration_days: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveResponse {
    /// Present only when a key was minted (absent for idempotent repeats).
    pub api_key: Option<String>,
}

/// `POST /api/devices/{id}/approve`
pub async fn approve_device(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<DeviceId>,
    Json(body): Json<ApproveBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.get_device(admin.tenant_id, id)?;
    let issued = state.credentials.approve_device(id, body.api_key_expiration_days)?;
    Ok(Json(ApproveResponse { api_key: issued.map(|k| k.plaintext) }))
}

/// `POST /api/devices/{id}/reject`
pub async fn reject_device(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<DeviceId>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.get_device(admin.tenant_id, id)?;
    state.credentials.reject_device(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/devices/{id}/rotate-api-key`
pub async fn rotate_api_key(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<DeviceId>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.get_device(admin.tenant_id, id)?;
    let issued = state.credentials.rotate_api_key(id, None)?;
    Ok(Json(ApproveResponse { api_key: Some(issued.plaintext) }))
}

/// `POST /api/devices/{id}/revoke-api-key`
pub async fn revoke_api_key(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<DeviceId>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.get_device(admin.tenant_id, id)?;
    let revoked = state.credentials.revoke_api_keys(id)?;
    Ok(Json(serde_json::json!({ "revoked": revoked })))
}

// ---- Registry --------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListQuery {
    pub status: Option<RegistrationStatus>,
    pub tag_query: Option<String>,
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub device_id: DeviceId,
    pub name: String,
    pub registration_status: RegistrationStatus,
    pub online_status: sbe_common::types::OnlineStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub group_ids: Vec<GroupId>,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Device> for DeviceView {
    fn from(device: Device) -> Self {
        Self {
            device_id: device.device_id,
            name: device.name,
            registration_status: device.registration_status,
            online_status: device.online_status,
            last_seen_at: device.last_seen_at,
            tags: device.tags.iter().map(|t| t.to_string()).collect(),
            group_ids: device.group_ids,
            metadata: device.metadata,
            created_at: device.created_at,
        }
    }
}

/// `GET /api/devices` with status / tag-query / group filters.
pub async fn list_devices(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Query(query): Query<DeviceListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let devices = state.registry.list_devices(
        admin.tenant_id,
        &DeviceFilter {
            status: query.status,
            tag_query: query.tag_query,
            group_id: query.group_id,
            offset: query.offset,
            limit: query.limit,
        },
    )?;
    Ok(Json(devices.into_iter().map(DeviceView::from).collect::<Vec<_>>()))
}

/// `GET /api/devices/{id}`
pub async fn get_device(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<DeviceId>,
) -> Result<impl IntoResponse, ApiError> {
    let device = state.registry.get_device(admin.tenant_id, id)?;
    Ok(Json(DeviceView::from(device)))
}

/// `DELETE /api/devices/{id}` - admin-only removal.
pub async fn delete_device(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<DeviceId>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.delete_device(admin.tenant_id, id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct TagBody {
    pub tag: String,
}

/// `POST /api/devices/{id}/tags`
pub async fn add_tag(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<DeviceId>,
    Json(body): Json<TagBody>,
) -> Result<impl IntoResponse, ApiError> {
    let tag = TagAtom::parse(&body.tag)?;
    state.registry.add_tag(admin.tenant_id, id, &tag)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /api/devices/{id}/tags/{tag}`
pub async fn remove_tag(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path((id, tag)): Path<(DeviceId, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let tag = TagAtom::parse(&tag)?;
    state.registry.remove_tag(admin.tenant_id, id, &tag)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- Groups ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupBody {
    pub name: String,
    pub group_type: GroupType,
    #[serde(default)]
    pub tag_query: Option<String>,
}

/// `POST /api/groups`
pub async fn create_group(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Json(body): Json<CreateGroupBody>,
) -> Result<impl IntoResponse, ApiError> {
    let group =
        state.registry.create_group(admin.tenant_id, &body.name, body.group_type, body.tag_query)?;
    Ok((StatusCode::CREATED, Json(group)))
}

/// `GET /api/groups`
pub async fn list_groups(
    State(state): State<AppState>,
    admin: AdminIdentity,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.list_groups(admin.tenant_id)?))
}

/// `GET /api/groups/{id}/members`
pub async fn group_members(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<GroupId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.group_members(admin.tenant_id, id)?))
}

/// `POST /api/groups/{id}/members/{device_id}`
pub async fn add_group_member(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path((id, device_id)): Path<(GroupId, DeviceId)>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.assign_to_group(admin.tenant_id, id, device_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /api/groups/{id}/members/{device_id}`
pub async fn remove_group_member(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path((id, device_id)): Path<(GroupId, DeviceId)>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.remove_from_group(admin.tenant_id, id, device_id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- Bundles ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateBundleBody {
    pub name: String,
}

/// `POST /api/bundles`
pub async fn create_bundle(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Json(body): Json<CreateBundleBody>,
) -> Result<impl IntoResponse, ApiError> {
    let bundle = state.bundles.create(admin.tenant_id, &body.name)?;
    Ok((StatusCode::CREATED, Json(bundle)))
}

/// `GET /api/bundles`
pub async fn list_bundles(
    State(state): State<AppState>,
    admin: AdminIdentity,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.bundles.list(admin.tenant_id)?))
}

/// `GET /api/bundles/{id}`
pub async fn get_bundle(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<BundleId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.bundles.get(admin.tenant_id, id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVersionBody {
    pub version: String,
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub release_notes: Option<String>,
    #[serde(default)]
    pub blob_uri: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// `POST /api/bundles/{id}/versions`
pub async fn create_bundle_version(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<BundleId>,
    Json(body): Json<CreateVersionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let version = parse_version(&body.version)?;
    let created = state.bundles.create_version(
        admin.tenant_id,
        CreateVersionRequest {
            bundle_id: id,
            version,
            containers: body.containers,
            release_notes: body.release_notes,
            blob_uri: body.blob_uri,
            checksum: body.checksum,
            size_bytes: body.size_bytes,
        },
    )?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /api/bundles/{id}/versions`
pub async fn list_bundle_versions(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<BundleId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.bundles.list_versions(admin.tenant_id, id)?))
}

// ---- Desired state ---------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignBody {
    pub bundle_id: BundleId,
    pub version: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `POST /api/devices/{id}/desired-state` - explicit admin assignment.
pub async fn assign_desired_state(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<DeviceId>,
    Json(body): Json<AssignBody>,
) -> Result<impl IntoResponse, ApiError> {
    let version = parse_version(&body.version)?;
    let assigned = state.desired.assign(AssignRequest {
        tenant_id: admin.tenant_id,
        device_id: id,
        bundle_id: body.bundle_id,
        version,
        assigned_by: admin.actor,
        reason: body.reason.unwrap_or_else(|| "manual assignment".into()),
    })?;
    Ok(Json(assigned))
}

// ---- Rollouts --------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseBody {
    pub name: String,
    #[serde(default)]
    pub target_device_count: Option<u32>,
    #[serde(default)]
    pub target_percentage: Option<f64>,
    #[serde(default)]
    pub min_healthy_duration_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRolloutBody {
    pub bundle_id: BundleId,
    pub target_version: String,
    #[serde(default)]
    pub previous_version: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub phases: Vec<PhaseBody>,
    #[serde(default)]
    pub failure_threshold: Option<f64>,
    #[serde(default)]
    pub eligibility: EligibilityPolicy,
    #[serde(default)]
    pub target_device_group_id: Option<GroupId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutView {
    pub rollout: sbe_common::rollout::Rollout,
    pub phases: Vec<sbe_common::rollout::RolloutPhase>,
    pub assignments: Vec<sbe_common::rollout::RolloutDeviceAssignment>,
}

impl From<RolloutSnapshot> for RolloutView {
    fn from(snapshot: RolloutSnapshot) -> Self {
        Self {
            rollout: snapshot.rollout,
            phases: snapshot.phases,
            assignments: snapshot.assignments,
        }
    }
}

/// `POST /api/rollouts`
pub async fn create_rollout(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Json(body): Json<CreateRolloutBody>,
) -> Result<impl IntoResponse, ApiError> {
    let target_version = parse_version(&body.target_version)?;
    let previous_version = body.previous_version.as_deref().map(parse_version).transpose()?;

    let mut phases = Vec::with_capacity(body.phases.len());
    for phase in body.phases {
        let target = match (phase.target_device_count, phase.target_percentage) {
            (Some(count), None) => PhaseTarget::DeviceCount(count),
            (None, Some(pct)) => PhaseTarget::Percentage(pct),
            _ => {
                return Err(CoreError::new(
                    ErrorCode::InvalidRolloutSpec,
                    "each phase takes exactly one of targetDeviceCount or targetPercentage",
                )
                .into());
            }
        };
        phases.push(PhaseSpec {
            name: phase.name,
            target,
            min_healthy_duration_secs: phase.min_healthy_duration_secs,
        });
    }

    let snapshot = state.rollouts.create(CreateRolloutRequest {
        tenant_id: admin.tenant_id,
        bundle_id: body.bundle_id,
        target_version,
        previous_version,
        name: body.name,
        description: body.description,
        phases,
        failure_threshold: body.failure_threshold,
        eligibility: body.eligibility,
        target_group_id: body.target_device_group_id,
        created_by: admin.actor,
    })?;
    Ok((StatusCode::CREATED, Json(RolloutView::from(snapshot))))
}

/// `GET /api/rollouts`
pub async fn list_rollouts(
    State(state): State<AppState>,
    admin: AdminIdentity,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.rollouts.list(admin.tenant_id)?))
}

fn tenant_scoped_snapshot(
    state: &AppState,
    admin: &AdminIdentity,
    id: RolloutId,
) -> Result<RolloutSnapshot, ApiError> {
    let snapshot = state.rollouts.snapshot(id)?;
    if snapshot.rollout.tenant_id != admin.tenant_id {
        return Err(CoreError::rollout_not_found(id).into());
    }
    Ok(snapshot)
}

/// `GET /api/rollouts/{id}`
pub async fn get_rollout(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<RolloutId>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = tenant_scoped_snapshot(&state, &admin, id)?;
    Ok(Json(RolloutView::from(snapshot)))
}

macro_rules! rollout_verb {
    ($(#[$meta:meta])* $name:ident, $method:ident) => {
        $(#[$meta])*
        pub async fn $name(
            State(state): State<AppState>,
            admin: AdminIdentity,
            Path(id): Path<RolloutId>,
        ) -> Result<impl IntoResponse, ApiError> {
            tenant_scoped_snapshot(&state, &admin, id)?;
            let snapshot = state.rollouts.$method(id)?;
            Ok(Json(RolloutView::from(snapshot)))
        }
    };
}

rollout_verb!(
    /// `POST /api/rollouts/{id}/start`
    start_rollout,
    start
);
rollout_verb!(
    /// `POST /api/rollouts/{id}/pause`
    pause_rollout,
    pause
);
rollout_verb!(
    /// `POST /api/rollouts/{id}/resume`
    resume_rollout,
    resume
);
rollout_verb!(
    /// `POST /api/rollouts/{id}/rollback`
    rollback_rollout,
    rollback
);
rollout_verb!(
    /// `POST /api/rollouts/{id}/advance`
    advance_rollout,
    advance
);

// ---- Alerts ----------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct AlertListQuery {
    pub status: Option<AlertStatus>,
}

/// `GET /api/alerts`
pub async fn list_alerts(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Query(query): Query<AlertListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.alerts.list(admin.tenant_id, query.status)?))
}

/// `POST /api/alerts/{id}/acknowledge`
pub async fn acknowledge_alert(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<AlertId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.alerts.acknowledge(admin.tenant_id, id, &admin.actor)?))
}

/// `POST /api/alerts/{id}/resolve`
pub async fn resolve_alert(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Path(id): Path<AlertId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.alerts.resolve(admin.tenant_id, id)?))
}
