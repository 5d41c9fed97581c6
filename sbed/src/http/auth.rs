//! Request authentication extractors.
//!
//! Devices authenticate with `X-API-Key: <plaintext>`; every validation is
//! audited by the credential store and rate-limited per tenant. Humans carry
//! `Authorization: Bearer <token>`, checked against the configured admin
//! token (the external identity service owns real user auth; the static
//! token is its stand-in) plus an `X-Tenant-Id` scope header.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use sbe_common::error::{CoreError, ErrorCode};
use sbe_common::ids::TenantId;
use sbe_core::credentials::ValidatedDevice;

use super::AppState;
use super::error::ApiError;

const API_KEY_HEADER: &str = "x-api-key";
const TENANT_HEADER: &str = "x-tenant-id";
const ACTOR_HEADER: &str = "x-actor";

/// An authenticated device request.
#[derive(Debug, Clone)]
pub struct DeviceIdentity(pub ValidatedDevice);

impl FromRequestParts<AppState> for DeviceIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(CoreError::invalid_api_key)?;

        let ip = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string());
        let user_agent = parts
            .headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let validated =
            state.credentials.validate_key(key, ip.as_deref(), user_agent.as_deref())?;
        state.limiter.check(validated.tenant_id, state.clock.now())?;
        Ok(Self(validated))
    }
}

/// An authenticated admin request scoped to one tenant.
#[derive(Debug, Clone)]
pub struct AdminIdentity {
    pub tenant_id: TenantId,
    pub actor: String,
}

impl FromRequestParts<AppState> for AdminIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(expected) = &state.config.admin_token {
            let presented = parts
                .headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "));
            if presented != Some(expected.as_str()) {
                return Err(CoreError::new(
                    ErrorCode::InvalidApiKey,
                    "missing or invalid admin bearer token",
                )
                .into());
            }
        }

        let tenant_id: TenantId = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                CoreError::new(ErrorCode::TenantMismatch, "missing or malformed X-Tenant-Id header")
            })?;

        let actor = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("admin")
            .to_string();

        Ok(Self { tenant_id, actor })
    }
}
