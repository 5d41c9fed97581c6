//! HTTP control surface.
//!
//! Device-facing endpoints authenticate with `X-API-Key` and are rate
//! limited per tenant; admin endpoints sit behind the bearer-token seam.
//! Every failure renders the JSON error envelope from `sbe-common`.

pub mod admin;
pub mod auth;
pub mod device;
pub mod error;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;

use sbe_common::clock::Clock;
use sbe_common::config::EdgeConfig;
use sbe_core::alerts::AlertEngine;
use sbe_core::bundles::BundleService;
use sbe_core::credentials::CredentialService;
use sbe_core::desired::DesiredStateService;
use sbe_core::health::HealthScorer;
use sbe_core::ingest::IngestService;
use sbe_core::ratelimit::TenantRateLimiter;
use sbe_core::registry::RegistryService;
use sbe_core::rollout::RolloutEngine;
use sbe_store::Store;

use crate::metrics;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EdgeConfig>,
    pub store: Store,
    pub clock: Arc<dyn Clock>,
    pub credentials: CredentialService,
    pub bundles: BundleService,
    pub registry: RegistryService,
    pub ingest: IngestService,
    pub desired: DesiredStateService,
    pub rollouts: RolloutEngine,
    pub alerts: AlertEngine,
    pub health: HealthScorer,
    pub limiter: TenantRateLimiter,
    pub started_at: Instant,
    pub version: &'static str,
}

/// Build the full API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Device plane.
        .route("/api/devices/register", post(device::register))
        .route("/api/devices/{id}/heartbeat", post(device::heartbeat))
        .route("/api/devices/{id}/metrics", post(device::metrics))
        .route(
            "/api/devices/{id}/desired-state",
            get(device::desired_state).post(admin::assign_desired_state),
        )
        .route("/api/devices/{id}/state", post(device::report_state))
        // Admin plane: credentials and registry.
        .route("/api/registration-tokens", post(admin::issue_token))
        .route("/api/devices", get(admin::list_devices))
        .route("/api/devices/{id}", get(admin::get_device).delete(admin::delete_device))
        .route("/api/devices/{id}/approve", post(admin::approve_device))
        .route("/api/devices/{id}/reject", post(admin::reject_device))
        .route("/api/devices/{id}/rotate-api-key", post(admin::rotate_api_key))
        .route("/api/devices/{id}/revoke-api-key", post(admin::revoke_api_key))
        .route("/api/devices/{id}/tags", post(admin::add_tag))
        .route("/api/devices/{id}/tags/{tag}", delete(admin::remove_tag))
        // Groups.
        .route("/api/groups", get(admin::list_groups).post(admin::create_group))
        .route("/api/groups/{id}/members", get(admin::group_members))
        .route(
            "/api/groups/{id}/members/{device_id}",
            post(admin::add_group_member).delete(admin::remove_group_member),
        )
        // Bundles.
        .route("/api/bundles", get(admin::list_bundles).post(admin::create_bundle))
        .route("/api/bundles/{id}", get(admin::get_bundle))
        .route(
            "/api/bundles/{id}/versions",
            get(admin::list_bundle_versions).post(admin::create_bundle_version),
        )
        // Rollouts.
        .route("/api/rollouts", get(admin::list_rollouts).post(admin::create_rollout))
        .route("/api/rollouts/{id}", get(admin::get_rollout))
        .route("/api/rollouts/{id}/start", post(admin::start_rollout))
        .route("/api/rollouts/{id}/pause", post(admin::pause_rollout))
        .route("/api/rollouts/{id}/resume", post(admin::resume_rollout))
        .route("/api/rollouts/{id}/rollback", post(admin::rollback_rollout))
        .route("/api/rollouts/{id}/advance", post(admin::advance_rollout))
        // Alerts.
        .route("/api/alerts", get(admin::list_alerts))
        .route("/api/alerts/{id}/acknowledge", post(admin::acknowledge_alert))
        .route("/api/alerts/{id}/resolve", post(admin::resolve_alert))
        // Observability.
        .route("/health", get(health_handler))
        .route("/health/live", get(live_handler))
        .route("/health/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// `/health` - daemon identity and uptime.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": state.version,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// `/health/live` - process is running.
async fn live_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// `/health/ready` - storage answers queries.
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.with_conn(|c| c.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))) {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ready" }))).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "reason": e.to_string() })),
        )
            .into_response(),
    }
}

/// `/metrics` - Prometheus text export.
async fn metrics_handler() -> impl IntoResponse {
    match metrics::encode() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    use sbe_common::clock::{SystemClock, SystemSecrets};
    use sbe_common::ids::TenantId;
    use sbe_common::types::{Tenant, TenantTier};
    use sbe_core::credentials::CredentialConfig;
    use sbe_core::quota::TenantStoreQuotaGate;
    use sbe_core::events::EventBus;
    use sbe_core::ingest::IngestConfig;
    use sbe_core::rollout::RolloutConfig;
    use sbe_core::alerts::AlertConfig;
    use sbe_store::tenants;

    fn make_test_state() -> (AppState, TenantId) {
        let store = Store::open_in_memory().unwrap();
        let tenant = Tenant {
            tenant_id: TenantId::generate(),
            name: "acme".into(),
            max_devices: 10,
            data_retention_days: 30,
            tier: TenantTier::Paid,
        };
        store.with_conn(|c| tenants::upsert(c, &tenant)).unwrap();

        let config = Arc::new(EdgeConfig::default());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = EventBus::default();
        let quota = Arc::new(TenantStoreQuotaGate::new(store.clone()));
        let credentials = sbe_core::credentials::CredentialService::new(
            store.clone(),
            clock.clone(),
            Arc::new(SystemSecrets),
            quota,
            events.clone(),
            // Low KDF cost keeps hashing out of the test profile.
            CredentialConfig { kdf_cost: 4, default_key_expiration_days: 90 },
        );
        let state = AppState {
            config: config.clone(),
            store: store.clone(),
            clock: clock.clone(),
            credentials,
            bundles: BundleService::new(store.clone(), clock.clone()),
            registry: RegistryService::new(store.clone(), clock.clone(), events.clone()),
            ingest: IngestService::new(
                store.clone(),
                clock.clone(),
                events.clone(),
                IngestConfig::default(),
            ),
            desired: DesiredStateService::new(store.clone(), clock.clone()),
            rollouts: sbe_core::rollout::RolloutEngine::new(
                store.clone(),
                clock.clone(),
                events.clone(),
                RolloutConfig::default(),
            ),
            alerts: AlertEngine::new(store.clone(), clock.clone(), events, AlertConfig::default()),
            health: HealthScorer::new(store.clone(), clock.clone()),
            limiter: TenantRateLimiter::new(100, Duration::from_secs(60), 10),
            started_at: Instant::now(),
            version: "0.0.0-test",
        };
        (state, tenant.tenant_id)
    }

    async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn admin_post(tenant: TenantId, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-tenant-id", tenant.to_string())
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn device_post(key: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-api-key", key)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_and_metrics_endpoints() {
        let (state, _) = make_test_state();
        let router = router(state);

        let (status, body) = call(
            &router,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (status, _) = call(
            &router,
            Request::builder().uri("/health/ready").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn error_envelope_shape_on_not_found() {
        let (state, tenant) = make_test_state();
        let router = router(state);

        let (status, body) = call(
            &router,
            Request::builder()
                .uri(format!("/api/devices/{}", uuid::Uuid::new_v4()))
                .header("x-tenant-id", tenant.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "DEVICE_NOT_FOUND");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn device_auth_failure_is_401_with_envelope() {
        let (state, _) = make_test_state();
        let router = router(state);
        let id = uuid::Uuid::new_v4();

        let (status, body) = call(
            &router,
            device_post("sb_device_00000000_aaaaaaaaaaaaaaaaaaaaaa", &format!("/api/devices/{id}/heartbeat"), serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "INVALID_API_KEY");
    }

    #[tokio::test]
    async fn full_device_lifecycle_over_http() {
        let (state, tenant) = make_test_state();
        let router = router(state);

        // Admin mints a registration token.
        let (status, token_body) = call(
            &router,
            admin_post(tenant, "/api/registration-tokens", serde_json::json!({ "validityDays": 7 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let token = token_body["token"].as_str().unwrap().to_string();
        assert!(token.starts_with("sbt_"));

        // Device redeems it.
        let (status, reg_body) = call(
            &router,
            Request::builder()
                .method("POST")
                .uri("/api/devices/register")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "tenantId": tenant,
                        "token": token,
                        "name": "bench-gateway",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let device_id = reg_body["deviceId"].as_str().unwrap().to_string();

        // Admin approves; key plaintext is returned once.
        let (status, approve_body) = call(
            &router,
            admin_post(tenant, &format!("/api/devices/{device_id}/approve"), serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let api_key = approve_body["apiKey"].as_str().unwrap().to_string();
        assert!(api_key.starts_with("sb_device_"));

        // Heartbeat with the key.
        let (status, _) = call(
            &router,
            device_post(&api_key, &format!("/api/devices/{device_id}/heartbeat"), serde_json::json!({ "status": "ok" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        // Polling with no assignment yields null.
        let (status, body) = call(
            &router,
            Request::builder()
                .uri(format!("/api/devices/{device_id}/desired-state"))
                .header("x-api-key", &api_key)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_null());

        // Admin publishes a bundle version and assigns it.
        let (status, bundle_body) = call(
            &router,
            admin_post(tenant, "/api/bundles", serde_json::json!({ "name": "edge-stack" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let bundle_id = bundle_body["bundle_id"].as_str().unwrap().to_string();

        let (status, _) = call(
            &router,
            admin_post(
                tenant,
                &format!("/api/bundles/{bundle_id}/versions"),
                serde_json::json!({
                    "version": "1.0.0",
                    "containers": [{ "name": "web", "image": "registry.example/web:1.0.0" }],
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = call(
            &router,
            admin_post(
                tenant,
                &format!("/api/devices/{device_id}/desired-state"),
                serde_json::json!({ "bundleId": bundle_id, "version": "1.0.0" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // The agent now sees the assignment and reports completion.
        let (status, body) = call(
            &router,
            Request::builder()
                .uri(format!("/api/devices/{device_id}/desired-state"))
                .header("x-api-key", &api_key)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], "1.0.0");

        let (status, _) = call(
            &router,
            device_post(
                &api_key,
                &format!("/api/devices/{device_id}/state"),
                serde_json::json!({
                    "bundleId": bundle_id,
                    "version": "1.0.0",
                    "state": "completed",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn admin_requires_tenant_header() {
        let (state, _) = make_test_state();
        let router = router(state);
        let (status, body) = call(
            &router,
            Request::builder()
                .method("POST")
                .uri("/api/registration-tokens")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::json!({ "validityDays": 7 }).to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "TENANT_MISMATCH");
    }
}
