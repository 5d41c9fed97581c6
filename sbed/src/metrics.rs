//! Prometheus metrics for the daemon.
//!
//! All metrics live in one registry and are exported in text format at
//! `/metrics`.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder, opts, register_int_counter_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_with_registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// HTTP requests by outcome class.
    pub static ref HTTP_REQUESTS: IntCounterVec = register_int_counter_vec_with_registry!(
        opts!("sbe_http_requests_total", "HTTP requests processed"),
        &["outcome"],
        REGISTRY
    )
    .expect("metric registration");

    pub static ref HEARTBEATS_INGESTED: IntCounter = register_int_counter_with_registry!(
        opts!("sbe_heartbeats_ingested_total", "Heartbeat samples accepted"),
        REGISTRY
    )
    .expect("metric registration");

    pub static ref METRICS_INGESTED: IntCounter = register_int_counter_with_registry!(
        opts!("sbe_metrics_ingested_total", "Metric samples accepted"),
        REGISTRY
    )
    .expect("metric registration");

    pub static ref ROLLOUT_TICKS: IntCounter = register_int_counter_with_registry!(
        opts!("sbe_rollout_ticks_total", "Rollout tick iterations"),
        REGISTRY
    )
    .expect("metric registration");

    pub static ref ROLLOUT_TICKS_SKIPPED: IntCounter = register_int_counter_with_registry!(
        opts!("sbe_rollout_ticks_skipped_total", "Rollout tick iterations dropped by backpressure"),
        REGISTRY
    )
    .expect("metric registration");

    pub static ref ALERTS_RAISED: IntCounter = register_int_counter_with_registry!(
        opts!("sbe_alerts_raised_total", "Alerts raised by the rule engine"),
        REGISTRY
    )
    .expect("metric registration");

    pub static ref DEVICES_OFFLINE_TRANSITIONS: IntCounter = register_int_counter_with_registry!(
        opts!("sbe_devices_offline_transitions_total", "Online -> Offline transitions"),
        REGISTRY
    )
    .expect("metric registration");

    pub static ref WORKER_ITERATIONS: IntCounterVec = register_int_counter_vec_with_registry!(
        opts!("sbe_worker_iterations_total", "Periodic worker iterations by worker and outcome"),
        &["worker", "outcome"],
        REGISTRY
    )
    .expect("metric registration");

    pub static ref RATE_LIMITED: IntCounter = register_int_counter_with_registry!(
        opts!("sbe_rate_limited_total", "Requests refused by the tenant rate limiter"),
        REGISTRY
    )
    .expect("metric registration");

    pub static ref BUILD_INFO: IntGauge = register_int_gauge_with_registry!(
        opts!("sbe_build_info", "Constant 1, labeled build marker"),
        REGISTRY
    )
    .expect("metric registration");
}

/// Encode the registry in Prometheus text format.
pub fn encode() -> Result<String, prometheus::Error> {
    BUILD_INFO.set(1);
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
