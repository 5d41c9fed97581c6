//! SignalBeam Edge - control-plane daemon.
//!
//! Hosts the HTTP API and the periodic workers that drive the fleet:
//! offline detection, health scoring, rollout ticks, alert evaluation,
//! dynamic-group sync, telemetry retention, and API-key expiry sweeps.

#![forbid(unsafe_code)]

mod http;
mod metrics;
mod workers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use sbe_common::clock::{Clock, SystemClock, SystemSecrets};
use sbe_common::config::EdgeConfig;
use sbe_core::alerts::{AlertConfig, AlertEngine};
use sbe_core::bundles::BundleService;
use sbe_core::credentials::{CredentialConfig, CredentialService};
use sbe_core::desired::DesiredStateService;
use sbe_core::events::EventBus;
use sbe_core::health::HealthScorer;
use sbe_core::ingest::{IngestConfig, IngestService};
use sbe_core::quota::TenantStoreQuotaGate;
use sbe_core::ratelimit::TenantRateLimiter;
use sbe_core::registry::RegistryService;
use sbe_core::rollout::{RolloutConfig, RolloutEngine};
use sbe_store::Store;

use http::AppState;
use workers::{DRAIN_DEADLINE, WorkerSet};

#[derive(Parser)]
#[command(name = "sbed")]
#[command(author, version, about = "SignalBeam Edge - fleet control plane daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from config.
    #[arg(short, long)]
    listen: Option<String>,

    /// Override the database path from config.
    #[arg(short, long)]
    database: Option<String>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EdgeConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();

    info!(version = env!("CARGO_PKG_VERSION"), "sbed starting");

    let store = if config.database_path == ":memory:" {
        Store::open_in_memory()?
    } else {
        Store::open(std::path::Path::new(&config.database_path))?
    };
    info!(database = %config.database_path, "storage ready");

    let state = build_state(store, Arc::new(config));
    let workers = spawn_workers(&state);

    let listener = tokio::net::TcpListener::bind(&state.config.listen_addr).await?;
    info!(addr = %state.config.listen_addr, "HTTP API listening");
    let router = http::router(state);

    let serve = axum::serve(listener, router).with_graceful_shutdown(async {
        shutdown_signal().await;
    });

    if let Err(e) = serve.await {
        warn!("HTTP server exited with error: {e}");
    }

    info!("draining workers (up to {}s)", DRAIN_DEADLINE.as_secs());
    workers.shutdown(DRAIN_DEADLINE).await;
    info!("sbed stopped");
    Ok(())
}

/// Wire every service onto the shared store, clock, and event bus.
fn build_state(store: Store, config: Arc<EdgeConfig>) -> AppState {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let events = EventBus::default();
    let quota = Arc::new(TenantStoreQuotaGate::new(store.clone()));

    let credentials = CredentialService::new(
        store.clone(),
        clock.clone(),
        Arc::new(SystemSecrets),
        quota,
        events.clone(),
        CredentialConfig {
            default_key_expiration_days: config.api_key_default_expiration_days,
            ..CredentialConfig::default()
        },
    );
    let registry = RegistryService::new(store.clone(), clock.clone(), events.clone());
    let ingest = IngestService::new(
        store.clone(),
        clock.clone(),
        events.clone(),
        IngestConfig {
            max_clock_skew: Duration::from_secs(config.max_clock_skew_minutes * 60),
            offline_threshold: config.offline_threshold(),
            retention_batch: config.retention_delete_batch_size,
        },
    );
    let desired = DesiredStateService::new(store.clone(), clock.clone());
    let bundles = BundleService::new(store.clone(), clock.clone());
    let rollouts = RolloutEngine::new(
        store.clone(),
        clock.clone(),
        events.clone(),
        RolloutConfig {
            default_min_healthy: config.rollout_default_min_healthy(),
            default_failure_threshold: config.rollout_default_failure_threshold,
            max_retries: config.rollout_max_retries,
        },
    );
    let alerts = AlertEngine::new(
        store.clone(),
        clock.clone(),
        events.clone(),
        AlertConfig {
            error_rate_window_minutes: config.alert_error_rate_window_minutes,
            error_rate_threshold_pct: config.alert_error_rate_threshold_pct,
        },
    );
    let health = HealthScorer::new(store.clone(), clock.clone());
    let limiter = TenantRateLimiter::new(
        config.rate_limit_permits,
        Duration::from_secs(config.rate_limit_window_seconds),
        config.rate_limit_queue_depth,
    );

    AppState {
        config,
        store,
        clock,
        credentials,
        bundles,
        registry,
        ingest,
        desired,
        rollouts,
        alerts,
        health,
        limiter,
        started_at: Instant::now(),
        version: env!("CARGO_PKG_VERSION"),
    }
}

/// Start the periodic worker table.
fn spawn_workers(state: &AppState) -> WorkerSet {
    let config = &state.config;
    let mut set = WorkerSet::new();

    let ingest = state.ingest.clone();
    set.spawn(
        "offline_detector",
        Duration::from_secs(config.offline_check_interval_seconds),
        move || {
            let transitioned = ingest.offline_tick()?;
            metrics::DEVICES_OFFLINE_TRANSITIONS.inc_by(transitioned.len() as u64);
            Ok(format!("{} devices transitioned offline", transitioned.len()))
        },
    );

    let health = state.health.clone();
    set.spawn(
        "health_scorer",
        Duration::from_secs(config.health_score_interval_seconds),
        move || {
            let scores = health.score_tick()?;
            Ok(format!("scored {} devices", scores.len()))
        },
    );

    let rollouts = state.rollouts.clone();
    let in_flight = Arc::new(std::sync::Mutex::new(()));
    set.spawn(
        "rollout_tick",
        Duration::from_secs(config.rollout_check_interval_seconds),
        move || {
            // Backpressure: if the previous tick is still running, drop this
            // iteration and let the next period pick it up.
            let Ok(_guard) = in_flight.try_lock() else {
                metrics::ROLLOUT_TICKS_SKIPPED.inc();
                warn!("rollout tick still in flight, dropping this iteration");
                return Ok("skipped".into());
            };
            metrics::ROLLOUT_TICKS.inc();
            let outcomes = rollouts.tick()?;
            Ok(format!("processed {} rollouts", outcomes.len()))
        },
    );

    let alerts = state.alerts.clone();
    set.spawn(
        "alert_tick",
        Duration::from_secs(config.alert_tick_interval_seconds),
        move || {
            let stats = alerts.tick()?;
            metrics::ALERTS_RAISED.inc_by(stats.raised as u64);
            Ok(format!("raised {} resolved {}", stats.raised, stats.resolved))
        },
    );

    let registry = state.registry.clone();
    set.spawn(
        "dynamic_group_sync",
        Duration::from_secs(config.group_sync_interval_seconds),
        move || {
            let stats = registry.sync_dynamic_groups()?;
            Ok(format!(
                "{} groups, +{} -{} members",
                stats.groups_evaluated, stats.devices_added, stats.devices_removed
            ))
        },
    );

    let ingest = state.ingest.clone();
    set.spawn(
        "retention_sweeper",
        Duration::from_secs(config.retention_sweep_interval_hours * 3_600),
        move || {
            let stats = ingest.retention_sweep()?;
            Ok(format!(
                "deleted {} heartbeats, {} metric rows",
                stats.heartbeats_deleted, stats.metrics_deleted
            ))
        },
    );

    let credentials = state.credentials.clone();
    let warning_days = config.api_key_warning_days;
    set.spawn(
        "token_expiry",
        Duration::from_secs(config.api_key_expiry_check_interval_hours * 3_600),
        move || {
            let findings = credentials.expiry_sweep(warning_days)?;
            Ok(format!("{} keys expiring or expired", findings.len()))
        },
    );

    set
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
