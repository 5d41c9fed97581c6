//! Daemon configuration.
//!
//! Loaded from an optional TOML file, then overridden by `SBE_*` environment
//! variables. Every key is optional; defaults follow the operational
//! parameters the control plane documents.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Address the HTTP API binds to.
    pub listen_addr: String,
    /// Path to the SQLite database file. `:memory:` for ephemeral runs.
    pub database_path: String,
    /// Log filter (tracing `EnvFilter` syntax).
    pub log_level: String,
    /// Static admin bearer token; the external identity service replaces
    /// this in production deployments.
    pub admin_token: Option<String>,

    // Liveness
    pub offline_threshold_seconds: u64,
    pub offline_check_interval_seconds: u64,
    pub max_clock_skew_minutes: u64,

    // Health scoring
    pub health_score_interval_seconds: u64,

    // Rollouts
    pub rollout_check_interval_seconds: u64,
    pub rollout_max_concurrent: usize,
    pub rollout_default_min_healthy_minutes: u64,
    pub rollout_default_failure_threshold: f64,
    pub rollout_max_retries: u32,

    // Alerts
    pub alert_tick_interval_seconds: u64,
    pub alert_error_rate_window_minutes: u64,
    pub alert_error_rate_threshold_pct: f64,

    // Credentials
    pub api_key_expiry_check_interval_hours: u64,
    pub api_key_warning_days: i64,
    pub api_key_default_expiration_days: i64,

    // Groups and retention
    pub group_sync_interval_seconds: u64,
    pub retention_sweep_interval_hours: u64,
    pub retention_delete_batch_size: usize,

    // Per-tenant rate limiting
    pub rate_limit_permits: u32,
    pub rate_limit_window_seconds: u64,
    pub rate_limit_queue_depth: u32,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            database_path: "signalbeam.db".to_string(),
            log_level: "info".to_string(),
            admin_token: None,
            offline_threshold_seconds: 120,
            offline_check_interval_seconds: 60,
            max_clock_skew_minutes: 5,
            health_score_interval_seconds: 300,
            rollout_check_interval_seconds: 30,
            rollout_max_concurrent: 10,
            rollout_default_min_healthy_minutes: 5,
            rollout_default_failure_threshold: 0.05,
            rollout_max_retries: 3,
            alert_tick_interval_seconds: 60,
            alert_error_rate_window_minutes: 15,
            alert_error_rate_threshold_pct: 10.0,
            api_key_expiry_check_interval_hours: 24,
            api_key_warning_days: 7,
            api_key_default_expiration_days: 90,
            group_sync_interval_seconds: 60,
            retention_sweep_interval_hours: 24,
            retention_delete_batch_size: 5_000,
            rate_limit_permits: 100,
            rate_limit_window_seconds: 60,
            rate_limit_queue_depth: 10,
        }
    }
}

impl EdgeConfig {
    /// Load from an optional TOML file, then apply `SBE_*` environment
    /// overrides from the process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", p.display()))?;
                toml::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", p.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(std::env::vars());
        config.validate()?;
        Ok(config)
    }

    /// Apply `SBE_*` overrides from the given variable set.
    ///
    /// Unknown variables are ignored; malformed values are logged and
    /// skipped, never fatal.
    pub fn apply_env_overrides(&mut self, vars: impl Iterator<Item = (String, String)>) {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix("SBE_") else { continue };
            match name {
                "LISTEN_ADDR" => self.listen_addr = value,
                "DATABASE_PATH" => self.database_path = value,
                "LOG_LEVEL" => self.log_level = value,
                "ADMIN_TOKEN" => self.admin_token = Some(value),
                "OFFLINE_THRESHOLD_SECONDS" => parse_into(&mut self.offline_threshold_seconds, name, &value),
                "OFFLINE_CHECK_INTERVAL_SECONDS" => parse_into(&mut self.offline_check_interval_seconds, name, &value),
                "MAX_CLOCK_SKEW_MINUTES" => parse_into(&mut self.max_clock_skew_minutes, name, &value),
                "HEALTH_SCORE_INTERVAL_SECONDS" => parse_into(&mut self.health_score_interval_seconds, name, &value),
                "ROLLOUT_CHECK_INTERVAL_SECONDS" => parse_into(&mut self.rollout_check_interval_seconds, name, &value),
                "ROLLOUT_MAX_CONCURRENT" => parse_into(&mut self.rollout_max_concurrent, name, &value),
                "ROLLOUT_DEFAULT_MIN_HEALTHY_MINUTES" => parse_into(&mut self.rollout_default_min_healthy_minutes, name, &value),
                "ROLLOUT_DEFAULT_FAILURE_THRESHOLD" => parse_into(&mut self.rollout_default_failure_threshold, name, &value),
                "ROLLOUT_MAX_RETRIES" => parse_into(&mut self.rollout_max_retries, name, &value),
                "ALERT_TICK_INTERVAL_SECONDS" => parse_into(&mut self.alert_tick_interval_seconds, name, &value),
                "ALERT_ERROR_RATE_WINDOW_MINUTES" => parse_into(&mut self.alert_error_rate_window_minutes, name, &value),
                "ALERT_ERROR_RATE_THRESHOLD_PCT" => parse_into(&mut self.alert_error_rate_threshold_pct, name, &value),
                "API_KEY_EXPIRY_CHECK_INTERVAL_HOURS" => parse_into(&mut self.api_key_expiry_check_interval_hours, name, &value),
                "API_KEY_WARNING_DAYS" => parse_into(&mut self.api_key_warning_days, name, &value),
                "API_KEY_DEFAULT_EXPIRATION_DAYS" => parse_into(&mut self.api_key_default_expiration_days, name, &value),
                "GROUP_SYNC_INTERVAL_SECONDS" => parse_into(&mut self.group_sync_interval_seconds, name, &value),
                "RETENTION_SWEEP_INTERVAL_HOURS" => parse_into(&mut self.retention_sweep_interval_hours, name, &value),
                "RETENTION_DELETE_BATCH_SIZE" => parse_into(&mut self.retention_delete_batch_size, name, &value),
                "RATE_LIMIT_PERMITS" => parse_into(&mut self.rate_limit_permits, name, &value),
                "RATE_LIMIT_WINDOW_SECONDS" => parse_into(&mut self.rate_limit_window_seconds, name, &value),
                "RATE_LIMIT_QUEUE_DEPTH" => parse_into(&mut self.rate_limit_queue_depth, name, &value),
                _ => {}
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.rollout_default_failure_threshold) {
            anyhow::bail!(
                "rollout_default_failure_threshold must be in [0, 1], got {}",
                self.rollout_default_failure_threshold
            );
        }
        if self.rollout_max_concurrent == 0 {
            anyhow::bail!("rollout_max_concurrent must be at least 1");
        }
        if self.rate_limit_window_seconds == 0 {
            anyhow::bail!("rate_limit_window_seconds must be at least 1");
        }
        Ok(())
    }

    pub fn offline_threshold(&self) -> Duration {
        Duration::from_secs(self.offline_threshold_seconds)
    }

    pub fn rollout_default_min_healthy(&self) -> Duration {
        Duration::from_secs(self.rollout_default_min_healthy_minutes * 60)
    }
}

fn parse_into<T: std::str::FromStr>(slot: &mut T, name: &str, value: &str) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!("ignoring malformed SBE_{} value {:?}", name, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EdgeConfig::default();
        assert_eq!(config.offline_threshold_seconds, 120);
        assert_eq!(config.offline_check_interval_seconds, 60);
        assert_eq!(config.health_score_interval_seconds, 300);
        assert_eq!(config.rollout_check_interval_seconds, 30);
        assert_eq!(config.rollout_max_concurrent, 10);
        assert_eq!(config.rollout_default_min_healthy_minutes, 5);
        assert_eq!(config.rollout_default_failure_threshold, 0.05);
        assert_eq!(config.rollout_max_retries, 3);
        assert_eq!(config.alert_tick_interval_seconds, 60);
        assert_eq!(config.api_key_expiry_check_interval_hours, 24);
        assert_eq!(config.api_key_warning_days, 7);
        assert_eq!(config.rate_limit_permits, 100);
        assert_eq!(config.rate_limit_window_seconds, 60);
        assert_eq!(config.rate_limit_queue_depth, 10);
        assert_eq!(config.max_clock_skew_minutes, 5);
    }

    #[test]
    fn toml_round_trip_with_partial_file() {
        let raw = r#"
            listen_addr = "127.0.0.1:9090"
            rollout_check_interval_seconds = 5
        "#;
        let config: EdgeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9090");
        assert_eq!(config.rollout_check_interval_seconds, 5);
        // Unspecified keys keep their defaults.
        assert_eq!(config.offline_threshold_seconds, 120);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = EdgeConfig::default();
        let vars = vec![
            ("SBE_OFFLINE_THRESHOLD_SECONDS".to_string(), "300".to_string()),
            ("SBE_ROLLOUT_DEFAULT_FAILURE_THRESHOLD".to_string(), "0.1".to_string()),
            ("SBE_LISTEN_ADDR".to_string(), "0.0.0.0:9999".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        config.apply_env_overrides(vars.into_iter());
        assert_eq!(config.offline_threshold_seconds, 300);
        assert_eq!(config.rollout_default_failure_threshold, 0.1);
        assert_eq!(config.listen_addr, "0.0.0.0:9999");
    }

    #[test]
    fn malformed_env_value_is_skipped() {
        let mut config = EdgeConfig::default();
        config.apply_env_overrides(
            vec![("SBE_ROLLOUT_MAX_RETRIES".to_string(), "lots".to_string())].into_iter(),
        );
        assert_eq!(config.rollout_max_retries, 3);
    }

    #[test]
    fn validation_rejects_bad_threshold() {
        let config = EdgeConfig {
            rollout_default_failure_threshold: 1.5,
            ..EdgeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
