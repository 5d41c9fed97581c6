//! Per-tenant rate limiting for inbound requests.
//!
//! Token-bucket-per-window: each tenant gets `permits` requests per window
//! plus a small queue allowance absorbing bursts at the boundary. Beyond
//! that, requests are refused with `RATE_LIMIT_EXCEEDED` and a retry hint
//! equal to the remainder of the window.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sbe_common::error::{CoreError, ErrorCode};
use sbe_common::ids::TenantId;

#[derive(Debug, Clone, Copy)]
struct WindowState {
    window_start: DateTime<Utc>,
    used: u32,
}

/// Shared limiter; clones observe the same buckets.
#[derive(Clone)]
pub struct TenantRateLimiter {
    permits: u32,
    queue_depth: u32,
    window: Duration,
    buckets: Arc<Mutex<HashMap<TenantId, WindowState>>>,
}

impl TenantRateLimiter {
    pub fn new(permits: u32, window: Duration, queue_depth: u32) -> Self {
        Self {
            permits,
            queue_depth,
            window,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Admit or refuse one request for `tenant_id` at `now`.
    pub fn check(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<(), CoreError> {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::seconds(60));
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let state = buckets
            .entry(tenant_id)
            .or_insert(WindowState { window_start: now, used: 0 });

        if now - state.window_start >= window {
            state.window_start = now;
            state.used = 0;
        }

        let cap = self.permits + self.queue_depth;
        if state.used >= cap {
            let elapsed = now - state.window_start;
            let remaining = (window - elapsed).num_seconds().max(1) as u64;
            return Err(CoreError::new(
                ErrorCode::RateLimitExceeded,
                format!("tenant request budget exhausted, retry in {remaining}s"),
            )
            .with_retry_after(remaining));
        }
        state.used += 1;
        Ok(())
    }

    /// Drop buckets whose window has long passed. Called opportunistically
    /// so the map stays bounded by the set of recently active tenants.
    pub fn prune(&self, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::seconds(60));
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.retain(|_, state| now - state.window_start < window * 2);
    }
}
