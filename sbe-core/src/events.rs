//! Best-effort outbound event bus.
//!
//! Events fan out over a broadcast channel as JSON lines carrying a subject
//! in the `signalbeam.*` namespace. Delivery to external consumers is
//! at-least-once at best and never blocks the emitting operation; consumers
//! must tolerate duplicates and out-of-order delivery.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

/// Subject for device lifecycle events (`registered`, `approved`, ...).
pub fn device_event_subject(event: &str) -> String {
    format!("signalbeam.devices.events.{event}")
}

/// Subject for heartbeat batches.
pub const HEARTBEAT_SUBJECT: &str = "signalbeam.devices.heartbeat.v1";

/// Subject for metric batches.
pub const METRICS_SUBJECT: &str = "signalbeam.telemetry.metrics.v1";

/// Broadcast channel for outbound events (JSON lines).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// Create a new bus; the buffer is clamped to at least `DEFAULT_BUFFER`
    /// so bursty emitters do not immediately lag slow consumers.
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(DEFAULT_BUFFER));
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Emit a structured event on a subject. Fire-and-forget: serialization
    /// failures are logged, send failures (no subscribers) are ignored.
    pub fn emit<T: Serialize>(&self, subject: &str, at: DateTime<Utc>, data: &T) {
        let payload = json!({
            "subject": subject,
            "data": data,
            "timestamp": at.to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!("failed to serialize event on {}: {}", subject, err),
        }
    }
}
