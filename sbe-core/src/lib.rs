//! Control-plane services for SignalBeam Edge.
//!
//! Each module owns one subsystem:
//!
//! - [`bundles`] — the bundle catalog and version publication
//! - [`credentials`] — registration tokens, device API keys, audit ledger
//! - [`registry`] — devices, tags, static and dynamic groups
//! - [`ingest`] — heartbeat/metric ingestion, offline detection, retention
//! - [`health`] — periodic 0-100 health scoring
//! - [`desired`] — desired-state assignments and the reported-status ledger
//! - [`rollout`] — the phased rollout engine
//! - [`alerts`] — rule evaluation, deduplication, auto-resolution
//! - [`quota`] — the tenant device-quota gate
//! - [`ratelimit`] — per-tenant token buckets for inbound requests
//! - [`events`] — best-effort outbound event bus
//!
//! Services are cheap to clone and share the [`sbe_store::Store`] plus the
//! clock/secret seams from `sbe-common`, so tests drive them with manual
//! clocks and fixed secrets.

pub mod alerts;
pub mod bundles;
pub mod credentials;
pub mod desired;
pub mod events;
pub mod health;
pub mod ingest;
pub mod quota;
pub mod ratelimit;
pub mod registry;
pub mod rollout;

pub use alerts::AlertEngine;
pub use bundles::BundleService;
pub use credentials::CredentialService;
pub use desired::DesiredStateService;
pub use events::EventBus;
pub use health::HealthScorer;
pub use ingest::IngestService;
pub use quota::{QuotaDecision, QuotaGate, TenantStoreQuotaGate};
pub use ratelimit::TenantRateLimiter;
pub use registry::RegistryService;
pub use rollout::RolloutEngine;

use sbe_common::error::CoreError;
use sbe_store::StoreError;

/// Map a storage failure onto the retriable `STORAGE_UNAVAILABLE` code.
pub(crate) fn storage_err(err: StoreError) -> CoreError {
    CoreError::storage(err)
}
