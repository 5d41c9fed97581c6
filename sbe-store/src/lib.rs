//! SQLite storage layer for SignalBeam Edge.
//!
//! One logical database holds every entity. Each entity gets concrete query
//! functions in its own module, all taking a [`rusqlite::Connection`] so they
//! compose inside a transaction. The [`Store`] type owns the connection and
//! exposes the transactional seam; services never build SQL themselves.
//!
//! Time-series tables (heartbeats, metrics, health scores) are append-only
//! and indexed by `(device_id, at_ms)`; retention deletes in bounded batches.

pub mod alerts;
pub mod bundles;
pub mod codec;
pub mod credentials;
pub mod desired;
pub mod devices;
pub mod groups;
pub mod rollouts;
pub mod schema;
pub mod store;
pub mod telemetry;
pub mod tenants;

pub use store::{RolloutLocks, Store, StoreError};
