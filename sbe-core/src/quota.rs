//! Tenant device-quota gate.
//!
//! One idempotent, side-effect-free check consulted inline during device
//! registration. The in-process implementation reads the local tenant
//! records; an HTTP implementation against the identity service satisfies
//! the same trait.

use sbe_common::error::{CoreError, ErrorCode};
use sbe_common::ids::TenantId;
use sbe_store::{Store, devices, tenants};

use crate::storage_err;

/// Outcome of a quota check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Ok,
    QuotaExceeded { current: u32, max: u32 },
}

pub trait QuotaGate: Send + Sync {
    /// May this tenant register one more device?
    fn check_device_quota(&self, tenant_id: TenantId) -> Result<QuotaDecision, CoreError>;
}

/// Quota gate backed by the local tenant store.
#[derive(Clone)]
pub struct TenantStoreQuotaGate {
    store: Store,
}

impl TenantStoreQuotaGate {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl QuotaGate for TenantStoreQuotaGate {
    fn check_device_quota(&self, tenant_id: TenantId) -> Result<QuotaDecision, CoreError> {
        let (tenant, current) = self
            .store
            .with_conn(|c| {
                let tenant = tenants::get(c, tenant_id)?;
                let current = devices::count_in_tenant(c, tenant_id)?;
                Ok((tenant, current))
            })
            .map_err(storage_err)?;

        let tenant = tenant.ok_or_else(|| {
            CoreError::new(ErrorCode::TenantMismatch, format!("unknown tenant {tenant_id}"))
        })?;

        if current >= tenant.max_devices {
            Ok(QuotaDecision::QuotaExceeded { current, max: tenant.max_devices })
        } else {
            Ok(QuotaDecision::Ok)
        }
    }
}
