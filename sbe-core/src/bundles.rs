//! Bundle catalog: named container sets and their published versions.

use std::sync::Arc;

use tracing::info;

use sbe_common::bundle::{Bundle, BundleVersion, BundleVersionStatus, ContainerSpec};
use sbe_common::clock::Clock;
use sbe_common::error::{CoreError, ErrorCode};
use sbe_common::ids::{BundleId, TenantId};
use sbe_store::{Store, bundles};

use crate::storage_err;

#[derive(Debug, Clone)]
pub struct CreateVersionRequest {
    pub bundle_id: BundleId,
    pub version: semver::Version,
    pub containers: Vec<ContainerSpec>,
    pub release_notes: Option<String>,
    pub blob_uri: Option<String>,
    pub checksum: Option<String>,
    pub size_bytes: Option<u64>,
}

#[derive(Clone)]
pub struct BundleService {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl BundleService {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn create(&self, tenant_id: TenantId, name: &str) -> Result<Bundle, CoreError> {
        let bundle = Bundle {
            bundle_id: BundleId::generate(),
            tenant_id,
            name: name.to_string(),
            latest_version: None,
            created_at: self.clock.now(),
        };
        self.store.with_conn(|c| bundles::insert(c, &bundle)).map_err(storage_err)?;
        info!(bundle = %bundle.bundle_id, name, "bundle created");
        Ok(bundle)
    }

    pub fn get(&self, tenant_id: TenantId, bundle_id: BundleId) -> Result<Bundle, CoreError> {
        self.store
            .with_conn(|c| bundles::get_in_tenant(c, tenant_id, bundle_id))
            .map_err(storage_err)?
            .ok_or_else(|| CoreError::bundle_not_found(bundle_id))
    }

    pub fn list(&self, tenant_id: TenantId) -> Result<Vec<Bundle>, CoreError> {
        self.store.with_conn(|c| bundles::list_in_tenant(c, tenant_id)).map_err(storage_err)
    }

    /// Publish a new version. `(bundle, version)` is unique; the bundle's
    /// `latest_version` advances only when the new version sorts higher.
    pub fn create_version(
        &self,
        tenant_id: TenantId,
        req: CreateVersionRequest,
    ) -> Result<BundleVersion, CoreError> {
        let now = self.clock.now();
        let bundle = self.get(tenant_id, req.bundle_id)?;

        let version = BundleVersion {
            bundle_id: req.bundle_id,
            version: req.version.clone(),
            containers: req.containers,
            created_at: now,
            release_notes: req.release_notes,
            blob_uri: req.blob_uri,
            checksum: req.checksum,
            size_bytes: req.size_bytes,
            status: BundleVersionStatus::Published,
        };

        let result = self.store.with_tx(|tx| {
            if bundles::get_version(tx, req.bundle_id, &req.version)?.is_some() {
                return Ok(Err(CoreError::new(
                    ErrorCode::InvalidVersion,
                    format!("bundle already has version {}", req.version),
                )));
            }
            bundles::insert_version(tx, &version)?;
            if bundle.latest_version.as_ref().is_none_or(|latest| req.version > *latest) {
                bundles::set_latest_version(tx, req.bundle_id, &req.version)?;
            }
            Ok(Ok(()))
        });
        match result {
            Ok(Ok(())) => {
                info!(bundle = %req.bundle_id, version = %version.version, "bundle version published");
                Ok(version)
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(storage_err(e)),
        }
    }

    pub fn list_versions(
        &self,
        tenant_id: TenantId,
        bundle_id: BundleId,
    ) -> Result<Vec<BundleVersion>, CoreError> {
        self.get(tenant_id, bundle_id)?;
        self.store.with_conn(|c| bundles::list_versions(c, bundle_id)).map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sbe_common::clock::ManualClock;

    fn v(s: &str) -> semver::Version {
        semver::Version::parse(s).unwrap()
    }

    fn service() -> (BundleService, TenantId) {
        let store = Store::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_000, 0).unwrap()));
        (BundleService::new(store, clock), TenantId::generate())
    }

    fn version_req(bundle_id: BundleId, version: &str) -> CreateVersionRequest {
        CreateVersionRequest {
            bundle_id,
            version: v(version),
            containers: vec![],
            release_notes: None,
            blob_uri: None,
            checksum: None,
            size_bytes: None,
        }
    }

    #[test]
    fn latest_version_tracks_the_highest_published() {
        let (service, tenant) = service();
        let bundle = service.create(tenant, "stack").unwrap();

        service.create_version(tenant, version_req(bundle.bundle_id, "1.0.0")).unwrap();
        service.create_version(tenant, version_req(bundle.bundle_id, "2.0.0")).unwrap();
        // A backfilled older version does not regress `latest`.
        service.create_version(tenant, version_req(bundle.bundle_id, "1.5.0")).unwrap();

        let loaded = service.get(tenant, bundle.bundle_id).unwrap();
        assert_eq!(loaded.latest_version, Some(v("2.0.0")));
    }

    #[test]
    fn duplicate_version_is_refused() {
        let (service, tenant) = service();
        let bundle = service.create(tenant, "stack").unwrap();
        service.create_version(tenant, version_req(bundle.bundle_id, "1.0.0")).unwrap();
        let err =
            service.create_version(tenant, version_req(bundle.bundle_id, "1.0.0")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidVersion);
    }

    #[test]
    fn cross_tenant_bundle_is_not_found() {
        let (service, tenant) = service();
        let bundle = service.create(tenant, "stack").unwrap();
        let err = service.get(TenantId::generate(), bundle.bundle_id).unwrap_err();
        assert_eq!(err.code, ErrorCode::BundleNotFound);
    }
}
