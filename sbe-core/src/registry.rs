//! Device registry: devices, tags, and groups.
//!
//! All reads and writes are scoped to one tenant; a cross-tenant lookup
//! reads as `DEVICE_NOT_FOUND`. Tag filters and dynamic-group membership
//! both evaluate the parsed tag-query AST in memory against loaded tag sets.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use sbe_common::clock::Clock;
use sbe_common::error::{CoreError, ErrorCode};
use sbe_common::ids::{DeviceId, GroupId, TenantId};
use sbe_common::tags::{TagAtom, TagQuery};
use sbe_common::types::{Device, DeviceGroup, GroupType, RegistrationStatus};
use sbe_store::{Store, devices, groups};

use crate::events::{EventBus, device_event_subject};
use crate::storage_err;

/// Filters for the device list endpoint.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub status: Option<RegistrationStatus>,
    /// Tag-query string; parsed before use so bad input fails fast.
    pub tag_query: Option<String>,
    pub group_id: Option<GroupId>,
    pub offset: usize,
    /// Zero means no limit.
    pub limit: usize,
}

/// Result of one dynamic-group sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSyncStats {
    pub groups_evaluated: usize,
    pub devices_added: usize,
    pub devices_removed: usize,
}

#[derive(Clone)]
pub struct RegistryService {
    store: Store,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl RegistryService {
    pub fn new(store: Store, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self { store, clock, events }
    }

    pub fn get_device(&self, tenant_id: TenantId, device_id: DeviceId) -> Result<Device, CoreError> {
        self.store
            .with_conn(|c| devices::get_in_tenant(c, tenant_id, device_id))
            .map_err(storage_err)?
            .ok_or_else(|| CoreError::device_not_found(device_id))
    }

    /// List devices with optional status / tag-query / group filters.
    pub fn list_devices(
        &self,
        tenant_id: TenantId,
        filter: &DeviceFilter,
    ) -> Result<Vec<Device>, CoreError> {
        let query = filter
            .tag_query
            .as_deref()
            .map(TagQuery::parse)
            .transpose()?;

        let group_members: Option<BTreeSet<DeviceId>> = match filter.group_id {
            Some(group_id) => {
                let members = self
                    .store
                    .with_conn(|c| groups::members(c, group_id))
                    .map_err(storage_err)?;
                Some(members.into_iter().collect())
            }
            None => None,
        };

        let mut all = self
            .store
            .with_conn(|c| devices::list_in_tenant(c, tenant_id))
            .map_err(storage_err)?;

        all.retain(|device| {
            if let Some(status) = filter.status {
                if device.registration_status != status {
                    return false;
                }
            }
            if let Some(members) = &group_members {
                if !members.contains(&device.device_id) {
                    return false;
                }
            }
            if let Some(query) = &query {
                if !query.matches(&device.tags) {
                    return false;
                }
            }
            true
        });

        let page: Vec<Device> = if filter.limit == 0 {
            all.into_iter().skip(filter.offset).collect()
        } else {
            all.into_iter().skip(filter.offset).take(filter.limit).collect()
        };
        Ok(page)
    }

    pub fn update_device(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        name: &str,
        metadata: Option<&str>,
    ) -> Result<Device, CoreError> {
        self.get_device(tenant_id, device_id)?;
        self.store
            .with_conn(|c| devices::update_name_metadata(c, device_id, name, metadata))
            .map_err(storage_err)?;
        self.get_device(tenant_id, device_id)
    }

    /// Admin-only removal of a device and its tag/group rows.
    pub fn delete_device(&self, tenant_id: TenantId, device_id: DeviceId) -> Result<(), CoreError> {
        self.get_device(tenant_id, device_id)?;
        self.store
            .with_tx(|tx| devices::delete(tx, device_id))
            .map_err(storage_err)?;
        self.events.emit(
            &device_event_subject("deleted"),
            self.clock.now(),
            &serde_json::json!({ "deviceId": device_id }),
        );
        Ok(())
    }

    pub fn add_tag(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        tag: &TagAtom,
    ) -> Result<(), CoreError> {
        self.get_device(tenant_id, device_id)?;
        self.store
            .with_conn(|c| devices::add_tag(c, device_id, tag))
            .map_err(storage_err)
    }

    pub fn remove_tag(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        tag: &TagAtom,
    ) -> Result<bool, CoreError> {
        self.get_device(tenant_id, device_id)?;
        self.store
            .with_conn(|c| devices::remove_tag(c, device_id, tag))
            .map_err(storage_err)
    }

    /// Create a group. Dynamic groups require a parseable tag query.
    pub fn create_group(
        &self,
        tenant_id: TenantId,
        name: &str,
        group_type: GroupType,
        tag_query: Option<String>,
    ) -> Result<DeviceGroup, CoreError> {
        match (group_type, &tag_query) {
            (GroupType::Dynamic, Some(raw)) => {
                TagQuery::parse(raw)?;
            }
            (GroupType::Dynamic, None) => {
                return Err(CoreError::new(
                    ErrorCode::InvalidTagQuery,
                    "dynamic groups require a tag query",
                ));
            }
            (GroupType::Static, _) => {}
        }
        let group = DeviceGroup {
            group_id: GroupId::generate(),
            tenant_id,
            name: name.to_string(),
            group_type,
            tag_query: match group_type {
                GroupType::Dynamic => tag_query,
                GroupType::Static => None,
            },
            created_at: self.clock.now(),
        };
        self.store.with_conn(|c| groups::insert(c, &group)).map_err(storage_err)?;
        Ok(group)
    }

    pub fn get_group(&self, tenant_id: TenantId, group_id: GroupId) -> Result<DeviceGroup, CoreError> {
        self.store
            .with_conn(|c| groups::get(c, group_id))
            .map_err(storage_err)?
            .filter(|g| g.tenant_id == tenant_id)
            .ok_or_else(|| {
                CoreError::new(ErrorCode::GroupNotFound, format!("group {group_id} not found"))
            })
    }

    pub fn list_groups(&self, tenant_id: TenantId) -> Result<Vec<DeviceGroup>, CoreError> {
        self.store
            .with_conn(|c| groups::list_in_tenant(c, tenant_id))
            .map_err(storage_err)
    }

    pub fn group_members(
        &self,
        tenant_id: TenantId,
        group_id: GroupId,
    ) -> Result<Vec<DeviceId>, CoreError> {
        self.get_group(tenant_id, group_id)?;
        self.store.with_conn(|c| groups::members(c, group_id)).map_err(storage_err)
    }

    /// Add a device to a static group. Dynamic membership is computed, not
    /// assigned.
    pub fn assign_to_group(
        &self,
        tenant_id: TenantId,
        group_id: GroupId,
        device_id: DeviceId,
    ) -> Result<(), CoreError> {
        let group = self.get_group(tenant_id, group_id)?;
        if group.group_type == GroupType::Dynamic {
            return Err(CoreError::new(
                ErrorCode::ConcurrentModification,
                "membership of a dynamic group is computed from its tag query",
            ));
        }
        self.get_device(tenant_id, device_id)?;
        self.store
            .with_conn(|c| groups::add_member(c, group_id, device_id))
            .map_err(storage_err)
    }

    pub fn remove_from_group(
        &self,
        tenant_id: TenantId,
        group_id: GroupId,
        device_id: DeviceId,
    ) -> Result<bool, CoreError> {
        let group = self.get_group(tenant_id, group_id)?;
        if group.group_type == GroupType::Dynamic {
            return Err(CoreError::new(
                ErrorCode::ConcurrentModification,
                "membership of a dynamic group is computed from its tag query",
            ));
        }
        self.store
            .with_conn(|c| groups::remove_member(c, group_id, device_id))
            .map_err(storage_err)
    }

    /// Recompute membership of every dynamic group from current device tags,
    /// applying the minimum set of additions and removals. Running it twice
    /// with unchanged tags is a fixed point.
    pub fn sync_dynamic_groups(&self) -> Result<GroupSyncStats, CoreError> {
        let dynamic = self.store.with_conn(groups::list_dynamic).map_err(storage_err)?;
        let mut stats = GroupSyncStats::default();

        for group in dynamic {
            let Some(raw) = &group.tag_query else {
                warn!("dynamic group {} has no tag query, skipping", group.group_id);
                continue;
            };
            let query = match TagQuery::parse(raw) {
                Ok(q) => q,
                Err(e) => {
                    warn!("dynamic group {} has an invalid tag query: {e}", group.group_id);
                    continue;
                }
            };

            let result = self.store.with_tx(|tx| {
                let tenant_devices = devices::list_in_tenant(tx, group.tenant_id)?;
                let desired: BTreeSet<DeviceId> = tenant_devices
                    .iter()
                    .filter(|d| query.matches(&d.tags))
                    .map(|d| d.device_id)
                    .collect();
                let current: BTreeSet<DeviceId> =
                    groups::members(tx, group.group_id)?.into_iter().collect();

                let mut added: usize = 0;
                for device_id in desired.difference(&current) {
                    groups::add_member(tx, group.group_id, *device_id)?;
                    added += 1;
                }
                let mut removed: usize = 0;
                for device_id in current.difference(&desired) {
                    groups::remove_member(tx, group.group_id, *device_id)?;
                    removed += 1;
                }
                Ok((added, removed))
            });

            match result {
                Ok((added, removed)) => {
                    stats.groups_evaluated += 1;
                    stats.devices_added += added;
                    stats.devices_removed += removed;
                    if added + removed > 0 {
                        debug!(
                            group = %group.group_id,
                            added, removed, "dynamic group membership updated"
                        );
                    }
                }
                Err(e) => warn!("dynamic group {} sync failed: {e}", group.group_id),
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sbe_common::clock::ManualClock;
    use sbe_common::types::OnlineStatus;

    fn service() -> (Store, RegistryService, TenantId) {
        let store = Store::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_000, 0).unwrap()));
        let service = RegistryService::new(store.clone(), clock, EventBus::default());
        (store, service, TenantId::generate())
    }

    fn seed_device(store: &Store, tenant_id: TenantId, name: &str, tags: &[&str]) -> DeviceId {
        let device = Device {
            device_id: DeviceId::generate(),
            tenant_id,
            name: name.into(),
            metadata: None,
            registration_status: RegistrationStatus::Approved,
            online_status: OnlineStatus::Offline,
            last_seen_at: None,
            group_ids: Vec::new(),
            tags: tags.iter().map(|t| TagAtom::parse(t).unwrap()).collect(),
            created_at: Utc.timestamp_opt(500, 0).unwrap(),
        };
        store.with_conn(|c| devices::insert(c, &device)).unwrap();
        device.device_id
    }

    #[test]
    fn list_filters_by_status_and_tag_query() {
        let (store, service, tenant) = service();
        let prod = seed_device(&store, tenant, "a", &["env=production"]);
        let _staging = seed_device(&store, tenant, "b", &["env=staging"]);

        let found = service
            .list_devices(
                tenant,
                &DeviceFilter { tag_query: Some("env=prod*".into()), ..Default::default() },
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].device_id, prod);

        let err = service
            .list_devices(
                tenant,
                &DeviceFilter { tag_query: Some("env=(".into()), ..Default::default() },
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTagQuery);
    }

    #[test]
    fn list_paginates() {
        let (store, service, tenant) = service();
        for i in 0..5 {
            seed_device(&store, tenant, &format!("d{i}"), &[]);
        }
        let page = service
            .list_devices(tenant, &DeviceFilter { offset: 1, limit: 2, ..Default::default() })
            .unwrap();
        assert_eq!(page.len(), 2);
        let rest = service
            .list_devices(tenant, &DeviceFilter { offset: 4, limit: 10, ..Default::default() })
            .unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn cross_tenant_lookup_is_not_found() {
        let (store, service, tenant) = service();
        let device = seed_device(&store, tenant, "a", &[]);
        let err = service.get_device(TenantId::generate(), device).unwrap_err();
        assert_eq!(err.code, ErrorCode::DeviceNotFound);
    }

    #[test]
    fn static_group_membership_is_manual() {
        let (store, service, tenant) = service();
        let device = seed_device(&store, tenant, "a", &[]);
        let group = service.create_group(tenant, "rack-1", GroupType::Static, None).unwrap();

        service.assign_to_group(tenant, group.group_id, device).unwrap();
        assert_eq!(service.group_members(tenant, group.group_id).unwrap(), vec![device]);
        assert!(service.remove_from_group(tenant, group.group_id, device).unwrap());
    }

    #[test]
    fn dynamic_group_refuses_manual_membership() {
        let (store, service, tenant) = service();
        let device = seed_device(&store, tenant, "a", &["production"]);
        let group = service
            .create_group(tenant, "prod", GroupType::Dynamic, Some("production".into()))
            .unwrap();
        let err = service.assign_to_group(tenant, group.group_id, device).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConcurrentModification);
    }

    #[test]
    fn dynamic_group_requires_valid_query() {
        let (_store, service, tenant) = service();
        assert!(service.create_group(tenant, "g", GroupType::Dynamic, None).is_err());
        assert!(
            service
                .create_group(tenant, "g", GroupType::Dynamic, Some("((".into()))
                .is_err()
        );
    }

    #[test]
    fn dynamic_sync_reaches_fixed_point() {
        let (store, service, tenant) = service();
        let prod_a = seed_device(&store, tenant, "a", &["env=production"]);
        let prod_b = seed_device(&store, tenant, "b", &["env=production", "canary"]);
        let _staging = seed_device(&store, tenant, "c", &["env=staging"]);
        let group = service
            .create_group(tenant, "prod", GroupType::Dynamic, Some("env=production".into()))
            .unwrap();

        let stats = service.sync_dynamic_groups().unwrap();
        assert_eq!(stats.devices_added, 2);
        assert_eq!(stats.devices_removed, 0);
        let mut members = service.group_members(tenant, group.group_id).unwrap();
        members.sort();
        let mut expected = vec![prod_a, prod_b];
        expected.sort();
        assert_eq!(members, expected);

        // Fixed point: unchanged tags, no churn.
        let stats = service.sync_dynamic_groups().unwrap();
        assert_eq!(stats, GroupSyncStats { groups_evaluated: 1, devices_added: 0, devices_removed: 0 });

        // Tag changes flow through on the next pass.
        service
            .remove_tag(tenant, prod_b, &TagAtom::parse("env=production").unwrap())
            .unwrap();
        let stats = service.sync_dynamic_groups().unwrap();
        assert_eq!(stats.devices_removed, 1);
        assert_eq!(service.group_members(tenant, group.group_id).unwrap(), vec![prod_a]);
    }
}
