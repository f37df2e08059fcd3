// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory instance store.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use compute_api_types::{
    AttachStatus, CallContext, Instance, InstanceId, InstanceUpdate,
    PowerState, TaskState, Volume, VolumeId, VolumePlacement,
};
use serde::Deserialize;

use crate::collaborators::{InstanceStore, StoreError};

/// Records to preload into a [`MemoryStore`], typically read from the JSON
/// file named by the `store.seed` configuration option.
#[derive(Debug, Default, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub fixed_addresses: BTreeMap<InstanceId, IpAddr>,
}

#[derive(Default)]
struct StoreState {
    instances: BTreeMap<InstanceId, Instance>,
    volumes: BTreeMap<VolumeId, Volume>,
    fixed_addresses: BTreeMap<InstanceId, IpAddr>,
}

impl StoreState {
    fn instance_mut(
        &mut self,
        id: &InstanceId,
    ) -> Result<&mut Instance, StoreError> {
        self.instances.get_mut(id).ok_or_else(|| instance_not_found(id))
    }

    fn volume_mut(&mut self, id: &VolumeId) -> Result<&mut Volume, StoreError> {
        self.volumes.get_mut(id).ok_or_else(|| volume_not_found(id))
    }
}

fn instance_not_found(id: &InstanceId) -> StoreError {
    StoreError::NotFound { kind: "instance", id: id.to_string() }
}

fn volume_not_found(id: &VolumeId) -> StoreError {
    StoreError::NotFound { kind: "volume", id: id.to_string() }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: StoreSeed) -> Self {
        let store = Self::new();
        for instance in seed.instances {
            store.insert_instance(instance);
        }
        for volume in seed.volumes {
            store.insert_volume(volume);
        }
        store.state.lock().unwrap().fixed_addresses = seed.fixed_addresses;
        store
    }

    pub fn from_seed_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading store seed {}", path.display()))?;
        let seed: StoreSeed = serde_json::from_str(&contents)
            .with_context(|| format!("parsing store seed {}", path.display()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn insert_instance(&self, instance: Instance) {
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(instance.id.clone(), instance);
    }

    /// Adds a volume record. If the volume names an instance it is attached
    /// to, it is appended to that instance's volume list.
    pub fn insert_volume(&self, volume: Volume) {
        let mut state = self.state.lock().unwrap();
        if let Some(owner) = volume
            .instance_id
            .as_ref()
            .and_then(|id| state.instances.get_mut(id))
        {
            owner.volumes.retain(|v| v.id != volume.id);
            owner.volumes.push(volume.clone());
        }
        state.volumes.insert(volume.id.clone(), volume);
    }

    pub fn set_fixed_address(&self, instance_id: &InstanceId, addr: IpAddr) {
        self.state
            .lock()
            .unwrap()
            .fixed_addresses
            .insert(instance_id.clone(), addr);
    }

    /// Returns a snapshot of an instance record, with its volume list
    /// refreshed from the volume table.
    pub fn instance(&self, instance_id: &InstanceId) -> Option<Instance> {
        let state = self.state.lock().unwrap();
        let mut instance = state.instances.get(instance_id)?.clone();
        instance.volumes = instance
            .volumes
            .iter()
            .filter_map(|v| state.volumes.get(&v.id).cloned())
            .collect();
        Some(instance)
    }

    pub fn volume(&self, volume_id: &VolumeId) -> Option<Volume> {
        self.state.lock().unwrap().volumes.get(volume_id).cloned()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn instance_get(
        &self,
        _ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<Instance, StoreError> {
        self.instance(instance_id).ok_or_else(|| instance_not_found(instance_id))
    }

    async fn instance_update(
        &self,
        _ctx: &CallContext,
        instance_id: &InstanceId,
        update: InstanceUpdate,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let instance = state.instance_mut(instance_id)?;
        if let Some(host) = update.host {
            instance.host = Some(host);
        }
        if let Some(launched_at) = update.launched_at {
            instance.launched_at = Some(launched_at);
        }
        Ok(())
    }

    async fn instance_destroy(
        &self,
        _ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .instances
            .remove(instance_id)
            .map(|_| ())
            .ok_or_else(|| instance_not_found(instance_id))?;
        state.fixed_addresses.remove(instance_id);
        Ok(())
    }

    async fn instance_set_state(
        &self,
        _ctx: &CallContext,
        instance_id: &InstanceId,
        power_state: PowerState,
        task_state: Option<TaskState>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let instance = state.instance_mut(instance_id)?;
        instance.power_state = power_state;
        instance.task_state = task_state;
        Ok(())
    }

    async fn volume_get(
        &self,
        _ctx: &CallContext,
        volume_id: &VolumeId,
    ) -> Result<Volume, StoreError> {
        self.volume(volume_id).ok_or_else(|| volume_not_found(volume_id))
    }

    async fn volume_attached(
        &self,
        _ctx: &CallContext,
        volume_id: &VolumeId,
        instance_id: &InstanceId,
        mountpoint: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.instance_mut(instance_id)?;

        let volume = state.volume_mut(volume_id)?;
        volume.instance_id = Some(instance_id.clone());
        volume.mountpoint = Some(mountpoint.to_string());
        volume.attach_status = AttachStatus::Attached;
        let volume = volume.clone();

        let instance = state.instance_mut(instance_id)?;
        instance.volumes.retain(|v| v.id != *volume_id);
        instance.volumes.push(volume);
        Ok(())
    }

    async fn volume_detached(
        &self,
        _ctx: &CallContext,
        volume_id: &VolumeId,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let volume = state.volume_mut(volume_id)?;
        let owner = volume.instance_id.take();
        volume.mountpoint = None;
        volume.attach_status = AttachStatus::Detached;

        if let Some(instance) =
            owner.and_then(|id| state.instances.get_mut(&id))
        {
            instance.volumes.retain(|v| v.id != *volume_id);
        }
        Ok(())
    }

    async fn volumes_by_hostname(
        &self,
        _ctx: &CallContext,
        hostname: &str,
    ) -> Result<Vec<Volume>, StoreError> {
        let state = self.state.lock().unwrap();
        let volumes: Vec<Volume> = state
            .instances
            .values()
            .filter(|i| i.hostname == hostname)
            .flat_map(|i| i.volumes.iter())
            .filter_map(|v| state.volumes.get(&v.id).cloned())
            .collect();

        if volumes.is_empty() {
            return Err(StoreError::NotFound {
                kind: "volumes for instance",
                id: hostname.to_string(),
            });
        }
        Ok(volumes)
    }

    async fn volume_placement(
        &self,
        _ctx: &CallContext,
        volume_id: &VolumeId,
    ) -> Result<VolumePlacement, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .volumes
            .get(volume_id)
            .and_then(|v| v.placement)
            .ok_or_else(|| StoreError::NotFound {
                kind: "volume placement",
                id: volume_id.to_string(),
            })
    }

    async fn instance_fixed_address(
        &self,
        _ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<Option<IpAddr>, StoreError> {
        Ok(self.state.lock().unwrap().fixed_addresses.get(instance_id).copied())
    }

    async fn queue_get_for(
        &self,
        _ctx: &CallContext,
        topic: &str,
        host: &str,
    ) -> Result<String, StoreError> {
        Ok(format!("{}.{}", topic, host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CallContext {
        CallContext::new("test", None).elevated()
    }

    #[tokio::test]
    async fn attachment_is_reflected_on_the_instance() {
        let store = MemoryStore::new();
        let id = InstanceId::from("i-1");
        store.insert_instance(Instance::new("i-1", "i-1", "i-1"));
        store.insert_volume(Volume::new("v-1"));
        store.insert_volume(Volume::new("v-2"));

        store
            .volume_attached(&ctx(), &VolumeId::from("v-2"), &id, "/dev/vdc")
            .await
            .unwrap();
        store
            .volume_attached(&ctx(), &VolumeId::from("v-1"), &id, "/dev/vdb")
            .await
            .unwrap();

        let instance = store.instance_get(&ctx(), &id).await.unwrap();
        let ids: Vec<_> =
            instance.volumes.iter().map(|v| v.id.0.as_str()).collect();
        assert_eq!(ids, ["v-2", "v-1"]);
        assert_eq!(instance.volumes[1].mountpoint.as_deref(), Some("/dev/vdb"));

        store.volume_detached(&ctx(), &VolumeId::from("v-2")).await.unwrap();
        let instance = store.instance_get(&ctx(), &id).await.unwrap();
        assert_eq!(instance.volumes.len(), 1);
        let detached = store.volume(&VolumeId::from("v-2")).unwrap();
        assert_eq!(detached.attach_status, AttachStatus::Detached);
        assert!(detached.instance_id.is_none());
    }

    #[tokio::test]
    async fn volumes_by_hostname_reports_absence_as_not_found() {
        let store = MemoryStore::new();
        store.insert_instance(Instance::new("i-1", "i-1", "host-i-1"));
        let err =
            store.volumes_by_hostname(&ctx(), "host-i-1").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn seed_preloads_records() {
        let seed: StoreSeed = serde_json::from_str(
            r#"{
                "instances": [
                    {"id": "i-1", "name": "instance-1", "hostname": "i-1"}
                ],
                "volumes": [
                    {"id": "v-1", "instance_id": "i-1", "mountpoint": "/dev/vdb",
                     "attach_status": "attached",
                     "placement": {"shelf": 1, "slot": 4}}
                ],
                "fixed_addresses": {"i-1": "10.0.0.5"}
            }"#,
        )
        .unwrap();
        let store = MemoryStore::from_seed(seed);
        let id = InstanceId::from("i-1");

        let instance = store.instance_get(&ctx(), &id).await.unwrap();
        assert_eq!(instance.volumes.len(), 1);
        assert_eq!(
            store.volume_placement(&ctx(), &VolumeId::from("v-1")).await,
            Ok(VolumePlacement { shelf: 1, slot: 4 })
        );
        assert_eq!(
            store.instance_fixed_address(&ctx(), &id).await,
            Ok(Some("10.0.0.5".parse().unwrap()))
        );
    }
}
