// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the services a compute manager orchestrates.
//!
//! The manager never talks to a hypervisor, network, block storage, or
//! database directly. The process that hosts it selects an implementation of
//! each of these traits at startup and injects the set via [`Collaborators`].
//! They are traits (rather than concrete types) so that they can be mocked out
//! while testing the orchestration logic.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use compute_api_types::{
    CallContext, Instance, InstanceId, InstanceUpdate, PowerState, TaskState,
    Volume, VolumeId, VolumePlacement,
};
use thiserror::Error;

use crate::migrate::PeerRpc;

/// What the driver reports about a guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverInfo {
    pub state: PowerState,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DriverError {
    /// The hypervisor has no guest by this name.
    #[error("instance {0} not found by driver")]
    InstanceNotFound(String),

    #[error("{0}")]
    Failed(String),
}

/// The hypervisor abstraction performing actual guest operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Driver: Send + Sync {
    /// Names of the guests the hypervisor currently knows about.
    async fn list_instances(&self) -> Result<Vec<String>, DriverError>;

    async fn get_info(&self, name: &str) -> Result<DriverInfo, DriverError>;

    async fn spawn(&self, instance: &Instance) -> Result<(), DriverError>;

    async fn destroy(&self, instance: &Instance) -> Result<(), DriverError>;

    async fn reboot(&self, instance: &Instance) -> Result<(), DriverError>;

    async fn rescue(&self, instance: &Instance) -> Result<(), DriverError>;

    async fn unrescue(&self, instance: &Instance) -> Result<(), DriverError>;

    async fn attach_volume(
        &self,
        name: &str,
        device_path: &str,
        mountpoint: &str,
    ) -> Result<(), DriverError>;

    async fn detach_volume(
        &self,
        name: &str,
        mountpoint: &str,
    ) -> Result<(), DriverError>;

    async fn get_console_output(
        &self,
        instance: &Instance,
    ) -> Result<String, DriverError>;

    async fn refresh_security_group(
        &self,
        security_group_id: &str,
    ) -> Result<(), DriverError>;

    /// Installs the hypervisor-level network filters an instance needs before
    /// it can run on this host.
    async fn setup_nwfilters_for_instance(
        &self,
        instance: &Instance,
    ) -> Result<(), DriverError>;

    async fn nwfilter_for_instance_exists(
        &self,
        instance: &Instance,
    ) -> Result<bool, DriverError>;

    /// Moves a running guest to `dest`. Returns `false` if the hypervisor
    /// reports that the migration did not complete.
    async fn live_migration(
        &self,
        instance: &Instance,
        dest: &str,
    ) -> Result<bool, DriverError>;

    async fn get_vcpu_number(&self) -> Result<u32, DriverError>;
}

/// Per-instance network wiring on this host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkManager: Send + Sync {
    async fn setup_compute_network(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> anyhow::Result<()>;
}

/// Per-instance block device wiring on this host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VolumeManager: Send + Sync {
    /// Makes a volume available on this host and returns its local device
    /// path.
    async fn setup_compute_volume(
        &self,
        ctx: &CallContext,
        volume_id: &VolumeId,
    ) -> anyhow::Result<String>;

    async fn remove_compute_volume(
        &self,
        ctx: &CallContext,
        volume_id: &VolumeId,
    ) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("instance store failure: {0}")]
    Backend(String),
}

/// The persistent record of instances and volumes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn instance_get(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<Instance, StoreError>;

    async fn instance_update(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
        update: InstanceUpdate,
    ) -> Result<(), StoreError>;

    async fn instance_destroy(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<(), StoreError>;

    async fn instance_set_state(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
        power_state: PowerState,
        task_state: Option<TaskState>,
    ) -> Result<(), StoreError>;

    async fn volume_get(
        &self,
        ctx: &CallContext,
        volume_id: &VolumeId,
    ) -> Result<Volume, StoreError>;

    async fn volume_attached(
        &self,
        ctx: &CallContext,
        volume_id: &VolumeId,
        instance_id: &InstanceId,
        mountpoint: &str,
    ) -> Result<(), StoreError>;

    async fn volume_detached(
        &self,
        ctx: &CallContext,
        volume_id: &VolumeId,
    ) -> Result<(), StoreError>;

    /// Volumes attached to the instance with the given external identifier.
    /// Fails with `NotFound` if there are none.
    async fn volumes_by_hostname(
        &self,
        ctx: &CallContext,
        hostname: &str,
    ) -> Result<Vec<Volume>, StoreError>;

    async fn volume_placement(
        &self,
        ctx: &CallContext,
        volume_id: &VolumeId,
    ) -> Result<VolumePlacement, StoreError>;

    async fn instance_fixed_address(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<Option<IpAddr>, StoreError>;

    /// Resolves the RPC topic on which the service for `host` listens.
    async fn queue_get_for(
        &self,
        ctx: &CallContext,
        topic: &str,
        host: &str,
    ) -> Result<String, StoreError>;
}

/// The capability set a compute manager is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub driver: Arc<dyn Driver>,
    pub network: Arc<dyn NetworkManager>,
    pub volumes: Arc<dyn VolumeManager>,
    pub store: Arc<dyn InstanceStore>,
    pub peers: Arc<dyn PeerRpc>,
}
