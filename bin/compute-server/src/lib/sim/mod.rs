// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated collaborators.
//!
//! These stand in for a real hypervisor, network manager, volume manager, and
//! database so that a compute server can be run (and its orchestration logic
//! tested) without any of them. They are selected with the `sim` backend name.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use compute_api_types::{CallContext, InstanceId, VolumeId};
use slog::{info, Logger};

use crate::collaborators::{NetworkManager, VolumeManager};

mod driver;
mod store;

pub use driver::{DriverCall, FailureInjection, SimDriver};
pub use store::{MemoryStore, StoreSeed};

pub struct SimNetworkManager {
    configured: Mutex<Vec<InstanceId>>,
    fail_setup: AtomicBool,
    log: Logger,
}

impl SimNetworkManager {
    pub fn new(log: Logger) -> Self {
        Self {
            configured: Mutex::new(Vec::new()),
            fail_setup: AtomicBool::new(false),
            log,
        }
    }

    pub fn set_fail_setup(&self, fail: bool) {
        self.fail_setup.store(fail, Ordering::SeqCst);
    }

    /// The number of times networking was set up for `instance_id`.
    pub fn setup_count(&self, instance_id: &InstanceId) -> usize {
        self.configured
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == instance_id)
            .count()
    }
}

#[async_trait]
impl NetworkManager for SimNetworkManager {
    async fn setup_compute_network(
        &self,
        _ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> anyhow::Result<()> {
        info!(self.log, "setting up simulated network";
              "instance_id" => %instance_id);
        if self.fail_setup.load(Ordering::SeqCst) {
            anyhow::bail!(
                "injected failure setting up network for {}",
                instance_id
            );
        }
        self.configured.lock().unwrap().push(instance_id.clone());
        Ok(())
    }
}

pub struct SimVolumeManager {
    exported: Mutex<BTreeSet<VolumeId>>,
    removals: Mutex<Vec<VolumeId>>,
    fail_removal: AtomicBool,
    log: Logger,
}

impl SimVolumeManager {
    pub fn new(log: Logger) -> Self {
        Self {
            exported: Mutex::new(BTreeSet::new()),
            removals: Mutex::new(Vec::new()),
            fail_removal: AtomicBool::new(false),
            log,
        }
    }

    pub fn device_path(volume_id: &VolumeId) -> String {
        format!("/dev/disk/by-path/sim-{}", volume_id)
    }

    pub fn is_exported(&self, volume_id: &VolumeId) -> bool {
        self.exported.lock().unwrap().contains(volume_id)
    }

    /// Every volume removal requested so far, oldest first.
    pub fn removals(&self) -> Vec<VolumeId> {
        self.removals.lock().unwrap().clone()
    }

    pub fn set_fail_removal(&self, fail: bool) {
        self.fail_removal.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl VolumeManager for SimVolumeManager {
    async fn setup_compute_volume(
        &self,
        _ctx: &CallContext,
        volume_id: &VolumeId,
    ) -> anyhow::Result<String> {
        info!(self.log, "exporting simulated volume";
              "volume_id" => %volume_id);
        self.exported.lock().unwrap().insert(volume_id.clone());
        Ok(Self::device_path(volume_id))
    }

    async fn remove_compute_volume(
        &self,
        _ctx: &CallContext,
        volume_id: &VolumeId,
    ) -> anyhow::Result<()> {
        self.removals.lock().unwrap().push(volume_id.clone());
        if self.fail_removal.load(Ordering::SeqCst) {
            anyhow::bail!("injected failure removing volume {}", volume_id);
        }
        self.exported.lock().unwrap().remove(volume_id);
        Ok(())
    }
}
