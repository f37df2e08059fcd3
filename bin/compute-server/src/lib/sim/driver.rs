// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated hypervisor driver.
//!
//! Guests are entries in a table; nothing is actually executed. Every call is
//! recorded so that tests can assert on the order of driver operations, and
//! individual operations can be made to fail via [`FailureInjection`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use compute_api_types::{Instance, PowerState};
use slog::{info, Logger};

use crate::collaborators::{Driver, DriverError, DriverInfo};

const DEFAULT_VCPUS: u32 = 8;

/// A driver operation as observed by the simulated driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverCall {
    Spawn(String),
    Destroy(String),
    Reboot(String),
    Rescue(String),
    Unrescue(String),
    AttachVolume { name: String, device_path: String, mountpoint: String },
    DetachVolume { name: String, mountpoint: String },
    RefreshSecurityGroup(String),
    SetupNwfilters(String),
    LiveMigration { name: String, dest: String },
}

/// Operations the simulated driver should fail.
#[derive(Clone, Debug, Default)]
pub struct FailureInjection {
    pub spawn: bool,
    pub destroy: bool,
    pub reboot: bool,
    pub rescue: bool,
    pub unrescue: bool,
    pub attach_volume: bool,
    pub detach_volume: bool,

    /// Report live migrations as unsuccessful (rather than erroring).
    pub reject_live_migration: bool,
}

#[derive(Debug)]
struct SimDomain {
    state: PowerState,
    rescued: bool,
    /// Attached devices, keyed by guest mountpoint.
    devices: BTreeMap<String, String>,
    console: String,
}

impl SimDomain {
    fn new(name: &str, state: PowerState) -> Self {
        Self {
            state,
            rescued: false,
            devices: BTreeMap::new(),
            console: format!("[sim] {} booted\n", name),
        }
    }
}

#[derive(Default)]
struct SimDriverState {
    domains: BTreeMap<String, SimDomain>,
    nwfilters: BTreeSet<String>,
    calls: Vec<DriverCall>,
    failures: FailureInjection,
}

impl SimDriverState {
    fn domain_mut(
        &mut self,
        name: &str,
    ) -> Result<&mut SimDomain, DriverError> {
        self.domains
            .get_mut(name)
            .ok_or_else(|| DriverError::InstanceNotFound(name.to_string()))
    }
}

fn injected(op: &str) -> DriverError {
    DriverError::Failed(format!("injected {} failure", op))
}

pub struct SimDriver {
    state: Mutex<SimDriverState>,
    vcpus: u32,
    log: Logger,
}

impl SimDriver {
    pub fn new(log: Logger) -> Self {
        Self {
            state: Mutex::new(SimDriverState::default()),
            vcpus: DEFAULT_VCPUS,
            log,
        }
    }

    pub fn set_failures(&self, failures: FailureInjection) {
        self.state.lock().unwrap().failures = failures;
    }

    /// Returns every call made to this driver so far, oldest first.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Registers a guest as though it had been created out of band.
    pub fn insert_domain(&self, name: &str, state: PowerState) {
        self.state
            .lock()
            .unwrap()
            .domains
            .insert(name.to_string(), SimDomain::new(name, state));
    }

    /// Changes a guest's power state, e.g. to simulate a guest shutdown.
    pub fn set_power_state(&self, name: &str, state: PowerState) {
        if let Some(domain) = self.state.lock().unwrap().domains.get_mut(name)
        {
            domain.state = state;
        }
    }

    pub fn is_rescued(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .domains
            .get(name)
            .is_some_and(|d| d.rescued)
    }

    pub fn attached_devices(&self, name: &str) -> BTreeMap<String, String> {
        self.state
            .lock()
            .unwrap()
            .domains
            .get(name)
            .map(|d| d.devices.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Driver for SimDriver {
    async fn list_instances(&self) -> Result<Vec<String>, DriverError> {
        Ok(self.state.lock().unwrap().domains.keys().cloned().collect())
    }

    async fn get_info(&self, name: &str) -> Result<DriverInfo, DriverError> {
        let state = self.state.lock().unwrap();
        state
            .domains
            .get(name)
            .map(|d| DriverInfo { state: d.state })
            .ok_or_else(|| DriverError::InstanceNotFound(name.to_string()))
    }

    async fn spawn(&self, instance: &Instance) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::Spawn(instance.name.clone()));
        if state.failures.spawn {
            return Err(injected("spawn"));
        }
        if state.domains.contains_key(&instance.name) {
            return Err(DriverError::Failed(format!(
                "domain {} already exists",
                instance.name
            )));
        }

        info!(self.log, "spawning simulated guest"; "name" => &instance.name);
        state.domains.insert(
            instance.name.clone(),
            SimDomain::new(&instance.name, PowerState::Running),
        );
        Ok(())
    }

    async fn destroy(&self, instance: &Instance) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::Destroy(instance.name.clone()));
        if state.failures.destroy {
            return Err(injected("destroy"));
        }

        // Destroying a guest the hypervisor has already forgotten is not an
        // error.
        state.domains.remove(&instance.name);
        state.nwfilters.remove(&instance.name);
        Ok(())
    }

    async fn reboot(&self, instance: &Instance) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::Reboot(instance.name.clone()));
        if state.failures.reboot {
            return Err(injected("reboot"));
        }

        let domain = state.domain_mut(&instance.name)?;
        domain.state = PowerState::Running;
        domain.console.push_str("[sim] rebooted\n");
        Ok(())
    }

    async fn rescue(&self, instance: &Instance) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::Rescue(instance.name.clone()));
        if state.failures.rescue {
            return Err(injected("rescue"));
        }

        let domain = state.domain_mut(&instance.name)?;
        domain.rescued = true;
        domain.state = PowerState::Running;
        domain.console.push_str("[sim] booted rescue image\n");
        Ok(())
    }

    async fn unrescue(&self, instance: &Instance) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::Unrescue(instance.name.clone()));
        if state.failures.unrescue {
            return Err(injected("unrescue"));
        }

        let domain = state.domain_mut(&instance.name)?;
        domain.rescued = false;
        domain.state = PowerState::Running;
        domain.console.push_str("[sim] booted original image\n");
        Ok(())
    }

    async fn attach_volume(
        &self,
        name: &str,
        device_path: &str,
        mountpoint: &str,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::AttachVolume {
            name: name.to_string(),
            device_path: device_path.to_string(),
            mountpoint: mountpoint.to_string(),
        });
        if state.failures.attach_volume {
            return Err(injected("attach_volume"));
        }

        let domain = state.domain_mut(name)?;
        if domain.devices.contains_key(mountpoint) {
            return Err(DriverError::Failed(format!(
                "{} already has a device at {}",
                name, mountpoint
            )));
        }
        domain.devices.insert(mountpoint.to_string(), device_path.to_string());
        Ok(())
    }

    async fn detach_volume(
        &self,
        name: &str,
        mountpoint: &str,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::DetachVolume {
            name: name.to_string(),
            mountpoint: mountpoint.to_string(),
        });
        if state.failures.detach_volume {
            return Err(injected("detach_volume"));
        }

        let domain = state.domain_mut(name)?;
        domain.devices.remove(mountpoint).map(|_| ()).ok_or_else(|| {
            DriverError::Failed(format!(
                "no device attached to {} at {}",
                name, mountpoint
            ))
        })
    }

    async fn get_console_output(
        &self,
        instance: &Instance,
    ) -> Result<String, DriverError> {
        let mut state = self.state.lock().unwrap();
        Ok(state.domain_mut(&instance.name)?.console.clone())
    }

    async fn refresh_security_group(
        &self,
        security_group_id: &str,
    ) -> Result<(), DriverError> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(DriverCall::RefreshSecurityGroup(security_group_id.to_string()));
        Ok(())
    }

    async fn setup_nwfilters_for_instance(
        &self,
        instance: &Instance,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::SetupNwfilters(instance.name.clone()));
        state.nwfilters.insert(instance.name.clone());
        Ok(())
    }

    async fn nwfilter_for_instance_exists(
        &self,
        instance: &Instance,
    ) -> Result<bool, DriverError> {
        Ok(self.state.lock().unwrap().nwfilters.contains(&instance.name))
    }

    async fn live_migration(
        &self,
        instance: &Instance,
        dest: &str,
    ) -> Result<bool, DriverError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::LiveMigration {
            name: instance.name.clone(),
            dest: dest.to_string(),
        });
        if state.failures.reject_live_migration {
            return Ok(false);
        }

        // The guest now runs on `dest`.
        state.domain_mut(&instance.name)?;
        state.domains.remove(&instance.name);
        state.nwfilters.remove(&instance.name);
        Ok(true)
    }

    async fn get_vcpu_number(&self) -> Result<u32, DriverError> {
        Ok(self.vcpus)
    }
}
