// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciles stored power state with the driver's view of a guest.

use compute_api_types::{CallContext, InstanceId, PowerState};
use slog::debug;

use super::{ComputeError, ComputeManager};
use crate::collaborators::DriverError;

impl ComputeManager {
    /// Queries the driver for an instance's power state and persists it,
    /// clearing any task state. A guest the driver doesn't know about is
    /// recorded as [`PowerState::NoState`].
    pub(crate) async fn sync_power_state(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<PowerState, ComputeError> {
        self.sync_power_state_or(ctx, instance_id, PowerState::NoState).await
    }

    /// Like [`Self::sync_power_state`], but records `not_found` when the
    /// driver doesn't know about the guest.
    pub(crate) async fn sync_power_state_or(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
        not_found: PowerState,
    ) -> Result<PowerState, ComputeError> {
        let instance = self.store.instance_get(ctx, instance_id).await?;
        let state = match self.driver.get_info(&instance.name).await {
            Ok(info) => info.state,
            Err(DriverError::InstanceNotFound(_)) => not_found,
            Err(e) => return Err(e.into()),
        };

        debug!(self.log, "synchronized power state";
               "instance_id" => %instance_id,
               "state" => %state);
        self.store.instance_set_state(ctx, instance_id, state, None).await?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use compute_api_types::{Instance, TaskState};
    use compute_server_config::Config;

    use super::*;
    use crate::collaborators::{
        Collaborators, InstanceStore, MockDriver, MockInstanceStore,
    };
    use crate::manager::testing::{ctx, test_logger, TestHost};
    use crate::migrate::MockPeerRpc;
    use crate::sim::{SimNetworkManager, SimVolumeManager};

    #[tokio::test]
    async fn records_driver_state_and_clears_task_state() {
        let host = TestHost::new();
        let id = host.add_instance("i-1");
        host.driver.insert_domain("i-1", PowerState::Running);
        host.store
            .instance_set_state(
                &ctx(),
                &id,
                PowerState::NoState,
                Some(TaskState::Rebooting),
            )
            .await
            .unwrap();

        let state = host.manager.sync_power_state(&ctx(), &id).await.unwrap();
        assert_eq!(state, PowerState::Running);

        let instance = host.instance(&id);
        assert_eq!(instance.power_state, PowerState::Running);
        assert!(instance.task_state.is_none());
    }

    #[tokio::test]
    async fn unknown_guest_is_recorded_as_no_state() {
        let host = TestHost::new();
        let id = host.add_instance("i-1");
        host.store
            .instance_set_state(&ctx(), &id, PowerState::Running, None)
            .await
            .unwrap();

        let state = host.manager.sync_power_state(&ctx(), &id).await.unwrap();
        assert_eq!(state, PowerState::NoState);
        assert_eq!(host.instance(&id).power_state, PowerState::NoState);
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let host = TestHost::new();
        let id = host.add_instance("i-1");
        host.driver.insert_domain("i-1", PowerState::Shutdown);

        let first = host.manager.sync_power_state(&ctx(), &id).await.unwrap();
        let after_first = host.instance(&id);
        let second = host.manager.sync_power_state(&ctx(), &id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(after_first, host.instance(&id));
    }

    #[tokio::test]
    async fn other_driver_errors_propagate_without_writing() {
        let mut driver = MockDriver::new();
        driver.expect_get_info().returning(|_| {
            Err(DriverError::Failed("hypervisor unreachable".to_string()))
        });

        let mut store = MockInstanceStore::new();
        store
            .expect_instance_get()
            .returning(|_, _| Ok(Instance::new("i-1", "i-1", "i-1")));
        store.expect_instance_set_state().never();

        let log = test_logger();
        let manager = ComputeManager::new(
            &Config::new("host-a"),
            Collaborators {
                driver: Arc::new(driver),
                network: Arc::new(SimNetworkManager::new(log.clone())),
                volumes: Arc::new(SimVolumeManager::new(log.clone())),
                store: Arc::new(store),
                peers: Arc::new(MockPeerRpc::new()),
            },
            log,
        );

        let err = manager
            .sync_power_state(&ctx(), &InstanceId::from("i-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::Driver(DriverError::Failed(_))));
    }

    #[tokio::test]
    async fn fallback_applies_only_to_unknown_guests() {
        let host = TestHost::new();
        let id = host.add_instance("i-1");
        let state = host
            .manager
            .sync_power_state_or(&ctx(), &id, PowerState::Shutdown)
            .await
            .unwrap();
        assert_eq!(state, PowerState::Shutdown);

        host.driver.insert_domain("i-1", PowerState::Running);
        let state = host
            .manager
            .sync_power_state_or(&ctx(), &id, PowerState::Shutdown)
            .await
            .unwrap();
        assert_eq!(state, PowerState::Running);
    }
}
