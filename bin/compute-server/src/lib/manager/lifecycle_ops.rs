// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest lifecycle operations: run, terminate, reboot, rescue, and unrescue.
//!
//! Each operation takes the instance's lock, elevates its caller's context,
//! works from a freshly fetched instance record, and (unless the instance was
//! destroyed) ends by resynchronizing the record's power state with the
//! driver.

use chrono::Utc;
use compute_api_types::{
    CallContext, InstanceId, InstanceUpdate, PowerState, TaskState,
};
use slog::{error, info, warn};

use super::{ComputeError, ComputeManager};

/// Driver operations that follow the same guarded pattern: mark the instance
/// as busy, invoke the driver, then resynchronize.
#[derive(Clone, Copy, Debug)]
enum GuardedOp {
    Reboot,
    Rescue,
    Unrescue,
}

impl GuardedOp {
    fn task_state(self) -> TaskState {
        match self {
            GuardedOp::Reboot => TaskState::Rebooting,
            GuardedOp::Rescue => TaskState::Rescuing,
            GuardedOp::Unrescue => TaskState::Unrescuing,
        }
    }

    fn name(self) -> &'static str {
        match self {
            GuardedOp::Reboot => "reboot",
            GuardedOp::Rescue => "rescue",
            GuardedOp::Unrescue => "unrescue",
        }
    }
}

impl ComputeManager {
    /// Launches a new guest for an existing instance record.
    ///
    /// A spawn failure is logged and recorded as a shut-down instance; it is
    /// not returned to the caller.
    pub async fn run_instance(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<(), ComputeError> {
        let ctx = ctx.elevated();
        let _guard = self.locks.lock(instance_id).await;

        let instance = self.store.instance_get(&ctx, instance_id).await?;
        if self.driver.list_instances().await?.contains(&instance.name) {
            return Err(ComputeError::AlreadyCreated(instance_id.clone()));
        }

        info!(self.log, "starting instance"; "instance_id" => %instance_id);
        self.network.setup_compute_network(&ctx, instance_id).await.map_err(
            |source| ComputeError::Network {
                instance_id: instance_id.clone(),
                source,
            },
        )?;

        self.store
            .instance_update(
                &ctx,
                instance_id,
                InstanceUpdate {
                    host: Some(self.host.clone()),
                    ..Default::default()
                },
            )
            .await?;
        self.store
            .instance_set_state(
                &ctx,
                instance_id,
                PowerState::NoState,
                Some(TaskState::Spawning),
            )
            .await?;

        let instance = self.store.instance_get(&ctx, instance_id).await?;
        let not_found = match self.driver.spawn(&instance).await {
            Ok(()) => {
                self.store
                    .instance_update(
                        &ctx,
                        instance_id,
                        InstanceUpdate {
                            launched_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                PowerState::NoState
            }
            Err(e) => {
                error!(self.log, "instance failed to spawn";
                       "instance_id" => %instance_id,
                       "error" => %e);
                self.store
                    .instance_set_state(
                        &ctx,
                        instance_id,
                        PowerState::Shutdown,
                        None,
                    )
                    .await?;
                PowerState::Shutdown
            }
        };

        self.sync_power_state_or(&ctx, instance_id, not_found).await?;
        Ok(())
    }

    /// Detaches an instance's volumes, destroys its guest, and removes its
    /// record.
    ///
    /// An instance already recorded as shut off has its record removed but
    /// the call still fails with [`ComputeError::AlreadyDestroyed`].
    pub async fn terminate_instance(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<(), ComputeError> {
        let ctx = ctx.elevated();
        let _guard = self.locks.lock(instance_id).await;

        info!(self.log, "terminating instance"; "instance_id" => %instance_id);
        let instance = self.store.instance_get(&ctx, instance_id).await?;
        for volume in &instance.volumes {
            self.detach_volume_locked(&ctx, instance_id, &volume.id).await?;
        }

        let instance = self.store.instance_get(&ctx, instance_id).await?;
        if instance.power_state == PowerState::Shutoff {
            self.store.instance_destroy(&ctx, instance_id).await?;
            return Err(ComputeError::AlreadyDestroyed(instance_id.clone()));
        }

        self.driver.destroy(&instance).await?;
        self.store.instance_destroy(&ctx, instance_id).await?;
        Ok(())
    }

    pub async fn reboot_instance(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<(), ComputeError> {
        let ctx = ctx.elevated();
        let _guard = self.locks.lock(instance_id).await;

        let state = self.sync_power_state(&ctx, instance_id).await?;
        if state != PowerState::Running {
            warn!(self.log, "trying to reboot a non-running instance";
                  "instance_id" => %instance_id,
                  "state" => %state,
                  "expected" => %PowerState::Running);
        }

        self.guarded_driver_op(&ctx, instance_id, GuardedOp::Reboot).await
    }

    pub async fn rescue_instance(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<(), ComputeError> {
        let ctx = ctx.elevated();
        let _guard = self.locks.lock(instance_id).await;
        self.guarded_driver_op(&ctx, instance_id, GuardedOp::Rescue).await
    }

    pub async fn unrescue_instance(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<(), ComputeError> {
        let ctx = ctx.elevated();
        let _guard = self.locks.lock(instance_id).await;
        self.guarded_driver_op(&ctx, instance_id, GuardedOp::Unrescue).await
    }

    pub async fn get_console_output(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<String, ComputeError> {
        let ctx = ctx.elevated();
        let instance = self.store.instance_get(&ctx, instance_id).await?;
        Ok(self.driver.get_console_output(&instance).await?)
    }

    pub async fn refresh_security_group(
        &self,
        _ctx: &CallContext,
        security_group_id: &str,
    ) -> Result<(), ComputeError> {
        info!(self.log, "refreshing security group";
              "security_group_id" => security_group_id);
        Ok(self.driver.refresh_security_group(security_group_id).await?)
    }

    /// Runs `op` against the instance's guest. The caller must hold the
    /// instance's lock.
    ///
    /// On a driver failure the power state is still resynchronized (on a best
    /// effort basis) before the driver's error is returned.
    async fn guarded_driver_op(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
        op: GuardedOp,
    ) -> Result<(), ComputeError> {
        let instance = self.store.instance_get(ctx, instance_id).await?;
        self.store
            .instance_set_state(
                ctx,
                instance_id,
                PowerState::NoState,
                Some(op.task_state()),
            )
            .await?;

        info!(self.log, "issuing driver {}", op.name();
              "instance_id" => %instance_id);
        let result = match op {
            GuardedOp::Reboot => self.driver.reboot(&instance).await,
            GuardedOp::Rescue => self.driver.rescue(&instance).await,
            GuardedOp::Unrescue => self.driver.unrescue(&instance).await,
        };

        if let Err(e) = result {
            error!(self.log, "driver {} failed", op.name();
                   "instance_id" => %instance_id,
                   "error" => %e);
            if let Err(sync_err) = self.sync_power_state(ctx, instance_id).await
            {
                error!(self.log, "failed to resynchronize power state";
                       "instance_id" => %instance_id,
                       "error" => %sync_err);
            }
            return Err(e.into());
        }

        self.sync_power_state(ctx, instance_id).await?;
        Ok(())
    }
}
