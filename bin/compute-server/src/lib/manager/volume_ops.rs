// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Attaching volumes to and detaching them from guests.

use compute_api_types::{CallContext, InstanceId, VolumeId};
use slog::{error, info, warn};

use super::{ComputeError, ComputeManager};

impl ComputeManager {
    /// Exports a volume to this host and attaches it to the instance's guest
    /// at `mountpoint`.
    ///
    /// If the guest attach (or recording the attachment) fails, the volume is
    /// removed from this host again and the original error is returned.
    pub async fn attach_volume(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
        volume_id: &VolumeId,
        mountpoint: &str,
    ) -> Result<bool, ComputeError> {
        let ctx = ctx.elevated();
        let _guard = self.locks.lock(instance_id).await;

        let instance = self.store.instance_get(&ctx, instance_id).await?;
        info!(self.log, "attaching volume";
              "instance_id" => %instance_id,
              "volume_id" => %volume_id,
              "mountpoint" => mountpoint);

        let device_path = self
            .volumes
            .setup_compute_volume(&ctx, volume_id)
            .await
            .map_err(|source| ComputeError::Volume {
                volume_id: volume_id.clone(),
                source,
            })?;

        let attached = async {
            self.driver
                .attach_volume(&instance.name, &device_path, mountpoint)
                .await?;
            self.store
                .volume_attached(&ctx, volume_id, instance_id, mountpoint)
                .await?;
            Ok::<_, ComputeError>(())
        }
        .await;

        if let Err(e) = attached {
            error!(self.log, "failed to attach volume; removing it from host";
                   "instance_id" => %instance_id,
                   "volume_id" => %volume_id,
                   "error" => %e);
            if let Err(cleanup) =
                self.volumes.remove_compute_volume(&ctx, volume_id).await
            {
                error!(self.log, "failed to remove volume after failed attach";
                       "volume_id" => %volume_id,
                       "error" => ?cleanup);
            }
            return Err(e);
        }

        Ok(true)
    }

    pub async fn detach_volume(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
        volume_id: &VolumeId,
    ) -> Result<bool, ComputeError> {
        let ctx = ctx.elevated();
        let _guard = self.locks.lock(instance_id).await;
        self.detach_volume_locked(&ctx, instance_id, volume_id).await?;
        Ok(true)
    }

    /// Detaches a volume from the instance's guest, removes it from this
    /// host, and records the detachment. The caller must hold the instance's
    /// lock and pass an elevated context.
    ///
    /// The guest-level detach is skipped if the driver doesn't know about the
    /// guest; the rest happens regardless.
    pub(super) async fn detach_volume_locked(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
        volume_id: &VolumeId,
    ) -> Result<(), ComputeError> {
        let instance = self.store.instance_get(ctx, instance_id).await?;
        let volume = self.store.volume_get(ctx, volume_id).await?;
        info!(self.log, "detaching volume";
              "instance_id" => %instance_id,
              "volume_id" => %volume_id);

        if !self.driver.list_instances().await?.contains(&instance.name) {
            warn!(self.log, "detaching volume from instance unknown to driver";
                  "instance_id" => %instance_id,
                  "volume_id" => %volume_id);
        } else if let Some(mountpoint) = volume.mountpoint.as_deref() {
            self.driver.detach_volume(&instance.name, mountpoint).await?;
        } else {
            warn!(self.log, "volume has no recorded mountpoint";
                  "instance_id" => %instance_id,
                  "volume_id" => %volume_id);
        }

        self.volumes.remove_compute_volume(ctx, volume_id).await.map_err(
            |source| ComputeError::Volume { volume_id: volume_id.clone(), source },
        )?;
        self.store.volume_detached(ctx, volume_id).await?;
        Ok(())
    }
}
