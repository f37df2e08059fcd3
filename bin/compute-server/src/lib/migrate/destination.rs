// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use compute_api_types::{CallContext, InstanceId};
use slog::{debug, info};

use super::MigrateError;
use crate::collaborators::StoreError;
use crate::manager::{ComputeError, ComputeManager};

impl ComputeManager {
    /// Prepares this host to receive `instance_id` from another host.
    ///
    /// Returns `true` once the instance's network filters and compute-side
    /// networking are in place.
    pub async fn pre_live_migration(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
        dest: &str,
    ) -> Result<bool, ComputeError> {
        let ctx = ctx.elevated();
        let _guard = self.locks.lock(instance_id).await;

        let instance = self.store.instance_get(&ctx, instance_id).await?;
        info!(self.log, "preparing to receive migrating instance";
              "instance_id" => %instance_id,
              "dest" => dest);

        let volumes =
            match self.store.volumes_by_hostname(&ctx, &instance.hostname).await
            {
                Ok(volumes) => volumes,
                Err(StoreError::NotFound { .. }) => {
                    info!(self.log, "no volumes attached to instance";
                          "instance_id" => %instance_id);
                    Vec::new()
                }
                Err(e) => return Err(e.into()),
            };

        // Storage remapping hooks in here: every attached volume's physical
        // placement is resolved, but nothing needs to act on it yet.
        for volume in &volumes {
            match self.store.volume_placement(&ctx, &volume.id).await {
                Ok(placement) => {
                    debug!(self.log, "resolved volume placement";
                           "volume_id" => %volume.id,
                           "shelf" => placement.shelf,
                           "slot" => placement.slot);
                }
                Err(StoreError::NotFound { .. }) => {
                    debug!(self.log, "volume has no recorded placement";
                           "volume_id" => %volume.id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let fixed_address = self
            .store
            .instance_fixed_address(&ctx, instance_id)
            .await?
            .ok_or_else(|| MigrateError::NoFixedAddress {
                instance_id: instance_id.clone(),
                hostname: instance.hostname.clone(),
            })?;
        debug!(self.log, "instance has fixed address";
               "instance_id" => %instance_id,
               "address" => %fixed_address);

        self.driver.setup_nwfilters_for_instance(&instance).await?;
        self.network.setup_compute_network(&ctx, instance_id).await.map_err(
            |source| ComputeError::Network {
                instance_id: instance_id.clone(),
                source,
            },
        )?;

        Ok(true)
    }

    pub async fn nwfilter_for_instance_exists(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<bool, ComputeError> {
        let ctx = ctx.elevated();
        let instance = self.store.instance_get(&ctx, instance_id).await?;
        Ok(self.driver.nwfilter_for_instance_exists(&instance).await?)
    }
}
