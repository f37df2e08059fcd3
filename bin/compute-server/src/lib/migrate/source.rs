// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use compute_api_types::{CallContext, InstanceId, PowerState};
use slog::{debug, error, info};

use super::{MigrateError, NWFILTER_POLL_INTERVAL};
use crate::manager::{ComputeError, ComputeManager};

impl ComputeManager {
    /// Moves a running instance from this host to `dest`.
    ///
    /// If `dest` can't prepare for the instance, its power state is reverted
    /// to running and no migration is attempted. A timeout while waiting for
    /// `dest` to finish preparing leaves the instance as it is.
    pub async fn live_migration(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
        dest: &str,
    ) -> Result<(), ComputeError> {
        // The destination would wait on the lock held here.
        if dest == self.host {
            return Err(MigrateError::SameHost {
                instance_id: instance_id.clone(),
                dest: dest.to_string(),
            }
            .into());
        }

        let ctx = ctx.elevated();
        let _guard = self.locks.lock(instance_id).await;

        let topic =
            self.store.queue_get_for(&ctx, &self.compute_topic, dest).await?;
        info!(self.log, "asking destination to prepare for migration";
              "instance_id" => %instance_id,
              "dest" => dest,
              "topic" => &topic);

        let abort = match self
            .peers
            .pre_live_migration(&ctx, &topic, instance_id, dest)
            .await
        {
            Ok(true) => None,
            Ok(false) => Some(MigrateError::PreparationDeclined {
                dest: dest.to_string(),
            }),
            Err(source) => Some(MigrateError::PreparationFailed {
                dest: dest.to_string(),
                source,
            }),
        };
        if let Some(err) = abort {
            error!(self.log, "pre_live_migration failed; reverting";
                   "instance_id" => %instance_id,
                   "dest" => dest,
                   "error" => %ComputeError::from(err.clone()).trace());
            self.store
                .instance_set_state(&ctx, instance_id, PowerState::Running, None)
                .await?;
            return Err(err.into());
        }

        self.wait_for_destination_nwfilter(&ctx, &topic, instance_id, dest)
            .await?;

        let instance = self.store.instance_get(&ctx, instance_id).await?;
        if !self.driver.live_migration(&instance, dest).await? {
            error!(self.log, "driver reported live migration failure";
                   "instance_id" => %instance_id,
                   "dest" => dest);
            return Err(MigrateError::DriverReportedFailure {
                name: instance.name,
                dest: dest.to_string(),
            }
            .into());
        }

        info!(self.log, "live migration complete";
              "instance_id" => %instance_id,
              "dest" => dest);
        Ok(())
    }

    /// Polls `dest` once per poll interval until its network filters for the
    /// instance exist, giving up after `live_migration_timeout` polls. A zero
    /// timeout skips the wait, trusting the destination's preparation.
    async fn wait_for_destination_nwfilter(
        &self,
        ctx: &CallContext,
        topic: &str,
        instance_id: &InstanceId,
        dest: &str,
    ) -> Result<(), MigrateError> {
        if self.live_migration_timeout == 0 {
            debug!(self.log, "not waiting for destination network filters";
                   "instance_id" => %instance_id,
                   "dest" => dest);
            return Ok(());
        }

        for _ in 0..self.live_migration_timeout {
            let ready = self
                .peers
                .nwfilter_for_instance_exists(ctx, topic, instance_id)
                .await
                .map_err(|source| MigrateError::Peer {
                    dest: dest.to_string(),
                    source,
                })?;
            if ready {
                return Ok(());
            }
            tokio::time::sleep(NWFILTER_POLL_INTERVAL).await;
        }

        error!(self.log, "timed out waiting for destination network filters";
               "instance_id" => %instance_id,
               "dest" => dest,
               "timeout_secs" => self.live_migration_timeout);
        Err(MigrateError::Timeout {
            dest: dest.to_string(),
            timeout_secs: self.live_migration_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use compute_api_types::{ErrorKind, RemoteError, TaskState};

    use super::*;
    use crate::collaborators::InstanceStore;
    use crate::manager::testing::{ctx, TestHost, TEST_HOST};
    use crate::migrate::MockPeerRpc;
    use crate::sim::{DriverCall, FailureInjection};

    const TOPIC: &str = "compute.host-b";

    fn is_live_migration(call: &DriverCall) -> bool {
        matches!(call, DriverCall::LiveMigration { .. })
    }

    /// Puts i-1 on the host, running, with a migration pending.
    fn migrating_host(peers: MockPeerRpc) -> (TestHost, InstanceId) {
        let host = TestHost::with_peers(Arc::new(peers));
        let id = host.add_instance("i-1");
        host.driver.insert_domain("i-1", PowerState::Running);
        (host, id)
    }

    async fn mark_migrating(host: &TestHost, id: &InstanceId) {
        host.store
            .instance_set_state(
                &ctx(),
                id,
                PowerState::NoState,
                Some(TaskState::Migrating),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn declined_preparation_reverts_to_running() {
        let mut peers = MockPeerRpc::new();
        peers
            .expect_pre_live_migration()
            .withf(|_, topic, id, dest| {
                topic == TOPIC && id.0 == "i-1" && dest == "host-b"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(false));
        peers.expect_nwfilter_for_instance_exists().never();

        let (host, id) = migrating_host(peers);
        mark_migrating(&host, &id).await;

        let err = host
            .manager
            .live_migration(&ctx(), &id, "host-b")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ComputeError::Migration(MigrateError::PreparationDeclined { .. })
        ));

        let instance = host.instance(&id);
        assert_eq!(instance.power_state, PowerState::Running);
        assert!(instance.task_state.is_none());
        assert!(!host.driver.calls().iter().any(is_live_migration));
    }

    #[tokio::test]
    async fn failed_preparation_reports_peer_kind() {
        let mut peers = MockPeerRpc::new();
        peers.expect_pre_live_migration().times(1).returning(|_, _, _, _| {
            Err(RemoteError::new(
                ErrorKind::NotFound,
                "no fixed IP address found",
                "",
            ))
        });

        let (host, id) = migrating_host(peers);
        mark_migrating(&host, &id).await;

        let err = host
            .manager
            .live_migration(&ctx(), &id, "host-b")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.trace().contains("no fixed IP address found"));
        assert_eq!(host.instance(&id).power_state, PowerState::Running);
        assert!(host.driver.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stops_once_filters_exist() {
        let polls = Arc::new(AtomicU32::new(0));
        let mut peers = MockPeerRpc::new();
        peers.expect_pre_live_migration().returning(|_, _, _, _| Ok(true));
        let counter = polls.clone();
        peers
            .expect_nwfilter_for_instance_exists()
            .withf(|_, topic, id| topic == TOPIC && id.0 == "i-1")
            .returning(move |_, _, _| {
                Ok(counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3)
            });

        let (host, id) = migrating_host(peers);
        let start = tokio::time::Instant::now();
        host.manager.live_migration(&ctx(), &id, "host-b").await.unwrap();

        assert_eq!(polls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
        assert_eq!(
            host.driver.calls(),
            [DriverCall::LiveMigration {
                name: "i-1".to_string(),
                dest: "host-b".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polling_times_out_without_reverting() {
        let mut peers = MockPeerRpc::new();
        peers.expect_pre_live_migration().returning(|_, _, _, _| Ok(true));
        peers
            .expect_nwfilter_for_instance_exists()
            .times(5)
            .returning(|_, _, _| Ok(false));

        let (host, id) = migrating_host(peers);
        mark_migrating(&host, &id).await;
        let before = host.instance(&id);

        let start = tokio::time::Instant::now();
        let err = host
            .manager
            .live_migration(&ctx(), &id, "host-b")
            .await
            .unwrap_err();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));
        assert_eq!(err.kind(), ErrorKind::ProtocolTimeout);
        assert!(err.to_remote().is_retryable());
        assert_eq!(host.instance(&id), before);
        assert!(!host.driver.calls().iter().any(is_live_migration));
    }

    #[tokio::test]
    async fn poll_failure_aborts_with_peer_kind() {
        let mut peers = MockPeerRpc::new();
        peers.expect_pre_live_migration().returning(|_, _, _, _| Ok(true));
        peers.expect_nwfilter_for_instance_exists().times(1).returning(
            |_, _, _| {
                Err(RemoteError::new(
                    ErrorKind::Unavailable,
                    "failed to reach compute service",
                    "connection refused",
                ))
            },
        );

        let (host, id) = migrating_host(peers);
        let err = host
            .manager
            .live_migration(&ctx(), &id, "host-b")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(!host.driver.calls().iter().any(is_live_migration));
    }

    #[tokio::test]
    async fn driver_rejection_is_a_driver_failure() {
        let mut peers = MockPeerRpc::new();
        peers.expect_pre_live_migration().returning(|_, _, _, _| Ok(true));
        peers
            .expect_nwfilter_for_instance_exists()
            .returning(|_, _, _| Ok(true));

        let (host, id) = migrating_host(peers);
        host.driver.set_failures(FailureInjection {
            reject_live_migration: true,
            ..Default::default()
        });

        let err = host
            .manager
            .live_migration(&ctx(), &id, "host-b")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ComputeError::Migration(MigrateError::DriverReportedFailure { .. })
        ));
        assert_eq!(err.kind(), ErrorKind::DriverFailure);
    }

    #[tokio::test]
    async fn migrating_to_own_host_is_a_conflict() {
        let mut peers = MockPeerRpc::new();
        peers.expect_pre_live_migration().never();
        peers.expect_nwfilter_for_instance_exists().never();

        let (host, id) = migrating_host(peers);
        mark_migrating(&host, &id).await;
        let before = host.instance(&id);

        let err = host
            .manager
            .live_migration(&ctx(), &id, TEST_HOST)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ComputeError::Migration(MigrateError::SameHost { .. })
        ));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(host.instance(&id), before);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_migrates_without_polling() {
        let mut peers = MockPeerRpc::new();
        peers.expect_pre_live_migration().returning(|_, _, _, _| Ok(true));
        peers.expect_nwfilter_for_instance_exists().never();

        let (mut host, id) = migrating_host(peers);
        host.manager.live_migration_timeout = 0;

        let start = tokio::time::Instant::now();
        host.manager.live_migration(&ctx(), &id, "host-b").await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(host.driver.calls().iter().any(is_live_migration));
    }
}
