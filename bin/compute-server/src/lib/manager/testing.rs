// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds compute managers wired to simulated collaborators for tests.

use std::sync::Arc;

use compute_api_types::{CallContext, Instance, InstanceId};
use compute_server_config::Config;

use crate::collaborators::{Collaborators, Driver};
use crate::migrate::{MockPeerRpc, PeerRpc};
use crate::sim::{MemoryStore, SimDriver, SimNetworkManager, SimVolumeManager};

use super::ComputeManager;

pub(crate) const TEST_HOST: &str = "host-a";

pub(crate) fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

pub(crate) fn ctx() -> CallContext {
    CallContext::new("tester", Some("project".to_string()))
}

pub(crate) struct TestHost {
    pub manager: ComputeManager,
    pub driver: Arc<SimDriver>,
    pub network: Arc<SimNetworkManager>,
    pub volumes: Arc<SimVolumeManager>,
    pub store: Arc<MemoryStore>,
}

impl TestHost {
    /// A host whose peers must never be contacted.
    pub fn new() -> Self {
        Self::with_peers(Arc::new(MockPeerRpc::new()))
    }

    pub fn with_peers(peers: Arc<dyn PeerRpc>) -> Self {
        let log = test_logger();
        let driver = Arc::new(SimDriver::new(log.clone()));
        let network = Arc::new(SimNetworkManager::new(log.clone()));
        let volumes = Arc::new(SimVolumeManager::new(log.clone()));
        let store = Arc::new(MemoryStore::new());

        let mut config = Config::new(TEST_HOST);
        config.live_migration_timeout = 5;

        let manager = ComputeManager::new(
            &config,
            Collaborators {
                driver: driver.clone(),
                network: network.clone(),
                volumes: volumes.clone(),
                store: store.clone(),
                peers,
            },
            log,
        );

        Self { manager, driver, network, volumes, store }
    }

    /// Adds an instance record whose driver-facing name and external
    /// identifier are both its id.
    pub fn add_instance(&self, id: &str) -> InstanceId {
        self.store.insert_instance(Instance::new(id, id, id));
        InstanceId::from(id)
    }

    pub fn instance(&self, id: &InstanceId) -> Instance {
        self.store.instance(id).expect("instance record should exist")
    }
}

/// Builds a manager around `driver`, with simulated networking and volumes
/// and the given store.
pub(crate) fn manager_with_driver(
    driver: Arc<dyn Driver>,
    store: Arc<MemoryStore>,
) -> ComputeManager {
    let log = test_logger();
    ComputeManager::new(
        &Config::new(TEST_HOST),
        Collaborators {
            driver,
            network: Arc::new(SimNetworkManager::new(log.clone())),
            volumes: Arc::new(SimVolumeManager::new(log.clone())),
            store,
            peers: Arc::new(MockPeerRpc::new()),
        },
        log,
    )
}
