// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Selects collaborator implementations by the names in the server's
//! configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use compute_server_config::{Config, SIM_BACKEND};
use slog::{info, o, Logger};

use crate::collaborators::{
    Collaborators, Driver, InstanceStore, NetworkManager, VolumeManager,
};
use crate::migrate::peer::HttpPeerRpc;
use crate::sim::{MemoryStore, SimDriver, SimNetworkManager, SimVolumeManager};

fn driver(name: &str, log: &Logger) -> anyhow::Result<Arc<dyn Driver>> {
    match name {
        SIM_BACKEND => {
            Ok(Arc::new(SimDriver::new(log.new(o!("component" => "driver")))))
        }
        other => bail!("unknown driver backend \"{}\"", other),
    }
}

fn network_manager(
    name: &str,
    log: &Logger,
) -> anyhow::Result<Arc<dyn NetworkManager>> {
    match name {
        SIM_BACKEND => Ok(Arc::new(SimNetworkManager::new(
            log.new(o!("component" => "network")),
        ))),
        other => bail!("unknown network manager backend \"{}\"", other),
    }
}

fn volume_manager(
    name: &str,
    log: &Logger,
) -> anyhow::Result<Arc<dyn VolumeManager>> {
    match name {
        SIM_BACKEND => Ok(Arc::new(SimVolumeManager::new(
            log.new(o!("component" => "volumes")),
        ))),
        other => bail!("unknown volume manager backend \"{}\"", other),
    }
}

fn store(config: &Config, log: &Logger) -> anyhow::Result<Arc<dyn InstanceStore>> {
    let store = match &config.store.seed {
        Some(path) => {
            info!(log, "loading instance store seed";
                  "path" => %path.display());
            MemoryStore::from_seed_file(path)?
        }
        None => MemoryStore::new(),
    };
    Ok(Arc::new(store))
}

/// Builds the collaborators named by `config`.
pub fn build_collaborators(
    config: &Config,
    log: &Logger,
) -> anyhow::Result<Collaborators> {
    let backends = &config.backends;
    Ok(Collaborators {
        driver: driver(&backends.driver, log)?,
        network: network_manager(&backends.network_manager, log)?,
        volumes: volume_manager(&backends.volume_manager, log)?,
        store: store(config, log)?,
        peers: Arc::new(
            HttpPeerRpc::new(
                config.peers.clone(),
                log.new(o!("component" => "peers")),
            )
            .with_request_timeout(Duration::from_secs(
                config.peer_request_timeout,
            )),
        ),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use compute_api_types::InstanceId;

    use super::*;
    use crate::manager::testing::{ctx, test_logger};

    #[test]
    fn unknown_backend_is_rejected() {
        let mut config = Config::new("host-a");
        config.backends.driver = "libvirt".to_string();

        let err = build_collaborators(&config, &test_logger())
            .err()
            .expect("unknown driver should be rejected");
        assert!(err.to_string().contains("libvirt"));
    }

    #[tokio::test]
    async fn seeded_store_is_loaded() {
        let mut seed = tempfile::NamedTempFile::new().unwrap();
        write!(
            seed,
            r#"{{"instances": [{{"id": "i-1", "name": "i-1", "hostname": "i-1"}}]}}"#
        )
        .unwrap();

        let mut config = Config::new("host-a");
        config.store.seed = Some(seed.path().to_path_buf());

        let collaborators =
            build_collaborators(&config, &test_logger()).unwrap();
        let instance = collaborators
            .store
            .instance_get(&ctx(), &InstanceId::from("i-1"))
            .await
            .unwrap();
        assert_eq!(instance.name, "i-1");
    }
}
