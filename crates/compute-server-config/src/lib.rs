// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes a compute server config which may be parsed from a TOML file.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// The backend name selecting the in-memory simulated collaborators.
pub const SIM_BACKEND: &str = "sim";

const DEFAULT_COMPUTE_TOPIC: &str = "compute";
const DEFAULT_INSTANCES_PATH: &str = "/var/lib/compute/instances";
const DEFAULT_LIVE_MIGRATION_TIMEOUT: u64 = 30;
const DEFAULT_PEER_REQUEST_TIMEOUT: u64 = 15;

/// Configuration for the compute server.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    /// The name of the compute node this server manages.
    pub host: String,

    /// The RPC topic prefix under which compute services are addressed. The
    /// service for host `h` listens on `<compute_topic>.<h>`.
    #[serde(default = "default_compute_topic")]
    pub compute_topic: String,

    /// Where instances are kept on disk.
    #[serde(default = "default_instances_path")]
    pub instances_path: PathBuf,

    /// How many seconds a live migration source waits for the destination's
    /// network filters to appear.
    #[serde(default = "default_live_migration_timeout")]
    pub live_migration_timeout: u64,

    /// How many seconds a single request to a peer compute service may take.
    #[serde(default = "default_peer_request_timeout")]
    pub peer_request_timeout: u64,

    #[serde(default)]
    pub backends: Backends,

    #[serde(default)]
    pub store: StoreConfig,

    /// Addresses of peer compute services, keyed by RPC topic.
    #[serde(default)]
    pub peers: BTreeMap<String, SocketAddr>,
}

impl Config {
    /// Constructs a configuration with default settings for the given host.
    ///
    /// Typically, the configuration is parsed from a config file via
    /// [`parse`], but this method allows an alternative mechanism for
    /// initialization.
    pub fn new<S: Into<String>>(host: S) -> Config {
        Config {
            host: host.into(),
            compute_topic: default_compute_topic(),
            instances_path: default_instances_path(),
            live_migration_timeout: default_live_migration_timeout(),
            peer_request_timeout: default_peer_request_timeout(),
            backends: Backends::default(),
            store: StoreConfig::default(),
            peers: BTreeMap::new(),
        }
    }
}

fn default_compute_topic() -> String {
    DEFAULT_COMPUTE_TOPIC.to_string()
}

fn default_instances_path() -> PathBuf {
    PathBuf::from(DEFAULT_INSTANCES_PATH)
}

fn default_live_migration_timeout() -> u64 {
    DEFAULT_LIVE_MIGRATION_TIMEOUT
}

fn default_peer_request_timeout() -> u64 {
    DEFAULT_PEER_REQUEST_TIMEOUT
}

fn default_backend() -> String {
    SIM_BACKEND.to_string()
}

/// Names of the collaborator implementations to inject at startup.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Backends {
    #[serde(default = "default_backend")]
    pub driver: String,

    #[serde(default = "default_backend")]
    pub network_manager: String,

    #[serde(default = "default_backend")]
    pub volume_manager: String,
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            driver: default_backend(),
            network_manager: default_backend(),
            volume_manager: default_backend(),
        }
    }
}

#[derive(Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    /// A JSON document of records to preload into the in-memory store.
    #[serde(default)]
    pub seed: Option<PathBuf>,
}

/// Errors which may be returned when parsing the server configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let mut config = Config::new("host-a");
        config
            .peers
            .insert("compute.host-b".to_string(), "[::1]:12400".parse().unwrap());
        let serialized = toml::ser::to_string(&config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn minimal_config_applies_defaults() {
        let config: Config = toml::de::from_str("host = \"host-a\"").unwrap();
        assert_eq!(config.host, "host-a");
        assert_eq!(config.compute_topic, "compute");
        assert_eq!(config.live_migration_timeout, 30);
        assert_eq!(config.peer_request_timeout, 15);
        assert_eq!(config.backends.driver, SIM_BACKEND);
        assert_eq!(config.backends.network_manager, SIM_BACKEND);
        assert_eq!(config.backends.volume_manager, SIM_BACKEND);
        assert!(config.store.seed.is_none());
        assert!(config.peers.is_empty());
    }

    #[test]
    fn parse_reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compute.toml");
        std::fs::write(
            &path,
            r#"
host = "host-b"
live_migration_timeout = 5
peer_request_timeout = 2

[backends]
driver = "sim"

[peers]
"compute.host-a" = "127.0.0.1:12400"
"#,
        )
        .unwrap();

        let config = parse(&path).unwrap();
        assert_eq!(config.host, "host-b");
        assert_eq!(config.live_migration_timeout, 5);
        assert_eq!(config.peer_request_timeout, 2);
        assert_eq!(
            config.peers.get("compute.host-a"),
            Some(&"127.0.0.1:12400".parse().unwrap())
        );
    }

    #[test]
    fn parse_rejects_missing_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compute.toml");
        std::fs::write(&path, "compute_topic = \"compute\"").unwrap();
        assert!(matches!(parse(&path), Err(ParseError::Toml(_))));
    }
}
