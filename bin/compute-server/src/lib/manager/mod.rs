// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implements the compute manager: the orchestration core for the instances on
//! a single compute host.
//!
//! The manager owns no instance state of its own. Every operation elevates its
//! caller's context, fetches a fresh copy of the instance record from the
//! instance store, drives the hypervisor driver (and the network and volume
//! collaborators) through the guarded steps of the operation, and finally
//! resynchronizes the record's power state with what the driver reports.
//!
//! Operations that target the same instance are serialized by a per-instance
//! lock table; operations on different instances proceed concurrently.
//!
//! The operations themselves live in submodules:
//!
//! - `state_sync`: reconciles the stored power state with the driver.
//! - `lifecycle_ops`: run, terminate, reboot, rescue, and unrescue.
//! - `volume_ops`: attaching and detaching volumes, with rollback.
//!
//! The live migration handshake is implemented in [`crate::migrate`].

use std::path::PathBuf;
use std::sync::Arc;

use compute_api_types::{
    encode_error_trace, ErrorKind, InstanceId, RemoteError, VolumeId,
    ERROR_TRACE_HEADER,
};
use compute_server_config::Config;
use dropshot::{ErrorStatusCode, HttpError};
use slog::Logger;
use thiserror::Error;

use crate::collaborators::{
    Collaborators, Driver, DriverError, InstanceStore, NetworkManager,
    StoreError, VolumeManager,
};
use crate::migrate::{MigrateError, PeerRpc};

mod instance_locks;
mod lifecycle_ops;
mod state_sync;
mod volume_ops;

#[cfg(test)]
pub(crate) mod testing;

use instance_locks::InstanceLocks;

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("instance {0} has already been created")]
    AlreadyCreated(InstanceId),

    #[error("trying to destroy already destroyed instance: {0}")]
    AlreadyDestroyed(InstanceId),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to set up networking for instance {instance_id}")]
    Network {
        instance_id: InstanceId,
        #[source]
        source: anyhow::Error,
    },

    #[error("volume manager failed for volume {volume_id}")]
    Volume {
        volume_id: VolumeId,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to query host inventory")]
    HostInventory(#[source] anyhow::Error),

    #[error(transparent)]
    Migration(#[from] MigrateError),
}

impl ComputeError {
    /// Classifies this error for callers on the other side of an RPC.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ComputeError::AlreadyCreated(_)
            | ComputeError::AlreadyDestroyed(_) => ErrorKind::Conflict,
            ComputeError::Driver(DriverError::InstanceNotFound(_)) => {
                ErrorKind::NotFound
            }
            ComputeError::Driver(DriverError::Failed(_)) => {
                ErrorKind::DriverFailure
            }
            ComputeError::Store(StoreError::NotFound { .. }) => {
                ErrorKind::NotFound
            }
            ComputeError::Store(StoreError::Backend(_))
            | ComputeError::Network { .. }
            | ComputeError::Volume { .. }
            | ComputeError::HostInventory(_) => ErrorKind::Internal,
            ComputeError::Migration(e) => e.kind(),
        }
    }

    /// Renders this error and the chain of errors that caused it.
    pub fn trace(&self) -> String {
        let mut trace = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            trace.push_str(&format!("\ncaused by: {}", cause));
            source = cause.source();
        }
        trace
    }

    pub fn to_remote(&self) -> RemoteError {
        RemoteError::new(self.kind(), self.to_string(), self.trace())
    }
}

impl From<ComputeError> for HttpError {
    fn from(err: ComputeError) -> Self {
        let kind = err.kind();
        let status_code = match kind {
            ErrorKind::NotFound => ErrorStatusCode::NOT_FOUND,
            ErrorKind::Conflict => ErrorStatusCode::CONFLICT,
            ErrorKind::DriverFailure
            | ErrorKind::ProtocolTimeout
            | ErrorKind::Unavailable => ErrorStatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => ErrorStatusCode::INTERNAL_SERVER_ERROR,
        };
        let trace = err.trace();
        let mut http_err = HttpError {
            status_code,
            error_code: Some(kind.as_str().to_string()),
            external_message: err.to_string(),
            internal_message: trace.clone(),
            headers: None,
        };
        // The encoded trace is always a valid header value.
        let _ = http_err
            .add_header(ERROR_TRACE_HEADER, encode_error_trace(&trace));
        http_err
    }
}

/// The orchestration core for the instances on one compute host.
pub struct ComputeManager {
    /// The name of the compute node this manager runs on.
    pub(crate) host: String,
    pub(crate) compute_topic: String,
    pub(crate) instances_path: PathBuf,

    /// How many one-second polls a migration source makes while waiting for
    /// the destination's network filters.
    pub(crate) live_migration_timeout: u64,

    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) network: Arc<dyn NetworkManager>,
    pub(crate) volumes: Arc<dyn VolumeManager>,
    pub(crate) store: Arc<dyn InstanceStore>,
    pub(crate) peers: Arc<dyn PeerRpc>,

    pub(crate) locks: InstanceLocks,
    pub(crate) log: Logger,
}

impl ComputeManager {
    pub fn new(
        config: &Config,
        collaborators: Collaborators,
        log: Logger,
    ) -> Self {
        let Collaborators { driver, network, volumes, store, peers } =
            collaborators;
        Self {
            host: config.host.clone(),
            compute_topic: config.compute_topic.clone(),
            instances_path: config.instances_path.clone(),
            live_migration_timeout: config.live_migration_timeout,
            driver,
            network,
            volumes,
            store,
            peers,
            locks: InstanceLocks::default(),
            log,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_and_not_found_are_terminal() {
        let conflict = ComputeError::AlreadyCreated(InstanceId::from("i-1"));
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert!(!conflict.to_remote().is_retryable());

        let missing = ComputeError::Store(StoreError::NotFound {
            kind: "instance",
            id: "i-1".to_string(),
        });
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert!(!missing.to_remote().is_retryable());
    }

    #[test]
    fn driver_failures_are_retryable() {
        let err = ComputeError::Driver(DriverError::Failed(
            "hypervisor busy".to_string(),
        ));
        let remote = err.to_remote();
        assert_eq!(remote.kind, ErrorKind::DriverFailure);
        assert!(remote.is_retryable());
    }

    #[test]
    fn trace_includes_causes() {
        let err = ComputeError::Volume {
            volume_id: VolumeId::from("v-1"),
            source: anyhow::anyhow!("export missing"),
        };
        let trace = err.trace();
        assert!(trace.starts_with("volume manager failed for volume v-1"));
        assert!(trace.contains("caused by: export missing"));
    }

    #[test]
    fn http_errors_keep_message_and_trace() {
        let err = ComputeError::Volume {
            volume_id: VolumeId::from("v-1"),
            source: anyhow::anyhow!("export missing"),
        };
        let http_err = HttpError::from(err);
        assert_eq!(
            http_err.status_code,
            ErrorStatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(http_err.error_code.as_deref(), Some("Internal"));
        assert_eq!(
            http_err.external_message,
            "volume manager failed for volume v-1"
        );

        let header = http_err
            .headers
            .as_ref()
            .and_then(|h| h.get(ERROR_TRACE_HEADER))
            .and_then(|v| v.to_str().ok())
            .and_then(compute_api_types::decode_error_trace)
            .unwrap();
        assert!(header.contains("caused by: export missing"));
    }

    #[test]
    fn http_status_follows_kind() {
        let missing = HttpError::from(ComputeError::Migration(
            MigrateError::NoFixedAddress {
                instance_id: InstanceId::from("i-1"),
                hostname: "i-1".to_string(),
            },
        ));
        assert_eq!(missing.status_code, ErrorStatusCode::NOT_FOUND);
        assert!(missing.external_message.contains("no fixed IP address"));

        let failed = HttpError::from(ComputeError::Driver(
            DriverError::Failed("hypervisor busy".to_string()),
        ));
        assert_eq!(failed.status_code, ErrorStatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(failed.error_code.as_deref(), Some("DriverFailure"));
    }
}
