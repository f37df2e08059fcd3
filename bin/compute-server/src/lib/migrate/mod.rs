// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The live migration handshake between two compute hosts.
//!
//! The source host asks the destination to prepare for the instance
//! (`pre_live_migration`), polls the destination until its network filters
//! for the instance exist, and only then asks its own driver to move the
//! guest. The destination side of the handshake lives in [`destination`];
//! the source side in [`source`].

use std::time::Duration;

use async_trait::async_trait;
use compute_api_types::{CallContext, ErrorKind, InstanceId, RemoteError};
use thiserror::Error;

pub mod destination;
pub mod peer;
pub mod source;

/// How long the source waits between checks for the destination's network
/// filters.
pub(crate) const NWFILTER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Errors which may occur during the course of a migration
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MigrateError {
    /// The destination can't host the instance without a fixed address.
    #[error("no fixed IP address found for instance {instance_id} ({hostname})")]
    NoFixedAddress { instance_id: InstanceId, hostname: String },

    #[error("instance {instance_id} is already on {dest}")]
    SameHost { instance_id: InstanceId, dest: String },

    /// The destination answered the preparation request with `false`.
    #[error("destination {dest} declined to prepare for migration")]
    PreparationDeclined { dest: String },

    #[error("destination {dest} failed to prepare for migration")]
    PreparationFailed {
        dest: String,
        #[source]
        source: RemoteError,
    },

    /// The destination's network filters didn't appear in time.
    #[error(
        "timed out after {timeout_secs}s waiting for network filters on {dest}"
    )]
    Timeout { dest: String, timeout_secs: u64 },

    #[error("migration peer {dest} encountered error")]
    Peer {
        dest: String,
        #[source]
        source: RemoteError,
    },

    #[error("driver failed to migrate {name} to {dest}")]
    DriverReportedFailure { name: String, dest: String },
}

impl MigrateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::NoFixedAddress { .. } => ErrorKind::NotFound,
            MigrateError::SameHost { .. } => ErrorKind::Conflict,
            MigrateError::PreparationDeclined { .. } => ErrorKind::Internal,
            MigrateError::PreparationFailed { source, .. }
            | MigrateError::Peer { source, .. } => source.kind,
            MigrateError::Timeout { .. } => ErrorKind::ProtocolTimeout,
            MigrateError::DriverReportedFailure { .. } => {
                ErrorKind::DriverFailure
            }
        }
    }
}

/// Calls a compute service on another host, addressed by its RPC topic.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerRpc: Send + Sync {
    async fn pre_live_migration(
        &self,
        ctx: &CallContext,
        topic: &str,
        instance_id: &InstanceId,
        dest: &str,
    ) -> Result<bool, RemoteError>;

    async fn nwfilter_for_instance_exists(
        &self,
        ctx: &CallContext,
        topic: &str,
        instance_id: &InstanceId,
    ) -> Result<bool, RemoteError>;
}
