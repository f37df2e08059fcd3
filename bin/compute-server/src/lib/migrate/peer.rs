// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reaches peer compute servers over HTTP.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use compute_api_types::{CallContext, ErrorKind, InstanceId, RemoteError};
use slog::{o, Logger};

use super::PeerRpc;

/// How long a request to a peer may take unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Resolves RPC topics to peer addresses from a static table.
pub struct HttpPeerRpc {
    peers: BTreeMap<String, SocketAddr>,
    request_timeout: Duration,
    log: Logger,
}

impl HttpPeerRpc {
    pub fn new(peers: BTreeMap<String, SocketAddr>, log: Logger) -> Self {
        Self { peers, request_timeout: DEFAULT_REQUEST_TIMEOUT, log }
    }

    /// Bounds each peer request. A peer that doesn't answer in time is
    /// reported as unavailable.
    pub fn with_request_timeout(self, request_timeout: Duration) -> Self {
        Self { request_timeout, ..self }
    }

    fn client_for(
        &self,
        topic: &str,
    ) -> Result<compute_client::Client, RemoteError> {
        let addr = self.peers.get(topic).ok_or_else(|| {
            RemoteError::new(
                ErrorKind::NotFound,
                format!("no compute peer is configured for topic {}", topic),
                "",
            )
        })?;
        compute_client::Client::new_with_timeout(
            &format!("http://{}", addr),
            self.request_timeout,
            self.log.new(o!("topic" => topic.to_string())),
        )
        .map_err(compute_client::Error::into_remote)
    }
}

#[async_trait]
impl PeerRpc for HttpPeerRpc {
    async fn pre_live_migration(
        &self,
        ctx: &CallContext,
        topic: &str,
        instance_id: &InstanceId,
        dest: &str,
    ) -> Result<bool, RemoteError> {
        self.client_for(topic)?
            .pre_live_migration(ctx, instance_id, dest)
            .await
            .map_err(compute_client::Error::into_remote)
    }

    async fn nwfilter_for_instance_exists(
        &self,
        ctx: &CallContext,
        topic: &str,
        instance_id: &InstanceId,
    ) -> Result<bool, RemoteError> {
        self.client_for(topic)?
            .nwfilter_for_instance_exists(ctx, instance_id)
            .await
            .map_err(compute_client::Error::into_remote)
    }
}
