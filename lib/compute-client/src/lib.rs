// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A client for the compute server API.
//!
//! Compute servers use this client to talk to their peers on other hosts
//! (e.g. during live migration); the scheduler layer can use it to drive a
//! host's instances.

use std::time::Duration;

use compute_api_types::{
    decode_error_trace, AttachVolumeRequest, CallContext,
    ConsoleOutputResponse, ErrorKind, HostResources, InstanceId,
    MigrationRequest, RemoteError, VolumeId, ADMIN_HEADER, ERROR_TRACE_HEADER,
    PROJECT_ID_HEADER, REQUEST_ID_HEADER, USER_ID_HEADER,
};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use slog::{debug, Logger};
use thiserror::Error;

pub use compute_api_types as types;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Communication error: {0}")]
    Communication(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {error}")]
    Remote { status: u16, error: RemoteError },
}

impl Error {
    /// Converts this error into the structured form shared by all compute
    /// services. Transport failures are reported as `Unavailable`.
    pub fn into_remote(self) -> RemoteError {
        match self {
            Error::Communication(e) => RemoteError::new(
                ErrorKind::Unavailable,
                "failed to reach compute service",
                e.to_string(),
            ),
            Error::Remote { error, .. } => error,
        }
    }
}

/// The body dropshot returns alongside a failed request.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    request_id: String,
    #[serde(default)]
    error_code: Option<String>,
    message: String,
}

fn kind_for_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::CONFLICT => ErrorKind::Conflict,
        StatusCode::SERVICE_UNAVAILABLE => ErrorKind::Unavailable,
        _ => ErrorKind::Internal,
    }
}

/// Rebuilds a [`RemoteError`] from a failed response's status, body and the
/// trace the server attached, if any.
fn remote_error_from_body(
    status: StatusCode,
    body: &str,
    trace: Option<String>,
    url: &str,
) -> RemoteError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => {
            let origin =
                format!("request {} to {} failed", parsed.request_id, url);
            RemoteError::new(
                parsed
                    .error_code
                    .as_deref()
                    .map(ErrorKind::from_tag)
                    .unwrap_or_else(|| kind_for_status(status)),
                parsed.message,
                match trace {
                    Some(trace) => format!("{}\n({})", trace, origin),
                    None => origin,
                },
            )
        }
        Err(_) => RemoteError::new(
            kind_for_status(status),
            format!("request to {} failed with status {}", url, status),
            body.to_string(),
        ),
    }
}

/// A client for a single compute server.
#[derive(Clone, Debug)]
pub struct Client {
    client: reqwest::Client,
    baseurl: String,
    log: Logger,
}

impl Client {
    /// Creates a client for the server at `baseurl` (e.g.
    /// `http://[fd00::1]:12400`).
    pub fn new(baseurl: &str, log: Logger) -> Self {
        Self::new_with_client(baseurl, reqwest::Client::new(), log)
    }

    /// Creates a client whose requests fail once `timeout` has passed
    /// without a complete response.
    pub fn new_with_timeout(
        baseurl: &str,
        timeout: Duration,
        log: Logger,
    ) -> Result<Self, Error> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self::new_with_client(baseurl, client, log))
    }

    pub fn new_with_client(
        baseurl: &str,
        client: reqwest::Client,
        log: Logger,
    ) -> Self {
        Self {
            client,
            baseurl: baseurl.trim_end_matches('/').to_string(),
            log,
        }
    }

    pub fn baseurl(&self) -> &str {
        &self.baseurl
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.baseurl, path)
    }

    fn with_context(
        builder: RequestBuilder,
        ctx: &CallContext,
    ) -> RequestBuilder {
        let builder = builder
            .header(USER_ID_HEADER, &ctx.user_id)
            .header(ADMIN_HEADER, ctx.is_admin.to_string());
        let builder = match &ctx.project_id {
            Some(project) => builder.header(PROJECT_ID_HEADER, project),
            None => builder,
        };
        match &ctx.request_id {
            Some(request_id) => builder.header(REQUEST_ID_HEADER, request_id),
            None => builder,
        }
    }

    async fn check(response: Response) -> Result<Response, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().to_string();
        let trace = response
            .headers()
            .get(ERROR_TRACE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(decode_error_trace);
        let body = response.text().await?;
        Err(Error::Remote {
            status: status.as_u16(),
            error: remote_error_from_body(status, &body, trace, &url),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        path: &str,
    ) -> Result<T, Error> {
        let url = self.url(path);
        debug!(self.log, "GET {}", url);
        let rsp =
            Self::with_context(self.client.get(&url), ctx).send().await?;
        Ok(Self::check(rsp).await?.json().await?)
    }

    async fn post<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        let url = self.url(path);
        debug!(self.log, "POST {}", url);
        let rsp = Self::with_context(self.client.post(&url), ctx)
            .json(body)
            .send()
            .await?;
        Ok(Self::check(rsp).await?.json().await?)
    }

    async fn post_no_content(
        &self,
        ctx: &CallContext,
        path: &str,
        body: Option<&MigrationRequest>,
    ) -> Result<(), Error> {
        let url = self.url(path);
        debug!(self.log, "POST {}", url);
        let mut builder = Self::with_context(self.client.post(&url), ctx);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Self::check(builder.send().await?).await?;
        Ok(())
    }

    pub async fn refresh_security_group(
        &self,
        ctx: &CallContext,
        security_group_id: &str,
    ) -> Result<(), Error> {
        let path = format!("/security-groups/{}/refresh", security_group_id);
        self.post_no_content(ctx, &path, None).await
    }

    pub async fn run_instance(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<(), Error> {
        let path = format!("/instances/{}/run", instance_id);
        self.post_no_content(ctx, &path, None).await
    }

    pub async fn terminate_instance(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<(), Error> {
        let path = format!("/instances/{}/terminate", instance_id);
        self.post_no_content(ctx, &path, None).await
    }

    pub async fn reboot_instance(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<(), Error> {
        let path = format!("/instances/{}/reboot", instance_id);
        self.post_no_content(ctx, &path, None).await
    }

    pub async fn rescue_instance(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<(), Error> {
        let path = format!("/instances/{}/rescue", instance_id);
        self.post_no_content(ctx, &path, None).await
    }

    pub async fn unrescue_instance(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<(), Error> {
        let path = format!("/instances/{}/unrescue", instance_id);
        self.post_no_content(ctx, &path, None).await
    }

    pub async fn get_console_output(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<String, Error> {
        let path = format!("/instances/{}/console", instance_id);
        let rsp: ConsoleOutputResponse = self.get(ctx, &path).await?;
        Ok(rsp.output)
    }

    pub async fn attach_volume(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
        volume_id: &VolumeId,
        mountpoint: &str,
    ) -> Result<bool, Error> {
        let path = format!(
            "/instances/{}/volumes/{}/attach",
            instance_id, volume_id
        );
        let body = AttachVolumeRequest { mountpoint: mountpoint.to_string() };
        self.post(ctx, &path, &body).await
    }

    pub async fn detach_volume(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
        volume_id: &VolumeId,
    ) -> Result<bool, Error> {
        let path = format!(
            "/instances/{}/volumes/{}/detach",
            instance_id, volume_id
        );
        self.post(ctx, &path, &()).await
    }

    pub async fn pre_live_migration(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
        dest: &str,
    ) -> Result<bool, Error> {
        let path = format!("/instances/{}/migrate/prepare", instance_id);
        let body = MigrationRequest { dest: dest.to_string() };
        self.post(ctx, &path, &body).await
    }

    pub async fn nwfilter_for_instance_exists(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
    ) -> Result<bool, Error> {
        let path = format!("/instances/{}/nwfilter", instance_id);
        self.get(ctx, &path).await
    }

    pub async fn live_migration(
        &self,
        ctx: &CallContext,
        instance_id: &InstanceId,
        dest: &str,
    ) -> Result<(), Error> {
        let path = format!("/instances/{}/migrate", instance_id);
        let body = MigrationRequest { dest: dest.to_string() };
        self.post_no_content(ctx, &path, Some(&body)).await
    }

    pub async fn host_resources(
        &self,
        ctx: &CallContext,
    ) -> Result<HostResources, Error> {
        self.get(ctx, "/host/resources").await
    }
}
