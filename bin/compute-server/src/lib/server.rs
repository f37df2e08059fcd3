// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP server callback functions.
//!
//! Functions in this module verify parameters and convert between types (API
//! request types to compute manager calls, and manager errors to HTTP
//! errors); the orchestration itself happens in [`ComputeManager`].

use std::sync::Arc;

use compute_api_types::{
    AttachVolumeRequest, CallContext, ConsoleOutputResponse, HostResources,
    InstancePathParams, MigrationRequest, SecurityGroupPathParams,
    VolumePathParams, ADMIN_HEADER, PROJECT_ID_HEADER, REQUEST_ID_HEADER,
    USER_ID_HEADER,
};
use dropshot::{
    endpoint, ApiDescription, HttpError, HttpResponseOk,
    HttpResponseUpdatedNoContent, Path, RequestContext, TypedBody,
};
use slog::{error, Logger};

use crate::manager::{ComputeError, ComputeManager};

const ANONYMOUS_USER: &str = "anonymous";

/// Context accessible from HTTP callbacks.
pub struct ServerContext {
    pub manager: Arc<ComputeManager>,
    pub log: Logger,
}

impl ServerContext {
    pub fn new(manager: Arc<ComputeManager>, log: Logger) -> Self {
        Self { manager, log }
    }
}

type ComputeApiContext = Arc<ServerContext>;

/// Builds the caller's context from request headers. Callers are trusted to
/// identify themselves. A caller that doesn't name the request it is acting
/// for gets this request's id.
fn call_context(rqctx: &RequestContext<ComputeApiContext>) -> CallContext {
    let headers = rqctx.request.headers();
    let header = |name: &str| {
        headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
    };

    let mut ctx = CallContext::new(
        header(USER_ID_HEADER).unwrap_or_else(|| ANONYMOUS_USER.to_string()),
        header(PROJECT_ID_HEADER),
    );
    ctx.is_admin = header(ADMIN_HEADER).is_some_and(|v| v == "true");
    ctx.with_request_id(
        header(REQUEST_ID_HEADER).unwrap_or_else(|| rqctx.request_id.clone()),
    )
}

/// Logs a failed operation and converts its error for the HTTP layer.
fn to_http_error(
    log: &Logger,
    ctx: &CallContext,
    op: &'static str,
    err: ComputeError,
) -> HttpError {
    error!(log, "compute operation failed";
           "op" => op,
           "request_id" => ctx.request_id.as_deref().unwrap_or_default(),
           "kind" => %err.kind(),
           "error" => err.trace());
    err.into()
}

#[endpoint {
    method = POST,
    path = "/security-groups/{security_group_id}/refresh",
}]
async fn security_group_refresh(
    rqctx: RequestContext<ComputeApiContext>,
    path_params: Path<SecurityGroupPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = call_context(&rqctx);
    let server = rqctx.context();
    let id = path_params.into_inner().security_group_id;
    server
        .manager
        .refresh_security_group(&ctx, &id)
        .await
        .map_err(|e| {
            to_http_error(&server.log, &ctx, "refresh_security_group", e)
        })?;
    Ok(HttpResponseUpdatedNoContent {})
}

#[endpoint {
    method = POST,
    path = "/instances/{instance_id}/run",
}]
async fn instance_run(
    rqctx: RequestContext<ComputeApiContext>,
    path_params: Path<InstancePathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = call_context(&rqctx);
    let server = rqctx.context();
    let id = path_params.into_inner().instance_id;
    server
        .manager
        .run_instance(&ctx, &id)
        .await
        .map_err(|e| to_http_error(&server.log, &ctx, "run_instance", e))?;
    Ok(HttpResponseUpdatedNoContent {})
}

#[endpoint {
    method = POST,
    path = "/instances/{instance_id}/terminate",
}]
async fn instance_terminate(
    rqctx: RequestContext<ComputeApiContext>,
    path_params: Path<InstancePathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = call_context(&rqctx);
    let server = rqctx.context();
    let id = path_params.into_inner().instance_id;
    server
        .manager
        .terminate_instance(&ctx, &id)
        .await
        .map_err(|e| {
            to_http_error(&server.log, &ctx, "terminate_instance", e)
        })?;
    Ok(HttpResponseUpdatedNoContent {})
}

#[endpoint {
    method = POST,
    path = "/instances/{instance_id}/reboot",
}]
async fn instance_reboot(
    rqctx: RequestContext<ComputeApiContext>,
    path_params: Path<InstancePathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = call_context(&rqctx);
    let server = rqctx.context();
    let id = path_params.into_inner().instance_id;
    server
        .manager
        .reboot_instance(&ctx, &id)
        .await
        .map_err(|e| to_http_error(&server.log, &ctx, "reboot_instance", e))?;
    Ok(HttpResponseUpdatedNoContent {})
}

#[endpoint {
    method = POST,
    path = "/instances/{instance_id}/rescue",
}]
async fn instance_rescue(
    rqctx: RequestContext<ComputeApiContext>,
    path_params: Path<InstancePathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = call_context(&rqctx);
    let server = rqctx.context();
    let id = path_params.into_inner().instance_id;
    server
        .manager
        .rescue_instance(&ctx, &id)
        .await
        .map_err(|e| to_http_error(&server.log, &ctx, "rescue_instance", e))?;
    Ok(HttpResponseUpdatedNoContent {})
}

#[endpoint {
    method = POST,
    path = "/instances/{instance_id}/unrescue",
}]
async fn instance_unrescue(
    rqctx: RequestContext<ComputeApiContext>,
    path_params: Path<InstancePathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = call_context(&rqctx);
    let server = rqctx.context();
    let id = path_params.into_inner().instance_id;
    server
        .manager
        .unrescue_instance(&ctx, &id)
        .await
        .map_err(|e| to_http_error(&server.log, &ctx, "unrescue_instance", e))?;
    Ok(HttpResponseUpdatedNoContent {})
}

#[endpoint {
    method = GET,
    path = "/instances/{instance_id}/console",
}]
async fn instance_console_get(
    rqctx: RequestContext<ComputeApiContext>,
    path_params: Path<InstancePathParams>,
) -> Result<HttpResponseOk<ConsoleOutputResponse>, HttpError> {
    let ctx = call_context(&rqctx);
    let server = rqctx.context();
    let id = path_params.into_inner().instance_id;
    let output = server
        .manager
        .get_console_output(&ctx, &id)
        .await
        .map_err(|e| {
            to_http_error(&server.log, &ctx, "get_console_output", e)
        })?;
    Ok(HttpResponseOk(ConsoleOutputResponse { output }))
}

#[endpoint {
    method = POST,
    path = "/instances/{instance_id}/volumes/{volume_id}/attach",
}]
async fn instance_volume_attach(
    rqctx: RequestContext<ComputeApiContext>,
    path_params: Path<VolumePathParams>,
    request: TypedBody<AttachVolumeRequest>,
) -> Result<HttpResponseOk<bool>, HttpError> {
    let ctx = call_context(&rqctx);
    let server = rqctx.context();
    let VolumePathParams { instance_id, volume_id } = path_params.into_inner();
    let request = request.into_inner();
    let attached = server
        .manager
        .attach_volume(&ctx, &instance_id, &volume_id, &request.mountpoint)
        .await
        .map_err(|e| to_http_error(&server.log, &ctx, "attach_volume", e))?;
    Ok(HttpResponseOk(attached))
}

#[endpoint {
    method = POST,
    path = "/instances/{instance_id}/volumes/{volume_id}/detach",
}]
async fn instance_volume_detach(
    rqctx: RequestContext<ComputeApiContext>,
    path_params: Path<VolumePathParams>,
) -> Result<HttpResponseOk<bool>, HttpError> {
    let ctx = call_context(&rqctx);
    let server = rqctx.context();
    let VolumePathParams { instance_id, volume_id } = path_params.into_inner();
    let detached = server
        .manager
        .detach_volume(&ctx, &instance_id, &volume_id)
        .await
        .map_err(|e| to_http_error(&server.log, &ctx, "detach_volume", e))?;
    Ok(HttpResponseOk(detached))
}

#[endpoint {
    method = POST,
    path = "/instances/{instance_id}/migrate/prepare",
}]
async fn instance_migrate_prepare(
    rqctx: RequestContext<ComputeApiContext>,
    path_params: Path<InstancePathParams>,
    request: TypedBody<MigrationRequest>,
) -> Result<HttpResponseOk<bool>, HttpError> {
    let ctx = call_context(&rqctx);
    let server = rqctx.context();
    let id = path_params.into_inner().instance_id;
    let dest = request.into_inner().dest;
    let prepared = server
        .manager
        .pre_live_migration(&ctx, &id, &dest)
        .await
        .map_err(|e| {
            to_http_error(&server.log, &ctx, "pre_live_migration", e)
        })?;
    Ok(HttpResponseOk(prepared))
}

#[endpoint {
    method = GET,
    path = "/instances/{instance_id}/nwfilter",
}]
async fn instance_nwfilter_get(
    rqctx: RequestContext<ComputeApiContext>,
    path_params: Path<InstancePathParams>,
) -> Result<HttpResponseOk<bool>, HttpError> {
    let ctx = call_context(&rqctx);
    let server = rqctx.context();
    let id = path_params.into_inner().instance_id;
    let exists = server
        .manager
        .nwfilter_for_instance_exists(&ctx, &id)
        .await
        .map_err(|e| {
            to_http_error(&server.log, &ctx, "nwfilter_for_instance_exists", e)
        })?;
    Ok(HttpResponseOk(exists))
}

#[endpoint {
    method = POST,
    path = "/instances/{instance_id}/migrate",
}]
async fn instance_migrate(
    rqctx: RequestContext<ComputeApiContext>,
    path_params: Path<InstancePathParams>,
    request: TypedBody<MigrationRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = call_context(&rqctx);
    let server = rqctx.context();
    let id = path_params.into_inner().instance_id;
    let dest = request.into_inner().dest;
    server
        .manager
        .live_migration(&ctx, &id, &dest)
        .await
        .map_err(|e| to_http_error(&server.log, &ctx, "live_migration", e))?;
    Ok(HttpResponseUpdatedNoContent {})
}

#[endpoint {
    method = GET,
    path = "/host/resources",
}]
async fn host_resources_get(
    rqctx: RequestContext<ComputeApiContext>,
) -> Result<HttpResponseOk<HostResources>, HttpError> {
    let ctx = call_context(&rqctx);
    let server = rqctx.context();
    let resources = server
        .manager
        .host_resources(&ctx)
        .await
        .map_err(|e| to_http_error(&server.log, &ctx, "host_resources", e))?;
    Ok(HttpResponseOk(resources))
}

/// Returns a Dropshot [`ApiDescription`] object to launch a server.
pub fn api() -> ApiDescription<ComputeApiContext> {
    let mut api = ApiDescription::new();
    api.register(security_group_refresh).unwrap();
    api.register(instance_run).unwrap();
    api.register(instance_terminate).unwrap();
    api.register(instance_reboot).unwrap();
    api.register(instance_rescue).unwrap();
    api.register(instance_unrescue).unwrap();
    api.register(instance_console_get).unwrap();
    api.register(instance_volume_attach).unwrap();
    api.register(instance_volume_detach).unwrap();
    api.register(instance_migrate_prepare).unwrap();
    api.register(instance_nwfilter_get).unwrap();
    api.register(instance_migrate).unwrap();
    api.register(host_resources_get).unwrap();
    api
}
