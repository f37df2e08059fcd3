// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for types exposed by the compute-server API

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies an instance record in the instance store.
#[derive(
    Clone,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Identifies a volume record in the instance store.
#[derive(
    Clone,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(transparent)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for VolumeId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "x-compute-user-id";
/// Header carrying the caller's project id, if any.
pub const PROJECT_ID_HEADER: &str = "x-compute-project-id";
/// Header set to `true` when the caller is privileged.
pub const ADMIN_HEADER: &str = "x-compute-admin";
/// Header carrying the id of the request that started an operation, so that
/// a peer's log lines can be matched with the caller's.
pub const REQUEST_ID_HEADER: &str = "x-compute-request-id";
/// Response header carrying the diagnostic trace of a failed request, encoded
/// with [`encode_error_trace`].
pub const ERROR_TRACE_HEADER: &str = "x-compute-error-trace";

/// The identity on whose behalf an operation runs.
///
/// Authentication happens upstream of this service; the context is taken at
/// face value.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CallContext {
    pub user_id: String,
    pub project_id: Option<String>,
    pub is_admin: bool,
    pub request_id: Option<String>,
}

impl CallContext {
    pub fn new(user_id: impl Into<String>, project_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id,
            is_admin: false,
            request_id: None,
        }
    }

    pub fn with_request_id(self, request_id: impl Into<String>) -> Self {
        Self { request_id: Some(request_id.into()), ..self }
    }

    /// Returns a privileged copy of this context. All collaborator-facing
    /// work is done with an elevated context.
    pub fn elevated(&self) -> Self {
        Self { is_admin: true, ..self.clone() }
    }
}

/// The run state of a guest as observed by the hypervisor driver.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// The driver has no record of the guest.
    #[default]
    NoState,
    Running,
    /// The guest is stopped but may come back (e.g. a failed spawn).
    Shutdown,
    /// The guest has been torn down by the hypervisor.
    Shutoff,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::NoState => "no_state",
            PowerState::Running => "running",
            PowerState::Shutdown => "shutdown",
            PowerState::Shutoff => "shutoff",
        };
        f.write_str(s)
    }
}

/// A transient marker describing the lifecycle operation in flight on an
/// instance. An instance with no operation in flight has no task state.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Spawning,
    Rebooting,
    Rescuing,
    Unrescuing,
    Migrating,
}

/// Physical storage coordinates of a volume's export.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub struct VolumePlacement {
    pub shelf: u32,
    pub slot: u32,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AttachStatus {
    Attached,
    #[default]
    Detached,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct Volume {
    pub id: VolumeId,

    /// The guest device name the volume is (or was last) attached at.
    #[serde(default)]
    pub mountpoint: Option<String>,

    /// The instance this volume is attached to, if any.
    #[serde(default)]
    pub instance_id: Option<InstanceId>,

    #[serde(default)]
    pub attach_status: AttachStatus,

    #[serde(default)]
    pub placement: Option<VolumePlacement>,
}

impl Volume {
    pub fn new(id: impl Into<VolumeId>) -> Self {
        Self {
            id: id.into(),
            mountpoint: None,
            instance_id: None,
            attach_status: AttachStatus::Detached,
            placement: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct Instance {
    pub id: InstanceId,

    /// The name by which the hypervisor driver knows this instance.
    pub name: String,

    /// The compute node that owns this instance.
    #[serde(default)]
    pub host: Option<String>,

    /// The instance's externally visible identifier.
    pub hostname: String,

    #[serde(default)]
    pub power_state: PowerState,

    #[serde(default)]
    pub task_state: Option<TaskState>,

    #[serde(default)]
    pub launched_at: Option<DateTime<Utc>>,

    /// Attached volumes, in attachment order.
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl Instance {
    pub fn new(
        id: impl Into<InstanceId>,
        name: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            host: None,
            hostname: hostname.into(),
            power_state: PowerState::NoState,
            task_state: None,
            launched_at: None,
            volumes: Vec::new(),
        }
    }
}

/// A partial update to an instance record. Only the fields that are present
/// are written back to the store.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct InstanceUpdate {
    pub host: Option<String>,
    pub launched_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Deserialize, Serialize, JsonSchema)]
pub struct InstancePathParams {
    pub instance_id: InstanceId,
}

#[derive(Clone, Deserialize, Serialize, JsonSchema)]
pub struct VolumePathParams {
    pub instance_id: InstanceId,
    pub volume_id: VolumeId,
}

#[derive(Clone, Deserialize, Serialize, JsonSchema)]
pub struct SecurityGroupPathParams {
    pub security_group_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct AttachVolumeRequest {
    /// The guest device name to attach the volume at.
    pub mountpoint: String,
}

/// Names the destination host of a live migration.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct MigrationRequest {
    pub dest: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct ConsoleOutputResponse {
    pub output: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HostResources {
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
}

/// The classification carried by every error that crosses a service boundary.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    DriverFailure,
    ProtocolTimeout,
    /// A peer or collaborator could not be reached.
    Unavailable,
    Internal,
}

impl ErrorKind {
    /// Returns the tag used for this kind on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::DriverFailure => "DriverFailure",
            ErrorKind::ProtocolTimeout => "ProtocolTimeout",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Parses a wire tag. Unknown tags are treated as internal errors.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "NotFound" => ErrorKind::NotFound,
            "Conflict" => ErrorKind::Conflict,
            "DriverFailure" => ErrorKind::DriverFailure,
            "ProtocolTimeout" => ErrorKind::ProtocolTimeout,
            "Unavailable" => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured failure reported by a compute service, locally or by a peer.
#[derive(
    Clone, Debug, Deserialize, Eq, Error, JsonSchema, PartialEq, Serialize,
)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,

    /// Diagnostic detail (typically the chain of underlying causes).
    pub trace: String,
}

impl RemoteError {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        trace: impl Into<String>,
    ) -> Self {
        Self { kind, message: message.into(), trace: trace.into() }
    }

    /// Whether the failed operation may succeed if the caller tries again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ProtocolTimeout
                | ErrorKind::DriverFailure
                | ErrorKind::Unavailable
        )
    }
}

/// Encodes a trace as a JSON string literal containing only visible ASCII,
/// which makes it a valid HTTP header value.
pub fn encode_error_trace(trace: &str) -> String {
    let json = serde_json::Value::String(trace.to_string()).to_string();
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() && !c.is_ascii_control() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// Reverses [`encode_error_trace`]. Returns `None` for a malformed value.
pub fn decode_error_trace(value: &str) -> Option<String> {
    serde_json::from_str(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevation_keeps_identity() {
        let ctx = CallContext::new("alice", Some("proj".to_string()));
        let elevated = ctx.elevated();
        assert!(!ctx.is_admin);
        assert!(elevated.is_admin);
        assert_eq!(elevated.user_id, "alice");
        assert_eq!(elevated.project_id.as_deref(), Some("proj"));
    }

    #[test]
    fn request_id_survives_elevation() {
        let ctx = CallContext::new("alice", None).with_request_id("req-7");
        assert_eq!(ctx.elevated().request_id.as_deref(), Some("req-7"));
    }

    #[test]
    fn error_trace_header_is_visible_ascii() {
        let trace =
            "no fixed address for \"i-1\"\ncaused by: caf\u{e9} \u{1f4a5}";
        let encoded = encode_error_trace(trace);
        assert!(encoded.bytes().all(|b| (0x20..0x7f).contains(&b)));
        assert_eq!(decode_error_trace(&encoded).as_deref(), Some(trace));
        assert!(decode_error_trace("not json").is_none());
    }

    #[test]
    fn power_state_uses_snake_case_on_the_wire() {
        let json = serde_json::to_string(&PowerState::NoState).unwrap();
        assert_eq!(json, "\"no_state\"");
        let state: PowerState = serde_json::from_str("\"shutoff\"").unwrap();
        assert_eq!(state, PowerState::Shutoff);
    }

    #[test]
    fn instance_defaults_missing_fields() {
        let instance: Instance = serde_json::from_str(
            r#"{"id": "i-1", "name": "instance-1", "hostname": "i-1"}"#,
        )
        .unwrap();
        assert_eq!(instance.id, InstanceId::from("i-1"));
        assert_eq!(instance.power_state, PowerState::NoState);
        assert!(instance.task_state.is_none());
        assert!(instance.volumes.is_empty());
    }

    #[test]
    fn only_transient_kinds_are_retryable() {
        let retryable = [
            ErrorKind::ProtocolTimeout,
            ErrorKind::DriverFailure,
            ErrorKind::Unavailable,
        ];
        let terminal =
            [ErrorKind::NotFound, ErrorKind::Conflict, ErrorKind::Internal];

        for kind in retryable {
            assert!(RemoteError::new(kind, "m", "t").is_retryable());
        }
        for kind in terminal {
            assert!(!RemoteError::new(kind, "m", "t").is_retryable());
        }
    }

    #[test]
    fn error_kind_tags_parse_back() {
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::DriverFailure,
            ErrorKind::ProtocolTimeout,
            ErrorKind::Unavailable,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_tag(kind.as_str()), kind);
        }
        assert_eq!(ErrorKind::from_tag("Bogus"), ErrorKind::Internal);
    }
}
