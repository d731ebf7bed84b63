//! Request and response messages exchanged after the handshake.
//!
//! Messages are JSON objects, one per frame:
//!
//! ```json
//! {"id": 7, "command": "charge_to_full"}
//! {"id": 8, "command": {"set_settings": {"settings": {"min_charge": 60, "max_charge": 80, "adapter_sleep": false}}}}
//! {"id": 8, "status": "success"}
//! ```
//!
//! # Security Considerations
//!
//! [`parse_request`] runs on bytes from a peer that was admitted but may
//! still send anything. It never panics and bounds the input size before
//! parsing.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{MAX_FRAME_SIZE, ProtocolError, ProtocolResult};
use crate::power::Settings;

/// Commands understood by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Command {
    /// Whether power management is supported.
    IsSupported,
    /// Current power state.
    GetState,
    /// Current settings.
    GetSettings,
    /// Stop drawing power from the adapter.
    DisablePowerAdapter,
    /// Resume drawing power from the adapter.
    EnablePowerAdapter,
    /// Charge to 100% once.
    ChargeToFull,
    /// Charge to the upper limit once.
    ChargeToLimit,
    /// Stop charging.
    DisableCharging,
    /// Pause background activity.
    PauseActivity,
    /// Resume background activity.
    ResumeActivity,
    /// Prepare for a daemon update.
    PrepareUpdate,
    /// Finish a daemon update.
    FinishUpdate,
    /// Replace the settings.
    SetSettings {
        /// New settings.
        settings: Settings,
    },
}

impl Command {
    /// Stable name for logs and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::IsSupported => "is_supported",
            Self::GetState => "get_state",
            Self::GetSettings => "get_settings",
            Self::DisablePowerAdapter => "disable_power_adapter",
            Self::EnablePowerAdapter => "enable_power_adapter",
            Self::ChargeToFull => "charge_to_full",
            Self::ChargeToLimit => "charge_to_limit",
            Self::DisableCharging => "disable_charging",
            Self::PauseActivity => "pause_activity",
            Self::ResumeActivity => "resume_activity",
            Self::PrepareUpdate => "prepare_update",
            Self::FinishUpdate => "finish_update",
            Self::SetSettings { .. } => "set_settings",
        }
    }

    /// Returns `true` if the command changes machine state and must pass the
    /// authorization gate on every call.
    #[must_use]
    pub const fn is_privileged(&self) -> bool {
        !matches!(self, Self::IsSupported | Self::GetState | Self::GetSettings)
    }

    /// Returns `true` if the peer's user must also hold the manage right.
    ///
    /// Update notifications only need the code identity.
    #[must_use]
    pub const fn needs_manage_right(&self) -> bool {
        self.is_privileged() && !matches!(self, Self::PrepareUpdate | Self::FinishUpdate)
    }
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    /// Correlation id echoed in the response.
    pub id: u64,
    /// What to do.
    pub command: Command,
}

impl Request {
    /// Create a request.
    #[must_use]
    pub const fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

/// Outcome reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The command ran.
    Success,
    /// The command failed for an unspecified reason.
    Unknown,
    /// The peer may not run the command. Sent for every denial kind.
    NotAuthorized,
    /// The daemon could not complete the exchange.
    CommFailed,
    /// The request or its arguments were invalid.
    MalformedData,
    /// The machine does not support the command.
    Unsupported,
}

impl Status {
    /// Stable label for metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Unknown => "unknown",
            Self::NotAuthorized => "not_authorized",
            Self::CommFailed => "comm_failed",
            Self::MalformedData => "malformed_data",
            Self::Unsupported => "unsupported",
        }
    }
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Response {
    /// Id of the request answered, 0 if it could not be parsed.
    pub id: u64,
    /// Outcome.
    pub status: Status,
    /// Command result, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Response {
    /// A reply without payload.
    #[must_use]
    pub const fn status(id: u64, status: Status) -> Self {
        Self {
            id,
            status,
            payload: None,
        }
    }

    /// A successful reply carrying `payload`.
    #[must_use]
    pub const fn success(id: u64, payload: serde_json::Value) -> Self {
        Self {
            id,
            status: Status::Success,
            payload: Some(payload),
        }
    }

    /// Reply to a frame that did not parse.
    #[must_use]
    pub const fn malformed() -> Self {
        Self::status(0, Status::MalformedData)
    }
}

/// Parses a request frame.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] for oversized input and
/// [`ProtocolError::Serialization`] for anything that is not a request.
pub fn parse_request(frame: &[u8]) -> ProtocolResult<Request> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::frame_too_large(frame.len(), MAX_FRAME_SIZE));
    }
    Ok(serde_json::from_slice(frame)?)
}

/// Serializes a request.
pub fn serialize_request(request: &Request) -> ProtocolResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(request)?))
}

/// Parses a response frame.
pub fn parse_response(frame: &[u8]) -> ProtocolResult<Response> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::frame_too_large(frame.len(), MAX_FRAME_SIZE));
    }
    Ok(serde_json::from_slice(frame)?)
}

/// Serializes a response.
pub fn serialize_response(response: &Response) -> ProtocolResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(response)?))
}
