//! Hello/HelloAck handshake.
//!
//! # Handshake Sequence
//!
//! ```text
//! Client                                         Server
//!   |                                               |
//!   |  -- Hello { version, client_info } -------->  |  admission runs
//!   |                                               |
//!   |  <-- HelloAck { version, server_info,         |
//!   |                 daemon_id } ----------------- |
//!   |      OR                                       |
//!   |  <-- HelloNack { error_code, message } ------ |
//! ```
//!
//! # Security Considerations
//!
//! - Admission is decided before the Hello is looked at, so an unadmitted
//!   peer learns nothing about supported versions
//! - A refused peer gets one generic message whatever the denial kind
//! - Hello frames are limited to [`MAX_HANDSHAKE_FRAME_SIZE`]

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{MAX_HANDSHAKE_FRAME_SIZE, PROTOCOL_VERSION, ProtocolError, ProtocolResult};

/// Message sent to every peer that fails admission.
pub const NOT_AUTHORIZED_MESSAGE: &str = "not authorized";

/// First message from the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Hello {
    /// Protocol version requested by the client.
    pub protocol_version: u32,

    /// Client identifier for logging, e.g. `"battery-toolkit/1.2"`.
    pub client_info: String,
}

impl Hello {
    /// Create a Hello for [`PROTOCOL_VERSION`].
    #[must_use]
    pub fn new(client_info: impl Into<String>) -> Self {
        Self::with_version(PROTOCOL_VERSION, client_info)
    }

    /// Create a Hello with a specific protocol version.
    #[must_use]
    pub fn with_version(protocol_version: u32, client_info: impl Into<String>) -> Self {
        Self {
            protocol_version,
            client_info: client_info.into(),
        }
    }
}

/// Server acceptance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HelloAck {
    /// Protocol version agreed upon.
    pub protocol_version: u32,

    /// Server identifier, e.g. `"battd/0.1.0"`.
    pub server_info: String,

    /// Hex SHA-256 of the daemon image.
    ///
    /// Changes whenever the daemon binary is replaced, so clients can tell
    /// they are talking to an upgraded daemon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_id: Option<String>,
}

impl HelloAck {
    /// Create an acknowledgment.
    #[must_use]
    pub fn new(server_info: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            server_info: server_info.into(),
            daemon_id: None,
        }
    }

    /// Set the daemon id.
    #[must_use]
    pub fn with_daemon_id(mut self, daemon_id: impl Into<String>) -> Self {
        self.daemon_id = Some(daemon_id.into());
        self
    }
}

/// Server rejection. The connection is closed after it is sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HelloNack {
    /// Error code.
    pub error_code: HandshakeErrorCode,

    /// Human-readable message.
    pub message: String,

    /// Server protocol version, for version mismatches only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<u32>,
}

impl HelloNack {
    /// Create a version mismatch rejection.
    #[must_use]
    pub fn version_mismatch(client_version: u32) -> Self {
        Self {
            error_code: HandshakeErrorCode::VersionMismatch,
            message: format!(
                "protocol version {client_version} not supported, server supports version {PROTOCOL_VERSION}"
            ),
            server_version: Some(PROTOCOL_VERSION),
        }
    }

    /// Create a rejection with a custom message.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            error_code: HandshakeErrorCode::Rejected,
            message: message.into(),
            server_version: None,
        }
    }

    /// The rejection sent to peers that fail admission.
    #[must_use]
    pub fn not_authorized() -> Self {
        Self::rejected(NOT_AUTHORIZED_MESSAGE)
    }

    /// Rejection while the daemon shuts down.
    #[must_use]
    pub fn shutting_down() -> Self {
        Self {
            error_code: HandshakeErrorCode::ServerShuttingDown,
            message: "server shutting down".to_string(),
            server_version: None,
        }
    }
}

/// Handshake rejection codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeErrorCode {
    /// Protocol version not supported.
    VersionMismatch,

    /// Rejected; includes every admission failure.
    Rejected,

    /// Server is shutting down.
    ServerShuttingDown,
}

/// Handshake message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Client Hello.
    Hello(Hello),

    /// Server acknowledgment.
    HelloAck(HelloAck),

    /// Server rejection.
    HelloNack(HelloNack),
}

impl From<Hello> for HandshakeMessage {
    fn from(hello: Hello) -> Self {
        Self::Hello(hello)
    }
}

impl From<HelloAck> for HandshakeMessage {
    fn from(ack: HelloAck) -> Self {
        Self::HelloAck(ack)
    }
}

impl From<HelloNack> for HandshakeMessage {
    fn from(nack: HelloNack) -> Self {
        Self::HelloNack(nack)
    }
}

/// Parses a handshake message, enforcing [`MAX_HANDSHAKE_FRAME_SIZE`].
pub fn parse_handshake_message(frame: &Bytes) -> ProtocolResult<HandshakeMessage> {
    if frame.len() > MAX_HANDSHAKE_FRAME_SIZE {
        return Err(ProtocolError::frame_too_large(
            frame.len(),
            MAX_HANDSHAKE_FRAME_SIZE,
        ));
    }

    serde_json::from_slice(frame)
        .map_err(|e| ProtocolError::serialization(format!("invalid handshake message: {e}")))
}

/// Parses a Hello, enforcing [`MAX_HANDSHAKE_FRAME_SIZE`].
pub fn parse_hello(frame: &Bytes) -> ProtocolResult<Hello> {
    match parse_handshake_message(frame)? {
        HandshakeMessage::Hello(hello) => Ok(hello),
        _ => Err(ProtocolError::handshake_failed("expected Hello message")),
    }
}

/// Serializes a handshake message.
pub fn serialize_handshake_message(msg: &HandshakeMessage) -> ProtocolResult<Bytes> {
    serde_json::to_vec(msg)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::serialization(format!("failed to serialize handshake message: {e}")))
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Waiting for the Hello (server) or the reply (client).
    #[default]
    AwaitingHello,

    /// Handshake completed.
    Completed,

    /// Handshake failed.
    Failed,
}

/// Server side of the handshake.
#[derive(Debug)]
pub struct ServerHandshake {
    server_info: String,
    daemon_id: Option<String>,
    state: HandshakeState,
}

impl ServerHandshake {
    /// Create a server handshake.
    #[must_use]
    pub fn new(server_info: impl Into<String>) -> Self {
        Self {
            server_info: server_info.into(),
            daemon_id: None,
            state: HandshakeState::AwaitingHello,
        }
    }

    /// Advertise `daemon_id` in the `HelloAck`.
    #[must_use]
    pub fn with_daemon_id(mut self, daemon_id: impl Into<String>) -> Self {
        self.daemon_id = Some(daemon_id.into());
        self
    }

    /// Processes the client Hello.
    ///
    /// `admitted` is the outcome of the authorization gate for this
    /// connection. A peer that was not admitted is refused with
    /// [`HelloNack::not_authorized`] regardless of its Hello.
    ///
    /// # Errors
    ///
    /// Returns an error if a Hello was already processed.
    pub fn process_hello(&mut self, hello: &Hello, admitted: bool) -> ProtocolResult<HandshakeMessage> {
        if self.state != HandshakeState::AwaitingHello {
            self.state = HandshakeState::Failed;
            return Err(ProtocolError::handshake_failed(
                "unexpected Hello message (already handshaked)",
            ));
        }

        if !admitted {
            self.state = HandshakeState::Failed;
            return Ok(HelloNack::not_authorized().into());
        }

        if hello.protocol_version != PROTOCOL_VERSION {
            self.state = HandshakeState::Failed;
            return Ok(HelloNack::version_mismatch(hello.protocol_version).into());
        }

        self.state = HandshakeState::Completed;

        let mut ack = HelloAck::new(&self.server_info);
        if let Some(id) = &self.daemon_id {
            ack = ack.with_daemon_id(id);
        }
        Ok(ack.into())
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Returns `true` if the handshake completed.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.state, HandshakeState::Completed)
    }
}

/// Client side of the handshake.
#[derive(Debug)]
pub struct ClientHandshake {
    client_info: String,
    state: HandshakeState,
    server_info: Option<String>,
    daemon_id: Option<String>,
}

impl ClientHandshake {
    /// Create a client handshake.
    #[must_use]
    pub fn new(client_info: impl Into<String>) -> Self {
        Self {
            client_info: client_info.into(),
            state: HandshakeState::AwaitingHello,
            server_info: None,
            daemon_id: None,
        }
    }

    /// The Hello to send.
    #[must_use]
    pub fn create_hello(&self) -> Hello {
        Hello::new(&self.client_info)
    }

    /// Processes the server reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the server refused the handshake.
    pub fn process_response(&mut self, response: HandshakeMessage) -> ProtocolResult<()> {
        match response {
            HandshakeMessage::HelloAck(ack) => {
                self.state = HandshakeState::Completed;
                self.server_info = Some(ack.server_info);
                self.daemon_id = ack.daemon_id;
                Ok(())
            },
            HandshakeMessage::HelloNack(nack) => {
                self.state = HandshakeState::Failed;
                match nack.error_code {
                    HandshakeErrorCode::VersionMismatch => {
                        Err(ProtocolError::version_mismatch(PROTOCOL_VERSION))
                    },
                    HandshakeErrorCode::Rejected if nack.message == NOT_AUTHORIZED_MESSAGE => {
                        Err(ProtocolError::NotAuthorized)
                    },
                    _ => Err(ProtocolError::handshake_failed(nack.message)),
                }
            },
            HandshakeMessage::Hello(_) => {
                self.state = HandshakeState::Failed;
                Err(ProtocolError::handshake_failed(
                    "received Hello instead of HelloAck/HelloNack",
                ))
            },
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Server info, once completed.
    #[must_use]
    pub fn server_info(&self) -> Option<&str> {
        self.server_info.as_deref()
    }

    /// Daemon id, once completed.
    #[must_use]
    pub fn daemon_id(&self) -> Option<&str> {
        self.daemon_id.as_deref()
    }

    /// Returns `true` if the handshake completed.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.state, HandshakeState::Completed)
    }
}
