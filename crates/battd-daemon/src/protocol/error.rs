//! Protocol error types for the control socket.
//!
//! # Security Considerations
//!
//! Nothing in a [`ProtocolError`] is sent to the peer verbatim. Peers see a
//! [`Status`](super::messages::Status) code; the error text is for the local
//! log.

use std::io;

use thiserror::Error;

/// Maximum request frame size in bytes (1 MiB).
///
/// Checked against the length prefix before any allocation.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum handshake frame size in bytes (64 KiB).
///
/// The handshake runs before the peer has been admitted, so it gets a much
/// smaller allowance than regular requests.
pub const MAX_HANDSHAKE_FRAME_SIZE: usize = 64 * 1024;

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Protocol errors for the control socket.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Size from the length prefix.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Protocol version mismatch during handshake.
    #[error("version mismatch: client version {client_version}, server version {server_version}")]
    VersionMismatch {
        /// Version requested by client.
        client_version: u32,
        /// Version supported by server.
        server_version: u32,
    },

    /// Handshake protocol failure.
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// Description of the handshake failure.
        reason: String,
    },

    /// The peer failed admission.
    #[error("peer not authorized")]
    NotAuthorized,

    /// Timeout waiting for the peer.
    #[error("operation timed out after {duration_ms} ms")]
    Timeout {
        /// Duration in milliseconds before timeout.
        duration_ms: u64,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization error.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },
}

impl ProtocolError {
    /// Create a frame too large error.
    #[must_use]
    pub const fn frame_too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }

    /// Create a version mismatch error.
    #[must_use]
    pub const fn version_mismatch(client_version: u32) -> Self {
        Self::VersionMismatch {
            client_version,
            server_version: PROTOCOL_VERSION,
        }
    }

    /// Create a timeout error.
    #[must_use]
    pub const fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a handshake failed error.
    #[must_use]
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    #[must_use]
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the peer broke the protocol and must be dropped.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. } | Self::VersionMismatch { .. }
                | Self::HandshakeFailed { .. }
        )
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
