//! Kernel-attested peer credentials.
//!
//! A [`ConnectionCredential`] is captured once, when a connection is
//! accepted, from a [`PeerCredentialSource`]. Implementations must read the
//! credential from the kernel (e.g. `SO_PEERCRED`), never from anything the
//! peer sends over the connection.
//!
//! # Audit Token
//!
//! A pid alone does not name a process: once the peer exits, the pid can be
//! reused. The [`AuditToken`] pairs the pid with its generation (the kernel
//! start time of the process) so later queries can detect reuse.

use std::fmt;

use serde::Serialize;

use crate::error::{AuthError, AuthResult};

/// Kernel identity of one process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AuditToken {
    pid: u32,
    pid_generation: u64,
    session_id: u32,
}

impl AuditToken {
    /// Create a token from its kernel-reported parts.
    #[must_use]
    pub const fn new(pid: u32, pid_generation: u64, session_id: u32) -> Self {
        Self {
            pid,
            pid_generation,
            session_id,
        }
    }

    /// Process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Process start time, in kernel clock ticks since boot.
    #[must_use]
    pub const fn pid_generation(&self) -> u64 {
        self.pid_generation
    }

    /// Session id of the process.
    #[must_use]
    pub const fn session_id(&self) -> u32 {
        self.session_id
    }
}

/// Peer credential bound to a connection at accept time.
///
/// Fields are private so the value cannot be altered after capture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionCredential {
    uid: u32,
    gid: u32,
    audit_token: AuditToken,
}

impl ConnectionCredential {
    /// Create a credential from kernel-reported values.
    #[must_use]
    pub const fn new(uid: u32, gid: u32, audit_token: AuditToken) -> Self {
        Self {
            uid,
            gid,
            audit_token,
        }
    }

    /// Peer process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.audit_token.pid
    }

    /// Peer effective user id.
    #[must_use]
    pub const fn uid(&self) -> u32 {
        self.uid
    }

    /// Peer effective group id.
    #[must_use]
    pub const fn gid(&self) -> u32 {
        self.gid
    }

    /// Full audit token.
    #[must_use]
    pub const fn audit_token(&self) -> &AuditToken {
        &self.audit_token
    }
}

impl fmt::Display for ConnectionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pid={} uid={} gid={} generation={} session={}",
            self.audit_token.pid,
            self.uid,
            self.gid,
            self.audit_token.pid_generation,
            self.audit_token.session_id
        )
    }
}

/// Capability for reading the kernel-attested credential of a connection.
///
/// One implementation exists per transport/platform. The core depends only
/// on this trait.
pub trait PeerCredentialSource {
    /// Reads the peer credential.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::CredentialUnavailable`] if the transport cannot
    /// attest the peer.
    fn peer_credential(&self) -> AuthResult<ConnectionCredential>;
}

impl<S: PeerCredentialSource + ?Sized> PeerCredentialSource for &S {
    fn peer_credential(&self) -> AuthResult<ConnectionCredential> {
        (**self).peer_credential()
    }
}

/// Extracts the peer credential of an accepted connection.
///
/// Any failure reported by the source, whatever its kind, is surfaced as
/// [`AuthError::CredentialUnavailable`]. A credential naming pid 0 is
/// rejected: pid 0 is what some kernels report when the peer could not be
/// attributed to a process.
///
/// # Errors
///
/// Returns [`AuthError::CredentialUnavailable`] on any failure.
pub fn extract<S: PeerCredentialSource + ?Sized>(source: &S) -> AuthResult<ConnectionCredential> {
    let credential = source.peer_credential().map_err(|e| match e {
        AuthError::CredentialUnavailable { .. } => e,
        other => AuthError::credential_unavailable(other.to_string()),
    })?;

    if credential.pid() == 0 {
        return Err(AuthError::credential_unavailable(
            "kernel did not attribute the connection to a process",
        ));
    }

    Ok(credential)
}
