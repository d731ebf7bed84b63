//! Kernel-attested credentials of a Unix-socket peer.
//!
//! `SO_PEERCRED` yields pid, uid and gid as recorded by the kernel when the
//! peer called `connect`. The audit token is completed from
//! `/proc/<pid>/stat` (start time and session) before the handshake, so a pid
//! recycled later is detected by every subsequent query.
//!
//! Reading `/proc` can block. The accept loop only reads `SO_PEERCRED`; the
//! rest runs on the blocking pool, in the connection task.

use std::fmt;

use battd_core::credentials::{AuditToken, ConnectionCredential, PeerCredentialSource};
use battd_core::error::{AuthError, AuthResult};
use tokio::net::UnixStream;
use tokio::net::unix::UCred;

use crate::platform::ProcFs;

/// Credential source handed from the listener to the connection task.
pub type PeerSource = Box<dyn PeerCredentialSource + Send>;

/// Creates the credential source of each accepted stream.
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    /// Source for `stream`.
    ///
    /// Runs on the accept loop and must not block. Anything slow belongs in
    /// the returned source's [`PeerCredentialSource::peer_credential`].
    fn source(&self, stream: &UnixStream) -> PeerSource;
}

/// [`PeerCredentialSource`] for an accepted Unix stream.
#[derive(Debug, Clone)]
pub struct UnixPeer {
    cred: AuthResult<UCred>,
    procfs: ProcFs,
}

impl UnixPeer {
    /// Reads `SO_PEERCRED` of `stream`. The `/proc` lookup is deferred.
    #[must_use]
    pub fn new(stream: &UnixStream, procfs: ProcFs) -> Self {
        let cred = stream
            .peer_cred()
            .map_err(|e| AuthError::credential_unavailable(format!("SO_PEERCRED: {e}")));
        Self { cred, procfs }
    }
}

impl PeerCredentialSource for UnixPeer {
    fn peer_credential(&self) -> AuthResult<ConnectionCredential> {
        let cred = self.cred.clone()?;

        let pid = cred
            .pid()
            .ok_or_else(|| AuthError::credential_unavailable("platform does not report peer pid"))?;
        let pid = u32::try_from(pid)
            .map_err(|_| AuthError::credential_unavailable(format!("invalid peer pid {pid}")))?;

        let stat = self
            .procfs
            .stat(pid)
            .map_err(|e| AuthError::credential_unavailable(e.to_string()))?;

        Ok(ConnectionCredential::new(
            cred.uid(),
            cred.gid(),
            AuditToken::new(pid, stat.start_time, stat.session),
        ))
    }
}

/// `SO_PEERCRED` plus `/proc/<pid>/stat`.
#[derive(Debug, Clone)]
pub struct ProcfsCredentials {
    procfs: ProcFs,
}

impl ProcfsCredentials {
    /// Provider reading audit tokens from `procfs`.
    #[must_use]
    pub const fn new(procfs: ProcFs) -> Self {
        Self { procfs }
    }
}

impl CredentialProvider for ProcfsCredentials {
    fn source(&self, stream: &UnixStream) -> PeerSource {
        Box::new(UnixPeer::new(stream, self.procfs.clone()))
    }
}
