//! Test doubles for the credential and code-integrity seams.
//!
//! Compiled for unit tests and, with the `test-support` feature, for
//! downstream integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::credentials::{AuditToken, ConnectionCredential, PeerCredentialSource};
use crate::error::{AuthError, AuthResult};
use crate::identity::{
    Cancellation, CodeIdentity, CodeStatusFlags, IdentityVerifier, ImageGeneration, SigningQuery,
    VerifierError,
};

/// Credential source returning a fixed result.
#[derive(Debug, Clone)]
pub struct StaticCredential(AuthResult<ConnectionCredential>);

impl StaticCredential {
    /// A source that attests `credential`.
    #[must_use]
    pub const fn ok(credential: ConnectionCredential) -> Self {
        Self(Ok(credential))
    }

    /// A source that cannot attest its peer.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self(Err(AuthError::credential_unavailable(reason)))
    }
}

impl PeerCredentialSource for StaticCredential {
    fn peer_credential(&self) -> AuthResult<ConnectionCredential> {
        self.0.clone()
    }
}

/// Credential of a local user process with the given pid.
#[must_use]
pub fn credential(pid: u32) -> ConnectionCredential {
    ConnectionCredential::new(1000, 1000, AuditToken::new(pid, u64::from(pid) * 10, pid))
}

/// Validly signed identity with the given common name.
#[must_use]
pub fn trusted_identity(common_name: &str) -> CodeIdentity {
    CodeIdentity::new("me.mhaeuser.batterytoolkit", common_name)
        .with_flags(CodeStatusFlags::valid())
        .with_image_digest("00".repeat(32))
}

#[derive(Debug, Clone)]
enum Script {
    Identity(CodeIdentity),
    Failure(VerifierError),
    Transient {
        remaining: u32,
        then: CodeIdentity,
    },
}

#[derive(Debug, Default)]
struct ScriptState {
    scripts: HashMap<u32, Script>,
    generations: HashMap<u32, ImageGeneration>,
    last_query: Option<SigningQuery>,
    cancel_on_guest: Option<Cancellation>,
}

/// Verifier answering from per-pid scripts.
///
/// Counts backend calls and live code handles so tests can assert retry
/// bounds and handle release.
#[derive(Debug, Default)]
pub struct ScriptedVerifier {
    state: Mutex<ScriptState>,
    live: Arc<AtomicUsize>,
    guest_calls: AtomicUsize,
    signing_queries: AtomicUsize,
}

/// Code handle issued by [`ScriptedVerifier`].
#[derive(Debug)]
pub struct ScriptedCode {
    pid: u32,
    live: Arc<AtomicUsize>,
}

impl Drop for ScriptedCode {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedVerifier {
    /// Create a verifier that knows no processes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `identity` for `pid`.
    #[must_use]
    pub fn with_identity(self, pid: u32, identity: CodeIdentity) -> Self {
        self.set_identity(pid, identity);
        self
    }

    /// Fail every signing query for `pid` with `error`.
    #[must_use]
    pub fn with_failure(self, pid: u32, error: VerifierError) -> Self {
        self.lock().scripts.insert(pid, Script::Failure(error));
        self
    }

    /// Fail the next `count` signing queries for `pid` transiently, then
    /// report `then`.
    #[must_use]
    pub fn with_transient_failures(self, pid: u32, count: u32, then: CodeIdentity) -> Self {
        self.lock().scripts.insert(
            pid,
            Script::Transient {
                remaining: count,
                then,
            },
        );
        self
    }

    /// Report `generation` as the image generation of `pid`.
    #[must_use]
    pub fn with_generation(self, pid: u32, generation: ImageGeneration) -> Self {
        self.set_generation(pid, generation);
        self
    }

    /// Replace the identity reported for `pid`.
    pub fn set_identity(&self, pid: u32, identity: CodeIdentity) {
        self.lock().scripts.insert(pid, Script::Identity(identity));
    }

    /// Replace the image generation reported for `pid`.
    pub fn set_generation(&self, pid: u32, generation: ImageGeneration) {
        self.lock().generations.insert(pid, generation);
    }

    /// Set `cancel` whenever a code handle is acquired.
    pub fn cancel_on_guest(&self, cancel: Cancellation) {
        self.lock().cancel_on_guest = Some(cancel);
    }

    /// Code handles acquired and not yet released.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Calls to [`IdentityVerifier::copy_guest`].
    #[must_use]
    pub fn guest_calls(&self) -> usize {
        self.guest_calls.load(Ordering::SeqCst)
    }

    /// Calls to [`IdentityVerifier::copy_signing_information`].
    #[must_use]
    pub fn signing_queries(&self) -> usize {
        self.signing_queries.load(Ordering::SeqCst)
    }

    /// The last query passed to [`IdentityVerifier::copy_signing_information`].
    #[must_use]
    pub fn last_query(&self) -> Option<SigningQuery> {
        self.lock().last_query
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IdentityVerifier for ScriptedVerifier {
    type Code = ScriptedCode;

    fn copy_guest(&self, credential: &ConnectionCredential) -> Result<ScriptedCode, VerifierError> {
        self.guest_calls.fetch_add(1, Ordering::SeqCst);
        let pid = credential.pid();

        let state = self.lock();
        if !state.scripts.contains_key(&pid) {
            return Err(VerifierError::ProcessGone { pid });
        }
        if let Some(cancel) = &state.cancel_on_guest {
            cancel.cancel();
        }
        drop(state);

        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedCode {
            pid,
            live: Arc::clone(&self.live),
        })
    }

    fn copy_signing_information(
        &self,
        code: &ScriptedCode,
        query: SigningQuery,
    ) -> Result<CodeIdentity, VerifierError> {
        self.signing_queries.fetch_add(1, Ordering::SeqCst);

        let mut state = self.lock();
        state.last_query = Some(query);
        match state.scripts.get_mut(&code.pid) {
            None => Err(VerifierError::ProcessGone { pid: code.pid }),
            Some(Script::Identity(identity)) => Ok(identity.clone()),
            Some(Script::Failure(error)) => Err(error.clone()),
            Some(Script::Transient { remaining, then }) => {
                if *remaining == 0 {
                    Ok(then.clone())
                } else {
                    *remaining -= 1;
                    Err(VerifierError::subsystem("scripted transient failure"))
                }
            },
        }
    }

    fn image_generation(&self, code: &ScriptedCode) -> Result<Option<ImageGeneration>, VerifierError> {
        Ok(self.lock().generations.get(&code.pid).copied())
    }

    fn runtime_flags(&self, code: &ScriptedCode) -> Result<Option<CodeStatusFlags>, VerifierError> {
        match self.lock().scripts.get(&code.pid) {
            None => Err(VerifierError::ProcessGone { pid: code.pid }),
            Some(Script::Identity(identity) | Script::Transient { then: identity, .. }) => {
                Ok(Some(identity.flags))
            },
            Some(Script::Failure(error)) => Err(error.clone()),
        }
    }
}
