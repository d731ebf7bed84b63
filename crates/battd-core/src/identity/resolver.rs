//! Identity resolution with bounded retry and cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use super::{CodeIdentity, IdentityVerifier, ImageGeneration, SigningQuery, VerifierError};
use crate::credentials::ConnectionCredential;
use crate::error::{AuthError, AuthResult};

/// Default number of retries after a transient subsystem failure.
pub const DEFAULT_SUBSYSTEM_RETRIES: u32 = 1;

/// Upper bound on configurable retries.
pub const MAX_SUBSYSTEM_RETRIES: u32 = 3;

/// Shared flag set when the connection behind an evaluation goes away.
///
/// Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    /// Create an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the evaluation as abandoned.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` once [`Cancellation::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Signing identity of the live image.
    pub identity: CodeIdentity,
    /// Fingerprint of the image at resolution time, if the backend has one.
    pub generation: Option<ImageGeneration>,
}

/// Resolves the current signing identity of a connected peer.
#[derive(Debug)]
pub struct IdentityResolver<V> {
    verifier: V,
    subsystem_retries: u32,
}

impl<V: IdentityVerifier> IdentityResolver<V> {
    /// Create a resolver with the default retry budget.
    #[must_use]
    pub const fn new(verifier: V) -> Self {
        Self {
            verifier,
            subsystem_retries: DEFAULT_SUBSYSTEM_RETRIES,
        }
    }

    /// Set the number of retries after a transient failure, capped at
    /// [`MAX_SUBSYSTEM_RETRIES`].
    #[must_use]
    pub fn with_subsystem_retries(mut self, retries: u32) -> Self {
        self.subsystem_retries = retries.min(MAX_SUBSYSTEM_RETRIES);
        self
    }

    /// The backend this resolver queries.
    #[must_use]
    pub const fn verifier(&self) -> &V {
        &self.verifier
    }

    /// Configured retry budget.
    #[must_use]
    pub const fn subsystem_retries(&self) -> u32 {
        self.subsystem_retries
    }

    /// Resolves the live signing identity of the peer named by `credential`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::SigningInfoUnavailable`] if the process is gone, was
    ///   replaced, or cannot be described
    /// - [`AuthError::Subsystem`] if every attempt failed transiently
    pub fn resolve(&self, credential: &ConnectionCredential) -> AuthResult<CodeIdentity> {
        self.resolve_cancellable(credential, &Cancellation::new())
            .map(|resolution| resolution.identity)
    }

    /// Like [`IdentityResolver::resolve`], but stops between stages once
    /// `cancel` is set and also reports the image fingerprint.
    ///
    /// # Errors
    ///
    /// As [`IdentityResolver::resolve`]; a cancelled evaluation is
    /// [`AuthError::PolicyDenied`].
    pub fn resolve_cancellable(
        &self,
        credential: &ConnectionCredential,
        cancel: &Cancellation,
    ) -> AuthResult<Resolution> {
        let pid = credential.pid();
        let attempts = self.subsystem_retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.resolve_once(credential, cancel) {
                Ok(resolution) => return Ok(resolution),
                Err(e) if e.is_transient() => {
                    debug!(pid, attempt, attempts, error = %e, "Transient signing query failure");
                    last_error = Some(e);
                },
                Err(e) => return Err(e.into_auth_error(pid)),
            }
        }

        Err(last_error.map_or_else(
            || AuthError::subsystem("no resolution attempt was made"),
            |e| e.into_auth_error(pid),
        ))
    }

    fn resolve_once(
        &self,
        credential: &ConnectionCredential,
        cancel: &Cancellation,
    ) -> Result<Resolution, VerifierError> {
        if cancel.is_cancelled() {
            return Err(VerifierError::Cancelled);
        }

        // Released on drop, including the early returns below.
        let code = self.verifier.copy_guest(credential)?;

        if cancel.is_cancelled() {
            return Err(VerifierError::Cancelled);
        }

        let identity = self
            .verifier
            .copy_signing_information(&code, SigningQuery::default())?;
        let generation = self.verifier.image_generation(&code)?;

        Ok(Resolution {
            identity,
            generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{ScriptedVerifier, credential, trusted_identity};

    #[test]
    fn test_resolve_returns_identity() {
        let verifier = ScriptedVerifier::new().with_identity(10, trusted_identity("Signer"));
        let resolver = IdentityResolver::new(verifier);

        let identity = resolver.resolve(&credential(10)).unwrap();
        assert_eq!(identity.common_name, "Signer");
        assert_eq!(resolver.verifier().live_handles(), 0);
    }

    #[test]
    fn test_resolve_always_requests_dynamic_information() {
        let verifier = ScriptedVerifier::new().with_identity(10, trusted_identity("Signer"));
        let resolver = IdentityResolver::new(verifier);

        resolver.resolve(&credential(10)).unwrap();
        assert_eq!(resolver.verifier().last_query(), Some(SigningQuery::DYNAMIC));
    }

    #[test]
    fn test_transient_failure_retried_once_then_succeeds() {
        let verifier = ScriptedVerifier::new().with_transient_failures(
            10,
            1,
            trusted_identity("Signer"),
        );
        let resolver = IdentityResolver::new(verifier);

        assert!(resolver.resolve(&credential(10)).is_ok());
        assert_eq!(resolver.verifier().signing_queries(), 2);
    }

    #[test]
    fn test_persistent_transient_failure_is_bounded() {
        let verifier = ScriptedVerifier::new().with_transient_failures(
            10,
            u32::MAX,
            trusted_identity("Signer"),
        );
        let resolver = IdentityResolver::new(verifier).with_subsystem_retries(2);

        let err = resolver.resolve(&credential(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SubsystemError);
        assert_eq!(resolver.verifier().signing_queries(), 3);
        assert_eq!(resolver.verifier().live_handles(), 0);
    }

    #[test]
    fn test_retry_budget_is_capped() {
        let resolver = IdentityResolver::new(ScriptedVerifier::new()).with_subsystem_retries(100);
        assert_eq!(resolver.subsystem_retries(), MAX_SUBSYSTEM_RETRIES);
    }

    #[test]
    fn test_permanent_failure_is_not_retried() {
        let verifier =
            ScriptedVerifier::new().with_failure(10, VerifierError::ProcessGone { pid: 10 });
        let resolver = IdentityResolver::new(verifier);

        let err = resolver.resolve(&credential(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SigningInfoUnavailable);
        assert_eq!(resolver.verifier().guest_calls(), 1);
    }

    #[test]
    fn test_unknown_process_is_unavailable() {
        let resolver = IdentityResolver::new(ScriptedVerifier::new());
        let err = resolver.resolve(&credential(99)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SigningInfoUnavailable);
    }

    #[test]
    fn test_cancelled_before_start_skips_backend() {
        let verifier = ScriptedVerifier::new().with_identity(10, trusted_identity("Signer"));
        let resolver = IdentityResolver::new(verifier);
        let cancel = Cancellation::new();
        cancel.cancel();

        let err = resolver
            .resolve_cancellable(&credential(10), &cancel)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyDenied);
        assert_eq!(resolver.verifier().guest_calls(), 0);
    }

    #[test]
    fn test_cancellation_between_stages_releases_handle() {
        let verifier = ScriptedVerifier::new().with_identity(10, trusted_identity("Signer"));
        let cancel = Cancellation::new();
        verifier.cancel_on_guest(cancel.clone());
        let resolver = IdentityResolver::new(verifier);

        let err = resolver
            .resolve_cancellable(&credential(10), &cancel)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyDenied);
        assert_eq!(resolver.verifier().guest_calls(), 1);
        assert_eq!(resolver.verifier().signing_queries(), 0);
        assert_eq!(resolver.verifier().live_handles(), 0);
    }
}
