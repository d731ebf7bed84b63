//! Authorization error taxonomy.
//!
//! Every failure in the trust pipeline is reported as an [`AuthError`], and
//! every [`AuthError`] maps onto exactly one [`ErrorKind`]. The kind is what
//! the local audit log and metrics record; the remote peer only ever learns
//! that it was refused.
//!
//! # Security Considerations
//!
//! None of the variants is recoverable into an allow. [`ErrorKind::SubsystemError`]
//! is the only kind the resolver retries, and only a bounded number of times.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Classification of an authorization failure.
///
/// This is the value recorded in logs and metrics. It is never sent to the
/// peer; peers see [`ErrorKind::PolicyDenied`] semantics regardless of the
/// actual kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The kernel-attested peer credential could not be read.
    CredentialUnavailable,
    /// The code-integrity subsystem could not describe the peer's code.
    SigningInfoUnavailable,
    /// The peer's signature is invalid, untrusted, or carries a red flag.
    SignatureInvalid,
    /// The peer is validly signed, but not by the expected identity.
    IdentityMismatch,
    /// Generic refusal.
    PolicyDenied,
    /// Transient platform failure unrelated to the peer's trustworthiness.
    SubsystemError,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::CredentialUnavailable,
        Self::SigningInfoUnavailable,
        Self::SignatureInvalid,
        Self::IdentityMismatch,
        Self::PolicyDenied,
        Self::SubsystemError,
    ];

    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CredentialUnavailable => "credential_unavailable",
            Self::SigningInfoUnavailable => "signing_info_unavailable",
            Self::SignatureInvalid => "signature_invalid",
            Self::IdentityMismatch => "identity_mismatch",
            Self::PolicyDenied => "policy_denied",
            Self::SubsystemError => "subsystem_error",
        }
    }

    /// Returns `true` if a retry of the same query may succeed.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::SubsystemError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the authorization pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The connection carries no usable kernel-attested credential.
    #[error("peer credentials unavailable: {reason}")]
    CredentialUnavailable {
        /// Why extraction failed.
        reason: String,
    },

    /// Signing information for the peer process could not be obtained.
    #[error("signing information unavailable for pid {pid}: {reason}")]
    SigningInfoUnavailable {
        /// Peer process id.
        pid: u32,
        /// Why the query failed.
        reason: String,
    },

    /// The signature failed a validity check.
    #[error("signature invalid: {reason}")]
    SignatureInvalid {
        /// Which checks failed.
        reason: String,
    },

    /// The signer does not match the configured identity.
    #[error("identity mismatch: {reason}")]
    IdentityMismatch {
        /// Which comparison failed.
        reason: String,
    },

    /// Generic refusal.
    #[error("policy denied: {reason}")]
    PolicyDenied {
        /// Local-only explanation.
        reason: String,
    },

    /// The code-integrity subsystem failed transiently.
    #[error("code-integrity subsystem error: {reason}")]
    Subsystem {
        /// Underlying failure.
        reason: String,
    },
}

impl AuthError {
    /// Create a credential unavailable error.
    #[must_use]
    pub fn credential_unavailable(reason: impl Into<String>) -> Self {
        Self::CredentialUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a signing information unavailable error.
    #[must_use]
    pub fn signing_info_unavailable(pid: u32, reason: impl Into<String>) -> Self {
        Self::SigningInfoUnavailable {
            pid,
            reason: reason.into(),
        }
    }

    /// Create a generic refusal.
    #[must_use]
    pub fn policy_denied(reason: impl Into<String>) -> Self {
        Self::PolicyDenied {
            reason: reason.into(),
        }
    }

    /// Create a subsystem error.
    #[must_use]
    pub fn subsystem(reason: impl Into<String>) -> Self {
        Self::Subsystem {
            reason: reason.into(),
        }
    }

    /// Returns the kind recorded for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::CredentialUnavailable { .. } => ErrorKind::CredentialUnavailable,
            Self::SigningInfoUnavailable { .. } => ErrorKind::SigningInfoUnavailable,
            Self::SignatureInvalid { .. } => ErrorKind::SignatureInvalid,
            Self::IdentityMismatch { .. } => ErrorKind::IdentityMismatch,
            Self::PolicyDenied { .. } => ErrorKind::PolicyDenied,
            Self::Subsystem { .. } => ErrorKind::SubsystemError,
        }
    }

    /// Returns `true` if a retry of the same query may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

/// Result type for authorization operations.
pub type AuthResult<T> = Result<T, AuthError>;
