//! Code-signing identity of a peer process.
//!
//! The [`IdentityVerifier`] trait is the seam to the platform's
//! code-integrity subsystem. The [`IdentityResolver`] drives it: it acquires
//! a scoped code handle for a [`ConnectionCredential`], asks for the signing
//! information of the code the process is running *now*, and releases the
//! handle on every exit path.
//!
//! # Dynamic Queries
//!
//! [`SigningQuery::default()`] is a dynamic query. Backends must answer it
//! from the live process image, not from anything recorded when the process
//! was launched. A backend that cannot do so must fail the query with
//! [`VerifierError::DynamicUnsupported`] instead of answering statically.

mod resolver;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use resolver::{
    Cancellation, DEFAULT_SUBSYSTEM_RETRIES, IdentityResolver, MAX_SUBSYSTEM_RETRIES, Resolution,
};

use crate::credentials::ConnectionCredential;
use crate::error::AuthError;

/// Validity flags reported for a code image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct CodeStatusFlags {
    /// The signature is structurally valid and covers the running image.
    pub valid: bool,
    /// The signature lacks a trusted issuing authority.
    pub adhoc: bool,
    /// Hardened-runtime protections are in force.
    pub hardened: bool,
    /// A debugger or tracer is attached.
    pub debugger_attached: bool,
    /// Library validation is disabled (foreign code may be loaded).
    pub library_validation_disabled: bool,
    /// The signing key has been revoked.
    pub revoked: bool,
}

impl CodeStatusFlags {
    /// Flags of a validly signed image with no red flags.
    #[must_use]
    pub const fn valid() -> Self {
        Self {
            valid: true,
            adhoc: false,
            hardened: false,
            debugger_attached: false,
            library_validation_disabled: false,
            revoked: false,
        }
    }

    /// Names of every flag that, on its own, makes the image untrustworthy.
    #[must_use]
    pub fn red_flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if !self.valid {
            flags.push("invalid");
        }
        if self.adhoc {
            flags.push("adhoc");
        }
        if self.revoked {
            flags.push("revoked");
        }
        if self.debugger_attached {
            flags.push("debugger_attached");
        }
        if self.library_validation_disabled {
            flags.push("library_validation_disabled");
        }
        flags
    }
}

/// Signing identity of a running process, as reported at query time.
///
/// Produced fresh by every resolution. It is never stored beyond the
/// evaluation that requested it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeIdentity {
    /// Bundle/service identifier the code was signed with.
    pub signing_identifier: String,
    /// Common name of the signing certificate.
    pub common_name: String,
    /// Team (organizational unit) identifier, if the signer has one.
    pub team_identifier: Option<String>,
    /// Validity flags.
    pub flags: CodeStatusFlags,
    /// Signed capability declarations of the image.
    pub entitlements: BTreeSet<String>,
    /// Hex SHA-256 of the image, for diagnostics only.
    pub image_digest: Option<String>,
}

impl CodeIdentity {
    /// Create an identity with no flags set.
    #[must_use]
    pub fn new(signing_identifier: impl Into<String>, common_name: impl Into<String>) -> Self {
        Self {
            signing_identifier: signing_identifier.into(),
            common_name: common_name.into(),
            team_identifier: None,
            flags: CodeStatusFlags::default(),
            entitlements: BTreeSet::new(),
            image_digest: None,
        }
    }

    /// Set the team identifier.
    #[must_use]
    pub fn with_team_identifier(mut self, team: impl Into<String>) -> Self {
        self.team_identifier = Some(team.into());
        self
    }

    /// Set the validity flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: CodeStatusFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the entitlements.
    #[must_use]
    pub fn with_entitlements<I, S>(mut self, entitlements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entitlements = entitlements.into_iter().map(Into::into).collect();
        self
    }

    /// Set the image digest.
    #[must_use]
    pub fn with_image_digest(mut self, digest: impl Into<String>) -> Self {
        self.image_digest = Some(digest.into());
        self
    }
}

/// Parameters of a signing-information query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningQuery {
    /// Re-derive the answer from the live process image.
    pub dynamic: bool,
}

impl SigningQuery {
    /// Query the live process image.
    pub const DYNAMIC: Self = Self { dynamic: true };

    /// Query the on-disk image the process was started from.
    pub const STATIC: Self = Self { dynamic: false };
}

impl Default for SigningQuery {
    fn default() -> Self {
        Self::DYNAMIC
    }
}

/// Cheap fingerprint of the image a process is executing.
///
/// Backends return a new value whenever the process starts executing a
/// different file (e.g. after `exec`). Used to invalidate cached verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageGeneration {
    volume: u64,
    file: u64,
    change_time: i64,
}

impl ImageGeneration {
    /// Create a fingerprint from file-system identity and change time.
    #[must_use]
    pub const fn new(volume: u64, file: u64, change_time: i64) -> Self {
        Self {
            volume,
            file,
            change_time,
        }
    }
}

/// Failures reported by an [`IdentityVerifier`] backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifierError {
    /// The process has exited.
    #[error("process {pid} is no longer running")]
    ProcessGone {
        /// Process id.
        pid: u32,
    },

    /// The pid now belongs to a different process than the audit token names.
    #[error("process {pid} does not match its audit token")]
    TokenMismatch {
        /// Process id.
        pid: u32,
    },

    /// The subsystem refused to describe the process.
    #[error("access to process {pid} denied")]
    AccessDenied {
        /// Process id.
        pid: u32,
    },

    /// The backend returned data it could not interpret.
    #[error("malformed signing information: {reason}")]
    Malformed {
        /// What was malformed.
        reason: String,
    },

    /// The backend cannot answer dynamic queries.
    #[error("backend cannot re-evaluate live process images")]
    DynamicUnsupported,

    /// The evaluation was abandoned because the connection closed.
    #[error("evaluation cancelled")]
    Cancelled,

    /// Transient subsystem failure.
    #[error("subsystem failure: {reason}")]
    Subsystem {
        /// Underlying failure.
        reason: String,
    },
}

impl VerifierError {
    /// Create a transient subsystem failure.
    #[must_use]
    pub fn subsystem(reason: impl Into<String>) -> Self {
        Self::Subsystem {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the query may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Subsystem { .. })
    }

    /// Converts this backend failure into a pipeline error for `pid`.
    #[must_use]
    pub fn into_auth_error(self, pid: u32) -> AuthError {
        match self {
            Self::Subsystem { reason } => AuthError::subsystem(reason),
            Self::Cancelled => AuthError::policy_denied("connection closed during evaluation"),
            other => AuthError::signing_info_unavailable(pid, other.to_string()),
        }
    }
}

/// Capability for querying the platform's code-integrity subsystem.
///
/// # Handle Lifetime
///
/// [`IdentityVerifier::copy_guest`] acquires a handle naming the code of one
/// process instance. The handle is released when dropped, so callers get
/// release on every path, early denials included.
pub trait IdentityVerifier: Send + Sync {
    /// Scoped reference to a process's code.
    type Code: Send;

    /// Acquires a code handle for the process named by `credential`.
    ///
    /// Implementations must check that the process behind the pid is still
    /// the one named by the audit token.
    fn copy_guest(&self, credential: &ConnectionCredential) -> Result<Self::Code, VerifierError>;

    /// Reports the signing information of `code`.
    ///
    /// Callers pass [`SigningQuery::default()`] (dynamic) unless they
    /// explicitly want the on-disk view.
    fn copy_signing_information(
        &self,
        code: &Self::Code,
        query: SigningQuery,
    ) -> Result<CodeIdentity, VerifierError>;

    /// Returns a fingerprint of the image `code` is executing, if the backend
    /// can produce one cheaply.
    fn image_generation(&self, _code: &Self::Code) -> Result<Option<ImageGeneration>, VerifierError> {
        Ok(None)
    }

    /// Re-reads the status flags that can change while the process keeps
    /// running the same image, without hashing it.
    ///
    /// Only `debugger_attached` and `library_validation_disabled` are
    /// meaningful in the result. `None` means the backend cannot tell
    /// cheaply.
    fn runtime_flags(&self, _code: &Self::Code) -> Result<Option<CodeStatusFlags>, VerifierError> {
        Ok(None)
    }
}

impl<V: IdentityVerifier + ?Sized> IdentityVerifier for Arc<V> {
    type Code = V::Code;

    fn copy_guest(&self, credential: &ConnectionCredential) -> Result<Self::Code, VerifierError> {
        (**self).copy_guest(credential)
    }

    fn copy_signing_information(
        &self,
        code: &Self::Code,
        query: SigningQuery,
    ) -> Result<CodeIdentity, VerifierError> {
        (**self).copy_signing_information(code, query)
    }

    fn image_generation(&self, code: &Self::Code) -> Result<Option<ImageGeneration>, VerifierError> {
        (**self).image_generation(code)
    }

    fn runtime_flags(&self, code: &Self::Code) -> Result<Option<CodeStatusFlags>, VerifierError> {
        (**self).runtime_flags(code)
    }
}
