//! Policy evaluation: resolved identity versus configured expectation.
//!
//! [`evaluate`] is a pure function of a [`CodeIdentity`] and a
//! [`PolicyRule`]. It performs no I/O, holds no state, and returns the same
//! [`AuthorizationDecision`] for the same inputs.
//!
//! # Check Order
//!
//! 1. Red flags (invalid, ad-hoc, revoked, debugger attached, library
//!    validation disabled) deny with [`ErrorKind::SignatureInvalid`]
//! 2. A missing hardened runtime, when required, denies with
//!    [`ErrorKind::SignatureInvalid`]
//! 3. Disallowed `security.` entitlements deny with
//!    [`ErrorKind::SignatureInvalid`]
//! 4. The common name must equal the expected one exactly
//! 5. The signing identifier must be in the expected set, if the set is
//!    non-empty
//! 6. The team identifier must equal the expected one, if configured
//!
//! Failures in steps 4-6 deny with [`ErrorKind::IdentityMismatch`].
//!
//! # Security Considerations
//!
//! # Manage Right
//!
//! Commands that change power state additionally need the manage right,
//! held by the peer's kernel credential: its uid or primary gid must be
//! listed in the rule. [`check_manage_right`] decides this from the
//! credential alone and denies with [`ErrorKind::PolicyDenied`]. By default
//! only root holds it.
//!
//! All name comparisons are exact and case-sensitive. There is no prefix,
//! wildcard or normalized matching: `"ACME, Inc."` and `"ACME Inc"` are
//! different signers. Comparisons run in constant time so a peer cannot
//! learn how much of a name it guessed correctly.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::credentials::ConnectionCredential;
use crate::error::{AuthError, ErrorKind};
use crate::identity::CodeIdentity;

/// Entitlement namespace screened by the evaluator.
pub const SECURITY_ENTITLEMENT_PREFIX: &str = "security.";

/// Entitlement namespace that is never permitted.
pub const PRIVATE_ENTITLEMENT_PREFIX: &str = "security.private.";

/// `security.` entitlements a trusted client may carry by default.
pub const DEFAULT_PERMITTED_SECURITY_ENTITLEMENTS: [&str; 2] =
    ["security.app-sandbox", "security.application-groups"];

/// Users holding the manage right by default.
pub const DEFAULT_MANAGE_UIDS: [u32; 1] = [0];

/// Expected signing identity of authorized clients.
///
/// Built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    expected_common_name: String,
    expected_bundle_identifiers: BTreeSet<String>,
    expected_team_identifier: Option<String>,
    require_hardened_runtime: bool,
    permitted_security_entitlements: BTreeSet<String>,
    manage_uids: BTreeSet<u32>,
    manage_gids: BTreeSet<u32>,
}

impl PolicyRule {
    /// Create a rule that expects `common_name` and nothing else.
    #[must_use]
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            expected_common_name: common_name.into(),
            expected_bundle_identifiers: BTreeSet::new(),
            expected_team_identifier: None,
            require_hardened_runtime: false,
            permitted_security_entitlements: DEFAULT_PERMITTED_SECURITY_ENTITLEMENTS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            manage_uids: DEFAULT_MANAGE_UIDS.into_iter().collect(),
            manage_gids: BTreeSet::new(),
        }
    }

    /// Restrict the signing identifier to one of `identifiers`.
    #[must_use]
    pub fn with_bundle_identifiers<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_bundle_identifiers = identifiers.into_iter().map(Into::into).collect();
        self
    }

    /// Require the given team identifier.
    #[must_use]
    pub fn with_team_identifier(mut self, team: impl Into<String>) -> Self {
        self.expected_team_identifier = Some(team.into());
        self
    }

    /// Require the hardened-runtime flag.
    #[must_use]
    pub const fn require_hardened_runtime(mut self, required: bool) -> Self {
        self.require_hardened_runtime = required;
        self
    }

    /// Replace the set of permitted `security.` entitlements.
    #[must_use]
    pub fn with_permitted_security_entitlements<I, S>(mut self, entitlements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permitted_security_entitlements = entitlements.into_iter().map(Into::into).collect();
        self
    }

    /// Grant the manage right to `uids` and to members of `gids` (by
    /// primary group). Replaces the defaults.
    #[must_use]
    pub fn with_manage_principals<U, G>(mut self, uids: U, gids: G) -> Self
    where
        U: IntoIterator<Item = u32>,
        G: IntoIterator<Item = u32>,
    {
        self.manage_uids = uids.into_iter().collect();
        self.manage_gids = gids.into_iter().collect();
        self
    }

    /// Expected certificate common name.
    #[must_use]
    pub fn expected_common_name(&self) -> &str {
        &self.expected_common_name
    }

    /// Accepted signing identifiers. Empty means any.
    #[must_use]
    pub const fn expected_bundle_identifiers(&self) -> &BTreeSet<String> {
        &self.expected_bundle_identifiers
    }

    /// Expected team identifier, if any.
    #[must_use]
    pub fn expected_team_identifier(&self) -> Option<&str> {
        self.expected_team_identifier.as_deref()
    }

    /// Whether the hardened-runtime flag is required.
    #[must_use]
    pub const fn requires_hardened_runtime(&self) -> bool {
        self.require_hardened_runtime
    }

    /// Permitted `security.` entitlements.
    #[must_use]
    pub const fn permitted_security_entitlements(&self) -> &BTreeSet<String> {
        &self.permitted_security_entitlements
    }

    /// Users holding the manage right.
    #[must_use]
    pub const fn manage_uids(&self) -> &BTreeSet<u32> {
        &self.manage_uids
    }

    /// Primary groups holding the manage right.
    #[must_use]
    pub const fn manage_gids(&self) -> &BTreeSet<u32> {
        &self.manage_gids
    }
}

/// Why a peer was refused. Local-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    /// Classification recorded in logs and metrics.
    pub kind: ErrorKind,
    /// Human-readable explanation for the local audit log.
    pub detail: String,
}

impl Denial {
    /// Create a denial.
    #[must_use]
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for Denial {}

impl From<AuthError> for Denial {
    fn from(err: AuthError) -> Self {
        let kind = err.kind();
        Self {
            kind,
            detail: err.to_string(),
        }
    }
}

/// Result of evaluating a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuthorizationDecision {
    /// The peer may invoke privileged operations.
    Allow,
    /// The peer is refused.
    Deny(Denial),
}

impl AuthorizationDecision {
    /// Create a denial decision.
    #[must_use]
    pub fn deny(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::Deny(Denial::new(kind, detail))
    }

    /// Returns `true` for [`AuthorizationDecision::Allow`].
    #[must_use]
    pub const fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// The denial kind, if denied.
    #[must_use]
    pub const fn denial_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Allow => None,
            Self::Deny(denial) => Some(denial.kind),
        }
    }

    /// Label for metrics: `allow` or `deny`.
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny(_) => "deny",
        }
    }

    /// Converts into a `Result`, keeping the denial as the error.
    ///
    /// # Errors
    ///
    /// Returns the [`Denial`] for [`AuthorizationDecision::Deny`].
    pub fn into_result(self) -> Result<(), Denial> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(denial) => Err(denial),
        }
    }
}

impl From<AuthError> for AuthorizationDecision {
    fn from(err: AuthError) -> Self {
        Self::Deny(err.into())
    }
}

/// Evaluates `identity` against `rule`.
#[must_use]
pub fn evaluate(identity: &CodeIdentity, rule: &PolicyRule) -> AuthorizationDecision {
    let red_flags = identity.flags.red_flags();
    if !red_flags.is_empty() {
        return AuthorizationDecision::deny(
            ErrorKind::SignatureInvalid,
            format!("code status: {}", red_flags.join(", ")),
        );
    }

    if rule.require_hardened_runtime && !identity.flags.hardened {
        return AuthorizationDecision::deny(
            ErrorKind::SignatureInvalid,
            "hardened runtime required but not in force",
        );
    }

    if let Some(entitlement) = forbidden_entitlement(identity, rule) {
        return AuthorizationDecision::deny(
            ErrorKind::SignatureInvalid,
            format!("forbidden entitlement: {entitlement}"),
        );
    }

    if !exact_eq(&identity.common_name, &rule.expected_common_name) {
        return AuthorizationDecision::deny(
            ErrorKind::IdentityMismatch,
            format!("unexpected signer common name {:?}", identity.common_name),
        );
    }

    if !rule.expected_bundle_identifiers.is_empty()
        && !rule
            .expected_bundle_identifiers
            .iter()
            .any(|expected| exact_eq(&identity.signing_identifier, expected))
    {
        return AuthorizationDecision::deny(
            ErrorKind::IdentityMismatch,
            format!(
                "unexpected signing identifier {:?}",
                identity.signing_identifier
            ),
        );
    }

    if let Some(expected_team) = &rule.expected_team_identifier {
        let matches = identity
            .team_identifier
            .as_deref()
            .is_some_and(|team| exact_eq(team, expected_team));
        if !matches {
            return AuthorizationDecision::deny(
                ErrorKind::IdentityMismatch,
                format!("unexpected team identifier {:?}", identity.team_identifier),
            );
        }
    }

    AuthorizationDecision::Allow
}

/// Decides whether `credential` holds the manage right under `rule`.
#[must_use]
pub fn check_manage_right(
    credential: &ConnectionCredential,
    rule: &PolicyRule,
) -> AuthorizationDecision {
    if rule.manage_uids.contains(&credential.uid()) || rule.manage_gids.contains(&credential.gid())
    {
        AuthorizationDecision::Allow
    } else {
        AuthorizationDecision::deny(
            ErrorKind::PolicyDenied,
            format!(
                "uid {} gid {} lacks the manage right",
                credential.uid(),
                credential.gid()
            ),
        )
    }
}

fn forbidden_entitlement<'a>(identity: &'a CodeIdentity, rule: &PolicyRule) -> Option<&'a str> {
    identity
        .entitlements
        .iter()
        .map(String::as_str)
        .find(|entitlement| {
            entitlement.starts_with(PRIVATE_ENTITLEMENT_PREFIX)
                || (entitlement.starts_with(SECURITY_ENTITLEMENT_PREFIX)
                    && !rule.permitted_security_entitlements.contains(*entitlement))
        })
}

/// Exact, case-sensitive comparison in constant time for equal lengths.
fn exact_eq(actual: &str, expected: &str) -> bool {
    actual.len() == expected.len() && bool::from(actual.as_bytes().ct_eq(expected.as_bytes()))
}
