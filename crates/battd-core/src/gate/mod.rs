//! Authorization gate for privileged entry points.
//!
//! Every privileged operation is invoked through
//! [`AuthorizationGate::authorize`] (or its cancellable form). The gate runs
//! the pipeline (credential, resolution, policy) for the calling connection,
//! or reuses a cached verdict when [`CachePolicy::PerConnection`] is in force
//! and the peer's image provably has not changed, and invokes the operation
//! only on [`AuthorizationDecision::Allow`].
//!
//! # State Machine
//!
//! ```text
//! Unauthenticated ──► Evaluating ──► Authorized
//!                        ▲   │
//!                        │   └─────► Denied
//!                        └── (next call re-enters)
//! ```
//!
//! # Invariants
//!
//! - [INV-GATE-001] A denied call never invokes the wrapped operation
//! - [INV-GATE-002] A cached Allow is reused only while its TTL is valid, the
//!   audit token still names a live process, the image generation is
//!   unchanged, and the runtime flags (tracer, loader overrides) are clean
//! - [INV-GATE-003] No state is shared between connections except the
//!   read-only [`PolicyRule`]
//! - [INV-GATE-004] Denial details stay local: callers get a [`Denial`] to
//!   log and count, never to forward to the peer
//!
//! # Residual Window
//!
//! With caching enabled, a cache hit re-reads only what is cheap: the audit
//! token, the image generation and the runtime flags from
//! [`IdentityVerifier::runtime_flags`]. A process that alters its loaded
//! code without changing the file it executes (e.g. by writing to its own
//! memory) is not re-examined until the TTL expires, and neither is anything
//! else on a backend that reports no runtime flags. [`CachePolicy::Never`]
//! closes that window at the cost of one resolution per call.
//!
//! # Manage Right
//!
//! [`AuthorizationGate::check_manage_right`] is a separate, credential-only
//! check for commands that change power state. It does not replace the
//! code-identity pipeline; callers run both.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::credentials::{self, ConnectionCredential, PeerCredentialSource};
use crate::error::{AuthError, AuthResult, ErrorKind};
use crate::identity::{Cancellation, IdentityResolver, IdentityVerifier, ImageGeneration};
use crate::policy::{self, AuthorizationDecision, Denial, PolicyRule};

/// Per-connection authorization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthState {
    /// No evaluation has run yet.
    #[default]
    Unauthenticated,
    /// An evaluation is in progress.
    Evaluating,
    /// The last evaluation allowed the peer.
    Authorized,
    /// The last evaluation denied the peer.
    Denied,
}

impl AuthState {
    /// Lowercase label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Evaluating => "evaluating",
            Self::Authorized => "authorized",
            Self::Denied => "denied",
        }
    }
}

/// Whether verdicts may be reused across privileged calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Re-evaluate on every privileged call.
    #[default]
    Never,
    /// Reuse an Allow for the same connection for up to `ttl`.
    PerConnection {
        /// Maximum age of a reused verdict.
        ttl: Duration,
    },
}

impl CachePolicy {
    /// Build from an optional TTL in milliseconds. `None` and `0` disable
    /// caching.
    #[must_use]
    pub const fn from_ttl_ms(ttl_ms: Option<u64>) -> Self {
        match ttl_ms {
            Some(ms) if ms > 0 => Self::PerConnection {
                ttl: Duration::from_millis(ms),
            },
            _ => Self::Never,
        }
    }
}

/// Receives every decision the gate makes. Used for metrics.
pub trait DecisionObserver: Send + Sync {
    /// Called once per decision, cached or fresh.
    fn decision(&self, decision: &AuthorizationDecision);

    /// Called after each identity resolution with its wall-clock duration.
    fn resolution(&self, _elapsed: Duration) {}
}

#[derive(Debug, Clone, Copy)]
struct CachedVerdict {
    at: Instant,
    generation: ImageGeneration,
}

#[derive(Debug, Default)]
struct AuthInner {
    state: AuthState,
    cached: Option<CachedVerdict>,
    evaluations: u64,
}

/// Authorization record of one connection.
///
/// Holds the peer credential captured once at accept time. The credential
/// cannot be replaced after construction.
#[derive(Debug)]
pub struct ConnectionAuth {
    credential: AuthResult<ConnectionCredential>,
    inner: Mutex<AuthInner>,
}

impl ConnectionAuth {
    /// Captures the credential of a newly accepted connection.
    ///
    /// Extraction failures are kept and make every later evaluation deny
    /// with [`ErrorKind::CredentialUnavailable`].
    #[must_use]
    pub fn capture<S: PeerCredentialSource + ?Sized>(source: &S) -> Self {
        Self::new(credentials::extract(source))
    }

    /// Create a record from an already extracted credential.
    #[must_use]
    pub fn new(credential: AuthResult<ConnectionCredential>) -> Self {
        Self {
            credential,
            inner: Mutex::new(AuthInner::default()),
        }
    }

    /// The captured credential.
    ///
    /// # Errors
    ///
    /// Returns the extraction failure if no credential could be captured.
    pub fn credential(&self) -> Result<&ConnectionCredential, &AuthError> {
        self.credential.as_ref()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.lock().state
    }

    /// Number of full pipeline evaluations run for this connection.
    #[must_use]
    pub fn evaluations(&self) -> u64 {
        self.lock().evaluations
    }

    /// Returns `true` if a verdict is cached.
    #[must_use]
    pub fn has_cached_verdict(&self) -> bool {
        self.lock().cached.is_some()
    }

    /// Drops any cached verdict. The next call runs the full pipeline.
    pub fn invalidate(&self) {
        self.lock().cached = None;
    }

    fn lock(&self) -> MutexGuard<'_, AuthInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) {
        let mut inner = self.lock();
        inner.state = AuthState::Evaluating;
        inner.evaluations += 1;
    }

    fn finish(&self, decision: &AuthorizationDecision, cached: Option<CachedVerdict>) {
        let mut inner = self.lock();
        inner.state = if decision.is_allow() {
            AuthState::Authorized
        } else {
            AuthState::Denied
        };
        inner.cached = cached;
    }
}

/// Runs the trust pipeline in front of privileged operations.
pub struct AuthorizationGate<V> {
    resolver: IdentityResolver<V>,
    rule: Arc<PolicyRule>,
    cache: CachePolicy,
    observer: Option<Arc<dyn DecisionObserver>>,
}

impl<V> std::fmt::Debug for AuthorizationGate<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationGate")
            .field("rule", &self.rule)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl<V: IdentityVerifier> AuthorizationGate<V> {
    /// Create a gate that re-evaluates on every call.
    #[must_use]
    pub fn new(verifier: V, rule: Arc<PolicyRule>) -> Self {
        Self {
            resolver: IdentityResolver::new(verifier),
            rule,
            cache: CachePolicy::Never,
            observer: None,
        }
    }

    /// Set the cache policy.
    #[must_use]
    pub const fn with_cache_policy(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    /// Set the subsystem retry budget of the resolver.
    #[must_use]
    pub fn with_subsystem_retries(mut self, retries: u32) -> Self {
        self.resolver = self.resolver.with_subsystem_retries(retries);
        self
    }

    /// Attach a decision observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn DecisionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The frozen policy.
    #[must_use]
    pub fn rule(&self) -> &PolicyRule {
        &self.rule
    }

    /// The resolver (and through it, the verifier backend).
    #[must_use]
    pub const fn resolver(&self) -> &IdentityResolver<V> {
        &self.resolver
    }

    /// Active cache policy.
    #[must_use]
    pub const fn cache_policy(&self) -> CachePolicy {
        self.cache
    }

    /// Evaluates a newly accepted connection.
    ///
    /// Always runs the full pipeline; a connection that is denied here must
    /// be closed before any request is read.
    pub fn admit(&self, auth: &ConnectionAuth, cancel: &Cancellation) -> AuthorizationDecision {
        let decision = self.run_pipeline(auth, cancel);
        self.record(auth, &decision, "admission");
        decision
    }

    /// Decides whether the connection may perform a privileged call,
    /// honouring the cache policy.
    pub fn evaluate(&self, auth: &ConnectionAuth, cancel: &Cancellation) -> AuthorizationDecision {
        if self.cached_allow_is_valid(auth) {
            let decision = AuthorizationDecision::Allow;
            self.record(auth, &decision, "cached");
            return decision;
        }

        let decision = self.run_pipeline(auth, cancel);
        self.record(auth, &decision, "evaluation");
        decision
    }

    /// Invokes `op` if the connection is authorized.
    ///
    /// # Errors
    ///
    /// Returns the [`Denial`] if the pipeline denies; `op` is not invoked.
    pub fn authorize<T, F>(&self, auth: &ConnectionAuth, op: F) -> Result<T, Denial>
    where
        F: FnOnce() -> T,
    {
        self.authorize_cancellable(auth, &Cancellation::new(), op)
    }

    /// Like [`AuthorizationGate::authorize`], but abandons the evaluation
    /// once `cancel` is set.
    ///
    /// # Errors
    ///
    /// Returns the [`Denial`] if the pipeline denies or was cancelled; `op`
    /// is not invoked.
    pub fn authorize_cancellable<T, F>(
        &self,
        auth: &ConnectionAuth,
        cancel: &Cancellation,
        op: F,
    ) -> Result<T, Denial>
    where
        F: FnOnce() -> T,
    {
        self.evaluate(auth, cancel).into_result()?;

        if cancel.is_cancelled() {
            return Err(Denial::new(
                ErrorKind::PolicyDenied,
                "connection closed before dispatch",
            ));
        }

        Ok(op())
    }

    /// Checks that the peer's kernel credential holds the manage right.
    ///
    /// Refusals are logged and reported to the observer like any other
    /// decision. A granted right is not reported: the call still goes
    /// through [`AuthorizationGate::authorize_cancellable`], which is.
    ///
    /// # Errors
    ///
    /// Returns a [`Denial`] of kind [`ErrorKind::PolicyDenied`], or
    /// [`ErrorKind::CredentialUnavailable`] without a credential.
    pub fn check_manage_right(&self, auth: &ConnectionAuth) -> Result<(), Denial> {
        let decision = match auth.credential() {
            Ok(credential) => policy::check_manage_right(credential, &self.rule),
            Err(e) => AuthorizationDecision::from(e.clone()),
        };
        if !decision.is_allow() {
            self.record(auth, &decision, "manage_right");
        }
        decision.into_result()
    }

    fn cached_allow_is_valid(&self, auth: &ConnectionAuth) -> bool {
        let CachePolicy::PerConnection { ttl } = self.cache else {
            return false;
        };
        let Ok(credential) = auth.credential() else {
            return false;
        };

        let cached = {
            let inner = auth.lock();
            match (inner.state, inner.cached) {
                (AuthState::Authorized, Some(cached)) => cached,
                _ => return false,
            }
        };

        if cached.at.elapsed() >= ttl {
            auth.invalidate();
            return false;
        }

        // The token must still name a live process running the same file.
        let verifier = self.resolver.verifier();
        let code = match verifier.copy_guest(credential) {
            Ok(code) => code,
            Err(e) => return Self::drop_cached(auth, credential, &e.to_string()),
        };
        match verifier.image_generation(&code) {
            Ok(Some(generation)) if generation == cached.generation => {},
            _ => return Self::drop_cached(auth, credential, "image changed"),
        }
        match verifier.runtime_flags(&code) {
            Ok(Some(flags)) if flags.debugger_attached || flags.library_validation_disabled => {
                Self::drop_cached(auth, credential, "runtime flags raised")
            },
            Ok(_) => true,
            Err(e) => Self::drop_cached(auth, credential, &e.to_string()),
        }
    }

    fn drop_cached(auth: &ConnectionAuth, credential: &ConnectionCredential, reason: &str) -> bool {
        debug!(credential = %credential, reason, "Cached verdict invalidated");
        auth.invalidate();
        false
    }

    fn run_pipeline(&self, auth: &ConnectionAuth, cancel: &Cancellation) -> AuthorizationDecision {
        auth.begin();

        let credential = match auth.credential() {
            Ok(credential) => credential,
            Err(e) => {
                let decision = AuthorizationDecision::from(e.clone());
                auth.finish(&decision, None);
                return decision;
            },
        };

        let started = Instant::now();
        let resolution = self.resolver.resolve_cancellable(credential, cancel);
        if let Some(observer) = &self.observer {
            observer.resolution(started.elapsed());
        }

        let (decision, cached) = match resolution {
            Ok(resolution) => {
                let decision = policy::evaluate(&resolution.identity, &self.rule);
                let cached = match (self.cache, resolution.generation) {
                    (CachePolicy::PerConnection { .. }, Some(generation))
                        if decision.is_allow() =>
                    {
                        Some(CachedVerdict {
                            at: started,
                            generation,
                        })
                    },
                    _ => None,
                };
                if !decision.is_allow() {
                    debug!(
                        credential = %credential,
                        signing_identifier = %resolution.identity.signing_identifier,
                        common_name = %resolution.identity.common_name,
                        image_digest = ?resolution.identity.image_digest,
                        "Resolved identity rejected by policy"
                    );
                }
                (decision, cached)
            },
            Err(e) => (AuthorizationDecision::from(e), None),
        };

        auth.finish(&decision, cached);
        decision
    }

    fn record(&self, auth: &ConnectionAuth, decision: &AuthorizationDecision, stage: &'static str) {
        let peer = auth
            .credential()
            .map_or_else(|_| "unknown".to_string(), ToString::to_string);

        match decision {
            AuthorizationDecision::Allow => {
                debug!(peer = %peer, stage, "Peer authorized");
            },
            AuthorizationDecision::Deny(denial) => {
                warn!(
                    peer = %peer,
                    stage,
                    kind = %denial.kind,
                    detail = %denial.detail,
                    "Peer denied"
                );
            },
        }

        if let Some(observer) = &self.observer {
            observer.decision(decision);
        }
    }
}
