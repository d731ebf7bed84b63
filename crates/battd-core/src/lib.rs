//! battd-core - peer trust evaluation for a privileged daemon
//!
//! This crate decides whether a local process connected to the battd
//! control socket may invoke privileged operations. It is platform-neutral:
//! kernel credentials and code-signing information arrive through the
//! [`credentials::PeerCredentialSource`] and [`identity::IdentityVerifier`]
//! traits, implemented per platform by the daemon.
//!
//! # Pipeline
//!
//! ```text
//! accept ─► credentials::extract ─► IdentityResolver::resolve ─► policy::evaluate
//!                                                                     │
//!                           AuthorizationGate::authorize ◄────────────┘
//! ```
//!
//! Any failure anywhere in the pipeline is a denial. Nothing is ever allowed
//! because a question could not be answered.
//!
//! # Modules
//!
//! - [`credentials`]: kernel-attested peer credentials
//! - [`identity`]: code-signing identity and its resolution
//! - [`policy`]: the pure policy evaluator
//! - [`gate`]: per-connection state and the authorization gate
//! - [`error`]: error taxonomy
//! - [`config`]: TOML configuration

pub mod config;
pub mod credentials;
pub mod error;
pub mod gate;
pub mod identity;
pub mod policy;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use error::{AuthError, AuthResult, ErrorKind};
pub use gate::{AuthState, AuthorizationGate, CachePolicy, ConnectionAuth, DecisionObserver};
pub use identity::{Cancellation, CodeIdentity, IdentityResolver, IdentityVerifier};
pub use policy::{AuthorizationDecision, Denial, PolicyRule};
