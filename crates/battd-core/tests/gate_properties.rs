//! Authorization properties of the full pipeline.
//!
//! Each test drives [`AuthorizationGate`] end to end through the scripted
//! backends, from a captured credential to the wrapped operation.
//!
//! # Properties Verified
//!
//! - Invalid signatures deny regardless of name
//! - Common names match exactly, never fuzzily
//! - Re-signed builds with the same identity are still allowed
//! - Unavailable credentials deny without retrying
//! - Concurrent connections are evaluated independently
//! - Any single red flag denies
//! - Transient subsystem failures are retried a bounded number of times

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use battd_core::identity::{CodeStatusFlags, VerifierError};
use battd_core::testing::{ScriptedVerifier, StaticCredential, credential, trusted_identity};
use battd_core::{
    AuthorizationDecision, AuthorizationGate, Cancellation, CodeIdentity, ConnectionAuth,
    ErrorKind, PolicyRule,
};
use proptest::prelude::*;

const SIGNER: &str = "BatteryToolkit Signer";

fn rule() -> Arc<PolicyRule> {
    Arc::new(PolicyRule::new(SIGNER))
}

fn connect(pid: u32) -> ConnectionAuth {
    ConnectionAuth::capture(&StaticCredential::ok(credential(pid)))
}

fn decide(gate: &AuthorizationGate<ScriptedVerifier>, pid: u32) -> AuthorizationDecision {
    gate.evaluate(&connect(pid), &Cancellation::new())
}

#[test]
fn end_to_end_three_processes() {
    let adhoc = trusted_identity(SIGNER).with_flags(CodeStatusFlags {
        adhoc: true,
        ..CodeStatusFlags::valid()
    });
    let verifier = ScriptedVerifier::new()
        .with_identity(100, trusted_identity(SIGNER))
        .with_identity(200, adhoc)
        .with_identity(300, CodeIdentity::new("com.evil", "Evil Corp"));
    let gate = AuthorizationGate::new(verifier, rule());

    assert_eq!(decide(&gate, 100), AuthorizationDecision::Allow);
    assert_eq!(
        decide(&gate, 200).denial_kind(),
        Some(ErrorKind::SignatureInvalid)
    );
    // Process C carries no valid flag either; the flag check runs first.
    assert!(!decide(&gate, 300).is_allow());

    let valid_evil = CodeIdentity::new("com.evil", "Evil Corp").with_flags(CodeStatusFlags::valid());
    gate.resolver().verifier().set_identity(300, valid_evil);
    assert_eq!(
        decide(&gate, 300).denial_kind(),
        Some(ErrorKind::IdentityMismatch)
    );
}

#[test]
fn resigned_build_with_same_identity_is_allowed() {
    let v1 = trusted_identity(SIGNER).with_image_digest("11".repeat(32));
    let v2 = trusted_identity(SIGNER).with_image_digest("22".repeat(32));
    let verifier = ScriptedVerifier::new().with_identity(10, v1);
    let gate = AuthorizationGate::new(verifier, rule());
    let auth = connect(10);

    assert!(gate.authorize(&auth, || ()).is_ok());
    gate.resolver().verifier().set_identity(10, v2);
    assert!(gate.authorize(&auth, || ()).is_ok());
}

#[test]
fn unavailable_credential_denied_without_retry() {
    let gate = AuthorizationGate::new(ScriptedVerifier::new(), rule()).with_subsystem_retries(3);
    let auth = ConnectionAuth::capture(&StaticCredential::unavailable("EOPNOTSUPP"));

    for _ in 0..3 {
        let denial = gate.authorize(&auth, || ()).unwrap_err();
        assert_eq!(denial.kind, ErrorKind::CredentialUnavailable);
    }
    assert_eq!(gate.resolver().verifier().guest_calls(), 0);
}

#[test]
fn persistent_subsystem_error_is_bounded_then_denied() {
    for retries in 0..=3u32 {
        let verifier = ScriptedVerifier::new().with_transient_failures(
            1,
            u32::MAX,
            trusted_identity(SIGNER),
        );
        let gate = AuthorizationGate::new(verifier, rule()).with_subsystem_retries(retries);

        let denial = gate.authorize(&connect(1), || ()).unwrap_err();

        assert_eq!(denial.kind, ErrorKind::SubsystemError);
        let attempts = usize::try_from(retries + 1).unwrap();
        assert_eq!(gate.resolver().verifier().signing_queries(), attempts);
        assert_eq!(gate.resolver().verifier().live_handles(), 0);
    }
}

#[test]
fn process_gone_is_never_retried() {
    let verifier = ScriptedVerifier::new().with_failure(5, VerifierError::ProcessGone { pid: 5 });
    let gate = AuthorizationGate::new(verifier, rule()).with_subsystem_retries(3);

    let denial = gate.authorize(&connect(5), || ()).unwrap_err();
    assert_eq!(denial.kind, ErrorKind::SigningInfoUnavailable);
    assert_eq!(gate.resolver().verifier().signing_queries(), 1);
}

#[test]
fn debugger_attached_denied_even_when_everything_else_matches() {
    let traced = trusted_identity(SIGNER)
        .with_team_identifier("TEAM123")
        .with_flags(CodeStatusFlags {
            debugger_attached: true,
            hardened: true,
            ..CodeStatusFlags::valid()
        });
    let verifier = ScriptedVerifier::new().with_identity(7, traced);
    let rule = PolicyRule::new(SIGNER)
        .with_bundle_identifiers(["me.mhaeuser.batterytoolkit"])
        .with_team_identifier("TEAM123");
    let gate = AuthorizationGate::new(verifier, Arc::new(rule));
    let calls = AtomicUsize::new(0);

    let denial = gate
        .authorize(&connect(7), || calls.fetch_add(1, Ordering::SeqCst))
        .unwrap_err();

    assert_eq!(denial.kind, ErrorKind::SignatureInvalid);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn concurrent_connections_do_not_cross_contaminate() {
    let tampered = trusted_identity(SIGNER).with_flags(CodeStatusFlags {
        adhoc: true,
        ..CodeStatusFlags::valid()
    });
    let verifier = ScriptedVerifier::new()
        .with_identity(1, trusted_identity(SIGNER))
        .with_identity(2, tampered);
    let gate = Arc::new(AuthorizationGate::new(verifier, rule()));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let gate = Arc::clone(&gate);
            let pid = if i % 2 == 0 { 1 } else { 2 };
            thread::spawn(move || {
                let auth = connect(pid);
                let mut outcomes = Vec::new();
                for _ in 0..50 {
                    outcomes.push(gate.authorize(&auth, || ()).is_ok());
                }
                (pid, outcomes)
            })
        })
        .collect();

    for handle in handles {
        let (pid, outcomes) = handle.join().unwrap();
        let expected = pid == 1;
        assert!(outcomes.iter().all(|allowed| *allowed == expected), "pid {pid}");
    }
    assert_eq!(gate.resolver().verifier().live_handles(), 0);
}

fn arb_flags() -> impl Strategy<Value = CodeStatusFlags> {
    (
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(
            |(valid, adhoc, hardened, debugger_attached, library_validation_disabled, revoked)| {
                CodeStatusFlags {
                    valid,
                    adhoc,
                    hardened,
                    debugger_attached,
                    library_validation_disabled,
                    revoked,
                }
            },
        )
}

proptest! {
    #[test]
    fn any_red_flag_denies(flags in arb_flags()) {
        let identity = trusted_identity(SIGNER).with_flags(flags);
        let gate = AuthorizationGate::new(ScriptedVerifier::new().with_identity(1, identity), rule());

        let allowed = decide(&gate, 1).is_allow();
        prop_assert_eq!(allowed, flags.red_flags().is_empty());
    }

    #[test]
    fn common_name_must_match_exactly(actual in "\\PC{0,40}") {
        let gate = AuthorizationGate::new(
            ScriptedVerifier::new().with_identity(1, trusted_identity(&actual)),
            rule(),
        );

        let decision = decide(&gate, 1);
        if actual == SIGNER {
            prop_assert!(decision.is_allow());
        } else {
            prop_assert_eq!(decision.denial_kind(), Some(ErrorKind::IdentityMismatch));
        }
    }

    #[test]
    fn near_miss_names_are_denied(suffix in "[ .,a-zA-Z]{1,4}") {
        let gate = AuthorizationGate::new(
            ScriptedVerifier::new().with_identity(1, trusted_identity(&format!("{SIGNER}{suffix}"))),
            rule(),
        );
        prop_assert_eq!(decide(&gate, 1).denial_kind(), Some(ErrorKind::IdentityMismatch));
    }

    #[test]
    fn evaluation_is_deterministic(flags in arb_flags(), name in "[A-Za-z ]{0,24}") {
        let identity = CodeIdentity::new("me.mhaeuser.batterytoolkit", name).with_flags(flags);
        let rule = PolicyRule::new(SIGNER);
        prop_assert_eq!(
            battd_core::policy::evaluate(&identity, &rule),
            battd_core::policy::evaluate(&identity, &rule)
        );
    }
}
