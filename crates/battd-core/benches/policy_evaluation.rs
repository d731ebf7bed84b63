//! Policy evaluation benchmarks.
//!
//! Measures the pure evaluator and the full gate path with a scripted
//! backend, to show what a non-cached privileged call costs before any
//! platform query.

#![allow(missing_docs)]

use std::sync::Arc;

use battd_core::identity::CodeStatusFlags;
use battd_core::policy::evaluate;
use battd_core::testing::{ScriptedVerifier, StaticCredential, credential, trusted_identity};
use battd_core::{AuthorizationGate, Cancellation, ConnectionAuth, PolicyRule};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

const SIGNER: &str = "BatteryToolkit Signer";

fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy/evaluate");
    let rule = PolicyRule::new(SIGNER)
        .with_bundle_identifiers(["me.mhaeuser.batterytoolkit"])
        .with_team_identifier("TEAM123");

    let allowed = trusted_identity(SIGNER).with_team_identifier("TEAM123");
    let mismatch = trusted_identity("BatteryToolkit Signe").with_team_identifier("TEAM123");
    let flagged = trusted_identity(SIGNER).with_flags(CodeStatusFlags {
        debugger_attached: true,
        ..CodeStatusFlags::valid()
    });

    for (name, identity) in [("allow", &allowed), ("mismatch", &mismatch), ("red_flag", &flagged)] {
        group.bench_with_input(BenchmarkId::from_parameter(name), identity, |b, identity| {
            b.iter(|| evaluate(black_box(identity), black_box(&rule)));
        });
    }

    group.finish();
}

fn bench_entitlements(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy/entitlements");
    let rule = PolicyRule::new(SIGNER);

    for count in [0usize, 8, 64] {
        let identity = trusted_identity(SIGNER)
            .with_entitlements((0..count).map(|i| format!("net.feature-{i}")));
        group.bench_with_input(BenchmarkId::from_parameter(count), &identity, |b, identity| {
            b.iter(|| evaluate(black_box(identity), black_box(&rule)));
        });
    }

    group.finish();
}

fn bench_gate(c: &mut Criterion) {
    let mut group = c.benchmark_group("gate/authorize");
    let verifier = ScriptedVerifier::new().with_identity(42, trusted_identity(SIGNER));
    let gate = AuthorizationGate::new(verifier, Arc::new(PolicyRule::new(SIGNER)));
    let auth = ConnectionAuth::capture(&StaticCredential::ok(credential(42)));
    let cancel = Cancellation::new();

    group.bench_function("uncached", |b| {
        b.iter(|| gate.authorize_cancellable(black_box(&auth), &cancel, || 1u8));
    });

    group.finish();
}

criterion_group!(benches, bench_evaluate, bench_entitlements, bench_gate);
criterion_main!(benches);
