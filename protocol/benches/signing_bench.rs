// Signing & verification benchmarks for the lattice protocol.
//
// Covers Ed25519 keypair generation, raw and envelope signing/verification,
// the full inbound verify path of the crypto manager, and AES-256-GCM
// session sealing at various payload sizes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use lattice_protocol::crypto::{CryptoManager, LatticeKeypair};
use lattice_protocol::directive::Directive;
use lattice_protocol::message::Message;

fn sample_envelope() -> Message {
    Directive::new("analyze_spending")
        .with_parameter("window_days", json!(30))
        .with_parameter("categories", json!(["groceries", "transport", "rent"]))
        .with_context("requested_by", json!("core-01"))
        .to_message("core-01", Some("wealth-01"))
        .unwrap()
}

fn bench_keypair_generation(c: &mut Criterion) {
    c.bench_function("ed25519/keypair_generate", |b| {
        b.iter(LatticeKeypair::generate);
    });
}

fn bench_raw_sign_verify(c: &mut Criterion) {
    let keypair = LatticeKeypair::generate();
    let public_key = keypair.public_key();
    let message = b"directive analyze_spending from core-01 to wealth-01";
    let signature = keypair.sign(message);

    c.bench_function("ed25519/sign_bytes", |b| {
        b.iter(|| keypair.sign(message));
    });
    c.bench_function("ed25519/verify_bytes", |b| {
        b.iter(|| public_key.verify(message, &signature));
    });
}

fn bench_envelope(c: &mut Criterion) {
    let keypair = LatticeKeypair::generate();
    let public_key = keypair.public_key();
    let template = sample_envelope();
    let mut signed = template.clone();
    signed.sign(&keypair).unwrap();

    c.bench_function("envelope/sign", |b| {
        b.iter(|| {
            let mut msg = template.clone();
            msg.sign(&keypair).unwrap();
            msg
        });
    });
    c.bench_function("envelope/verify", |b| {
        b.iter(|| signed.verify_signature(&public_key));
    });
    c.bench_function("envelope/json_roundtrip", |b| {
        b.iter(|| Message::from_json(&signed.to_json().unwrap()).unwrap());
    });
}

fn bench_manager_verify(c: &mut Criterion) {
    let sender = CryptoManager::new("core-01");
    let receiver = CryptoManager::new("wealth-01");
    receiver
        .trust_node("core-01", sender.public_key(), "ed25519")
        .unwrap();
    let mut signed = sample_envelope();
    sender.sign_message(&mut signed).unwrap();

    c.bench_function("manager/verify_message", |b| {
        b.iter(|| receiver.verify_message(&signed).unwrap());
    });
}

fn bench_session_seal(c: &mut Criterion) {
    let alice = CryptoManager::new("alice");
    let bob = CryptoManager::new("bob");
    alice.trust_node("bob", bob.public_key(), "ed25519").unwrap();
    bob.trust_node("alice", alice.public_key(), "ed25519").unwrap();
    let offer = alice.offer_session("bob").unwrap();
    let accept = bob.accept_session(&offer).unwrap();
    alice.complete_session(&accept).unwrap();

    let mut group = c.benchmark_group("session/seal");
    for size in [64usize, 1024, 16 * 1024, 256 * 1024] {
        let plaintext = vec![0x5au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &plaintext, |b, pt| {
            b.iter(|| alice.seal_for("bob", pt).unwrap());
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_keypair_generation,
    bench_raw_sign_verify,
    bench_envelope,
    bench_manager_verify,
    bench_session_seal,
);
criterion_main!(benches);
