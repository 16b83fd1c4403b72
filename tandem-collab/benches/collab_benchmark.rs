use std::collections::BTreeMap;
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use tandem_collab::{
    CollabConfig, EditingSession, Envelope, FileReplica, OperationBatch, Payload, Permission,
    SessionState,
};
use tandem_core::{ChangeOperation, Position, TextRange};
use uuid::Uuid;

fn session(alice: Uuid, bob: Uuid) -> EditingSession {
    let mut participants = BTreeMap::new();
    participants.insert(alice, Permission::Admin);
    participants.insert(bob, Permission::Write);
    EditingSession {
        id: Uuid::new_v4(),
        file_path: "bench.rs".into(),
        host: alice,
        participants,
        base_content: "fn main() {\n    println!(\"hello\");\n}\n".repeat(50),
        started_at: 0,
        last_activity: 0,
        state: SessionState::Active,
    }
}

fn typing(author: Uuid, count: u64) -> Vec<ChangeOperation> {
    (1..=count)
        .map(|i| {
            let at = Position::new(1 + (i % 50) as u32, 1);
            ChangeOperation::insert(author, "bench.rs", i, at, "x")
        })
        .collect()
}

fn bench_integrate_remote(c: &mut Criterion) {
    let alice = Uuid::from_u128(1);
    let bob = Uuid::from_u128(2);
    let session = session(alice, bob);
    let ops = typing(bob, 100);

    c.bench_function("integrate_remote_100_inserts", |b| {
        b.iter(|| {
            let mut replica = FileReplica::new(&session, alice, &CollabConfig::default());
            for op in &ops {
                black_box(replica.integrate_remote(op.clone(), bob, 0).unwrap());
            }
        })
    });
}

fn bench_integrate_past_unacked(c: &mut Criterion) {
    let alice = Uuid::from_u128(1);
    let bob = Uuid::from_u128(2);
    let session = session(alice, bob);
    let remote = typing(bob, 20);

    // Every remote op is positioned past 50 unacknowledged local ones.
    c.bench_function("integrate_past_50_unacked", |b| {
        b.iter(|| {
            let mut replica = FileReplica::new(&session, alice, &CollabConfig::default());
            for i in 0..50u32 {
                let ts = replica.next_timestamp();
                let op = ChangeOperation::insert(alice, "bench.rs", ts, Position::new(i + 1, 5), "y");
                replica.apply_local(op, &[bob], 0).unwrap();
            }
            for op in &remote {
                black_box(replica.integrate_remote(op.clone(), bob, 0).unwrap());
            }
        })
    });
}

fn bench_batch_compress(c: &mut Criterion) {
    let ops = typing(Uuid::new_v4(), 1_000);

    c.bench_function("batch_compress_1k_ops", |b| {
        b.iter(|| black_box(OperationBatch::compress("bench.rs", black_box(&ops)).unwrap()))
    });

    let batch = OperationBatch::compress("bench.rs", &ops).unwrap();
    c.bench_function("batch_decompress_1k_ops", |b| {
        b.iter(|| black_box(batch.decompress().unwrap()))
    });
}

fn bench_envelope_codec(c: &mut Criterion) {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let op = ChangeOperation::replace(
        alice,
        "bench.rs",
        7,
        TextRange::from_coords(2, 5, 2, 12),
        "eprintln",
        "println",
    );
    let envelope = Envelope::to(
        alice,
        bob,
        Payload::Change {
            session_id: Uuid::new_v4(),
            operation: op,
        },
    );

    c.bench_function("envelope_encode_change", |b| {
        b.iter(|| black_box(black_box(&envelope).encode().unwrap()))
    });

    let encoded = envelope.encode().unwrap();
    c.bench_function("envelope_decode_change", |b| {
        b.iter(|| black_box(Envelope::decode(black_box(&encoded)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_integrate_remote,
    bench_integrate_past_unacked,
    bench_batch_compress,
    bench_envelope_codec,
);
criterion_main!(benches);
