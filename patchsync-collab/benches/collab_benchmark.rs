use criterion::{black_box, criterion_group, criterion_main, Criterion};
use patchsync_collab::engine::SyncEngine;
use patchsync_collab::protocol::{ConfirmingBatch, OriginToken, ServerMessage};
use patchsync_collab::transport::ChannelTransport;
use patchsync_core::{Document, PatchOp};
use serde_json::json;
use uuid::Uuid;

fn change(seq: u64) -> ConfirmingBatch {
    ConfirmingBatch::new(
        OriginToken::new(Uuid::new_v4(), seq),
        vec![PatchOp::add(format!("/nodes/{seq}"), json!({"x": seq, "name": "bla"}))],
    )
}

fn bench_change_encode(c: &mut Criterion) {
    let change = change(42);
    c.bench_function("on_change_encode", |b| {
        b.iter(|| black_box(ServerMessage::encode_change(black_box(&change)).unwrap()))
    });
}

fn bench_change_decode(c: &mut Criterion) {
    let text = ServerMessage::encode_change(&change(42)).unwrap();
    c.bench_function("on_change_decode", |b| {
        b.iter(|| black_box(ServerMessage::decode(black_box(&text)).unwrap()))
    });
}

fn bench_snapshot_replay(c: &mut Criterion) {
    c.bench_function("snapshot_with_1k_pending", |b| {
        b.iter_batched(
            || {
                let (transport, rx) = ChannelTransport::new();
                let mut engine = SyncEngine::new(transport);
                for i in 0..1_000 {
                    engine
                        .perform_local_edit(PatchOp::add(format!("/nodes/{i}"), json!({"x": i})))
                        .unwrap();
                }
                engine.transport().epoch().begin();
                (engine, rx)
            },
            |(mut engine, rx)| {
                black_box(engine.on_full_snapshot(Document::new()));
                (engine, rx)
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_remote_apply_with_pending(c: &mut Criterion) {
    let (transport, _rx) = ChannelTransport::new();
    let mut engine = SyncEngine::new(transport);
    for i in 0..100 {
        engine
            .perform_local_edit(PatchOp::add(format!("/nodes/local{i}"), json!({"x": i})))
            .unwrap();
    }
    let mut seq = 0;

    c.bench_function("remote_batch_rebase_100_pending", |b| {
        b.iter(|| {
            seq += 1;
            black_box(engine.on_broadcast_received(change(seq)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_change_encode,
    bench_change_decode,
    bench_snapshot_replay,
    bench_remote_apply_with_pending
);
criterion_main!(benches);
