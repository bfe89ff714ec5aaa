use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use synccode_collab::awareness::AwarenessState;
use synccode_collab::broadcast::BroadcastGroup;
use synccode_collab::cursor::CursorProjection;
use synccode_collab::protocol::{ParticipantInfo, RoomId, RoomMessage, SyncMessage};
use synccode_core::Document;
use uuid::Uuid;

fn bench_op_encode(c: &mut Criterion) {
    let mut doc = Document::new(Uuid::new_v4());
    let op = doc.insert(0, "fn main() {}").unwrap();
    let msg = SyncMessage::new(RoomId::new("bench"), Uuid::new_v4(), RoomMessage::DocumentOp(op));

    c.bench_function("document_op_encode", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_op_decode(c: &mut Criterion) {
    let mut doc = Document::new(Uuid::new_v4());
    let op = doc.insert(0, "fn main() {}").unwrap();
    let msg = SyncMessage::new(RoomId::new("bench"), Uuid::new_v4(), RoomMessage::DocumentOp(op));
    let encoded = msg.encode().unwrap();

    c.bench_function("document_op_decode", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_sync_state_encode_4k(c: &mut Criterion) {
    let mut doc = Document::new(Uuid::new_v4());
    for i in 0..4096 {
        doc.insert(i, "x").unwrap();
    }
    let msg = SyncMessage::new(
        RoomId::new("bench"),
        Uuid::new_v4(),
        RoomMessage::SyncState {
            question: None,
            language: Default::default(),
            stamp: Default::default(),
            document: doc.state(),
        },
    );

    c.bench_function("sync_state_encode_4k_chars", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_pair", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(RoomId::new("bench"), 2, 2048);
                let alice = ParticipantInfo::new("Alice");
                let sender = alice.participant_id;
                let _a = group.join(alice).await.unwrap();
                let _b = group.join(ParticipantInfo::new("Bob")).await.unwrap();

                for i in 0..1000u64 {
                    group.broadcast_raw(sender, black_box(vec![i as u8; 64]));
                }
            });
        })
    });
}

fn bench_cursor_refresh(c: &mut Criterion) {
    let text = "def solve(nums):\n    return sorted(nums)\n".repeat(50);
    let info = ParticipantInfo::new("Remote");
    let mut state = AwarenessState::for_participant(&info);
    state.cursor_offset = text.len() / 2;
    let states = vec![state];

    c.bench_function("cursor_projection_refresh", |b| {
        let mut projection = CursorProjection::new();
        b.iter(|| {
            projection.refresh(black_box(&states), black_box(&text));
            black_box(projection.len());
        })
    });
}

criterion_group!(
    benches,
    bench_op_encode,
    bench_op_decode,
    bench_sync_state_encode_4k,
    bench_broadcast_1000_messages,
    bench_cursor_refresh,
);
criterion_main!(benches);
