use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use lobby_room::group::Group;
use lobby_room::protocol::{ClientFrame, UserMessage, ON_MESSAGE, ROUTE_MESSAGE};
use lobby_room::session::Session;

fn message() -> UserMessage {
    UserMessage {
        name: "bench".to_string(),
        content: "x".repeat(64),
    }
}

fn bench_broadcast_100_members(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = Group::new("bench");
    let mut receivers = Vec::new();
    let mut sessions = Vec::new();
    rt.block_on(async {
        for _ in 0..100 {
            let (session, rx) = Session::pair(1024);
            group.add(&session).await;
            sessions.push(session);
            receivers.push(rx);
        }
    });
    let msg = message();

    c.bench_function("broadcast_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(group.broadcast(ON_MESSAGE, black_box(&msg)).await.unwrap());
            });
            // Keep queues from filling up
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_membership_churn(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = Group::new("bench");
    let (session, _rx) = Session::pair(16);

    c.bench_function("add_leave", |b| {
        b.iter(|| {
            rt.block_on(async {
                group.add(black_box(&session)).await;
                group.leave(black_box(session.id())).await;
            });
        })
    });
}

fn bench_members_snapshot(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = Group::new("bench");
    let sessions: Vec<_> = (0..1000).map(|_| Session::pair(1)).collect();
    rt.block_on(async {
        for (session, _) in &sessions {
            group.add(session).await;
        }
    });

    c.bench_function("members_snapshot_1000", |b| {
        b.iter(|| black_box(rt.block_on(group.members())))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let text = ClientFrame::notify(ROUTE_MESSAGE, &message()).unwrap().encode().unwrap();

    c.bench_function("client_frame_decode", |b| {
        b.iter(|| black_box(ClientFrame::decode(black_box(&text)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_broadcast_100_members,
    bench_membership_churn,
    bench_members_snapshot,
    bench_frame_decode,
);
criterion_main!(benches);
