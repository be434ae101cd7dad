//! Fan-out benchmarks for Pulse.
//!
//! These benchmarks measure the registry indices and the cost of dispatching
//! one event to many pending listeners.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tenvis_pulse_core::{
    EventSources, Listener, Notifier, Registry, RoomId, RoomTimeline, StreamToken, UserId,
};

fn listener(i: usize, room: &RoomId) -> Arc<Listener> {
    let (listener, _rx) = Listener::new(
        UserId::new(format!("@user-{}:bench", i)),
        vec![room.clone()],
        StreamToken::new(),
        10,
        Duration::from_secs(30),
    );
    Arc::new(listener)
}

/// Benchmark registry operations.
fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    let room = RoomId::new("!bench:test");

    group.bench_function("register_expire", |b| {
        let registry = Registry::new();
        let mut i = 0;
        b.iter(|| {
            let l = listener(i, &room);
            i += 1;
            registry.register(&l, registry.wake_sequence());
            registry.expire(black_box(&l))
        });
    });

    for size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("snapshot", size), size, |b, &size| {
            let registry = Registry::new();
            let _listeners: Vec<_> = (0..size)
                .map(|i| {
                    let l = listener(i, &room);
                    registry.register(&l, 0);
                    l
                })
                .collect();

            b.iter(|| registry.snapshot(black_box(&[room.clone()]), &[]));
        });
    }

    group.finish();
}

/// Benchmark dispatching a room event to pending listeners with no news.
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let room = RoomId::new("!bench:test");

    for size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let timeline = Arc::new(RoomTimeline::new());
            let notifier = Notifier::new(EventSources::new().with_source(timeline.clone()));
            let _listeners: Vec<_> = (0..size)
                .map(|i| {
                    let l = listener(i, &room);
                    notifier.registry().register(&l, 0);
                    l
                })
                .collect();

            let sender = UserId::new("@sender:bench");
            timeline.join(&room, &sender);
            let event = timeline
                .send(&room, &sender, "m.room.message", json!({"body": "hi"}))
                .unwrap();

            b.to_async(&rt)
                .iter(|| notifier.on_new_room_event(black_box(&event), &[]));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_registry, bench_dispatch);
criterion_main!(benches);
