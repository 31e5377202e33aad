//! Fan-out benchmarks.
//!
//! Local dispatch cost for growing rooms, and the full bus delivery path
//! (envelope decode, validation, dispatch).

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use roomcast_core::bus::room_channel;
use roomcast_core::{
    BrokerMessage, BusConfig, ConnectionRegistry, FanoutBus, MemoryBroker, RegistryConfig,
};
use roomcast_protocol::codec;
use roomcast_protocol::{BusEnvelope, ChatMessage, ServerEvent};
use roomcast_transport::{queued, ConnectionId, OutboundQueue};
use std::sync::Arc;
use uuid::Uuid;

const ROOM_SIZES: [usize; 4] = [10, 100, 1_000, 10_000];

fn chat(room_id: Uuid) -> ServerEvent {
    ServerEvent::MessageNew(ChatMessage {
        id: Uuid::new_v4(),
        room_id,
        user_id: 1,
        username: "bench".into(),
        content: "x".repeat(64),
        created_at: Utc::now(),
    })
}

/// A registry with `size` connections subscribed to one room.
fn populated(size: usize) -> (Arc<ConnectionRegistry>, Uuid, Vec<OutboundQueue>) {
    let registry = Arc::new(ConnectionRegistry::with_config(RegistryConfig {
        max_connections: size + 1,
        ..RegistryConfig::default()
    }));
    let room_id = Uuid::new_v4();

    let queues = (0..size)
        .map(|_| {
            let (sink, queue) = queued(ConnectionId::generate(), 1_024);
            let id = registry.register(Arc::new(sink)).unwrap();
            registry.subscribe(&id, room_id).unwrap();
            queue
        })
        .collect();

    (registry, room_id, queues)
}

fn drain(queues: &mut [OutboundQueue]) {
    for queue in queues {
        while queue.try_next().is_some() {}
    }
}

fn bench_dispatch_local(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_local");

    for size in ROOM_SIZES {
        let (registry, room_id, mut queues) = populated(size);
        let event = chat(room_id);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let report = registry.dispatch_local(room_id, black_box(&event));
                drain(&mut queues);
                report
            });
        });
    }

    group.finish();
}

fn bench_bus_deliver(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus_deliver");

    for size in [1, 100, 1_000] {
        let (registry, room_id, mut queues) = populated(size);
        let bus = FanoutBus::new(
            Arc::new(MemoryBroker::default()),
            registry,
            BusConfig::default(),
        );
        let envelope = BusEnvelope::new("remote-node", room_id, chat(room_id));
        let message = BrokerMessage {
            channel: room_channel(room_id),
            payload: codec::encode_envelope(&envelope).unwrap(),
        };

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let report = bus.deliver(black_box(&message));
                drain(&mut queues);
                report
            });
        });
    }

    group.finish();
}

fn bench_subscribe(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("register_subscribe_deregister", |b| {
        let registry = ConnectionRegistry::new();
        let room_id = Uuid::new_v4();
        b.iter(|| {
            let (sink, _queue) = queued(ConnectionId::generate(), 8);
            let id = registry.register(Arc::new(sink)).unwrap();
            registry.subscribe(&id, room_id).unwrap();
            registry.deregister(&id)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_dispatch_local, bench_bus_deliver, bench_subscribe);
criterion_main!(benches);
