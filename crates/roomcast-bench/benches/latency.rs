//! Latency benchmarks.
//!
//! Measures a chat message from the sender's inbound frame to delivery on
//! every subscriber's outbound queue, through the hub, the rate limiter and
//! the in-process broker.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use roomcast_core::ratelimit::LimitRule;
use roomcast_core::{
    Backends, Hub, HubSettings, Identity, MemoryWindowStore, Policy, RateLimitConfig,
    RateLimiter, RoomSpec, StaticSessionGate,
};
use roomcast_transport::{queued, ConnectionId, Outbound, OutboundQueue};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::watch;
use uuid::Uuid;

struct Room {
    hub: Arc<Hub>,
    room_id: Uuid,
    sender: ConnectionId,
    queues: Vec<OutboundQueue>,
    _shutdown: watch::Sender<bool>,
}

fn settings() -> HubSettings {
    let mut settings = HubSettings::default();
    settings.rate_limits.messages = LimitRule::new(u32::MAX, 1);
    settings
}

async fn setup(members: usize) -> Room {
    let mut gate = StaticSessionGate::new();
    for user in 1..=members {
        gate.insert(format!("bench-{user}"), Identity::new(user as i64, format!("bench{user}")));
    }

    let hub = Arc::new(Hub::build(Backends::in_memory(Arc::new(gate)), settings()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    hub.start(shutdown_rx).await.unwrap();

    let room_id = hub
        .create_room(
            &Identity::new(1, "bench1"),
            RoomSpec {
                name: "latency".into(),
                capacity: Some(100),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .room
        .id;

    let join = json!({"type": "room:join", "data": {"roomId": room_id}}).to_string();
    let mut ids = Vec::with_capacity(members);
    let mut queues = Vec::with_capacity(members);
    for user in 1..=members {
        let (sink, queue) = queued(ConnectionId::generate(), 4_096);
        let id = hub.open(Arc::new(sink)).unwrap();
        hub.authenticate(&id, Some(&format!("bench-{user}")))
            .await
            .unwrap();
        hub.handle_text(&id, &join).await;
        ids.push(id);
        queues.push(queue);
    }

    // Let join announcements land, then discard them.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for queue in &mut queues {
        while queue.try_next().is_some() {}
    }

    Room {
        hub,
        room_id,
        sender: ids.swap_remove(0),
        queues,
        _shutdown: shutdown_tx,
    }
}

async fn await_message(queue: &mut OutboundQueue) {
    while let Some(item) = queue.next().await {
        if let Outbound::Text(text) = item {
            if text.contains("\"message:new\"") {
                return;
            }
        }
    }
}

fn bench_message_round_trip(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("message_round_trip");

    for members in [2, 10, 100] {
        let mut room = runtime.block_on(setup(members));
        let frame = json!({
            "type": "message:send",
            "data": {"roomId": room.room_id, "content": "x".repeat(64)}
        })
        .to_string();

        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, _| {
            b.iter_custom(|iters| {
                runtime.block_on(async {
                    let start = Instant::now();
                    for _ in 0..iters {
                        room.hub.handle_text(&room.sender, black_box(&frame)).await;
                        for queue in &mut room.queues {
                            await_message(queue).await;
                        }
                    }
                    start.elapsed()
                })
            });
        });
    }

    group.finish();
}

fn bench_rate_limit_check(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let limiter = RateLimiter::new(
        Arc::new(MemoryWindowStore::new()),
        RateLimitConfig {
            api: LimitRule::new(u32::MAX, 1),
            ..RateLimitConfig::default()
        },
    );

    let mut group = c.benchmark_group("rate_limit");
    group.bench_function("check_memory", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let key = format!("user:{}", n % 1_000);
            runtime.block_on(limiter.check(Policy::Api, black_box(&key)))
        });
    });
    group.finish();
}

criterion_group!(benches, bench_message_round_trip, bench_rate_limit_check);
criterion_main!(benches);
