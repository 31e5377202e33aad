//! End-to-end fan-out benchmark against a running server.
//!
//! Every client joins one public room over WebSocket and sends chat messages;
//! the benchmark counts `message:new` frames received across all clients.
//!
//! The server needs static sessions `bench-1` .. `bench-N` for user ids
//! 1..N, and a public room with enough capacity:
//!
//! ```bash
//! e2e_throughput <room-id> [clients] [ws-url]
//! ```
//!
//! Sends are subject to the server's per-user message rate limit, so the
//! measured rate is mostly fan-out: sends times room size.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    sent: AtomicU64,
    rejected: AtomicU64,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let Some(room_id) = args.get(1).and_then(|s| Uuid::parse_str(s).ok()) else {
        eprintln!("usage: e2e_throughput <room-id> [clients] [ws-url]");
        std::process::exit(2);
    };
    let num_clients: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(3).cloned().unwrap_or_else(|| DEFAULT_URL.to_string());

    println!("roomcast end-to-end fan-out");
    println!("  room:    {room_id}");
    println!("  clients: {num_clients}");
    println!("  server:  {url}");
    println!();

    let counters = Arc::new(Counters::default());
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let handles: Vec<_> = (1..=num_clients)
        .map(|user| {
            let counters = Arc::clone(&counters);
            let barrier = Arc::clone(&barrier);
            let url = url.clone();
            tokio::spawn(async move {
                if let Err(e) = run_client(&url, user, room_id, counters, barrier).await {
                    eprintln!("client {user} error: {e}");
                }
            })
        })
        .collect();

    barrier.wait().await;
    println!("All {num_clients} clients joined, warming up for {WARMUP_SECS}s");
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    counters.received.store(0, Ordering::SeqCst);
    counters.sent.store(0, Ordering::SeqCst);
    counters.rejected.store(0, Ordering::SeqCst);
    let start = Instant::now();
    println!("Measuring for {BENCH_SECS}s");
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;
    let elapsed = start.elapsed().as_secs_f64();

    let received = counters.received.load(Ordering::SeqCst);
    let sent = counters.sent.load(Ordering::SeqCst);
    let rejected = counters.rejected.load(Ordering::SeqCst);

    println!();
    println!("Results");
    println!("  duration:        {elapsed:>10.2}s");
    println!("  sent:            {sent:>10}");
    println!("  rejected:        {rejected:>10}");
    println!("  delivered:       {received:>10}");
    println!("  delivered/s:     {:>10.0}", received as f64 / elapsed);
    println!(
        "  per client/s:    {:>10.0}",
        received as f64 / elapsed / num_clients as f64
    );

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    url: &str,
    user: usize,
    room_id: Uuid,
    counters: Arc<Counters>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _) = connect_async(format!("{url}?token=bench-{user}")).await?;
    let (mut sender, mut receiver) = ws.split();

    let join = json!({"type": "room:join", "data": {"roomId": room_id}});
    sender.send(Message::Text(join.to_string())).await?;

    // Wait for our own join announcement.
    while let Some(frame) = receiver.next().await {
        if let Message::Text(text) = frame? {
            let value: Value = serde_json::from_str(&text)?;
            match value["type"].as_str() {
                Some("user:joined") if value["data"]["user"]["id"] == user => break,
                Some("error") => return Err(format!("join failed: {}", value["data"]).into()),
                _ => {}
            }
        }
    }

    barrier.wait().await;

    let recv_counters = Arc::clone(&counters);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = receiver.next().await {
            if let Message::Text(text) = frame {
                if text.contains("\"message:new\"") {
                    recv_counters.received.fetch_add(1, Ordering::Relaxed);
                } else if text.contains("\"RATE_LIMITED\"") {
                    recv_counters.rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });

    let message = json!({
        "type": "message:send",
        "data": {"roomId": room_id, "content": "x".repeat(64)}
    })
    .to_string();

    loop {
        if sender.send(Message::Text(message.clone())).await.is_err() {
            break;
        }
        counters.sent.fetch_add(1, Ordering::Relaxed);
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
