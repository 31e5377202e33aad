//! End-to-end scenarios across rooms, invites, connections and the bus.

use futures_util::future::join_all;
use roomcast_core::hub::SERVER_SHUTDOWN;
use roomcast_core::{
    Backends, CoreError, Hub, HubSettings, Identity, InviteOptions, MemoryBroker,
    MemoryInviteLedger, MemoryRoomStore, MemoryWindowStore, Role, RoomId, RoomSpec,
    StaticSessionGate,
};
use roomcast_transport::{queued, ConnectionId, ConnectionSink, Outbound, OutboundQueue};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn gate() -> Arc<StaticSessionGate> {
    let mut gate = StaticSessionGate::new();
    for user in 1..=20 {
        gate.insert(format!("token-{user}"), Identity::new(user, format!("user{user}")));
    }
    Arc::new(gate)
}

fn identity(user: i64) -> Identity {
    Identity::new(user, format!("user{user}"))
}

/// Two hubs over shared backends, as if they were separate processes.
fn cluster() -> (Hub, Hub) {
    let broker = MemoryBroker::default();
    let shared = Backends {
        rooms: Arc::new(MemoryRoomStore::new()),
        invites: Arc::new(MemoryInviteLedger::new()),
        broker: Arc::new(broker.clone()),
        windows: Arc::new(MemoryWindowStore::new()),
        sessions: gate(),
    };
    let other = Backends {
        broker: Arc::new(broker),
        ..shared.clone()
    };
    (
        Hub::build(shared, HubSettings::default()),
        Hub::build(other, HubSettings::default()),
    )
}

async fn connect(hub: &Hub, user: i64) -> (ConnectionId, OutboundQueue) {
    let (sink, queue) = queued(ConnectionId::generate(), 256);
    let id = hub.open(Arc::new(sink)).unwrap();
    hub.authenticate(&id, Some(&format!("token-{user}")))
        .await
        .unwrap();
    (id, queue)
}

async fn public_room(hub: &Hub, owner: i64, capacity: u32) -> RoomId {
    hub.create_room(
        &identity(owner),
        RoomSpec {
            name: "general".into(),
            capacity: Some(capacity),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .room
    .id
}

/// Read frames until one of type `kind` arrives.
async fn expect_frame(queue: &mut OutboundQueue, kind: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let next = tokio::time::timeout_at(deadline, queue.next()).await;
        match next {
            Ok(Some(Outbound::Text(text))) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["type"] == kind {
                    return value;
                }
            }
            Ok(Some(Outbound::Close(notice))) => {
                let value: Value = serde_json::from_str(notice.as_deref().unwrap_or("{}")).unwrap();
                if value["type"] == kind {
                    return value;
                }
            }
            Ok(None) => panic!("Queue closed while waiting for {kind}"),
            Err(_) => panic!("Timed out waiting for {kind}"),
        }
    }
}

fn frame(kind: &str, data: Value) -> String {
    serde_json::json!({ "type": kind, "data": data }).to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_never_exceed_capacity() {
    let (hub, _) = cluster();
    let room = public_room(&hub, 1, 5).await;

    let results = join_all((2..=12).map(|user| {
        let rooms = hub.rooms().clone();
        async move { rooms.request_join(room, user).await }
    }))
    .await;

    let joined = results.iter().filter(|r| r.is_ok()).count();
    let full = results
        .iter()
        .filter(|r| matches!(r, Err(CoreError::Full)))
        .count();
    assert_eq!(joined, 4);
    assert_eq!(full, 7);

    let snapshot = hub.rooms().load(room).await.unwrap().unwrap();
    assert_eq!(snapshot.member_count(), 5);
    assert!(snapshot.check_invariants().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_leaves_keep_one_owner() {
    let (hub, _) = cluster();
    let room = public_room(&hub, 1, 20).await;
    for user in 2..=10 {
        hub.rooms().request_join(room, user).await.unwrap();
    }

    let leavers = [1, 2, 3, 4, 5];
    join_all(leavers.iter().map(|user| {
        let rooms = hub.rooms().clone();
        async move { rooms.leave_room(room, *user).await.unwrap() }
    }))
    .await;

    let snapshot = hub.rooms().load(room).await.unwrap().unwrap();
    assert_eq!(snapshot.member_count(), 5);
    assert!(snapshot.check_invariants().is_ok());
    assert_eq!(snapshot.owner().map(|m| m.role), Some(Role::Owner));
}

#[tokio::test]
async fn test_owner_succession_then_archive() {
    let (hub, _) = cluster();
    let room = public_room(&hub, 1, 10).await;
    hub.join_room(&identity(2), room).await.unwrap();

    let outcome = hub.leave_room(&identity(1), room).await.unwrap();
    assert_eq!(outcome.new_owner, Some(2));
    assert_eq!(outcome.member_count, 1);

    let outcome = hub.leave_room(&identity(2), room).await.unwrap();
    assert!(outcome.archived);
    assert_eq!(outcome.member_count, 0);

    // Archived rooms are gone from listings and lookups.
    assert_eq!(hub.rooms().list_public_rooms(1, 20).await.unwrap().total, 0);
    assert_eq!(
        hub.rooms().get_room_with_stats(room, 1).await.unwrap_err(),
        CoreError::NotFound("Room")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redemptions_respect_max_usage() {
    let (hub, _) = cluster();
    let room = hub
        .create_room(
            &identity(1),
            RoomSpec {
                name: "secret".into(),
                is_private: true,
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .room
        .id;
    let invite = hub
        .generate_invite(
            &identity(1),
            room,
            InviteOptions {
                expires_in: Some(3_600),
                max_usage: Some(2),
            },
        )
        .await
        .unwrap();

    let results = join_all((2..=6).map(|user| {
        let invites = hub.invites().clone();
        let token = invite.token.clone();
        async move { invites.redeem(&token, user).await }
    }))
    .await;

    let joined = results.iter().filter(|r| matches!(r, Ok(r) if r.joined)).count();
    assert_eq!(joined, 2);
    assert!(results
        .iter()
        .filter(|r| r.is_err())
        .all(|r| matches!(r, Err(CoreError::UsageExceeded))));

    let snapshot = hub.rooms().load(room).await.unwrap().unwrap();
    assert_eq!(snapshot.member_count(), 3);
}

#[tokio::test]
async fn test_messages_fan_out_across_processes() {
    let (hub_a, hub_b) = cluster();
    let (_tx, shutdown) = watch::channel(false);
    hub_a.start(shutdown.clone()).await.unwrap();
    hub_b.start(shutdown.clone()).await.unwrap();

    let room = public_room(&hub_a, 1, 10).await;
    let (alice, mut qa) = connect(&hub_a, 1).await;
    let (bob, mut qb) = connect(&hub_b, 2).await;

    hub_a
        .handle_text(&alice, &frame("room:join", serde_json::json!({ "roomId": room })))
        .await;
    hub_b
        .handle_text(&bob, &frame("room:join", serde_json::json!({ "roomId": room })))
        .await;

    // Alice sees Bob come online from the other process.
    let joined = expect_frame(&mut qa, "user:joined").await;
    assert_eq!(joined["data"]["user"]["id"], 1);
    let joined = expect_frame(&mut qa, "user:joined").await;
    assert_eq!(joined["data"]["user"]["id"], 2);

    for text in ["one", "two", "three"] {
        hub_a
            .handle_text(
                &alice,
                &frame("message:send", serde_json::json!({ "roomId": room, "content": text })),
            )
            .await;
    }

    for queue in [&mut qa, &mut qb] {
        for expected in ["one", "two", "three"] {
            let message = expect_frame(queue, "message:new").await;
            assert_eq!(message["data"]["content"], expected);
            assert_eq!(message["data"]["username"], "user1");
        }
    }
}

#[tokio::test]
async fn test_frame_errors_reach_sender() {
    let (hub, _) = cluster();
    let room = public_room(&hub, 1, 10).await;

    // Not authenticated.
    let (sink, mut anon_queue) = queued(ConnectionId::generate(), 16);
    let anon = hub.open(Arc::new(sink)).unwrap();
    hub.handle_text(&anon, &frame("room:join", serde_json::json!({ "roomId": room })))
        .await;
    let error = expect_frame(&mut anon_queue, "error").await;
    assert_eq!(error["data"]["code"], "UNAUTHENTICATED");

    let (alice, mut queue) = connect(&hub, 1).await;

    hub.handle_text(&alice, "{\"type\":\"room:nuke\",\"data\":{}}").await;
    let error = expect_frame(&mut queue, "error").await;
    assert_eq!(error["data"]["code"], "UNKNOWN_TYPE");

    // Not subscribed yet.
    hub.handle_text(
        &alice,
        &frame("message:send", serde_json::json!({ "roomId": room, "content": "hi" })),
    )
    .await;
    let error = expect_frame(&mut queue, "error").await;
    assert_eq!(error["data"]["code"], "NOT_MEMBER");

    hub.handle_text(&alice, &frame("room:join", serde_json::json!({ "roomId": room })))
        .await;
    hub.handle_text(
        &alice,
        &frame(
            "message:send",
            serde_json::json!({ "roomId": room, "content": "x".repeat(2_001) }),
        ),
    )
    .await;
    let error = expect_frame(&mut queue, "error").await;
    assert_eq!(error["data"]["code"], "INVALID_INPUT");

    hub.handle_text(
        &alice,
        &frame("message:send", serde_json::json!({ "roomId": room, "content": "   " })),
    )
    .await;
    let error = expect_frame(&mut queue, "error").await;
    assert_eq!(error["data"]["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_message_rate_limit() {
    let (hub, _) = cluster();
    let room = public_room(&hub, 1, 10).await;
    let (alice, mut queue) = connect(&hub, 1).await;
    hub.handle_text(&alice, &frame("room:join", serde_json::json!({ "roomId": room })))
        .await;

    for i in 0..31 {
        hub.handle_text(
            &alice,
            &frame("message:send", serde_json::json!({ "roomId": room, "content": format!("m{i}") })),
        )
        .await;
    }

    let error = expect_frame(&mut queue, "error").await;
    assert_eq!(error["data"]["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn test_delete_room_notifies_and_revokes() {
    let (hub, _) = cluster();
    let (_tx, shutdown) = watch::channel(false);
    hub.start(shutdown).await.unwrap();

    let room = public_room(&hub, 1, 10).await;
    let invite = hub
        .generate_invite(&identity(1), room, InviteOptions::default())
        .await
        .unwrap();
    let (bob, mut queue) = connect(&hub, 2).await;
    hub.handle_text(&bob, &frame("room:join", serde_json::json!({ "roomId": room })))
        .await;

    let deleted = hub.delete_room(&identity(1), room).await.unwrap();
    assert_eq!(deleted.revoked_invites, 1);

    let event = expect_frame(&mut queue, "room:deleted").await;
    assert_eq!(event["data"]["roomId"], room.to_string());

    // The listener drops local subscriptions on delivery.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!hub.registry().is_subscribed(&bob, room));
    assert_eq!(
        hub.redeem_invite(&identity(3), &invite.token).await.unwrap_err(),
        CoreError::NotFound("Invite")
    );
}

#[tokio::test]
async fn test_disconnect_announces_once() {
    let (hub, _) = cluster();
    let (_tx, shutdown) = watch::channel(false);
    hub.start(shutdown).await.unwrap();

    let room = public_room(&hub, 1, 10).await;
    let (alice, mut qa) = connect(&hub, 1).await;
    let (bob, _qb) = connect(&hub, 2).await;
    hub.handle_text(&alice, &frame("room:join", serde_json::json!({ "roomId": room })))
        .await;
    hub.handle_text(&bob, &frame("room:join", serde_json::json!({ "roomId": room })))
        .await;

    assert!(hub.disconnect(&bob).await.is_some());
    assert!(hub.disconnect(&bob).await.is_none());

    let left = expect_frame(&mut qa, "user:left").await;
    assert_eq!(left["data"]["userId"], 2);
    assert_eq!(hub.stats().bus.published, 4);
}

#[tokio::test]
async fn test_shutdown_sends_notice() {
    let (hub, _) = cluster();
    let (_alice, mut queue) = connect(&hub, 1).await;

    assert_eq!(hub.shutdown().await, 1);
    let notice = expect_frame(&mut queue, "error").await;
    assert_eq!(notice["data"]["code"], SERVER_SHUTDOWN);
    assert!(hub.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_does_not_wait_on_stalled_peers() {
    let (hub, _) = cluster();
    let room = public_room(&hub, 1, 50).await;
    let join = frame("room:join", serde_json::json!({ "roomId": room }));

    let mut queues = Vec::new();
    for user in 1..=20 {
        let (sink, queue) = queued(ConnectionId::generate(), 1);
        let sink = Arc::new(sink);
        let id = hub.open(sink.clone()).unwrap();
        hub.authenticate(&id, Some(&format!("token-{user}")))
            .await
            .unwrap();
        hub.handle_text(&id, &join).await;
        // Nobody drains the queue, as with a peer that stopped reading.
        while sink.send_text(Arc::from("backlog")).is_ok() {}
        queues.push(queue);
    }

    let started = tokio::time::Instant::now();
    assert_eq!(hub.shutdown().await, 20);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(hub.registry().is_empty());

    for queue in &mut queues {
        assert_eq!(queue.next().await, Some(Outbound::Close(None)));
        assert_eq!(queue.next().await, None);
    }
}

#[tokio::test]
async fn test_repeated_join_announces_once() {
    let (hub, _) = cluster();
    let room = public_room(&hub, 1, 10).await;
    let join = frame("room:join", serde_json::json!({ "roomId": room }));
    let (alice, _queue) = connect(&hub, 1).await;

    let before = hub.stats().bus.published;
    hub.handle_text(&alice, &join).await;
    assert_eq!(hub.stats().bus.published, before + 1);

    hub.handle_text(&alice, &join).await;
    hub.handle_text(&alice, &join).await;
    assert_eq!(hub.stats().bus.published, before + 1);
    assert!(hub.registry().is_subscribed(&alice, room));
}
