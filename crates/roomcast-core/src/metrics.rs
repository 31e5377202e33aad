//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade; the server installs the
//! Prometheus exporter. Without an installed recorder these are no-ops.

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "roomcast_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "roomcast_connections_active";
    pub const CONNECTIONS_RECLAIMED: &str = "roomcast_connections_reclaimed_total";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "roomcast_subscriptions_active";
    pub const MESSAGES_TOTAL: &str = "roomcast_messages_total";
    pub const MESSAGES_BYTES: &str = "roomcast_messages_bytes";
    pub const DISPATCH_FAILURES: &str = "roomcast_dispatch_failures_total";
    pub const BUS_PUBLISHED: &str = "roomcast_bus_published_total";
    pub const BUS_FAILURES: &str = "roomcast_bus_failures_total";
    pub const BUS_RECEIVED: &str = "roomcast_bus_received_total";
    pub const ROOMS_CREATED: &str = "roomcast_rooms_created_total";
    pub const ROOMS_DELETED: &str = "roomcast_rooms_deleted_total";
    pub const MEMBERSHIP_CHANGES: &str = "roomcast_membership_changes_total";
    pub const INVITES_GENERATED: &str = "roomcast_invites_generated_total";
    pub const INVITES_REDEEMED: &str = "roomcast_invites_redeemed_total";
    pub const INVITES_REJECTED: &str = "roomcast_invites_rejected_total";
    pub const INVITES_REVOKED: &str = "roomcast_invites_revoked_total";
    pub const RATE_LIMITED: &str = "roomcast_rate_limited_total";
    pub const RATE_LIMIT_FAIL_OPEN: &str = "roomcast_rate_limit_fail_open_total";
    pub const LATENCY_SECONDS: &str = "roomcast_latency_seconds";
    pub const ERRORS_TOTAL: &str = "roomcast_errors_total";
}

/// Describe every metric. Call once after installing a recorder.
pub fn describe() {
    metrics::describe_counter!(names::CONNECTIONS_TOTAL, "Connections accepted since start");
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Currently registered connections");
    metrics::describe_counter!(
        names::CONNECTIONS_RECLAIMED,
        "Idle dead connections removed by the sweeper"
    );
    metrics::describe_gauge!(names::SUBSCRIPTIONS_ACTIVE, "Current room subscriptions");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Frames processed, by direction");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Frame bytes processed, by direction");
    metrics::describe_counter!(names::DISPATCH_FAILURES, "Local deliveries that failed");
    metrics::describe_counter!(names::BUS_PUBLISHED, "Events published to the broker");
    metrics::describe_counter!(names::BUS_FAILURES, "Broker publish or decode failures");
    metrics::describe_counter!(names::BUS_RECEIVED, "Events received from the broker");
    metrics::describe_counter!(names::ROOMS_CREATED, "Rooms created");
    metrics::describe_counter!(names::ROOMS_DELETED, "Rooms deleted");
    metrics::describe_counter!(names::MEMBERSHIP_CHANGES, "Joins and leaves");
    metrics::describe_counter!(names::INVITES_GENERATED, "Invite tokens minted");
    metrics::describe_counter!(names::INVITES_REDEEMED, "Invite tokens redeemed");
    metrics::describe_counter!(names::INVITES_REJECTED, "Invite redemptions rejected");
    metrics::describe_counter!(names::INVITES_REVOKED, "Invite tokens revoked");
    metrics::describe_counter!(names::RATE_LIMITED, "Requests rejected by rate limits");
    metrics::describe_counter!(
        names::RATE_LIMIT_FAIL_OPEN,
        "Rate-limit checks allowed because the window store failed"
    );
    metrics::describe_histogram!(names::LATENCY_SECONDS, "Frame handling latency in seconds");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors reported to clients, by code");
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record connections removed by the idle sweep.
pub fn record_reclaimed(count: usize) {
    counter!(names::CONNECTIONS_RECLAIMED).increment(count as u64);
}

/// Record a subscription change.
pub fn record_subscription(delta: f64) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).increment(delta);
}

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a failed local delivery.
pub fn record_dispatch_failure() {
    counter!(names::DISPATCH_FAILURES).increment(1);
}

/// Record a broker publication.
pub fn record_bus_published(event: &'static str) {
    counter!(names::BUS_PUBLISHED, "event" => event).increment(1);
}

/// Record a broker failure.
pub fn record_bus_failure(stage: &'static str) {
    counter!(names::BUS_FAILURES, "stage" => stage).increment(1);
}

/// Record an event received from the broker.
pub fn record_bus_received() {
    counter!(names::BUS_RECEIVED).increment(1);
}

pub fn record_room_created() {
    counter!(names::ROOMS_CREATED).increment(1);
}

pub fn record_room_deleted() {
    counter!(names::ROOMS_DELETED).increment(1);
}

pub fn record_membership_change(kind: &'static str) {
    counter!(names::MEMBERSHIP_CHANGES, "kind" => kind).increment(1);
}

pub fn record_invite_generated() {
    counter!(names::INVITES_GENERATED).increment(1);
}

pub fn record_invite_redeemed() {
    counter!(names::INVITES_REDEEMED).increment(1);
}

pub fn record_invite_rejected(reason: &'static str) {
    counter!(names::INVITES_REJECTED, "reason" => reason).increment(1);
}

pub fn record_invites_revoked(count: usize) {
    counter!(names::INVITES_REVOKED).increment(count as u64);
}

/// Record a rate-limit rejection.
pub fn record_rate_limited(policy: &'static str) {
    counter!(names::RATE_LIMITED, "policy" => policy).increment(1);
}

/// Record a rate-limit check that failed open.
pub fn record_rate_limit_fail_open(policy: &'static str) {
    counter!(names::RATE_LIMIT_FAIL_OPEN, "policy" => policy).increment(1);
}

/// Record frame handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error reported to a client.
pub fn record_error(code: &'static str) {
    counter!(names::ERRORS_TOTAL, "code" => code).increment(1);
}
