//! Lightweight Prometheus exporter for mediator runtime metrics.
//!
//! Tracks a small set of process-level counters required for operational
//! health dashboards and exposes them in Prometheus text format. The
//! server binary serves the rendered output at `/metrics`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

static ACTIVE_CONNECTIONS: AtomicI64 = AtomicI64::new(0);
static MESSAGES_ROUTED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_DELIVERED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_ENQUEUED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_RETRIED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_FAILED: AtomicU64 = AtomicU64::new(0);
static BROADCASTS: AtomicU64 = AtomicU64::new(0);

pub fn increment_active_connections() {
    ACTIVE_CONNECTIONS.fetch_add(1, Ordering::AcqRel);
}

pub fn decrement_active_connections() {
    loop {
        let current = ACTIVE_CONNECTIONS.load(Ordering::Acquire);
        let next = if current > 0 { current - 1 } else { 0 };
        if ACTIVE_CONNECTIONS
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }
}

pub fn record_message_routed() {
    MESSAGES_ROUTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_message_delivered() {
    MESSAGES_DELIVERED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_message_enqueued() {
    MESSAGES_ENQUEUED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_message_retried() {
    MESSAGES_RETRIED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_message_failed() {
    MESSAGES_FAILED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_broadcast() {
    BROADCASTS.fetch_add(1, Ordering::Relaxed);
}

pub fn render_metrics() -> String {
    let active_connections = ACTIVE_CONNECTIONS.load(Ordering::Acquire);
    let messages_routed = MESSAGES_ROUTED.load(Ordering::Acquire);
    let messages_delivered = MESSAGES_DELIVERED.load(Ordering::Acquire);
    let messages_enqueued = MESSAGES_ENQUEUED.load(Ordering::Acquire);
    let messages_retried = MESSAGES_RETRIED.load(Ordering::Acquire);
    let messages_failed = MESSAGES_FAILED.load(Ordering::Acquire);
    let broadcasts = BROADCASTS.load(Ordering::Acquire);

    format!(
        concat!(
            "# HELP roost_active_connections Currently registered live channels.\n",
            "# TYPE roost_active_connections gauge\n",
            "roost_active_connections {active_connections}\n",
            "# HELP roost_messages_routed_total Inbound messages accepted by the router.\n",
            "# TYPE roost_messages_routed_total counter\n",
            "roost_messages_routed_total {messages_routed}\n",
            "# HELP roost_messages_delivered_total Messages handed to a live channel.\n",
            "# TYPE roost_messages_delivered_total counter\n",
            "roost_messages_delivered_total {messages_delivered}\n",
            "# HELP roost_messages_enqueued_total Messages queued for later delivery.\n",
            "# TYPE roost_messages_enqueued_total counter\n",
            "roost_messages_enqueued_total {messages_enqueued}\n",
            "# HELP roost_messages_retried_total Delivery attempts that were rescheduled.\n",
            "# TYPE roost_messages_retried_total counter\n",
            "roost_messages_retried_total {messages_retried}\n",
            "# HELP roost_messages_failed_total Messages that exhausted their retry budget.\n",
            "# TYPE roost_messages_failed_total counter\n",
            "roost_messages_failed_total {messages_failed}\n",
            "# HELP roost_broadcasts_total Broadcast fan-out operations.\n",
            "# TYPE roost_broadcasts_total counter\n",
            "roost_broadcasts_total {broadcasts}\n"
        ),
        active_connections = active_connections,
        messages_routed = messages_routed,
        messages_delivered = messages_delivered,
        messages_enqueued = messages_enqueued,
        messages_retried = messages_retried,
        messages_failed = messages_failed,
        broadcasts = broadcasts
    )
}
