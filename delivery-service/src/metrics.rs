//! Process counters backing the external admin/observability surface.
//!
//! The core registers prometheus collectors and exposes a serde-ready
//! snapshot; the HTTP transport that serves them lives outside this crate.

use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts};
use serde::Serialize;
use std::time::Instant;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

pub static CONNECTED_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "delivery_service_connected_sessions",
        "Live client sessions registered on this process",
    )
    .expect("failed to create delivery_service_connected_sessions");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register delivery_service_connected_sessions");
    gauge
});

pub static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "delivery_service_queue_depth",
            "Delivery queue depth by job state",
        ),
        &["state"],
    )
    .expect("failed to create delivery_service_queue_depth");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register delivery_service_queue_depth");
    gauge
});

pub static DELIVERY_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "delivery_service_record_transitions_total",
            "Delivery record state transitions",
        ),
        &["state"],
    )
    .expect("failed to create delivery_service_record_transitions_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register delivery_service_record_transitions_total");
    counter
});

pub static FANOUT_FALLBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "delivery_service_fanout_fallbacks_total",
            "Publishes diverted to the delivery queue because the bus was unavailable",
        ),
        &["reason"],
    )
    .expect("failed to create delivery_service_fanout_fallbacks_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register delivery_service_fanout_fallbacks_total");
    counter
});

/// Forces process-start capture so uptime measures from boot, not from the
/// first snapshot.
pub fn init() {
    Lazy::force(&PROCESS_START);
}

pub fn set_queue_depth(waiting: usize, active: usize, completed: u64, failed: u64) {
    QUEUE_DEPTH.with_label_values(&["waiting"]).set(waiting as i64);
    QUEUE_DEPTH.with_label_values(&["active"]).set(active as i64);
    QUEUE_DEPTH
        .with_label_values(&["completed"])
        .set(completed as i64);
    QUEUE_DEPTH.with_label_values(&["failed"]).set(failed as i64);
}

/// Point-in-time counters for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connected_sessions: i64,
    pub queue_waiting: i64,
    pub queue_active: i64,
    pub queue_completed: i64,
    pub queue_failed: i64,
    pub uptime_seconds: u64,
    pub resident_memory_bytes: Option<u64>,
}

impl MetricsSnapshot {
    pub fn capture() -> Self {
        Self {
            connected_sessions: CONNECTED_SESSIONS.get(),
            queue_waiting: QUEUE_DEPTH.with_label_values(&["waiting"]).get(),
            queue_active: QUEUE_DEPTH.with_label_values(&["active"]).get(),
            queue_completed: QUEUE_DEPTH.with_label_values(&["completed"]).get(),
            queue_failed: QUEUE_DEPTH.with_label_values(&["failed"]).get(),
            uptime_seconds: PROCESS_START.elapsed().as_secs(),
            resident_memory_bytes: resident_memory_bytes(),
        }
    }
}

/// Resident set size from /proc, where available.
fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_queue_gauges() {
        set_queue_depth(3, 1, 10, 2);
        let snapshot = MetricsSnapshot::capture();
        assert_eq!(snapshot.queue_waiting, 3);
        assert_eq!(snapshot.queue_active, 1);
        assert_eq!(snapshot.queue_completed, 10);
        assert_eq!(snapshot.queue_failed, 2);
    }
}
