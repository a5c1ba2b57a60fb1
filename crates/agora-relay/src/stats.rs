//! Health and statistics collection.
//!
//! Hot-path counters are atomics bumped by the pipeline and hub; the
//! queryable [`StatsSnapshot`] is assembled on demand for the operational
//! surface (`/stats`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::memory::PressureLevel;

/// Aggregated counters for the relay.
pub struct StatsCollector {
    started_at: Instant,
    delivered: AtomicU64,
    batches_flushed: AtomicU64,
    dropped_closing: AtomicU64,
    rejected_pressure: AtomicU64,
    evicted: AtomicU64,
    send_failures: AtomicU64,
    backbone_connected: AtomicBool,
}

impl StatsCollector {
    /// Create a collector; backbone state starts connected.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            delivered: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            dropped_closing: AtomicU64::new(0),
            rejected_pressure: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            backbone_connected: AtomicBool::new(true),
        }
    }

    /// Count messages handed to a transport.
    pub fn count_delivered(&self, n: u64) {
        let _ = self.delivered.fetch_add(n, Ordering::Relaxed);
    }

    /// Count one flushed batch.
    pub fn count_batch(&self) {
        let _ = self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a message dropped because the connection was closing.
    pub fn count_dropped_closing(&self) {
        let _ = self.dropped_closing.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an enqueue refused under memory pressure.
    pub fn count_rejected_pressure(&self) {
        let _ = self.rejected_pressure.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a slow-consumer eviction.
    pub fn count_evicted(&self) {
        let _ = self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed transport send (leads to teardown).
    pub fn count_send_failure(&self) {
        let _ = self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record backbone connectivity.
    pub fn set_backbone_connected(&self, connected: bool) {
        self.backbone_connected.store(connected, Ordering::Relaxed);
    }

    /// Current backbone connectivity.
    #[must_use]
    pub fn backbone_connected(&self) -> bool {
        self.backbone_connected.load(Ordering::Relaxed)
    }

    /// Assemble a snapshot from the counters plus live registry/guardian
    /// readings supplied by the hub.
    #[must_use]
    pub fn snapshot(
        &self,
        connections: usize,
        topics: HashMap<String, usize>,
        pressure: PressureLevel,
        buffered_bytes: i64,
    ) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            connections,
            topics,
            pressure,
            buffered_bytes,
            backbone_connected: self.backbone_connected(),
            delivered: self.delivered.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            dropped_closing: self.dropped_closing.load(Ordering::Relaxed),
            rejected_pressure: self.rejected_pressure.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time operational snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    /// Seconds since the collector was created.
    pub uptime_secs: u64,
    /// Live connection count.
    pub connections: usize,
    /// Subscriber count per live topic.
    pub topics: HashMap<String, usize>,
    /// Current memory pressure level.
    pub pressure: PressureLevel,
    /// Total buffered bytes awaiting flush.
    pub buffered_bytes: i64,
    /// Whether the scale-out backbone is reachable.
    pub backbone_connected: bool,
    /// Messages handed to transports.
    pub delivered: u64,
    /// Batches flushed.
    pub batches_flushed: u64,
    /// Messages dropped on closing connections.
    pub dropped_closing: u64,
    /// Enqueues refused under pressure.
    pub rejected_pressure: u64,
    /// Slow consumers force-closed.
    pub evicted: u64,
    /// Transport send failures.
    pub send_failures: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = StatsCollector::new();
        stats.count_delivered(3);
        stats.count_delivered(2);
        stats.count_batch();
        stats.count_dropped_closing();
        stats.count_rejected_pressure();
        stats.count_evicted();
        stats.count_send_failure();

        let snap = stats.snapshot(1, HashMap::new(), PressureLevel::Normal, 0);
        assert_eq!(snap.delivered, 5);
        assert_eq!(snap.batches_flushed, 1);
        assert_eq!(snap.dropped_closing, 1);
        assert_eq!(snap.rejected_pressure, 1);
        assert_eq!(snap.evicted, 1);
        assert_eq!(snap.send_failures, 1);
    }

    #[test]
    fn backbone_state_toggles() {
        let stats = StatsCollector::new();
        assert!(stats.backbone_connected());
        stats.set_backbone_connected(false);
        assert!(!stats.backbone_connected());
    }

    #[test]
    fn snapshot_carries_live_readings() {
        let stats = StatsCollector::new();
        let mut topics = HashMap::new();
        let _ = topics.insert("bill:42".to_owned(), 7);
        let snap = stats.snapshot(12, topics, PressureLevel::Warning, 4096);
        assert_eq!(snap.connections, 12);
        assert_eq!(snap.topics["bill:42"], 7);
        assert_eq!(snap.pressure, PressureLevel::Warning);
        assert_eq!(snap.buffered_bytes, 4096);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = StatsCollector::new();
        let snap = stats.snapshot(0, HashMap::new(), PressureLevel::Normal, 0);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["pressure"], "normal");
        assert_eq!(json["backbone_connected"], true);
        assert!(json["uptime_secs"].is_number());
    }
}
