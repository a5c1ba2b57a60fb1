//! Outbound batching and compression.
//!
//! Messages accumulate per connection in a lane; a lane flushes when its
//! batch reaches the size threshold or when the time threshold expires,
//! whichever fires first, and either trigger resets both. Compression is
//! applied to the serialized batch (never per message) on a detached copy,
//! with no lane lock held. A failed send tears the connection down; this is
//! a best-effort channel and never retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use agora_core::ids::ConnectionId;
use agora_core::protocol::{self, TopicMessage};

use crate::memory::{MemoryGuardian, PressureLevel};
use crate::registry::ConnectionRegistry;
use crate::stats::StatsCollector;
use crate::transport::OutboundFrame;

/// Delivery priority of an outbound message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Flush the batch immediately after enqueue.
    High,
    /// Normal batching.
    #[default]
    Normal,
    /// Normal batching; first candidate for future shedding policies.
    Low,
}

/// One unit of data destined for delivery. Immutable once enqueued.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    /// The topic message as it will appear on the wire.
    pub message: TopicMessage,
    /// Delivery priority.
    pub priority: Priority,
}

impl OutboundMessage {
    /// Wrap a topic message at normal priority.
    #[must_use]
    pub fn normal(message: TopicMessage) -> Self {
        Self {
            message,
            priority: Priority::Normal,
        }
    }
}

/// Batching thresholds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Flush when a batch reaches this many serialized bytes.
    pub max_batch_bytes: usize,
    /// Flush a batch this long after its first message.
    pub max_hold_ms: u64,
    /// Hold time while the guardian reports `Warning` or above.
    pub warning_hold_ms: u64,
    /// Skip compression for batches smaller than this.
    pub min_compress_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: 16 * 1024,
            max_hold_ms: 75,
            warning_hold_ms: 15,
            min_compress_bytes: 512,
        }
    }
}

/// An accumulating batch. Owned exclusively by the lane until detach.
struct BatchBuf {
    messages: Vec<TopicMessage>,
    bytes: usize,
    opened_at: Instant,
}

impl BatchBuf {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
            bytes: 0,
            opened_at: Instant::now(),
        }
    }
}

/// Per-connection batching state.
///
/// `send_lock` serializes detach+send so batches leave in creation order
/// even when a size trigger races the sweeper.
struct Lane {
    buffer: Mutex<Option<BatchBuf>>,
    send_lock: tokio::sync::Mutex<()>,
}

impl Lane {
    fn new() -> Self {
        Self {
            buffer: Mutex::new(None),
            send_lock: tokio::sync::Mutex::new(()),
        }
    }
}

/// The batching and compression pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    lanes: RwLock<HashMap<ConnectionId, Arc<Lane>>>,
    registry: Arc<ConnectionRegistry>,
    guardian: Arc<MemoryGuardian>,
    stats: Arc<StatsCollector>,
}

impl Pipeline {
    /// Create a pipeline over the given registry, guardian, and stats.
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        registry: Arc<ConnectionRegistry>,
        guardian: Arc<MemoryGuardian>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            config,
            lanes: RwLock::new(HashMap::new()),
            registry,
            guardian,
            stats,
        }
    }

    /// Open a lane for a newly attached connection.
    pub fn open_lane(&self, id: &ConnectionId) {
        self.guardian.track(id);
        let _ = self
            .lanes
            .write()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Lane::new()));
    }

    /// Close a lane, discarding any unflushed batch and settling its bytes.
    pub fn close_lane(&self, id: &ConnectionId) {
        let Some(lane) = self.lanes.write().remove(id) else {
            return;
        };
        let mut slot = lane.buffer.lock();
        if let Some(buf) = slot.take() {
            self.guardian
                .account(id, -i64::try_from(buf.bytes).unwrap_or(i64::MAX));
        }
    }

    /// Enqueue a message for `id`.
    ///
    /// Closing/closed/unknown connections drop silently (counted); enqueues
    /// refused by the guardian under critical pressure drop likewise, since
    /// a slow consumer must never block the publisher. A connection whose
    /// buffer exceeds the hard cap is force-closed here.
    pub async fn enqueue(&self, id: &ConnectionId, msg: OutboundMessage) {
        let Some(conn) = self.registry.lookup(id).await else {
            self.stats.count_dropped_closing();
            return;
        };
        if conn.is_closing() {
            conn.count_drop();
            self.stats.count_dropped_closing();
            return;
        }
        if !self.guardian.should_admit(id) {
            conn.count_drop();
            self.stats.count_rejected_pressure();
            return;
        }
        let Some(lane) = self.lanes.read().get(id).cloned() else {
            self.stats.count_dropped_closing();
            return;
        };

        let size = serde_json::to_vec(&msg.message).map_or(0, |v| v.len());
        let (full, high) = {
            let mut slot = lane.buffer.lock();
            let buf = slot.get_or_insert_with(BatchBuf::new);
            buf.messages.push(msg.message);
            buf.bytes += size;
            // Account while the buffer is locked: a concurrent flush
            // subtracts the whole buffer, so contents and counters must
            // never be observable out of step.
            self.guardian.account(id, i64::try_from(size).unwrap_or(0));
            (buf.bytes >= self.config.max_batch_bytes, msg.priority == Priority::High)
        };

        if self.guardian.over_cap(id) {
            warn!(connection_id = %id, "per-connection buffer cap exceeded, evicting");
            self.stats.count_evicted();
            self.teardown(id).await;
            return;
        }
        if full || high {
            self.flush_lane(id, &lane).await;
        }
    }

    /// Flush every lane whose hold time has expired.
    ///
    /// Under `Warning` pressure or above the shorter hold applies, relieving
    /// memory faster without dropping connections.
    pub async fn flush_due(&self) {
        let hold = if self.guardian.pressure() >= PressureLevel::Warning {
            Duration::from_millis(self.config.warning_hold_ms)
        } else {
            Duration::from_millis(self.config.max_hold_ms)
        };
        let due: Vec<(ConnectionId, Arc<Lane>)> = self
            .lanes
            .read()
            .iter()
            .filter(|(_, lane)| {
                lane.buffer
                    .lock()
                    .as_ref()
                    .is_some_and(|buf| !buf.messages.is_empty() && buf.opened_at.elapsed() >= hold)
            })
            .map(|(id, lane)| (id.clone(), lane.clone()))
            .collect();
        for (id, lane) in due {
            self.flush_lane(&id, &lane).await;
        }
    }

    /// Flush every non-empty lane (drain path).
    pub async fn flush_all(&self) {
        let lanes: Vec<(ConnectionId, Arc<Lane>)> = self
            .lanes
            .read()
            .iter()
            .map(|(id, lane)| (id.clone(), lane.clone()))
            .collect();
        for (id, lane) in lanes {
            self.flush_lane(&id, &lane).await;
        }
    }

    /// Detach the current batch and send it.
    async fn flush_lane(&self, id: &ConnectionId, lane: &Lane) {
        // Hold the send lock across detach+send: batches leave in creation
        // order and concurrent flush calls collapse into no-ops.
        let _send = lane.send_lock.lock().await;

        let buf = {
            let mut slot = lane.buffer.lock();
            let Some(buf) = slot.take() else {
                return;
            };
            self.guardian
                .account(id, -i64::try_from(buf.bytes).unwrap_or(i64::MAX));
            buf
        };
        if buf.messages.is_empty() {
            return;
        }

        let encoded = match protocol::encode_batch(&buf.messages, self.config.min_compress_bytes) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(connection_id = %id, error = %e, "failed to encode batch");
                return;
            }
        };

        let Some(conn) = self.registry.lookup(id).await else {
            return;
        };
        let count = buf.messages.len() as u64;
        match conn.transport().send(OutboundFrame::Batch(encoded)).await {
            Ok(()) => {
                self.stats.count_delivered(count);
                self.stats.count_batch();
                debug!(connection_id = %id, messages = count, "batch flushed");
            }
            Err(e) => {
                warn!(connection_id = %id, error = %e, "batch send failed, tearing down");
                self.stats.count_send_failure();
                self.teardown(id).await;
            }
        }
    }

    /// Tear down one connection: lane, memory account, registry entry,
    /// transport. Safe to call twice; every step is idempotent.
    pub async fn teardown(&self, id: &ConnectionId) {
        let conn = self.registry.lookup(id).await;
        if let Some(conn) = &conn {
            conn.set_health(crate::connection::HealthState::Closing);
        }
        self.close_lane(id);
        let _ = self.guardian.settle(id);
        let _ = self.registry.unregister(id).await;
        if let Some(conn) = conn {
            conn.transport().close();
        }
    }
}

/// Spawn the background sweeper that drives time-based flushes.
pub fn spawn_sweeper(
    pipeline: Arc<Pipeline>,
    tick: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    pipeline.flush_due().await;
                }
                () = cancel.cancelled() => {
                    // Final drain so shutdown never strands a batch
                    pipeline.flush_all().await;
                    break;
                }
            }
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
