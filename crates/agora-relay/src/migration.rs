//! Connection migration for zero-downtime deploys.
//!
//! One migration episode walks `Idle -> Draining -> HandoffPending ->
//! Complete`. Draining stops new registrations while existing connections
//! are served normally. Handoff sends every connection a protocol-level
//! reconnect instruction with its resume topics, then closes each on its own
//! client acknowledgement or at the grace boundary, whichever comes first,
//! and never without having attempted the instruction. Subscriptions of a
//! connection that never acks are lost server-side; the client's own
//! reconnect logic re-establishes them.

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use agora_core::ids::{ConnectionId, MigrationId};
use agora_core::protocol::{ServerFrame, SystemEvent};

use crate::pipeline::Pipeline;
use crate::registry::ConnectionRegistry;
use crate::transport::OutboundFrame;

/// Phase of the current migration episode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    /// No migration in progress.
    Idle,
    /// New connections refused; existing ones served normally.
    Draining,
    /// Reconnect instructions sent; waiting for acks or the grace timeout.
    HandoffPending,
    /// All connections drained or timed out; the instance may terminate.
    Complete,
}

/// Outcome of one handoff episode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandoffReport {
    /// Connections that acknowledged and were closed cleanly.
    pub acked: usize,
    /// Connections force-closed at the grace boundary.
    pub forced: usize,
}

/// Orchestrates draining and handoff of all connections.
pub struct MigrationCoordinator {
    phase: Mutex<MigrationPhase>,
    episode: Mutex<Option<MigrationId>>,
    acked: Mutex<HashSet<ConnectionId>>,
    ack_notify: Notify,
}

impl MigrationCoordinator {
    /// Create a coordinator in the `Idle` phase.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(MigrationPhase::Idle),
            episode: Mutex::new(None),
            acked: Mutex::new(HashSet::new()),
            ack_notify: Notify::new(),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> MigrationPhase {
        *self.phase.lock()
    }

    /// The id of the current migration episode, assigned when draining
    /// starts.
    #[must_use]
    pub fn episode(&self) -> Option<MigrationId> {
        self.episode.lock().clone()
    }

    /// Whether this instance still accepts new connections.
    #[must_use]
    pub fn accepting_connections(&self) -> bool {
        self.phase() == MigrationPhase::Idle
    }

    /// Enter `Draining`. Returns `false` if an episode is already underway.
    pub fn begin_drain(&self) -> bool {
        let mut phase = self.phase.lock();
        if *phase != MigrationPhase::Idle {
            return false;
        }
        *phase = MigrationPhase::Draining;
        let episode = MigrationId::new();
        info!(migration_id = %episode, "migration drain started, refusing new connections");
        *self.episode.lock() = Some(episode);
        true
    }

    /// Record a client's acknowledgement of the reconnect instruction.
    pub fn acknowledge(&self, id: &ConnectionId) {
        let _ = self.acked.lock().insert(id.clone());
        self.ack_notify.notify_waiters();
    }

    /// Run the handoff: instruct, wait, close.
    ///
    /// Each connection is closed the moment its acknowledgement arrives;
    /// whatever is still pending at the `grace` boundary is force-closed
    /// there. A connection whose reconnect instruction cannot be delivered
    /// is force-closed immediately (the attempt was made).
    pub async fn run_handoff(
        &self,
        registry: &ConnectionRegistry,
        pipeline: &Pipeline,
        endpoint: &str,
        grace: Duration,
    ) -> HandoffReport {
        let _ = self.begin_drain();
        let episode = self.episode().unwrap_or_default();
        *self.phase.lock() = MigrationPhase::HandoffPending;
        self.acked.lock().clear();

        let connections = registry.connections().await;
        let mut pending: Vec<ConnectionId> = Vec::with_capacity(connections.len());
        let mut report = HandoffReport::default();

        for conn in &connections {
            let resume_topics = registry.index().topics_of(&conn.id);
            let frame = ServerFrame::System {
                event: SystemEvent::Reconnect {
                    endpoint: endpoint.to_owned(),
                    resume_topics,
                },
            };
            let Ok(json) = frame.to_json() else {
                continue;
            };
            match conn.transport().send(OutboundFrame::Control(json)).await {
                Ok(()) => pending.push(conn.id.clone()),
                Err(e) => {
                    warn!(connection_id = %conn.id, error = %e,
                        "reconnect instruction undeliverable, force-closing");
                    pipeline.teardown(&conn.id).await;
                    report.forced += 1;
                }
            }
        }
        info!(
            migration_id = %episode,
            connections = pending.len(),
            grace_secs = grace.as_secs(),
            "handoff instructions sent"
        );

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        while !pending.is_empty() {
            // Arm the waiter before reading the ack set so an ack landing
            // in between still wakes the loop.
            let notified = self.ack_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let acked_now: Vec<ConnectionId> = {
                let acked = self.acked.lock();
                pending.iter().filter(|id| acked.contains(*id)).cloned().collect()
            };
            for id in &acked_now {
                info!(connection_id = %id, "handoff acknowledged, closing cleanly");
                pipeline.teardown(id).await;
                report.acked += 1;
            }
            pending.retain(|id| !acked_now.contains(id));
            if pending.is_empty() {
                break;
            }

            tokio::select! {
                () = &mut deadline => {
                    for id in &pending {
                        warn!(connection_id = %id, "handoff grace expired, force-closing");
                        pipeline.teardown(id).await;
                        report.forced += 1;
                    }
                    break;
                }
                () = &mut notified => {}
            }
        }

        *self.phase.lock() = MigrationPhase::Complete;
        info!(
            migration_id = %episode,
            acked = report.acked,
            forced = report.forced,
            "migration complete"
        );
        report
    }
}

impl Default for MigrationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
