//! Per-connection state tracked by the registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use agora_core::ids::ConnectionId;

use crate::transport::{TransportAdapter, TransportKind};

/// Authenticated identity, opaque to the relay.
///
/// The auth collaborator hands back either an identity or nothing; the relay
/// never parses tokens itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap an opaque identity string.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Connection health as seen by the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Accepted, not yet past the connect handshake.
    Connecting,
    /// Serving normally.
    Active,
    /// Alive but misbehaving (missed pings, pressure rejections).
    Degraded,
    /// Teardown or handoff in progress; enqueues are dropped.
    Closing,
    /// Fully removed.
    Closed,
}

/// One live client session.
///
/// Created on transport accept, mutated by the registry and the
/// subscribe/unsubscribe path, destroyed on close. Destruction removes every
/// subscription-index entry for the handle before the registry returns.
pub struct Connection {
    /// The handle issued by the registry.
    pub id: ConnectionId,
    transport: Arc<dyn TransportAdapter>,
    identity: Mutex<Option<Identity>>,
    health: Mutex<HealthState>,
    /// When this connection was established.
    pub connected_at: Instant,
    is_alive: AtomicBool,
    /// Messages dropped for this connection (closing, pressure, queue full).
    pub dropped_messages: AtomicU64,
}

impl Connection {
    /// Create a new connection in the `Connecting` state.
    #[must_use]
    pub fn new(id: ConnectionId, transport: Arc<dyn TransportAdapter>) -> Self {
        Self {
            id,
            transport,
            identity: Mutex::new(None),
            health: Mutex::new(HealthState::Connecting),
            connected_at: Instant::now(),
            is_alive: AtomicBool::new(true),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// The transport this connection speaks through.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn TransportAdapter> {
        &self.transport
    }

    /// The wire protocol of this connection.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Record the authenticated identity (nullable until then).
    pub fn set_identity(&self, identity: Identity) {
        *self.identity.lock() = Some(identity);
    }

    /// The authenticated identity, if any.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().clone()
    }

    /// Current health state.
    #[must_use]
    pub fn health(&self) -> HealthState {
        *self.health.lock()
    }

    /// Transition health state.
    pub fn set_health(&self, state: HealthState) {
        *self.health.lock() = state;
    }

    /// Whether enqueues should be dropped (closing or closed).
    #[must_use]
    pub fn is_closing(&self) -> bool {
        matches!(self.health(), HealthState::Closing | HealthState::Closed)
    }

    /// Mark the connection as alive (pong or any inbound activity).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the alive flag for the heartbeat sweep.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Total messages dropped for this connection.
    #[must_use]
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Count one dropped message.
    pub fn count_drop(&self) {
        let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
