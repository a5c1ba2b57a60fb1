//! The authoritative set of live connections.
//!
//! Every subscription mutation goes through the registry so the core
//! invariant holds at all times: a handle present in the subscription index
//! is present in the registry. `subscribe` checks membership while holding
//! the registry read lock; `unregister` cleans the index while holding the
//! write lock, before returning.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error};

use agora_core::errors::InvariantError;
use agora_core::ids::ConnectionId;

use crate::connection::{Connection, HealthState};
use crate::subscriptions::SubscriptionIndex;

/// Thread-safe registry of live connections plus the subscription index.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    index: Arc<SubscriptionIndex>,
}

impl ConnectionRegistry {
    /// Create an empty registry with its own subscription index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            index: Arc::new(SubscriptionIndex::new()),
        }
    }

    /// The subscription index (read-only uses: fan-out snapshots, stats).
    #[must_use]
    pub fn index(&self) -> &Arc<SubscriptionIndex> {
        &self.index
    }

    /// Register a connection under its handle.
    ///
    /// A duplicate handle is a local bug, not a client condition: it is
    /// logged as fatal-local and the new connection is rejected.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), InvariantError> {
        let mut conns = self.connections.write().await;
        if conns.contains_key(&conn.id) {
            error!(connection_id = %conn.id, "duplicate connection registration");
            return Err(InvariantError::DuplicateConnection {
                connection_id: conn.id.clone(),
            });
        }
        debug!(connection_id = %conn.id, "connection registered");
        let _ = conns.insert(conn.id.clone(), conn);
        Ok(())
    }

    /// Remove a connection and all of its subscriptions.
    ///
    /// Idempotent: a second call for the same handle is a no-op returning 0,
    /// which lets a client disconnect race a server-initiated drain. Index
    /// cleanup happens before the write lock is released, so no fan-out can
    /// observe a dangling handle.
    pub async fn unregister(&self, id: &ConnectionId) -> usize {
        let mut conns = self.connections.write().await;
        let Some(conn) = conns.remove(id) else {
            return 0;
        };
        conn.set_health(HealthState::Closed);
        let removed = self.index.remove_all_for(id);
        debug!(connection_id = %id, removed_subscriptions = removed, "connection unregistered");
        removed
    }

    /// Look up a connection by handle.
    pub async fn lookup(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Subscribe `id` to `topic`.
    ///
    /// Fails if the handle has no live registry entry. Membership is checked
    /// under the registry read lock so an unregister cannot interleave
    /// between the check and the index insert.
    pub async fn subscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, InvariantError> {
        let conns = self.connections.read().await;
        if !conns.contains_key(id) {
            return Err(InvariantError::UnknownConnection {
                connection_id: id.clone(),
            });
        }
        Ok(self.index.add(id, topic))
    }

    /// Unsubscribe `id` from `topic`. Unknown handles and absent
    /// subscriptions are no-ops.
    pub async fn unsubscribe(&self, id: &ConnectionId, topic: &str) -> bool {
        let _conns = self.connections.read().await;
        self.index.remove(id, topic)
    }

    /// Point-in-time snapshot of the subscribers of `topic`.
    #[must_use]
    pub fn subscribers_of(&self, topic: &str) -> Vec<ConnectionId> {
        self.index.subscribers_of(topic)
    }

    /// Apply `f` to every live connection (health sweeps, broadcast-to-all).
    pub async fn for_each_connection<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for conn in self.connections.read().await.values() {
            f(conn);
        }
    }

    /// Snapshot of all live connections.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Number of live connections.
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
