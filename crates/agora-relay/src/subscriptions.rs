//! Topic → subscriber-set index.
//!
//! Membership is set-semantic: duplicate subscribes are no-ops. Reads hand
//! out point-in-time snapshot copies, never live views, so fan-out iteration
//! is unaffected by concurrent subscribe/unsubscribe and holds no lock
//! during delivery. Topics with zero subscribers are garbage-collected
//! silently; re-subscription recreates them.
//!
//! The index is deliberately unaware of the registry. The registry wraps
//! every mutation so that a handle can never outlive its registry entry
//! here (see `ConnectionRegistry`).

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use agora_core::ids::ConnectionId;

/// Maps topics to subscriber handles, with a reverse map for teardown.
#[derive(Default)]
pub struct SubscriptionIndex {
    inner: RwLock<Maps>,
}

#[derive(Default)]
struct Maps {
    by_topic: HashMap<String, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, HashSet<String>>,
}

impl SubscriptionIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` to `topic`. Returns `false` if it was already subscribed.
    pub fn add(&self, id: &ConnectionId, topic: &str) -> bool {
        let mut maps = self.inner.write();
        let inserted = maps
            .by_topic
            .entry(topic.to_owned())
            .or_default()
            .insert(id.clone());
        if inserted {
            let _ = maps
                .by_connection
                .entry(id.clone())
                .or_default()
                .insert(topic.to_owned());
        }
        inserted
    }

    /// Remove `id` from `topic`. Returns `false` if it was not subscribed.
    pub fn remove(&self, id: &ConnectionId, topic: &str) -> bool {
        let mut maps = self.inner.write();
        let removed = match maps.by_topic.get_mut(topic) {
            Some(set) => {
                let removed = set.remove(id);
                if set.is_empty() {
                    let _ = maps.by_topic.remove(topic);
                }
                removed
            }
            None => false,
        };
        if removed {
            if let Some(topics) = maps.by_connection.get_mut(id) {
                let _ = topics.remove(topic);
                if topics.is_empty() {
                    let _ = maps.by_connection.remove(id);
                }
            }
        }
        removed
    }

    /// Remove every subscription held by `id`. Returns how many were removed.
    pub fn remove_all_for(&self, id: &ConnectionId) -> usize {
        let mut maps = self.inner.write();
        let Some(topics) = maps.by_connection.remove(id) else {
            return 0;
        };
        let count = topics.len();
        for topic in topics {
            if let Some(set) = maps.by_topic.get_mut(&topic) {
                let _ = set.remove(id);
                if set.is_empty() {
                    let _ = maps.by_topic.remove(&topic);
                }
            }
        }
        count
    }

    /// Snapshot of the subscribers of `topic` at this instant.
    #[must_use]
    pub fn subscribers_of(&self, topic: &str) -> Vec<ConnectionId> {
        self.inner
            .read()
            .by_topic
            .get(topic)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the topics `id` currently holds.
    #[must_use]
    pub fn topics_of(&self, id: &ConnectionId) -> Vec<String> {
        self.inner
            .read()
            .by_connection
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `id` holds any subscription.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().by_connection.contains_key(id)
    }

    /// Subscriber count per live topic.
    #[must_use]
    pub fn topic_histogram(&self) -> HashMap<String, usize> {
        self.inner
            .read()
            .by_topic
            .iter()
            .map(|(topic, set)| (topic.clone(), set.len()))
            .collect()
    }

    /// Number of live topics.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.inner.read().by_topic.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
