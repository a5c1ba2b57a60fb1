//! Memory guardian: buffered-byte accounting and pressure policy.
//!
//! Counters sit on the hot enqueue path, so both the global total and the
//! per-connection balances are plain atomics; the map of balances is only
//! locked to add or settle a connection. The invariant maintained at every
//! observable point: global buffered bytes equals the sum of per-connection
//! buffered bytes, and neither is negative.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use agora_core::ids::ConnectionId;

/// Tri-state memory pressure signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    /// Below the warning threshold.
    Normal,
    /// Flush more aggressively; no enqueues refused.
    Warning,
    /// Refuse enqueues for the largest buffers, evict over-cap connections.
    Critical,
}

/// Thresholds for the guardian.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Global buffered bytes at which `Warning` begins.
    pub warning_bytes: i64,
    /// Global buffered bytes at which `Critical` begins.
    pub critical_bytes: i64,
    /// Hard per-connection cap; exceeding it force-closes the connection.
    pub per_connection_cap_bytes: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            warning_bytes: 64 * 1024 * 1024,
            critical_bytes: 128 * 1024 * 1024,
            per_connection_cap_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Tracks buffered bytes per connection and in aggregate.
pub struct MemoryGuardian {
    config: MemoryConfig,
    global: AtomicI64,
    balances: RwLock<HashMap<ConnectionId, Arc<AtomicI64>>>,
}

impl MemoryGuardian {
    /// Create a guardian with the given thresholds.
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            global: AtomicI64::new(0),
            balances: RwLock::new(HashMap::new()),
        }
    }

    /// Start tracking a connection with a zero balance.
    pub fn track(&self, id: &ConnectionId) {
        let _ = self
            .balances
            .write()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)));
    }

    /// Apply a buffered-byte delta for `id`.
    ///
    /// Untracked handles are a bug upstream; the delta is dropped with a
    /// warning rather than corrupting the global sum.
    pub fn account(&self, id: &ConnectionId, delta: i64) {
        let Some(balance) = self.balances.read().get(id).cloned() else {
            warn!(connection_id = %id, delta, "memory accounting for untracked connection");
            return;
        };
        let _ = balance.fetch_add(delta, Ordering::Relaxed);
        let _ = self.global.fetch_add(delta, Ordering::Relaxed);
    }

    /// Stop tracking `id`, returning its remaining balance to the pool.
    pub fn settle(&self, id: &ConnectionId) -> i64 {
        let Some(balance) = self.balances.write().remove(id) else {
            return 0;
        };
        let remaining = balance.load(Ordering::Relaxed);
        let _ = self.global.fetch_sub(remaining, Ordering::Relaxed);
        remaining
    }

    /// Current buffered bytes for `id` (0 when untracked).
    #[must_use]
    pub fn buffered_for(&self, id: &ConnectionId) -> i64 {
        self.balances
            .read()
            .get(id)
            .map_or(0, |b| b.load(Ordering::Relaxed))
    }

    /// Total buffered bytes across all connections.
    #[must_use]
    pub fn global_buffered(&self) -> i64 {
        self.global.load(Ordering::Relaxed)
    }

    /// Current pressure level.
    #[must_use]
    pub fn pressure(&self) -> PressureLevel {
        let global = self.global.load(Ordering::Relaxed);
        if global >= self.config.critical_bytes {
            PressureLevel::Critical
        } else if global >= self.config.warning_bytes {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    /// Whether an enqueue for `id` should be admitted right now.
    ///
    /// Under `Critical` the connections holding more than their fair share
    /// of the global buffer are refused first, protecting the median client
    /// from the worst offender. `Normal` and `Warning` admit everything;
    /// `Warning` relief comes from the pipeline flushing sooner.
    #[must_use]
    pub fn should_admit(&self, id: &ConnectionId) -> bool {
        if self.pressure() < PressureLevel::Critical {
            return true;
        }
        let tracked = self.balances.read().len() as i64;
        if tracked == 0 {
            return true;
        }
        let fair_share = self.global.load(Ordering::Relaxed) / tracked;
        self.buffered_for(id) < fair_share.max(1)
    }

    /// Whether `id` has exceeded the hard per-connection cap.
    #[must_use]
    pub fn over_cap(&self, id: &ConnectionId) -> bool {
        self.buffered_for(id) > self.config.per_connection_cap_bytes
    }

    /// The configured thresholds.
    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small_guardian() -> MemoryGuardian {
        MemoryGuardian::new(MemoryConfig {
            warning_bytes: 100,
            critical_bytes: 200,
            per_connection_cap_bytes: 150,
        })
    }

    fn id(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    #[test]
    fn starts_at_zero_and_normal() {
        let g = small_guardian();
        assert_eq!(g.global_buffered(), 0);
        assert_eq!(g.pressure(), PressureLevel::Normal);
    }

    #[test]
    fn account_updates_both_counters() {
        let g = small_guardian();
        g.track(&id("a"));
        g.account(&id("a"), 40);
        assert_eq!(g.buffered_for(&id("a")), 40);
        assert_eq!(g.global_buffered(), 40);
        g.account(&id("a"), -40);
        assert_eq!(g.global_buffered(), 0);
    }

    #[test]
    fn untracked_account_is_dropped() {
        let g = small_guardian();
        g.account(&id("ghost"), 50);
        assert_eq!(g.global_buffered(), 0);
    }

    #[test]
    fn settle_returns_remaining_and_restores_global() {
        let g = small_guardian();
        g.track(&id("a"));
        g.track(&id("b"));
        g.account(&id("a"), 30);
        g.account(&id("b"), 20);
        assert_eq!(g.settle(&id("a")), 30);
        assert_eq!(g.global_buffered(), 20);
        assert_eq!(g.settle(&id("a")), 0);
    }

    #[test]
    fn pressure_levels_cross_thresholds() {
        let g = small_guardian();
        g.track(&id("a"));
        g.account(&id("a"), 99);
        assert_eq!(g.pressure(), PressureLevel::Normal);
        g.account(&id("a"), 1);
        assert_eq!(g.pressure(), PressureLevel::Warning);
        g.account(&id("a"), 100);
        assert_eq!(g.pressure(), PressureLevel::Critical);
    }

    #[test]
    fn critical_refuses_largest_first() {
        let g = small_guardian();
        g.track(&id("hog"));
        g.track(&id("modest"));
        g.account(&id("hog"), 180);
        g.account(&id("modest"), 30);
        assert_eq!(g.pressure(), PressureLevel::Critical);
        // The hog is above fair share (105); the modest client is not.
        assert!(!g.should_admit(&id("hog")));
        assert!(g.should_admit(&id("modest")));
    }

    #[test]
    fn warning_admits_everything() {
        let g = small_guardian();
        g.track(&id("a"));
        g.account(&id("a"), 150);
        assert_eq!(g.pressure(), PressureLevel::Warning);
        assert!(g.should_admit(&id("a")));
    }

    #[test]
    fn over_cap_detection() {
        let g = small_guardian();
        g.track(&id("a"));
        g.account(&id("a"), 150);
        assert!(!g.over_cap(&id("a")));
        g.account(&id("a"), 1);
        assert!(g.over_cap(&id("a")));
    }

    #[test]
    fn global_equals_sum_after_random_sequence() {
        let g = small_guardian();
        let ids: Vec<_> = (0..5).map(|i| id(&format!("c{i}"))).collect();
        for i in &ids {
            g.track(i);
        }
        // Deterministic pseudo-random walk of accounts and settles
        let mut expected: i64 = 0;
        for step in 0_i64..100 {
            let target = &ids[usize::try_from(step).unwrap() % ids.len()];
            let delta = (step * 37) % 23 - 5;
            let before = g.buffered_for(target);
            g.account(target, delta);
            expected += g.buffered_for(target) - before;
        }
        let sum: i64 = ids.iter().map(|i| g.buffered_for(i)).sum();
        assert_eq!(g.global_buffered(), sum);
        assert_eq!(g.global_buffered(), expected);
    }

    #[test]
    fn pressure_ordering() {
        assert!(PressureLevel::Normal < PressureLevel::Warning);
        assert!(PressureLevel::Warning < PressureLevel::Critical);
    }
}
