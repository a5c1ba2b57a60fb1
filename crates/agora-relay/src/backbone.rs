//! Scale-out backbone: the shared pub/sub channel between relay instances.
//!
//! Every instance publishes locally-originated topic messages to the
//! backbone and receives all instances' messages back, including its own.
//! The hub never delivers a publish directly; it only delivers through the
//! receive path, so nothing is ever delivered twice.
//!
//! Implementations pump received events into a local `tokio::sync::broadcast`
//! channel; [`Backbone::subscribe`] hands out receivers on that channel. The
//! in-process implementation is the channel itself, which also gives
//! multi-instance tests a real shared backbone. Connectivity loss degrades
//! to single-instance delivery; the [`ReconnectSupervisor`] retries with
//! exponential backoff and no message is queued across the outage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use agora_core::errors::ResourceError;

use crate::stats::StatsCollector;

/// Default capacity of the local fan-in channel. Receivers that fall this
/// far behind observe `RecvError::Lagged` and skip.
pub const BACKBONE_CAPACITY: usize = 4096;

/// One event on the backbone: topic routing key plus opaque payload bytes.
#[derive(Clone, Debug)]
pub struct BackboneEvent {
    /// Topic routing key.
    pub topic: String,
    /// Serialized message payload; no schema enforced here.
    pub payload: Bytes,
}

/// The shared broadcast channel between instances.
#[async_trait]
pub trait Backbone: Send + Sync {
    /// Publish an event to every instance (including this one).
    async fn publish(&self, event: BackboneEvent) -> Result<(), ResourceError>;

    /// Subscribe to the local fan-in channel. Called once per hub at startup.
    fn subscribe(&self) -> broadcast::Receiver<BackboneEvent>;

    /// Whether the backbone link is currently up.
    fn is_connected(&self) -> bool;

    /// Attempt to re-establish the link after a failure.
    async fn reconnect(&self) -> Result<(), ResourceError>;
}

/// In-process backbone: a single broadcast channel.
///
/// This is the whole backbone for single-binary deployments and for tests;
/// several hubs subscribing to one `InProcessBackbone` behave exactly like
/// several instances sharing a broker.
pub struct InProcessBackbone {
    sender: broadcast::Sender<BackboneEvent>,
    // Tests and drills can force the degraded path.
    connected: AtomicBool,
}

impl InProcessBackbone {
    /// Create a backbone with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(BACKBONE_CAPACITY)
    }

    /// Create a backbone with an explicit channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate a connectivity loss (degraded-mode drills and tests).
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }
}

impl Default for InProcessBackbone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backbone for InProcessBackbone {
    async fn publish(&self, event: BackboneEvent) -> Result<(), ResourceError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(ResourceError::BackboneUnavailable {
                detail: "backbone link down".into(),
            });
        }
        // No receivers is fine: an instance with no hubs yet drops the event.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BackboneEvent> {
        self.sender.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn reconnect(&self) -> Result<(), ResourceError> {
        if self.connected.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(ResourceError::BackboneUnavailable {
                detail: "backbone link down".into(),
            })
        }
    }
}

/// Exponential backoff with jitter for backbone reconnects.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// First retry delay.
    pub base: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (0-based): `base * 2^attempt`, capped at
    /// `max`, with up to 25% random jitter added.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max);
        let jitter = rand::rng().random_range(0.0..0.25);
        exp.mul_f64(1.0 + jitter).min(self.max.mul_f64(1.25))
    }
}

/// Watches backbone connectivity and drives reconnect attempts.
///
/// On loss the supervisor flips the stats gauge to degraded (the hub keeps
/// serving locally-originated topics) and retries with exponential backoff
/// until the link returns.
pub struct ReconnectSupervisor {
    backbone: Arc<dyn Backbone>,
    stats: Arc<StatsCollector>,
    policy: BackoffPolicy,
    poll: Duration,
}

impl ReconnectSupervisor {
    /// Create a supervisor polling connectivity at `poll` interval.
    #[must_use]
    pub fn new(
        backbone: Arc<dyn Backbone>,
        stats: Arc<StatsCollector>,
        policy: BackoffPolicy,
        poll: Duration,
    ) -> Self {
        Self {
            backbone,
            stats,
            policy,
            poll,
        }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            if self.backbone.is_connected() {
                if attempt > 0 {
                    info!("backbone link restored");
                }
                attempt = 0;
                self.stats.set_backbone_connected(true);
                tokio::select! {
                    () = tokio::time::sleep(self.poll) => {}
                    () = cancel.cancelled() => return,
                }
                continue;
            }

            self.stats.set_backbone_connected(false);
            let delay = self.policy.delay(attempt);
            warn!(attempt, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "backbone unreachable, retrying");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return,
            }
            match self.backbone.reconnect().await {
                Ok(()) => {
                    info!("backbone reconnected");
                    self.stats.set_backbone_connected(true);
                    attempt = 0;
                }
                Err(_) => {
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn event(topic: &str, body: &str) -> BackboneEvent {
        BackboneEvent {
            topic: topic.into(),
            payload: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let backbone = InProcessBackbone::new();
        let mut rx1 = backbone.subscribe();
        let mut rx2 = backbone.subscribe();

        backbone.publish(event("bill:42", "update")).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().topic, "bill:42");
        assert_eq!(rx2.recv().await.unwrap().payload, Bytes::from_static(b"update"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let backbone = InProcessBackbone::new();
        backbone.publish(event("t", "x")).await.unwrap();
    }

    #[tokio::test]
    async fn disconnected_backbone_refuses_publish() {
        let backbone = InProcessBackbone::new();
        backbone.set_connected(false);
        let err = backbone.publish(event("t", "x")).await.unwrap_err();
        assert_matches!(err, ResourceError::BackboneUnavailable { .. });
        assert!(!backbone.is_connected());
    }

    #[tokio::test]
    async fn reconnect_succeeds_once_link_returns() {
        let backbone = InProcessBackbone::new();
        backbone.set_connected(false);
        assert!(backbone.reconnect().await.is_err());
        backbone.set_connected(true);
        backbone.reconnect().await.unwrap();
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
        };
        let d0 = policy.delay(0);
        let d3 = policy.delay(3);
        assert!(d0 >= Duration::from_millis(100));
        assert!(d0 < Duration::from_millis(200));
        assert!(d3 >= Duration::from_millis(800));
        // Deep attempts stay within the cap plus jitter headroom
        assert!(policy.delay(30) <= Duration::from_secs(5).mul_f64(1.25));
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_flags_degraded_and_recovers() {
        let backbone = Arc::new(InProcessBackbone::new());
        let stats = Arc::new(StatsCollector::new());
        let cancel = CancellationToken::new();

        backbone.set_connected(false);
        let supervisor = ReconnectSupervisor::new(
            backbone.clone(),
            stats.clone(),
            BackoffPolicy {
                base: Duration::from_millis(10),
                max: Duration::from_millis(100),
            },
            Duration::from_millis(10),
        );
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stats.backbone_connected());

        backbone.set_connected(true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(stats.backbone_connected());

        cancel.cancel();
        handle.await.unwrap();
    }
}
