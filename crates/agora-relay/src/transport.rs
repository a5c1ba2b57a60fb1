//! The transport seam: one capability interface over every wire protocol.
//!
//! The registry, pipeline, and hub never touch a socket; they hand frames to
//! a [`TransportAdapter`]. The native WebSocket path and the framed-protocol
//! path each wrap their writer task in a [`ChannelTransport`], and tests use
//! the same type with the receiver held open.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use agora_core::errors::TransportError;

/// Which wire protocol a connection speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Raw socket frames (native WebSocket protocol).
    Native,
    /// Higher-level framed-messaging protocol.
    Framed,
}

/// One unit handed to a transport for delivery.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundFrame {
    /// A control frame, already serialized to JSON text.
    Control(String),
    /// An encoded topic batch (codec header byte first).
    Batch(Vec<u8>),
}

/// Capability interface every wire transport implements.
///
/// `send` must complete within the transport's write timeout; a timeout is a
/// dead connection, not a retryable condition.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// The wire protocol behind this adapter.
    fn kind(&self) -> TransportKind;

    /// Deliver one frame to the peer.
    async fn send(&self, frame: OutboundFrame) -> Result<(), TransportError>;

    /// Close the transport. Idempotent.
    fn close(&self);

    /// Whether the transport can still accept frames.
    fn is_alive(&self) -> bool;
}

/// Default bound on a single transport write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel-backed transport: frames go to a bounded mpsc queue drained by a
/// writer task that owns the actual socket sink.
///
/// `close` drops the sender, so the writer task observes end-of-stream and
/// can close the socket on its own schedule.
pub struct ChannelTransport {
    kind: TransportKind,
    tx: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    write_timeout: Duration,
}

impl ChannelTransport {
    /// Create a transport with the given queue capacity and write timeout.
    ///
    /// Returns the adapter and the receiver the writer task drains.
    #[must_use]
    pub fn new(
        kind: TransportKind,
        capacity: usize,
        write_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                kind,
                tx: Mutex::new(Some(tx)),
                write_timeout,
            }),
            rx,
        )
    }
}

#[async_trait]
impl TransportAdapter for ChannelTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        let Some(tx) = self.tx.lock().clone() else {
            return Err(TransportError::Closed);
        };
        match tx.send_timeout(frame, self.write_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                // A full queue that stays full for the whole window means the
                // writer (and therefore the peer) is stuck.
                Err(TransportError::WriteTimeout {
                    timeout_ms: u64::try_from(self.write_timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(TransportError::PeerDisconnected),
        }
    }

    fn close(&self) {
        let _ = self.tx.lock().take();
    }

    fn is_alive(&self) -> bool {
        self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn send_delivers_frame() {
        let (t, mut rx) = ChannelTransport::new(TransportKind::Native, 8, DEFAULT_WRITE_TIMEOUT);
        t.send(OutboundFrame::Control("hi".into())).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Control("hi".into()));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (t, _rx) = ChannelTransport::new(TransportKind::Native, 8, DEFAULT_WRITE_TIMEOUT);
        t.close();
        let err = t.send(OutboundFrame::Control("x".into())).await.unwrap_err();
        assert_matches!(err, TransportError::Closed);
        assert!(!t.is_alive());
    }

    #[tokio::test]
    async fn send_to_dropped_receiver_is_peer_disconnected() {
        let (t, rx) = ChannelTransport::new(TransportKind::Framed, 8, DEFAULT_WRITE_TIMEOUT);
        drop(rx);
        let err = t.send(OutboundFrame::Control("x".into())).await.unwrap_err();
        assert_matches!(err, TransportError::PeerDisconnected);
    }

    #[tokio::test]
    async fn full_queue_times_out() {
        let (t, _rx) = ChannelTransport::new(TransportKind::Native, 1, Duration::from_millis(20));
        t.send(OutboundFrame::Control("first".into())).await.unwrap();
        // Queue full and nobody draining
        let err = t.send(OutboundFrame::Control("second".into())).await.unwrap_err();
        assert_matches!(err, TransportError::WriteTimeout { .. });
    }

    #[tokio::test]
    async fn close_ends_the_writer_stream() {
        let (t, mut rx) = ChannelTransport::new(TransportKind::Native, 8, DEFAULT_WRITE_TIMEOUT);
        t.send(OutboundFrame::Control("last".into())).await.unwrap();
        t.close();
        // Queued frames drain, then the stream ends
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Control("last".into()));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn kind_is_reported() {
        let (native, _rx1) = ChannelTransport::new(TransportKind::Native, 1, DEFAULT_WRITE_TIMEOUT);
        let (framed, _rx2) = ChannelTransport::new(TransportKind::Framed, 1, DEFAULT_WRITE_TIMEOUT);
        assert_eq!(native.kind(), TransportKind::Native);
        assert_eq!(framed.kind(), TransportKind::Framed);
    }

    #[tokio::test]
    async fn frames_arrive_in_send_order() {
        let (t, mut rx) = ChannelTransport::new(TransportKind::Native, 16, DEFAULT_WRITE_TIMEOUT);
        for i in 0..5 {
            t.send(OutboundFrame::Control(format!("m{i}"))).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Control(format!("m{i}")));
        }
    }
}
