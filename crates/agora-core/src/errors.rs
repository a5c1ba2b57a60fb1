//! Error hierarchy for the Agora relay.
//!
//! The taxonomy follows the four failure classes the relay distinguishes:
//!
//! - [`TransportError`]: peer disconnect, write timeout, malformed frame;
//!   always ends in teardown of the one affected connection
//! - [`ProtocolError`]: unknown message type, malformed topic; answered
//!   with a `system.error` frame, the connection stays open
//! - [`ResourceError`]: backbone unreachable, instance draining; handled by
//!   degrade-and-continue policies, surfaced through statistics (guardian
//!   pressure refusals are silent drops counted in stats, not errors)
//! - [`InvariantError`]: duplicate registration, registry/index desync;
//!   fatal-local bugs, so the affected connection is closed but the process
//!   lives
//!
//! Nothing in the relay propagates an error across connections; the
//! worst-case local failure is "close this one connection."

use thiserror::Error;

use crate::ids::ConnectionId;

/// Top-level error type for the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Transport-level failure on one connection.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// Client protocol violation.
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    /// Resource exhaustion or degradation.
    #[error("{0}")]
    Resource(#[from] ResourceError),

    /// Programming/invariant violation (fatal-local).
    #[error("{0}")]
    Invariant(#[from] InvariantError),
}

/// Transport-level failures. Every variant results in connection teardown.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed or vanished mid-send.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// A write did not complete within the bounded timeout.
    #[error("write timed out after {timeout_ms}ms")]
    WriteTimeout {
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The transport was already closed.
    #[error("transport closed")]
    Closed,
}

/// Client protocol violations. The offending connection stays open and
/// receives a `system.error` frame with [`ProtocolError::code`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame did not parse as any known message type.
    #[error("invalid frame: {detail}")]
    InvalidFrame {
        /// Parser diagnostic.
        detail: String,
    },

    /// A subscribe/unsubscribe named a malformed topic.
    #[error("malformed topic: {topic:?}")]
    MalformedTopic {
        /// The offending topic (truncated).
        topic: String,
    },
}

impl ProtocolError {
    /// Machine-readable code for the `system.error` reply.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFrame { .. } => "INVALID_FRAME",
            Self::MalformedTopic { .. } => "MALFORMED_TOPIC",
        }
    }
}

/// Resource exhaustion, handled by degrade-and-continue policies.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The scale-out backbone is unreachable; delivery is local-only.
    #[error("backbone unavailable: {detail}")]
    BackboneUnavailable {
        /// Connectivity diagnostic.
        detail: String,
    },

    /// The instance is draining for migration and refuses new connections.
    #[error("instance is draining, not accepting connections")]
    Draining,
}

/// Invariant violations. Local bugs, never client-caused.
#[derive(Debug, Error)]
pub enum InvariantError {
    /// A handle was registered twice.
    #[error("duplicate connection registration: {connection_id}")]
    DuplicateConnection {
        /// The duplicated handle.
        connection_id: ConnectionId,
    },

    /// An operation referenced a handle with no registry entry.
    #[error("unknown connection: {connection_id}")]
    UnknownConnection {
        /// The dangling handle.
        connection_id: ConnectionId,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display() {
        let err = TransportError::WriteTimeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "write timed out after 5000ms");
    }

    #[test]
    fn protocol_error_codes() {
        let invalid = ProtocolError::InvalidFrame {
            detail: "x".into(),
        };
        assert_eq!(invalid.code(), "INVALID_FRAME");
        let topic = ProtocolError::MalformedTopic {
            topic: "".into(),
        };
        assert_eq!(topic.code(), "MALFORMED_TOPIC");
    }

    #[test]
    fn relay_error_from_transport() {
        let err: RelayError = TransportError::PeerDisconnected.into();
        assert!(matches!(err, RelayError::Transport(_)));
        assert_eq!(err.to_string(), "peer disconnected");
    }

    #[test]
    fn relay_error_from_invariant() {
        let err: RelayError = InvariantError::DuplicateConnection {
            connection_id: ConnectionId::from("c1"),
        }
        .into();
        assert!(err.to_string().contains("c1"));
    }

    #[test]
    fn resource_error_display() {
        let err = ResourceError::BackboneUnavailable {
            detail: "connection refused".into(),
        };
        assert!(err.to_string().contains("connection refused"));
    }
}
