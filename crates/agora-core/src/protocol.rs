//! Client/server wire protocol frames and the batch codec.
//!
//! Inbound text frames parse to [`ClientFrame`]; outbound control traffic is
//! a [`ServerFrame`] serialized as JSON text. Topic update batches travel as
//! binary frames: a one-byte codec header followed by a JSON array of
//! [`TopicMessage`], optionally zlib-compressed (see [`encode_batch`]).

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::ids::ConnectionId;

/// Codec header byte: uncompressed JSON follows.
pub const CODEC_PLAIN: u8 = 0;
/// Codec header byte: zlib-compressed JSON follows.
pub const CODEC_DEFLATE: u8 = 1;

// ─────────────────────────────────────────────────────────────────────────────
// Inbound frames
// ─────────────────────────────────────────────────────────────────────────────

/// A frame received from a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Initial hello, optionally carrying an opaque auth token.
    Connect {
        /// Opaque token, handed to the authenticator boundary verbatim.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Subscribe to one or more topics.
    Subscribe {
        /// Topic names to add.
        topics: Vec<String>,
    },
    /// Unsubscribe from one or more topics.
    Unsubscribe {
        /// Topic names to remove.
        topics: Vec<String>,
    },
    /// Client-initiated keepalive.
    Ping,
    /// Reply to a server ping.
    Pong,
    /// Acknowledges a `system.reconnect` instruction during migration.
    ReconnectAck,
}

/// Parse a client text frame, mapping failures to a protocol error.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::InvalidFrame {
        detail: e.to_string(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound frames
// ─────────────────────────────────────────────────────────────────────────────

/// A control frame sent to a client as JSON text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent once immediately after the connection is registered.
    #[serde(rename = "connection.established")]
    Connected {
        /// The handle the server issued for this connection.
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
        /// Server time at registration.
        timestamp: DateTime<Utc>,
    },
    /// Reply to a client ping.
    Pong,
    /// System event (migration instruction or per-connection error).
    System {
        /// The event body.
        #[serde(flatten)]
        event: SystemEvent,
    },
}

/// System event bodies, discriminated by `event`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SystemEvent {
    /// Instructs the client to reconnect elsewhere and resume its topics.
    Reconnect {
        /// Endpoint URL of the replacement instance.
        endpoint: String,
        /// Topics the client held at handoff time.
        #[serde(rename = "resumeTopics")]
        resume_topics: Vec<String>,
    },
    /// A per-connection error; the connection stays open.
    Error {
        /// Machine-readable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

impl ServerFrame {
    /// Serialize to the JSON text sent over the wire.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidFrame {
            detail: e.to_string(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Topic messages and the batch codec
// ─────────────────────────────────────────────────────────────────────────────

/// One topic-scoped update as delivered to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    /// The topic this update belongs to.
    pub topic: String,
    /// Opaque domain payload; the relay never validates its shape.
    pub payload: serde_json::Value,
    /// When the originating publish happened.
    pub timestamp: DateTime<Utc>,
}

impl TopicMessage {
    /// Build a message stamped with the current time.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Encode a batch of messages into a wire buffer.
///
/// Serializes the batch as a JSON array, then zlib-compresses it when the
/// serialized form is at least `min_compress_bytes` (tiny batches are sent
/// plain; compressing them costs more than it saves). The first byte of the
/// result is the codec header.
pub fn encode_batch(
    messages: &[TopicMessage],
    min_compress_bytes: usize,
) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_vec(messages).map_err(|e| ProtocolError::InvalidFrame {
        detail: e.to_string(),
    })?;

    if json.len() >= min_compress_bytes {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2 + 1), Compression::fast());
        encoder
            .write_all(&json)
            .and_then(|()| encoder.finish())
            .map(|compressed| {
                let mut out = Vec::with_capacity(compressed.len() + 1);
                out.push(CODEC_DEFLATE);
                out.extend_from_slice(&compressed);
                out
            })
            .map_err(|e| ProtocolError::InvalidFrame {
                detail: e.to_string(),
            })
    } else {
        let mut out = Vec::with_capacity(json.len() + 1);
        out.push(CODEC_PLAIN);
        out.extend_from_slice(&json);
        Ok(out)
    }
}

/// Decode a wire buffer produced by [`encode_batch`].
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<TopicMessage>, ProtocolError> {
    let (codec, body) = bytes.split_first().ok_or(ProtocolError::InvalidFrame {
        detail: "empty batch frame".into(),
    })?;
    let json: Vec<u8> = match *codec {
        CODEC_PLAIN => body.to_vec(),
        CODEC_DEFLATE => {
            let mut decoder = ZlibDecoder::new(body);
            let mut out = Vec::new();
            let _ = decoder
                .read_to_end(&mut out)
                .map_err(|e| ProtocolError::InvalidFrame {
                    detail: e.to_string(),
                })?;
            out
        }
        other => {
            return Err(ProtocolError::InvalidFrame {
                detail: format!("unknown batch codec {other}"),
            });
        }
    };
    serde_json::from_slice(&json).map_err(|e| ProtocolError::InvalidFrame {
        detail: e.to_string(),
    })
}

/// Validate a topic name from a subscribe/unsubscribe frame.
///
/// Topics are non-empty, at most 256 bytes, with no control characters.
pub fn validate_topic(topic: &str) -> Result<(), ProtocolError> {
    if topic.is_empty() || topic.len() > 256 || topic.chars().any(char::is_control) {
        return Err(ProtocolError::MalformedTopic {
            topic: topic.chars().take(64).collect(),
        });
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parse_subscribe_frame() {
        let frame = parse_client_frame(r#"{"type":"subscribe","topics":["bill:42"]}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                topics: vec!["bill:42".into()]
            }
        );
    }

    #[test]
    fn parse_connect_without_token() {
        let frame = parse_client_frame(r#"{"type":"connect"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Connect { token: None });
    }

    #[test]
    fn parse_connect_with_token() {
        let frame = parse_client_frame(r#"{"type":"connect","token":"abc"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Connect {
                token: Some("abc".into())
            }
        );
    }

    #[test]
    fn parse_ping() {
        assert_eq!(parse_client_frame(r#"{"type":"ping"}"#).unwrap(), ClientFrame::Ping);
    }

    #[test]
    fn parse_garbage_is_protocol_error() {
        let err = parse_client_frame("not json").unwrap_err();
        assert_matches!(err, ProtocolError::InvalidFrame { .. });
    }

    #[test]
    fn parse_unknown_type_is_protocol_error() {
        let err = parse_client_frame(r#"{"type":"teleport"}"#).unwrap_err();
        assert_matches!(err, ProtocolError::InvalidFrame { .. });
    }

    #[test]
    fn connected_frame_wire_shape() {
        let frame = ServerFrame::Connected {
            connection_id: ConnectionId::from("c1"),
            timestamp: Utc::now(),
        };
        let parsed: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(parsed["type"], "connection.established");
        assert_eq!(parsed["connectionId"], "c1");
        assert!(parsed["timestamp"].is_string());
    }

    #[test]
    fn system_error_wire_shape() {
        let frame = ServerFrame::System {
            event: SystemEvent::Error {
                code: "MALFORMED_TOPIC".into(),
                message: "bad topic".into(),
            },
        };
        let parsed: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(parsed["type"], "system");
        assert_eq!(parsed["event"], "error");
        assert_eq!(parsed["code"], "MALFORMED_TOPIC");
    }

    #[test]
    fn system_reconnect_wire_shape() {
        let frame = ServerFrame::System {
            event: SystemEvent::Reconnect {
                endpoint: "wss://relay-2.example/ws".into(),
                resume_topics: vec!["bill:42".into(), "comments:bill:42".into()],
            },
        };
        let parsed: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(parsed["event"], "reconnect");
        assert_eq!(parsed["endpoint"], "wss://relay-2.example/ws");
        assert_eq!(parsed["resumeTopics"][1], "comments:bill:42");
    }

    #[test]
    fn small_batch_stays_plain() {
        let msgs = vec![TopicMessage::new("bill:42", json!({"s": "passed"}))];
        let encoded = encode_batch(&msgs, 1024).unwrap();
        assert_eq!(encoded[0], CODEC_PLAIN);
        let decoded = decode_batch(&encoded).unwrap();
        assert_eq!(decoded, msgs);
    }

    #[test]
    fn large_batch_is_compressed() {
        let big = "x".repeat(4096);
        let msgs = vec![TopicMessage::new("bill:42", json!({ "body": big }))];
        let encoded = encode_batch(&msgs, 1024).unwrap();
        assert_eq!(encoded[0], CODEC_DEFLATE);
        // Repetitive payload should shrink substantially.
        assert!(encoded.len() < 2048);
        let decoded = decode_batch(&encoded).unwrap();
        assert_eq!(decoded, msgs);
    }

    #[test]
    fn threshold_boundary_compresses_at_exactly_min() {
        let msgs = vec![TopicMessage::new("t", json!(null))];
        let json_len = serde_json::to_vec(&msgs).unwrap().len();
        let at = encode_batch(&msgs, json_len).unwrap();
        assert_eq!(at[0], CODEC_DEFLATE);
        let under = encode_batch(&msgs, json_len + 1).unwrap();
        assert_eq!(under[0], CODEC_PLAIN);
    }

    #[test]
    fn decode_empty_buffer_fails() {
        assert_matches!(decode_batch(&[]), Err(ProtocolError::InvalidFrame { .. }));
    }

    #[test]
    fn decode_unknown_codec_fails() {
        assert_matches!(decode_batch(&[7, 1, 2]), Err(ProtocolError::InvalidFrame { .. }));
    }

    #[test]
    fn decode_truncated_deflate_fails() {
        assert_matches!(
            decode_batch(&[CODEC_DEFLATE, 0x78]),
            Err(ProtocolError::InvalidFrame { .. })
        );
    }

    #[test]
    fn valid_topics() {
        assert!(validate_topic("bill:42").is_ok());
        assert!(validate_topic("comments:bill:42").is_ok());
    }

    #[test]
    fn malformed_topics() {
        assert_matches!(validate_topic(""), Err(ProtocolError::MalformedTopic { .. }));
        assert_matches!(
            validate_topic("a\x00b"),
            Err(ProtocolError::MalformedTopic { .. })
        );
        let long = "t".repeat(257);
        assert_matches!(
            validate_topic(&long),
            Err(ProtocolError::MalformedTopic { .. })
        );
    }

    proptest::proptest! {
        #[test]
        fn topic_validation_matches_the_rules(topic in "[\\x00-\\x7F]{0,300}") {
            let expected_ok = !topic.is_empty()
                && topic.len() <= 256
                && !topic.chars().any(char::is_control);
            proptest::prop_assert_eq!(validate_topic(&topic).is_ok(), expected_ok);
        }
    }

    #[test]
    fn batch_preserves_order() {
        let msgs: Vec<_> = (0..10)
            .map(|i| TopicMessage::new("t", json!({ "seq": i })))
            .collect();
        let decoded = decode_batch(&encode_batch(&msgs, usize::MAX).unwrap()).unwrap();
        let seqs: Vec<_> = decoded.iter().map(|m| m.payload["seq"].as_i64().unwrap()).collect();
        assert_eq!(seqs, (0..10).collect::<Vec<_>>());
    }
}
