//! Wire protocol for the collaboration channel.
//!
//! One persistent bidirectional channel per connection carries every message
//! kind below, bincode-encoded:
//!
//! ```text
//! client                                server
//!   │ ─── JoinSession ───────────────────▶ │
//!   │ ◀────────────────── SessionState ─── │
//!   │ ─── Change ────────────────────────▶ │
//!   │ ◀───────────────────── ChangeAck ─── │   (to the originator)
//!   │ ◀───────────────── ChangeApplied ─── │   (to every other peer)
//!   │ ─── ResyncRequest ─────────────────▶ │
//!   │ ◀──── SessionState / ResyncNoop ──── │
//! ```
//!
//! Deliveries to one peer always arrive in assigned-revision order; the
//! relay never reorders a single peer's stream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change::{AppliedChange, ChangeDescriptor};

/// Messages carried on the persistent per-connection channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Client to server: enter a session, creating it if absent. Joining
    /// again with the same `connection_id` resumes the existing membership.
    JoinSession {
        session_id: String,
        connection_id: Uuid,
        identity_token: String,
    },
    /// Server to client: join refused; the connection is closed right after.
    JoinRejected { reason: String },
    /// Server to client: authoritative snapshot plus current revision.
    SessionState { revision: u64, snapshot_text: String },
    /// Client to server: one local edit awaiting a revision.
    Change { descriptor: ChangeDescriptor },
    /// Server to originator: the edit was accepted as `assigned_revision`.
    ChangeAck { assigned_revision: u64 },
    /// Server to peers: an accepted edit, stamped with its revision.
    ChangeApplied { applied: AppliedChange },
    /// Client to server: leave the session. No response.
    LeaveSession { session_id: String },
    /// Client to server: snapshot wanted if revisions differ.
    ResyncRequest {
        session_id: String,
        last_known_revision: u64,
    },
    /// Server to client: revisions match, local state is current.
    ResyncNoop,
    /// Server to peers: a participant entered the session.
    PeerJoined { connection_id: Uuid },
    /// Server to peers: a participant left the session.
    PeerLeft { connection_id: Uuid },
    /// Opaque media-signaling payload, relayed to peers without revision or
    /// ordering guarantees.
    Signal { payload: Vec<u8> },
    /// Heartbeat.
    Ping,
    Pong,
}

impl Message {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol and transport errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    /// Identity token rejected at join or reconnect.
    AuthRequired,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::AuthRequired => write!(f, "Identity token rejected"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{encode as encode_change, EditEvent};

    #[test]
    fn test_join_session_roundtrip() {
        let conn = Uuid::new_v4();
        let msg = Message::JoinSession {
            session_id: "project-42".to_string(),
            connection_id: conn,
            identity_token: "tok-abc".to_string(),
        };

        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_change_roundtrip() {
        let desc = encode_change(&EditEvent::new(5, 5, " world"), 3, Uuid::new_v4()).unwrap();
        let msg = Message::Change {
            descriptor: desc.clone(),
        };

        let bytes = msg.encode().unwrap();
        match Message::decode(&bytes).unwrap() {
            Message::Change { descriptor } => assert_eq!(descriptor, desc),
            other => panic!("expected Change, got {other:?}"),
        }
    }

    #[test]
    fn test_change_applied_roundtrip() {
        let desc = encode_change(&EditEvent::new(0, 1, "X"), 5, Uuid::new_v4()).unwrap();
        let msg = Message::ChangeApplied {
            applied: crate::change::AppliedChange::new(desc, 6),
        };

        let bytes = msg.encode().unwrap();
        match Message::decode(&bytes).unwrap() {
            Message::ChangeApplied { applied } => {
                assert_eq!(applied.assigned_revision, 6);
                assert_eq!(applied.change.origin_revision, 5);
            }
            other => panic!("expected ChangeApplied, got {other:?}"),
        }
    }

    #[test]
    fn test_session_state_roundtrip() {
        let msg = Message::SessionState {
            revision: 9,
            snapshot_text: "fn main() {}\n".to_string(),
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_resync_messages_roundtrip() {
        let req = Message::ResyncRequest {
            session_id: "doc1".to_string(),
            last_known_revision: 4,
        };
        let bytes = req.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), req);

        let noop = Message::ResyncNoop;
        let bytes = noop.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), noop);
    }

    #[test]
    fn test_peer_notifications_roundtrip() {
        let conn = Uuid::new_v4();
        for msg in [
            Message::PeerJoined {
                connection_id: conn,
            },
            Message::PeerLeft {
                connection_id: conn,
            },
        ] {
            let bytes = msg.encode().unwrap();
            assert_eq!(Message::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        for msg in [Message::Ping, Message::Pong] {
            let bytes = msg.encode().unwrap();
            assert_eq!(Message::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(Message::decode(&garbage).is_err());
    }

    #[test]
    fn test_change_message_size_efficient() {
        let desc = encode_change(&EditEvent::new(100, 100, "x"), 7, Uuid::new_v4()).unwrap();
        let bytes = Message::Change { descriptor: desc }.encode().unwrap();
        // Single-character edit: enum tag + offsets + text + revision + uuid.
        assert!(
            bytes.len() < 64,
            "single-char change encoded to {} bytes",
            bytes.len()
        );
    }
}
