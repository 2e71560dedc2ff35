//! Media-signaling pass-through.
//!
//! Video/voice call setup between participants rides the same persistent
//! channel as document sync, but as plain store-and-forward: the relay
//! assigns no revision, keeps no order across senders, and never inspects
//! the payload. Messages are addressed peer-to-peer by connection id and
//! the receiving client drops anything not addressed to it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Signaling message types carried inside `Message::Signal` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalMessage {
    /// Session description offer.
    Offer { from: Uuid, to: Uuid, sdp: String },
    /// Session description answer.
    Answer { from: Uuid, to: Uuid, sdp: String },
    /// Transport candidate exchange.
    IceCandidate {
        from: Uuid,
        to: Uuid,
        candidate: String,
    },
}

impl SignalMessage {
    /// Encode to binary (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    /// Decode from binary.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(msg)
    }

    /// Sender connection id.
    pub fn from(&self) -> Uuid {
        match self {
            SignalMessage::Offer { from, .. } => *from,
            SignalMessage::Answer { from, .. } => *from,
            SignalMessage::IceCandidate { from, .. } => *from,
        }
    }

    /// Addressed connection id.
    pub fn to(&self) -> Uuid {
        match self {
            SignalMessage::Offer { to, .. } => *to,
            SignalMessage::Answer { to, .. } => *to,
            SignalMessage::IceCandidate { to, .. } => *to,
        }
    }
}
