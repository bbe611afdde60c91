//! Wire envelope model.
//!
//! One tagged union, one case per envelope kind. Exactly one kind is legal
//! to *send* per lifecycle state; more than one may be legal to *receive*
//! (to tolerate lost replies). Ids travel as UUID strings, timestamps as
//! microseconds since the Unix epoch.
//!
//! `Invitation` and `HandShake` travel unencrypted at the envelope level
//! (no shared key exists yet); `Normal` and `ResetInvitation` wire bytes are
//! additionally sealed with the contact shared key before transport.

use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Ratchet header sent alongside every ratchet-encrypted body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Message number within the current sending chain.
    pub message_number: u32,
    /// Number of messages in the previous sending chain.
    pub sequence_message_number: u32,
    /// Sender's current ratchet public key.
    pub public_key: Vec<u8>,
}

/// A conversation wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Starts a conversation. Unencrypted.
    Invitation {
        double_ratchet_public_key: Vec<u8>,
        local_public_key: Vec<u8>,
        conversation_id: String,
        recipient_id: String,
    },
    /// Reply to an invitation. The envelope travels unencrypted but `body`
    /// is ratchet ciphertext.
    HandShake {
        body: Vec<u8>,
        header: MessageHeader,
        conversation_id: String,
        local_public_key: Vec<u8>,
        recipient_id: String,
    },
    /// Steady-state message; `body` is ratchet ciphertext.
    Normal {
        body: Vec<u8>,
        header: MessageHeader,
        recipient_id: String,
        /// Microseconds since epoch of the last conversation reset, if any.
        conversation_reset_date: Option<i64>,
    },
    /// Re-establishes a conversation after a detected desync.
    ResetInvitation {
        double_ratchet_public_key: Vec<u8>,
        conversation_id: String,
        recipient_id: String,
        /// Microseconds since epoch.
        conversation_reset_date: i64,
    },
}

impl Envelope {
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Base64 encoding of the bincode wire bytes, for text transports
    /// (QR payloads, copy/paste sharing).
    pub fn to_base64(&self) -> Result<String, bincode::Error> {
        Ok(base64::engine::general_purpose::STANDARD.encode(self.serialize()?))
    }

    pub fn from_base64(data: &str) -> Option<Self> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(data).ok()?;
        Self::deserialize(&bytes).ok()
    }

    /// The `recipientId` field common to every kind.
    pub fn recipient_id(&self) -> &str {
        match self {
            Envelope::Invitation { recipient_id, .. }
            | Envelope::HandShake { recipient_id, .. }
            | Envelope::Normal { recipient_id, .. }
            | Envelope::ResetInvitation { recipient_id, .. } => recipient_id,
        }
    }
}

/// Inner message payload, serialized then ratchet-encrypted into an
/// envelope `body`. Only recovered after a successful decryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageData {
    pub content: String,
    /// Microseconds since epoch.
    pub sent_at: i64,
}

impl MessageData {
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Wire timestamp encoding: microseconds since the Unix epoch.
pub fn timestamp_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub fn timestamp_from_micros(micros: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_micros(micros).single()
}
