//! # Bubbles Protocol
//!
//! **An end-to-end encrypted, asynchronous conversation protocol for
//! contact-to-contact messaging.**
//!
//! Bubbles is a standalone protocol core: the application supplies the
//! transport (any channel that moves opaque bytes), the persistence layer,
//! and a double-ratchet implementation; this crate supplies everything in
//! between:
//!
//! - **Invitation / handshake lifecycle** — conversations start from an
//!   out-of-band invitation and converge to a steady state where messages
//!   flow both ways.
//! - **Conversation resets** — either side can re-key a desynchronized
//!   conversation without losing the contact relationship.
//! - **Contact resolution** — incoming opaque payloads are matched to the
//!   right contact by trial decryption, with precise error taxonomy.
//! - **Message order calculation** — locally comparable sort keys assigned
//!   in O(log n) timestamp decryptions per message, with timestamps kept
//!   encrypted at rest.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bubbles_protocol::crypto::local::LocalCrypto;
//! use bubbles_protocol::order::store::MemoryOrderStore;
//! use bubbles_protocol::storage::MemoryConversationStore;
//! use bubbles_protocol::ConversationEngine;
//!
//! let mut engine = ConversationEngine::new(
//!     local_device_id,
//!     my_double_ratchet,       // any `RatchetEngine` implementation
//!     LocalCrypto::new(),
//!     MemoryConversationStore::new(),
//!     MemoryOrderStore::new(),
//! );
//! let invitation = engine.create_invitation(contact_id)?;
//! // deliver `invitation` out of band; steady-state traffic then goes
//! // through `send_message` / `receive_raw`.
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`protocol`] | Wire envelopes, conversation lifecycle, send/receive engine |
//! | [`crypto`] | Crypto capability traits and the default symmetric/exchange implementation |
//! | [`order`] | Message order calculator and its rank-indexed store contract |
//! | [`storage`] | Conversation persistence contract and in-memory stores |
//! | [`error`] | Protocol and ratchet error taxonomy |

// ── Public modules ──────────────────────────────────────────────────────────

/// Crypto capability traits ([`crypto::RatchetEngine`], [`crypto::BubblesCrypto`])
/// and the default XChaCha20-Poly1305 / X25519 / HKDF implementation.
pub mod crypto;

/// Error taxonomy shared across the crate.
pub mod error;

/// Message order calculator: dense real-number sort keys over encrypted
/// timestamps.
pub mod order;

/// Wire envelopes, conversation state machine, and the conversation engine.
pub mod protocol;

/// Persistence contracts and in-memory implementations.
pub mod storage;

// ── Re-exports for convenience ──────────────────────────────────────────────

pub use crypto::{BubblesCrypto, ContactLocalKey, ContactSharedKey, RatchetEngine, RatchetState};

pub use error::{BubblesError, ProtocolError, RatchetError, Result};

pub use order::{MessageOrderCalculator, OrderRecord, OrderResult};

pub use protocol::{
    Conversation, ConversationEngine, Envelope, InboundEvent, LifecycleState, MessagePlaintext,
    SentMessage,
};

pub use storage::{ConversationStore, StorageError};

// ── Library metadata ────────────────────────────────────────────────────────

/// Bubbles protocol crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the crate version string.
pub fn version() -> &'static str {
    VERSION
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
        assert!(version().contains('.'));
    }
}
