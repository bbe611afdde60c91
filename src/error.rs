//! Closed error taxonomy for the Bubbles protocol.
//!
//! Two groups, mirroring the two failure surfaces:
//!
//! - [`ProtocolError`] — domain-level failures raised while resolving or
//!   validating an envelope against the local contact set.
//! - [`RatchetError`] — failures crossing the ratchet capability boundary.
//!
//! All of these are returned as typed results, never panics. The engine may
//! retry `ConversationNotSetup` once the missing handshake arrives; every
//! "drop" category is terminal for that specific message while the
//! conversation state stays intact.

use thiserror::Error;

/// Domain-level protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A Normal or HandShake envelope arrived for a contact with no
    /// conversation — the peer never sent (or we never saw) an invitation.
    #[error("Message received but no invitation was ever exchanged")]
    NotAnInvitationMessage,
    /// Wire bytes decrypted but decode as no known envelope shape.
    #[error("Payload is not a Bubbles message")]
    NotABubblesMessage,
    /// The envelope's conversation or recipient does not match this contact.
    #[error("Envelope does not belong to this contact")]
    WrongContact,
    /// No contact in the local set could resolve the incoming payload.
    #[error("No matching contact for incoming message")]
    NoMatchingContact,
    /// The per-contact local key is missing from the caller-provided set.
    #[error("Contact local key not found")]
    ContactKeyNotFound,
    /// Symmetric encryption with the local or shared key failed.
    #[error("Local encryption failed")]
    LocalEncryptionFailed,
    /// Symmetric decryption with the local or shared key failed. When raised
    /// from the order calculator this is a data-integrity fault in a stored
    /// record and must abort the insertion.
    #[error("Local decryption failed")]
    LocalDecryptionFailed,
    /// `create_invitation` called while a conversation is already running.
    /// Re-keying an established conversation goes through a reset invitation.
    #[error("Conversation already exists for this contact")]
    ConversationAlreadyExists,
    /// Wire bytes that decode as no envelope at the per-conversation entry.
    #[error("Malformed envelope")]
    MalformedEnvelope,
}

/// Errors crossing the ratchet capability boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RatchetError {
    /// No handshake reply received yet — recoverable by waiting.
    #[error("Conversation is not set up yet (awaiting handshake)")]
    ConversationNotSetup,
    /// Unknown conversation id — not recoverable without a fresh invitation.
    #[error("Conversation not found")]
    ConversationNotFound,
    /// The message key was already consumed — replay, drop and do not retry.
    #[error("Message key not found (already consumed)")]
    MessageKeyNotFound,
    /// The header references a chain this side never initialized.
    #[error("Required chain key missing")]
    RequiredChainKeyMissing,
    /// The local side attempted to decrypt its own outgoing message.
    /// Always a caller bug, never a remote fault.
    #[error("Cannot decrypt a message we sent")]
    CantDecryptSentMessage,
    /// The message predates the most recent conversation reset.
    #[error("Message is outdated by a conversation reset")]
    OutdatedMessage,
}

/// Unified error type surfaced by the conversation engine.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BubblesError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Ratchet(#[from] RatchetError),
    /// The persistence collaborator failed. When this happens after a
    /// successful crypto step the operation is still reported failed: a lost
    /// ratchet-state advance causes permanent desynchronization.
    #[error("Storage failure: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, BubblesError>;

impl BubblesError {
    /// Whether the failed message may be retried later without harm.
    /// Only an unanswered handshake is worth waiting for; every other
    /// category is either terminal for the message or a local bug.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BubblesError::Ratchet(RatchetError::ConversationNotSetup))
    }
}
