//! Conversation aggregate and lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{ContactSharedKey, ExchangeSecretKey, RatchetState};

/// Lifecycle stage of a conversation. The cycle never dead-ends: a reset
/// returns the conversation to `Running` under a new conversation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Invitation sent, awaiting the handshake reply. Nothing is legal to
    /// send in this state.
    Invited,
    /// Steady state: `Normal` messages flow both ways.
    Running,
}

/// Invitation-time exchange material, kept only until the handshake
/// completes (or until the peer's first steady-state message proves the
/// handshake reply landed).
#[derive(Clone)]
pub struct HandShakeData {
    /// Conversation id shared with the peer through the invitation.
    pub conversation_shared_id: Uuid,
    /// Our DH exchange public key (the invitation's `localPublicKey`).
    pub exchange_public_key: Vec<u8>,
    /// Matching secret, needed to agree on the contact shared key.
    pub exchange_secret_key: ExchangeSecretKey,
}

/// Per-contact conversation state. Exclusively owned by the local client;
/// callers serialize all access per contact id.
#[derive(Clone)]
pub struct Conversation {
    pub contact_id: Uuid,
    pub conversation_id: Uuid,
    pub state: LifecycleState,
    /// Opaque ratchet session, persisted after every successful send/receive.
    pub ratchet: RatchetState,
    /// Shared key agreed during the handshake. `None` until then.
    pub shared_key: Option<ContactSharedKey>,
    /// Date of the most recent conversation reset, if any. Messages dated
    /// before it are outdated and must be dropped.
    pub reset_at: Option<DateTime<Utc>>,
    /// `Some` while our next outgoing envelope must be a `HandShake`.
    pub handshake: Option<HandShakeData>,
}

impl Conversation {
    /// Inviter side: a freshly issued invitation awaiting its reply.
    pub fn invited(
        contact_id: Uuid,
        conversation_id: Uuid,
        ratchet: RatchetState,
        handshake: HandShakeData,
    ) -> Self {
        Self {
            contact_id,
            conversation_id,
            state: LifecycleState::Invited,
            ratchet,
            shared_key: None,
            reset_at: None,
            handshake: Some(handshake),
        }
    }

    /// Receiver side: a conversation accepted from an invitation. The
    /// receiver skips `Invited` — its first reply is itself the handshake.
    pub fn running(contact_id: Uuid, conversation_id: Uuid, ratchet: RatchetState) -> Self {
        Self {
            contact_id,
            conversation_id,
            state: LifecycleState::Running,
            ratchet,
            shared_key: None,
            reset_at: None,
            handshake: None,
        }
    }

    /// Whether a received message dated `message_reset_date` predates the
    /// most recent reset. Missing dates compare as the distant past, so a
    /// pre-reset message (which carries no date or an old one) is outdated
    /// exactly when a reset has happened since.
    pub fn is_outdated(&self, message_reset_date: Option<DateTime<Utc>>) -> bool {
        let ours = self.reset_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let theirs = message_reset_date.unwrap_or(DateTime::<Utc>::MIN_UTC);
        theirs < ours
    }

    /// Apply a processed reset: new conversation id, fresh ratchet chain,
    /// back to steady state. Message history is retained by the caller;
    /// future keys are independent of the old chain.
    pub fn apply_reset(
        &mut self,
        new_conversation_id: Uuid,
        ratchet: RatchetState,
        reset_at: DateTime<Utc>,
    ) {
        self.conversation_id = new_conversation_id;
        self.ratchet = ratchet;
        self.state = LifecycleState::Running;
        self.reset_at = Some(reset_at);
        self.handshake = None;
    }
}
