//! Conversation protocol: wire envelopes, per-contact conversation state,
//! and the send/receive engine that drives them.

pub mod conversation;
pub mod engine;
pub mod envelope;

pub use conversation::{Conversation, HandShakeData, LifecycleState};
pub use engine::{
    ConversationEngine, InboundEvent, MessagePlaintext, ResetOutcome, SentMessage,
    FIRST_MESSAGE_MARKER,
};
pub use envelope::{Envelope, MessageData, MessageHeader};
